use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "jobpilot")]
#[command(version)]
#[command(about = "Agent orchestration and autonomy enforcement core", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", env = "JOBPILOT_CONFIG_DIR")]
    pub config_dir: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler, the sweep and the HTTP API
    Serve {
        /// Override `api.bind`
        #[arg(short, long)]
        bind: Option<String>,
        /// Keep state in memory even if a database URL is configured
        #[arg(long)]
        memory: bool,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from(["jobpilot", "serve", "--bind", "127.0.0.1:9000", "--memory"]);
        match cli.command {
            Some(Commands::Serve { bind, memory }) => {
                assert_eq!(bind.as_deref(), Some("127.0.0.1:9000"));
                assert!(memory);
            }
            _ => panic!("expected serve"),
        }
        assert_eq!(cli.config_dir, "config");
    }
}
