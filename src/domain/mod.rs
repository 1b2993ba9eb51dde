pub mod activity;
pub mod approval;
pub mod brake;
pub mod dead_letter;
pub mod profile;
pub mod task;

pub use activity::*;
pub use approval::*;
pub use brake::*;
pub use dead_letter::*;
pub use profile::*;
pub use task::*;
