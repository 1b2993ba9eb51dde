/// Channel pattern over `{domain}.{user_id}.{event}` names.
///
/// Segments are dot-separated; `*` matches exactly one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    segments: Vec<String>,
}

impl ChannelPattern {
    pub fn parse(pattern: &str) -> Self {
        Self {
            segments: pattern.split('.').map(str::to_string).collect(),
        }
    }

    /// Every event for one user
    pub fn user(user_id: &str) -> Self {
        Self::parse(&format!("*.{}.*", user_id))
    }

    pub fn matches(&self, channel: &str) -> bool {
        let mut parts = channel.split('.');
        for segment in &self.segments {
            match parts.next() {
                Some(part) if segment == "*" || segment == part => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }
}

impl std::fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_one_segment() {
        let p = ChannelPattern::parse("brake.*.paused");
        assert!(p.matches("brake.user-1.paused"));
        assert!(!p.matches("brake.user-1.pausing"));
        assert!(!p.matches("brake.paused"));
        assert!(!p.matches("brake.user-1.paused.extra"));
    }

    #[test]
    fn test_user_pattern() {
        let p = ChannelPattern::user("u7");
        assert!(p.matches("task.u7.step"));
        assert!(p.matches("approval.u7.created"));
        assert!(!p.matches("task.u8.step"));
        assert_eq!(p.to_string(), "*.u7.*");
    }
}
