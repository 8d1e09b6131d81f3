use rand::{
    distributions::{Alphanumeric, DistString},
    Rng,
};
use std::time::Duration;

/// Inclusive random range used for timer periods and jitter sleeps.
pub fn rand_range(min: u64, max: u64) -> u64 {
    rand::thread_rng().gen_range(min..=max)
}

pub fn jitter_ms(min: u64, max: u64) -> Duration {
    Duration::from_millis(rand_range(min, max))
}

pub fn jitter_secs(min: u64, max: u64) -> Duration {
    Duration::from_secs(rand_range(min, max))
}

/// Opaque agent id generated once at install time.
pub fn generate_agent_id() -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), 40)
}

/// Remove whitespace and stray nulls from child-process output.
pub fn strip_all(s: &str) -> String {
    s.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string()
}

/// The server wraps bare string replies in double quotes.
pub fn django_string_resp(s: &str) -> String {
    s.trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_range_is_inclusive() {
        for _ in 0..200 {
            let v = rand_range(40, 110);
            assert!((40..=110).contains(&v));
        }
        assert_eq!(rand_range(7, 7), 7);
    }

    #[test]
    fn agent_id_is_forty_alphanumerics() {
        let id = generate_agent_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_agent_id());
    }

    #[test]
    fn strips_quotes_from_server_replies() {
        assert_eq!(django_string_resp("\"failing\"\n"), "failing");
        assert_eq!(django_string_resp("ok"), "ok");
        assert_eq!(django_string_resp(""), "");
    }

    #[test]
    fn strip_all_removes_padding() {
        assert_eq!(strip_all("  node-id\r\n\0"), "node-id");
        assert_eq!(strip_all("\n"), "");
    }
}
