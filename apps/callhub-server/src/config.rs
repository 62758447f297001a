use std::env;
use std::time::Duration;

use crate::chat::DEFAULT_MAX_CHAT_LEN;
use crate::registry::JoinLimits;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_filter: String,
    pub max_room_id_len: usize,
    pub max_display_name_len: usize,
    pub max_chat_len: usize,
    /// Client-side bound on the join round trip.
    pub join_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("CALLHUB_HOST").unwrap_or(defaults.host),
            port: parse_env("CALLHUB_PORT").unwrap_or(defaults.port),
            log_filter: env::var("RUST_LOG").unwrap_or(defaults.log_filter),
            max_room_id_len: parse_env("CALLHUB_MAX_ROOM_ID_LEN")
                .unwrap_or(defaults.max_room_id_len),
            max_display_name_len: parse_env("CALLHUB_MAX_NAME_LEN")
                .unwrap_or(defaults.max_display_name_len),
            max_chat_len: parse_env("CALLHUB_MAX_CHAT_LEN").unwrap_or(defaults.max_chat_len),
            join_timeout_secs: parse_env("CALLHUB_JOIN_TIMEOUT_SECS")
                .unwrap_or(defaults.join_timeout_secs),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn join_limits(&self) -> JoinLimits {
        JoinLimits {
            max_room_id_len: self.max_room_id_len,
            max_display_name_len: self.max_display_name_len,
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        let limits = JoinLimits::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            log_filter: "info".to_string(),
            max_room_id_len: limits.max_room_id_len,
            max_display_name_len: limits.max_display_name_len,
            max_chat_len: DEFAULT_MAX_CHAT_LEN,
            join_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_match_join_limits() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:5000");
        assert_eq!(config.join_limits().max_display_name_len, 64);
        assert_eq!(config.join_timeout(), Duration::from_secs(10));
    }
}
