use std::net::SocketAddr;

use courier_infra::{ConfigError, QueueConfig};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Everything the binary reads from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    /// `None` means the insecure dev default is used.
    pub admin_token: Option<String>,
    pub queue: QueueConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen = lookup("COURIER_LISTEN_ADDR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen.parse().map_err(|_| ConfigError::Invalid {
            key: "COURIER_LISTEN_ADDR",
            expected: "a socket address",
            value: listen.clone(),
        })?;

        let admin_token = lookup("COURIER_ADMIN_TOKEN")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            listen_addr,
            admin_token,
            queue: QueueConfig::from_lookup(&lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert!(cfg.admin_token.is_none());
        assert_eq!(cfg.queue, QueueConfig::default());
    }

    #[test]
    fn reads_listen_addr_and_token() {
        let cfg = AppConfig::from_lookup(|key| match key {
            "COURIER_LISTEN_ADDR" => Some("127.0.0.1:9000".into()),
            "COURIER_ADMIN_TOKEN" => Some(" ops-token ".into()),
            "NOTIFY_WORKERS" => Some("4".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.listen_addr.port(), 9000);
        assert_eq!(cfg.admin_token.as_deref(), Some("ops-token"));
        assert_eq!(cfg.queue.workers, 4);
    }

    #[test]
    fn bad_listen_addr_is_an_error() {
        let err = AppConfig::from_lookup(|key| {
            (key == "COURIER_LISTEN_ADDR").then(|| "localhost".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "COURIER_LISTEN_ADDR", .. }));
    }
}
