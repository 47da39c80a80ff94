//! Host and client configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::registry::RegistryLimits;

pub const DEFAULT_SOCKET_PREFIX: &str = "shmq";
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_MAX_SEGMENTS: usize = 4096;
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
pub const DEFAULT_MAX_MESSAGES_PER_POLL: usize = 64;
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Host-side settings for a [`MessageQueue`](crate::MessageQueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Directory the rendezvous socket is created in.
    pub socket_dir: PathBuf,
    /// File-name prefix of the rendezvous socket.
    pub socket_prefix: String,
    /// Largest segment a client may allocate or register, in bytes.
    pub max_segment_size: u64,
    /// Live segments across all connections.
    pub max_segments: usize,
    /// Simultaneously accepted connections.
    pub max_connections: usize,
    /// Datagrams drained from one socket per `poll_once`, so one chatty
    /// client cannot starve the others.
    pub max_messages_per_poll: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            socket_prefix: DEFAULT_SOCKET_PREFIX.to_owned(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_segments: DEFAULT_MAX_SEGMENTS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_messages_per_poll: DEFAULT_MAX_MESSAGES_PER_POLL,
        }
    }
}

fn default_socket_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(std::env::temp_dir)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl QueueConfig {
    /// Defaults overridden by `SHMQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`QueueConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup("SHMQ_SOCKET_DIR") {
            if dir.is_empty() {
                return Err(ConfigError::Invalid {
                    var: "SHMQ_SOCKET_DIR",
                    value: dir,
                    expected: "directory",
                });
            }
            config.socket_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = lookup("SHMQ_SOCKET_PREFIX") {
            if prefix.is_empty() || prefix.contains('/') {
                return Err(ConfigError::Invalid {
                    var: "SHMQ_SOCKET_PREFIX",
                    value: prefix,
                    expected: "file-name prefix",
                });
            }
            config.socket_prefix = prefix;
        }
        if let Some(v) = parse_positive::<u64>(&lookup, "SHMQ_MAX_SEGMENT_SIZE")? {
            config.max_segment_size = v;
        }
        if let Some(v) = parse_positive::<usize>(&lookup, "SHMQ_MAX_SEGMENTS")? {
            config.max_segments = v;
        }
        if let Some(v) = parse_positive::<usize>(&lookup, "SHMQ_MAX_CONNECTIONS")? {
            config.max_connections = v;
        }

        Ok(config)
    }

    pub fn registry_limits(&self) -> RegistryLimits {
        RegistryLimits {
            max_segment_size: self.max_segment_size,
            max_segments: self.max_segments,
        }
    }
}

fn parse_positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + Default + PartialEq,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    match value.trim().parse::<T>() {
        Ok(v) if v != T::default() => Ok(Some(v)),
        _ => Err(ConfigError::Invalid {
            var,
            value,
            expected: "positive integer",
        }),
    }
}

/// Client-side settings for a [`Client`](crate::Client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long to wait for the handshake acknowledgment and for each reply.
    pub reply_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn no_overrides_gives_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.socket_prefix, "shmq");
        assert_eq!(config.max_segment_size, 256 * 1024 * 1024);
    }

    #[test]
    fn overrides_apply() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("SHMQ_SOCKET_DIR", "/run/shmq"),
            ("SHMQ_SOCKET_PREFIX", "gpu"),
            ("SHMQ_MAX_SEGMENT_SIZE", "4096"),
            ("SHMQ_MAX_SEGMENTS", " 8 "),
            ("SHMQ_MAX_CONNECTIONS", "2"),
        ]))
        .unwrap();

        assert_eq!(config.socket_dir, PathBuf::from("/run/shmq"));
        assert_eq!(config.socket_prefix, "gpu");
        assert_eq!(
            config.registry_limits(),
            RegistryLimits {
                max_segment_size: 4096,
                max_segments: 8
            }
        );
        assert_eq!(config.max_connections, 2);
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = QueueConfig::from_lookup(lookup(&[("SHMQ_MAX_SEGMENTS", "lots")])).unwrap_err();
        assert!(err.to_string().contains("SHMQ_MAX_SEGMENTS"));

        let err = QueueConfig::from_lookup(lookup(&[("SHMQ_MAX_SEGMENT_SIZE", "0")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "SHMQ_MAX_SEGMENT_SIZE",
                ..
            }
        ));

        assert!(QueueConfig::from_lookup(lookup(&[("SHMQ_SOCKET_PREFIX", "a/b")])).is_err());
    }
}
