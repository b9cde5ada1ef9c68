//! INI-style configuration loader.
//!
//! Sections: `[server]`, `[logging]`, `[network]`, `[lazyfree]`,
//! `[database]`. Memory sizes accept the suffixes `b`, `k`, `kb`, `m`,
//! `mb`, `g`, `gb` (the one-letter forms are powers of ten, the two-letter
//! forms powers of two). Unknown keys are rejected with the offending
//! location.

use std::{fs, path::{Path, PathBuf}};

use tracing::Level;

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read configuration file")]
    Io(#[from] std::io::Error),
    #[error("line {line}: malformed directive: {text}")]
    Malformed { line: usize, text: String },
    #[error("line {line}: unknown item \"{key}\" in section [{section}]")]
    UnknownKey {
        line: usize,
        section: String,
        key: String,
    },
    #[error("line {line}: invalid value for {key}: {value}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
}

/// How many fds to keep aside for listeners, the poll fd, logs and friends.
pub const RESERVED_FDS: usize = 32;

/// Upper bound for the cron frequency.
pub const CRON_MAX_FREQUENCY: u32 = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: Option<String>,
    pub tcp_backlog: i32,
    pub max_clients: usize,
    /// Cron ticks per second.
    pub cron_frequency: u32,
    /// 0 means unlimited.
    pub max_memory: usize,
    pub pidfile: PathBuf,
    pub unix_domain_socket: Option<PathBuf>,
    pub unix_domain_perm: u32,
    pub log_level: Level,
    pub log_file: Option<PathBuf>,
    pub lazyfree_server_del: bool,
    pub max_dbs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6000,
            bind: None,
            tcp_backlog: 511,
            max_clients: 10_000,
            cron_frequency: 10,
            max_memory: 0,
            pidfile: PathBuf::from("/var/run/rhino-rox.pid"),
            unix_domain_socket: None,
            unix_domain_perm: 0o700,
            log_level: Level::INFO,
            log_file: None,
            lazyfree_server_del: false,
            max_dbs: 16,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();
        let mut section = String::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }
            if let Some(name) = trimmed.strip_prefix('[') {
                let Some(name) = name.strip_suffix(']') else {
                    return Err(ConfigError::Malformed {
                        line,
                        text: trimmed.to_owned(),
                    });
                };
                section = name.trim().to_ascii_lowercase();
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::Malformed {
                    line,
                    text: trimmed.to_owned(),
                });
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            config.apply(&section, &key, value, line)?;
        }
        Ok(config)
    }

    fn apply(&mut self, section: &str, key: &str, value: &str, line: usize) -> Result<()> {
        let invalid = || ConfigError::InvalidValue {
            line,
            key: key.to_owned(),
            value: value.to_owned(),
        };

        match (section, key) {
            ("server", "max_clients") => {
                self.max_clients = value.parse().map_err(|_| invalid())?;
                if self.max_clients == 0 {
                    return Err(invalid());
                }
            }
            ("server", "cron_frequency") => {
                self.cron_frequency = value.parse().map_err(|_| invalid())?;
                if self.cron_frequency == 0 || self.cron_frequency > CRON_MAX_FREQUENCY {
                    return Err(invalid());
                }
            }
            ("server", "max_memory") => {
                self.max_memory = parse_memory(value).ok_or_else(invalid)?;
            }
            ("server", "pidfile") => self.pidfile = PathBuf::from(value),
            ("server", "unix_domain_socket") => {
                self.unix_domain_socket = Some(PathBuf::from(value));
            }
            ("server", "unix_domain_perm") => {
                self.unix_domain_perm =
                    u32::from_str_radix(value, 8).map_err(|_| invalid())?;
            }
            ("logging", "log_level") => {
                self.log_level = parse_log_level(value).ok_or_else(invalid)?;
            }
            ("logging", "log_file") => self.log_file = Some(PathBuf::from(value)),
            ("network", "port") => {
                self.port = value.parse().map_err(|_| invalid())?;
            }
            ("network", "bind") => self.bind = Some(value.to_owned()),
            ("network", "tcp_backlog") => {
                self.tcp_backlog = value.parse().map_err(|_| invalid())?;
                if self.tcp_backlog < 0 {
                    return Err(invalid());
                }
            }
            ("lazyfree", "server_del") => {
                self.lazyfree_server_del = match value {
                    "0" => false,
                    "1" => true,
                    _ => return Err(invalid()),
                };
            }
            ("database", "max_dbs") => {
                self.max_dbs = value.parse().map_err(|_| invalid())?;
                if self.max_dbs == 0 {
                    return Err(invalid());
                }
            }
            _ => {
                return Err(ConfigError::UnknownKey {
                    line,
                    section: section.to_owned(),
                    key: key.to_owned(),
                })
            }
        }
        Ok(())
    }
}

/// Convert a memory amount with an optional unit suffix into bytes.
fn parse_memory(text: &str) -> Option<usize> {
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let digits = &text[..digits_end];
    if digits.is_empty() {
        return None;
    }
    let value: usize = digits.parse().ok()?;
    let multiplier: usize = match text[digits_end..].to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" => 1000,
        "kb" => 1024,
        "m" => 1000 * 1000,
        "mb" => 1024 * 1024,
        "g" => 1000 * 1000 * 1000,
        "gb" => 1024 * 1024 * 1024,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

fn parse_log_level(text: &str) -> Option<Level> {
    match text.to_ascii_lowercase().as_str() {
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warning" => Some(Level::WARN),
        "error" | "critical" => Some(Level::ERROR),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::{parse_memory, Config, ConfigError};

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.port, 6000);
        assert_eq!(config.max_dbs, 16);
        assert!(!config.lazyfree_server_del);
    }

    #[test]
    fn full_file() {
        let config = Config::parse(
            "; rhino-rox configuration\n\
             [server]\n\
             max_clients = 128\n\
             cron_frequency = 100\n\
             max_memory = 64mb\n\
             pidfile = /tmp/rr.pid\n\
             \n\
             [logging]\n\
             log_level = warning\n\
             log_file = /tmp/rr.log\n\
             \n\
             [network]\n\
             port = 7777\n\
             bind = 127.0.0.1\n\
             tcp_backlog = 128\n\
             \n\
             [lazyfree]\n\
             server_del = 1\n\
             \n\
             [database]\n\
             max_dbs = 4\n",
        )
        .unwrap();

        assert_eq!(config.max_clients, 128);
        assert_eq!(config.cron_frequency, 100);
        assert_eq!(config.max_memory, 64 * 1024 * 1024);
        assert_eq!(config.pidfile.to_str(), Some("/tmp/rr.pid"));
        assert_eq!(config.log_level, Level::WARN);
        assert_eq!(config.port, 7777);
        assert_eq!(config.bind.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.tcp_backlog, 128);
        assert!(config.lazyfree_server_del);
        assert_eq!(config.max_dbs, 4);
    }

    #[test]
    fn memory_suffixes() {
        assert_eq!(parse_memory("123"), Some(123));
        assert_eq!(parse_memory("1b"), Some(1));
        assert_eq!(parse_memory("2k"), Some(2000));
        assert_eq!(parse_memory("2kb"), Some(2048));
        assert_eq!(parse_memory("3m"), Some(3_000_000));
        assert_eq!(parse_memory("3MB"), Some(3 * 1024 * 1024));
        assert_eq!(parse_memory("1g"), Some(1_000_000_000));
        assert_eq!(parse_memory("1gb"), Some(1 << 30));
        assert_eq!(parse_memory("x"), None);
        assert_eq!(parse_memory("1q"), None);
        assert_eq!(parse_memory(""), None);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(matches!(
            Config::parse("[server]\nnope = 1\n"),
            Err(ConfigError::UnknownKey { .. })
        ));
        assert!(matches!(
            Config::parse("[network]\nport = 70000\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            Config::parse("[server]\ncron_frequency = 5000\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            Config::parse("[lazyfree]\nserver_del = yes\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            Config::parse("just text\n"),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn octal_unix_permissions() {
        let config =
            Config::parse("[server]\nunix_domain_socket = /tmp/rr.sock\nunix_domain_perm = 770\n")
                .unwrap();
        assert_eq!(config.unix_domain_perm, 0o770);
        assert_eq!(config.unix_domain_socket.unwrap().to_str(), Some("/tmp/rr.sock"));
    }
}
