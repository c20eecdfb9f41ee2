use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
///
/// Every field has a default, so a config file only needs the values it changes:
///
/// ```toml
/// listen = "127.0.0.1:4005"
/// dedicated_output = true
/// idle_timeout_secs = 600
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the server listens on.
    pub listen: String,
    /// Stream worker output through a separate socket instead of `:write-string` messages.
    pub dedicated_output: bool,
    /// Close connections that stay silent for longer than this.
    pub idle_timeout_secs: Option<u64>,
    /// Write the bound port number into this file once listening.
    pub port_file: Option<PathBuf>,
    /// Package reported to clients that have not chosen one.
    pub default_package: String,
    /// Number of frames sent together with a debugger entry.
    pub backtrace_length: usize,
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:4005".to_string(),
            dedicated_output: false,
            idle_timeout_secs: None,
            port_file: None,
            default_package: "USER".to_string(),
            backtrace_length: 20,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/slink/config.toml";

    /// Load configuration.
    ///
    /// With an explicit `path` the file must exist. Without it the file at
    /// `~/.config/slink/config.toml` is used if present, otherwise defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let data = match path {
            Some(path) => read_to_string(path)
                .with_context(|| format!("read config file {}", path.display()))?,
            None => {
                let Some(path) = Self::default_path() else {
                    return Ok(Self::default());
                };
                match read_to_string(&path) {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(Self::default());
                    }
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("read config file {}", path.display()));
                    }
                }
            }
        };

        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        let config: Config = toml::de::from_str(data).context("parse config")?;
        anyhow::ensure!(
            config.backtrace_length > 0,
            "backtrace_length must be positive"
        );
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(Self::DEFAULT_PATH))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_partial_config() {
        let config = Config::from_toml(
            r#"
            listen = "0.0.0.0:7000"
            idle_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, "0.0.0.0:7000");
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.default_package, "USER");
        assert_eq!(config.backtrace_length, 20);
        assert!(!config.dedicated_output);
    }

    #[test]
    fn test_invalid_config() {
        struct TestCase {
            data: &'static str,
        }
        let cases = [
            TestCase {
                data: "listen = 5",
            },
            TestCase {
                data: "unknown_key = true",
            },
            TestCase {
                data: "backtrace_length = 0",
            },
        ];

        for tc in cases {
            assert!(Config::from_toml(tc.data).is_err(), "{}", tc.data);
        }
    }

    #[test]
    fn test_serde() {
        let config = Config {
            dedicated_output: true,
            port_file: Some(PathBuf::from("/tmp/slink.port")),
            ..Config::default()
        };
        let ser = toml::ser::to_string(&config).unwrap();
        let de = Config::from_toml(&ser).unwrap();
        assert_eq!(config, de);
    }

    #[test]
    #[serial]
    fn test_load_from_home() {
        let home = std::env::temp_dir().join(format!("slink-home-{}", std::process::id()));
        let dir = home.join(".config/slink");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.toml"), "dedicated_output = true\n").unwrap();

        let prev_home = std::env::var_os("HOME");
        std::env::set_var("HOME", &home);
        let loaded = Config::load(None);
        match prev_home {
            Some(prev) => std::env::set_var("HOME", prev),
            None => std::env::remove_var("HOME"),
        }
        fs::remove_dir_all(&home).unwrap();

        assert!(loaded.unwrap().dedicated_output);
    }

    #[test]
    #[serial]
    fn test_load_missing_default() {
        let home = std::env::temp_dir().join(format!("slink-empty-home-{}", std::process::id()));
        fs::create_dir_all(&home).unwrap();

        let prev_home = std::env::var_os("HOME");
        std::env::set_var("HOME", &home);
        let loaded = Config::load(None);
        match prev_home {
            Some(prev) => std::env::set_var("HOME", prev),
            None => std::env::remove_var("HOME"),
        }
        fs::remove_dir_all(&home).unwrap();

        assert_eq!(loaded.unwrap(), Config::default());
    }

    #[test]
    fn test_load_explicit_missing() {
        let path = std::env::temp_dir().join("slink-definitely-missing.toml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
