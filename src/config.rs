use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: expected a number, got '{value}'")]
    NotANumber { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Server settings, read from `RENTABLE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5480,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "rentable".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let number = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::NotANumber { var, value }),
            }
        };
        let port = |var: &'static str| -> Result<Option<u16>, ConfigError> {
            match number(var)? {
                None => Ok(None),
                Some(n) => u16::try_from(n).map(Some).map_err(|_| ConfigError::NotANumber {
                    var,
                    value: n.to_string(),
                }),
            }
        };

        let max_connections = number("RENTABLE_MAX_CONNECTIONS")?
            .map_or(defaults.max_connections, |n| n as usize);
        if max_connections == 0 {
            return Err(ConfigError::Zero("RENTABLE_MAX_CONNECTIONS"));
        }
        let compact_threshold =
            number("RENTABLE_COMPACT_THRESHOLD")?.unwrap_or(defaults.compact_threshold);
        if compact_threshold == 0 {
            return Err(ConfigError::Zero("RENTABLE_COMPACT_THRESHOLD"));
        }

        Ok(Self {
            port: port("RENTABLE_PORT")?.unwrap_or(defaults.port),
            bind: lookup("RENTABLE_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("RENTABLE_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("RENTABLE_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            compact_threshold,
            metrics_port: port("RENTABLE_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("rentable.wal")
    }
}
