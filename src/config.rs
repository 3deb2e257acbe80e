use crate::core::db::{ConnectionProfile, Dialect};
use crate::core::{RelError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: Option<LoggingConfig>,
}

/// Connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub dialect: Dialect,
    /// Emit `with(nolock)` on reads where the dialect supports it; defaults to on
    pub no_lock: Option<bool>,
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `relbridge=debug`
    pub filter: Option<String>,
}

impl Config {
    /// Parses configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Config> {
        toml::from_str(content).map_err(|e| RelError::Configuration(e.to_string()))
    }

    /// The connection profile described by `[database]`.
    pub fn profile(&self) -> ConnectionProfile {
        ConnectionProfile::new(self.database.connection_string.clone(), self.database.dialect)
    }

    pub fn no_lock(&self) -> bool {
        self.database.no_lock.unwrap_or(true)
    }

    /// Log filter directive, if one is configured.
    pub fn log_filter(&self) -> Option<&str> {
        self.logging.as_ref().and_then(|l| l.filter.as_deref())
    }
}

/// Loads configuration from a TOML file at the given path.
///
/// # Arguments
///
/// * `path` - The file path to the TOML configuration file.
///
/// # Example
///
/// ```ignore
/// let config = load_config("relbridge.toml")?;
/// let session = Session::from_config(&config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    Config::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_CONFIG: &str = r#"
[database]
connection_string = "Server=.;Database=app;Trusted_Connection=True"
dialect = "mssql"
no_lock = false

[logging]
filter = "relbridge=debug"
"#;

    #[test]
    fn test_load_config_from_str() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).expect("Failed to parse sample config");
        assert_eq!(config.database.dialect, Dialect::SqlServer);
        assert!(!config.no_lock());
        assert_eq!(config.log_filter(), Some("relbridge=debug"));
        assert_eq!(
            config.profile(),
            ConnectionProfile::new("Server=.;Database=app;Trusted_Connection=True", Dialect::SqlServer)
        );
    }

    #[test]
    fn test_optional_sections_default() {
        let config = Config::from_toml_str("[database]\nconnection_string = \"app.db\"\ndialect = \"sqlite\"\n").unwrap();
        assert!(config.no_lock());
        assert_eq!(config.log_filter(), None);
    }

    #[test]
    fn test_bad_config_is_configuration_error() {
        let unknown = Config::from_toml_str("[database]\nconnection_string = \"x\"\ndialect = \"oracle\"\n");
        assert!(matches!(unknown, Err(RelError::Configuration(_))));
        assert!(matches!(
            Config::from_toml_str("[logging]\nfilter = \"info\"\n"),
            Err(RelError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", SAMPLE_CONFIG).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.database.connection_string, "Server=.;Database=app;Trusted_Connection=True");

        assert!(matches!(
            load_config("/definitely/not/here.toml"),
            Err(RelError::Io(_))
        ));
    }
}
