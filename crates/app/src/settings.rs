//! Handles settings for the application. Configuration is written in
//! `settings.toml`, every key can be overridden from the environment with the
//! `TALLY__` prefix, e.g. `TALLY__SCANNER__INTERVAL_SECS=30`.
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct App {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Database {
    #[default]
    Memory,
    Sqlite(String),
}

impl Database {
    pub fn url(&self) -> String {
        match self {
            Database::Memory => String::from("sqlite::memory:"),
            Database::Sqlite(path) => format!("sqlite:{path}?mode=rwc"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Scanner {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_flush")]
    pub flush_on_shutdown: bool,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            flush_on_shutdown: default_flush(),
        }
    }
}

fn default_interval() -> u64 {
    60
}

fn default_flush() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub scanner: Scanner,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("settings").required(false))
            .add_source(Environment::with_prefix("TALLY").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    fn parse(toml: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let settings = parse("");
        assert_eq!(settings.app.level, "info");
        assert_eq!(settings.database.url(), "sqlite::memory:");
        assert_eq!(settings.scanner.interval_secs, 60);
        assert!(settings.scanner.flush_on_shutdown);
    }

    #[test]
    fn reads_sqlite_path_and_scanner() {
        let settings = parse(
            r#"
            [app]
            level = "debug"

            [database]
            sqlite = "/var/lib/tally/tally.db"

            [scanner]
            interval_secs = 5
            flush_on_shutdown = false
            "#,
        );
        assert_eq!(settings.app.level, "debug");
        assert_eq!(settings.database.url(), "sqlite:/var/lib/tally/tally.db?mode=rwc");
        assert_eq!(settings.scanner.interval_secs, 5);
        assert!(!settings.scanner.flush_on_shutdown);
    }
}
