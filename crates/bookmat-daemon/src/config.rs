//! Daemon configuration.
//!
//! Everything deployment-specific comes from the environment, with
//! defaults matching the bring-up cabinet. Mechanical tunables live in
//! the calibration document instead; the split is: environment for
//! "where and who", calibration for "how far and how fast".

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use bookmat_irbis::IrbisConfig;

/// Operation timeouts, milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub move_ms: u64,
    pub tray_extend_ms: u64,
    pub tray_retract_ms: u64,
    pub cell_open_ms: u64,
    pub cell_close_ms: u64,
    pub user_wait_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            move_ms: 1500,
            tray_extend_ms: 800,
            tray_retract_ms: 800,
            cell_open_ms: 1000,
            cell_close_ms: 1000,
            user_wait_ms: 30_000,
        }
    }
}

impl Timeouts {
    #[must_use]
    pub fn user_wait(&self) -> Duration {
        Duration::from_millis(self.user_wait_ms)
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Run against mock hardware and the mock library backend.
    pub mock_mode: bool,
    pub debug: bool,
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub calibration_path: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub irbis: IrbisConfig,
    /// Force the mock library backend even off mock hardware.
    pub irbis_mock: bool,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mock_mode: true,
            debug: false,
            host: "0.0.0.0".to_string(),
            port: 5000,
            database_path: PathBuf::from("bookmat/shelf_data.db"),
            calibration_path: PathBuf::from("bookmat/calibration.json"),
            log_level: "info".to_string(),
            log_file: None,
            irbis: IrbisConfig::default(),
            irbis_mock: false,
            timeouts: Timeouts::default(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    env_string(key).map_or(default, |v| {
        matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Reads the environment, falling back to defaults per variable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let irbis_defaults = IrbisConfig::default();

        Self {
            mock_mode: env_bool("MOCK_MODE", defaults.mock_mode),
            debug: env_bool("DEBUG", defaults.debug),
            host: env_parse("HOST", defaults.host),
            port: env_parse("PORT", defaults.port),
            database_path: env_string("DATABASE_PATH")
                .map_or(defaults.database_path, PathBuf::from),
            calibration_path: env_string("CALIBRATION_PATH")
                .map_or(defaults.calibration_path, PathBuf::from),
            log_level: env_parse("LOG_LEVEL", defaults.log_level),
            log_file: env_string("LOG_FILE").map(PathBuf::from),
            irbis: IrbisConfig {
                host: env_parse("IRBIS_HOST", irbis_defaults.host),
                port: env_parse("IRBIS_PORT", irbis_defaults.port),
                username: env_parse("IRBIS_USERNAME", irbis_defaults.username),
                password: env_parse("IRBIS_PASSWORD", irbis_defaults.password),
                database: env_parse("IRBIS_DATABASE", irbis_defaults.database),
                readers_database: env_parse("IRBIS_READERS_DB", irbis_defaults.readers_database),
                loan_days: env_parse("IRBIS_LOAN_DAYS", irbis_defaults.loan_days),
                location_code: env_parse("IRBIS_LOCATION_CODE", irbis_defaults.location_code),
                workstation: irbis_defaults.workstation,
            },
            irbis_mock: env_bool("IRBIS_MOCK", defaults.irbis_mock),
            timeouts: Timeouts::default(),
        }
    }

    /// Whether the library client should be the in-memory mock.
    #[must_use]
    pub const fn use_mock_library(&self) -> bool {
        self.mock_mode || self.irbis_mock
    }
}
