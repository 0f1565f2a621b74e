use std::env;
use std::path::PathBuf;

/// Database configuration.
///
/// Reads from the `ALPHRED_DATABASE_PATH` environment variable, falling back
/// to `<platform data dir>/alphred/alphred.db` when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Filesystem path of the SQLite database file.
    pub database_path: PathBuf,
}

impl DbConfig {
    /// Build a config from the environment.
    ///
    /// Priority: `ALPHRED_DATABASE_PATH` env var, then the platform default.
    pub fn from_env() -> Self {
        let database_path = env::var("ALPHRED_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        Self { database_path }
    }

    /// Build a config from an explicit path (useful for tests and embedders).
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// The default database location: `<data dir>/alphred/alphred.db`,
    /// falling back to a relative path when the platform data directory
    /// cannot be determined.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("alphred")
            .join("alphred.db")
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
