//! Config loading and persistence.

mod load;
mod merge;
mod schema;

use std::path::PathBuf;

use thiserror::Error;

pub use load::{config_path, load, load_from, load_layer, write_config};
pub use merge::{apply_env_overrides, merge_layers};
pub use schema::{
    CollabConfig, CollabConfigOverride, Config, ConfigLayer, FileLoggingConfig,
    FileLoggingConfigOverride, LimitsOverride, LogFormat, LogRotation, LoggingConfig,
    LoggingConfigOverride,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
