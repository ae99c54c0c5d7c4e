mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{
    BrokerSettings, LoggingSettings, ServerSettings, Settings, StorageBackend, StorageSettings,
};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default";

/// Prefix of environment variables that override the file, e.g.
/// `POPMQ_BROKER__DEFAULT_MAX_RETRY=3`.
pub const ENV_PREFIX: &str = "POPMQ";

/// Loads `config/default.*` plus environment overrides.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

/// Loads the configuration from `path` (optional, any format `config`
/// understands) and `POPMQ_*` environment variables, then merges it with
/// default values.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_with_defaults())
}

#[cfg(test)]
mod tests;
