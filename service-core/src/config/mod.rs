use config::{Config, ConfigError, Environment, File};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

/// Locate `<service>/config`, whether the process runs from the workspace
/// root or from the service directory itself.
pub fn config_dir(service: &str) -> Result<PathBuf, ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;

    if base_path.ends_with(service) {
        Ok(base_path.join("config"))
    } else {
        Ok(base_path.join(service).join("config"))
    }
}

/// `base.yaml` from `service`'s config directory, overlaid by
/// `APP_<SECTION>__<KEY>` environment variables.
pub fn load<T: DeserializeOwned>(service: &str) -> Result<T, ConfigError> {
    let configuration_directory = config_dir(service)?;

    let settings = Config::builder()
        .add_source(File::from(configuration_directory.join("base.yaml")).required(true))
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<T>()
}
