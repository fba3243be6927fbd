use std::env;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Load a configuration struct from the file named by `RELAY_CONFIG`
/// (default `relay.yaml` in the working directory), with `RELAY_*`
/// environment variables layered on top.
///
/// A missing file is not an error; the struct's own defaults and the
/// environment decide. A file that exists but does not parse, or a value
/// of the wrong shape, is returned to the caller instead of taking the
/// process down.
pub fn load<T: DeserializeOwned>() -> Result<T, ConfigError> {
    let path = env::var("RELAY_CONFIG").unwrap_or_else(|_| "relay.yaml".into());
    load_from(path)
}

/// Same layering with an explicit file path.
pub fn load_from<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    debug!(target: "config", path = %path.display(), "loading configuration");

    Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(Environment::with_prefix("RELAY"))
        .build()?
        .try_deserialize()
}
