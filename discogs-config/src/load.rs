use std::io;
use std::path::{Path, PathBuf};

use rust_cli_config::{ConfigError, File};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Configuration directory, relative to the working directory.
const DEFAULT_CONFIG_DIR: &str = "configuration";

/// Variable overriding [`DEFAULT_CONFIG_DIR`].
const CONFIG_DIR_ENV_NAME: &str = "APP_CONFIG_DIR";

const FILE_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

const ENV_PREFIX: &str = "APP";

/// Separates nested keys in variable names, as in `APP_LOADER__PREFETCH_COUNT`.
const ENV_NESTING_SEPARATOR: &str = "__";

const ENV_LIST_SEPARATOR: &str = ",";

/// Top-level configuration of a service.
pub trait Config: DeserializeOwned {
    /// Keys whose environment overrides are comma separated lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to resolve the configuration directory: {0}")]
    ConfigDir(#[source] io::Error),

    #[error("configuration directory `{}` does not exist", .0.display())]
    MissingDirectory(PathBuf),

    #[error("no base configuration in `{}`, expected base.yaml, base.yml or base.json", .0.display())]
    MissingBaseFile(PathBuf),

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] ConfigError),
}

/// Loads the configuration of a service.
///
/// Layers, later ones winning: `base.{yaml,yml,json}`, the optional file named after the
/// runtime [`Environment`], then `APP_` environment variables.
pub fn load_config<T: Config>() -> Result<T, LoadConfigError> {
    let directory = match std::env::var_os(CONFIG_DIR_ENV_NAME) {
        Some(directory) => PathBuf::from(directory),
        None => std::env::current_dir()
            .map_err(LoadConfigError::ConfigDir)?
            .join(DEFAULT_CONFIG_DIR),
    };

    load_config_from(&directory, Environment::load()?)
}

pub(crate) fn load_config_from<T: Config>(
    directory: &Path,
    environment: Environment,
) -> Result<T, LoadConfigError> {
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingDirectory(directory.to_path_buf()));
    }

    let base = find_file(directory, "base")
        .ok_or_else(|| LoadConfigError::MissingBaseFile(directory.to_path_buf()))?;
    let mut builder = rust_cli_config::Config::builder().add_source(File::from(base));
    if let Some(overlay) = find_file(directory, environment.as_str()) {
        builder = builder.add_source(File::from(overlay));
    }

    let config = builder
        .add_source(environment_source(T::LIST_PARSE_KEYS))
        .build()?
        .try_deserialize()?;

    Ok(config)
}

fn find_file(directory: &Path, stem: &str) -> Option<PathBuf> {
    FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .find(|path| path.is_file())
}

fn environment_source(list_keys: &[&str]) -> rust_cli_config::Environment {
    let mut source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator(ENV_NESTING_SEPARATOR)
        .try_parsing(true);

    // A list separator without keys would split every value.
    if !list_keys.is_empty() {
        source = source.list_separator(ENV_LIST_SEPARATOR);
        for key in list_keys {
            source = source.with_list_parse_key(key);
        }
    }

    source
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    impl Config for Sample {
        const LIST_PARSE_KEYS: &'static [&'static str] = &[];
    }

    #[test]
    fn test_missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("configuration");

        let err = load_config_from::<Sample>(&missing, Environment::Dev).unwrap_err();
        assert!(matches!(err, LoadConfigError::MissingDirectory(path) if path == missing));
    }

    #[test]
    fn test_missing_base_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dev.yaml"), "count: 1\n").unwrap();

        let err = load_config_from::<Sample>(dir.path(), Environment::Dev).unwrap_err();
        assert!(matches!(err, LoadConfigError::MissingBaseFile(_)));
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), "name: base\ncount: 1\n").unwrap();
        fs::write(dir.path().join("dev.json"), r#"{"count": 7}"#).unwrap();
        fs::write(dir.path().join("prod.yml"), "count: 9\n").unwrap();

        let dev: Sample = load_config_from(dir.path(), Environment::Dev).unwrap();
        assert_eq!((dev.name.as_str(), dev.count), ("base", 7));

        let prod: Sample = load_config_from(dir.path(), Environment::Prod).unwrap();
        assert_eq!((prod.name.as_str(), prod.count), ("base", 9));
    }

    #[test]
    fn test_environment_file_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), "name: base\ncount: 3\n").unwrap();

        let sample: Sample = load_config_from(dir.path(), Environment::Prod).unwrap();
        assert_eq!(sample.count, 3);
    }
}
