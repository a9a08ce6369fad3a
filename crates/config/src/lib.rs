//! Configuration of the realization metadata engine.
//!
//! Loaded from a TOML file with [Figment]. Values can be overridden by environment variables
//! prefixed with `REALIZATION_CONFIG_`, nested keys separated by double underscores: e.g.
//! `REALIZATION_CONFIG_REALIZATION__MAX_RETRIES` overrides `realization.max_retries`.
//!
//! ```toml
//! metadata_url = "s3://bucket/metadata"
//!
//! [realization]
//! max_retries = 7
//! merge_max_storage_bytes = 1073741824
//! ```

use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};
use fs_err as fs;
use realization::{MetadataContext, RealizationConfig};
use serde::Deserialize;

mod store_url;

pub use self::store_url::{
    MetadataStoreUrl, MetadataStoreUrlError, StoreCreationError, StoreProvider,
};

const ENV_PREFIX: &str = "REALIZATION_CONFIG_";

const DEFAULT_METADATA_URL: &str = "memory://";

#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: PathBuf,
    pub metadata_url: MetadataStoreUrl,
    pub realization: RealizationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    /// Location of the metadata, a URL or a path relative to the config file
    /// (default: "memory://")
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
    #[serde(default)]
    pub realization: RealizationConfig,
}

fn default_metadata_url() -> String {
    DEFAULT_METADATA_URL.to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error at {}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),
    #[error("config parse error at {}", .0.display())]
    Figment(PathBuf, #[source] figment::Error),
    #[error("invalid metadata store URL at {}", .0.display())]
    InvalidMetadataUrl(PathBuf, #[source] MetadataStoreUrlError),
    #[error("metadata store error at {}", .0.display())]
    Store(PathBuf, #[source] StoreCreationError),
}

impl Config {
    /// Load configuration from file with optional environment variable overrides.
    ///
    /// `config_override` is merged last and wins over both the file and the environment.
    pub fn load(
        file: impl Into<PathBuf>,
        env_override: bool,
        config_override: Option<Figment>,
    ) -> Result<Self, ConfigError> {
        let input_path = file.into();
        let config_path = fs::canonicalize(&input_path)
            .map_err(|err| ConfigError::Io(input_path.clone(), err))?;
        let contents = fs::read_to_string(&config_path)
            .map_err(|err| ConfigError::Io(config_path.clone(), err))?;

        let config_file: ConfigFile = {
            let mut config_builder = Figment::new().merge(Toml::string(&contents));
            if env_override {
                config_builder = config_builder.merge(Env::prefixed(ENV_PREFIX).split("__"));
            }
            if let Some(config_override) = config_override {
                config_builder = config_builder.merge(config_override);
            }
            config_builder
                .extract()
                .map_err(|err| ConfigError::Figment(config_path.clone(), err))?
        };

        // Resolve filesystem paths relative to the directory of the config file.
        let base = config_path.parent();
        let metadata_url = MetadataStoreUrl::new_with_base(&config_file.metadata_url, base)
            .map_err(|err| ConfigError::InvalidMetadataUrl(config_path.clone(), err))?;

        tracing::debug!(
            config = %config_path.display(),
            %metadata_url,
            "loaded configuration"
        );
        Ok(Self {
            config_path,
            metadata_url,
            realization: config_file.realization,
        })
    }

    /// Opens the metadata store and builds the engine context over it.
    pub fn metadata_context(&self) -> Result<MetadataContext, ConfigError> {
        let store = self
            .metadata_url
            .open()
            .map_err(|err| ConfigError::Store(self.config_path.clone(), err))?;
        Ok(MetadataContext::new(store, self.realization.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use figment::Figment;
    use realization::RealizationConfig;
    use tempfile::NamedTempFile;

    use super::{Config, ConfigError, StoreCreationError, StoreProvider};

    fn config_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file should be created");
        file.write_all(contents.as_bytes())
            .expect("config should be written");
        file
    }

    #[test]
    fn empty_file_yields_defaults() {
        //* Given
        let file = config_file("");

        //* When
        let config = Config::load(file.path(), false, None).expect("config should load");

        //* Then
        assert_eq!(config.metadata_url.provider(), StoreProvider::Memory);
        assert_eq!(config.realization, RealizationConfig::default());
    }

    #[test]
    fn realization_table_is_read() {
        //* Given
        let file = config_file(
            r#"
            metadata_url = "s3://bucket/metadata"

            [realization]
            max_retries = 3
            merge_max_storage_bytes = 1024
            force_rebuild_dictionaries = true
            "#,
        );

        //* When
        let config = Config::load(file.path(), false, None).expect("config should load");

        //* Then
        assert_eq!(config.metadata_url.provider(), StoreProvider::AmazonS3);
        assert_eq!(config.realization.max_retries, 3);
        assert_eq!(config.realization.merge_quota(), Some(1024));
        assert!(config.realization.force_rebuild_dictionaries);
        assert!(config.realization.auto_promote_empty_warning_segments);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        //* Given
        let dir = tempfile::tempdir().expect("temp dir should be created");
        fs_err::create_dir(dir.path().join("metadata")).expect("store dir should be created");
        let path = dir.path().join("config.toml");
        fs_err::write(&path, r#"metadata_url = "metadata""#).expect("config should be written");

        //* When
        let config = Config::load(&path, false, None).expect("config should load");

        //* Then
        assert_eq!(config.metadata_url.provider(), StoreProvider::Local);
        assert!(
            config.metadata_url.as_url().path().ends_with("/metadata/"),
            "got {}",
            config.metadata_url
        );
    }

    #[test]
    fn local_filesystem_store_is_refused_on_open() {
        //* Given
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("config.toml");
        fs_err::write(&path, r#"metadata_url = ".""#).expect("config should be written");
        let config = Config::load(&path, false, None).expect("config should load");

        //* When
        let result = config.metadata_context();

        //* Then
        assert!(
            matches!(
                result,
                Err(ConfigError::Store(
                    _,
                    StoreCreationError::ConditionalUpdatesUnsupported {
                        provider: StoreProvider::Local,
                        ..
                    }
                ))
            ),
            "got {:?}",
            result.err()
        );
    }

    #[test]
    fn override_wins_over_file() {
        //* Given
        let file = config_file("[realization]\nmax_retries = 3\n");
        let overrides = Figment::new().merge(("realization.max_retries", 9));

        //* When
        let config = Config::load(file.path(), false, Some(overrides)).expect("config should load");

        //* Then
        assert_eq!(config.realization.max_retries, 9);
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        //* Given
        let file = config_file(r#"metadata_url = "ftp://host/metadata""#);

        //* When
        let result = Config::load(file.path(), false, None);

        //* Then
        assert!(
            matches!(result, Err(ConfigError::InvalidMetadataUrl(..))),
            "got {result:?}"
        );
    }

    #[tokio::test]
    async fn memory_store_backs_a_working_context() {
        //* Given
        let file = config_file("");
        let config = Config::load(file.path(), false, None).expect("config should load");

        //* When
        let context = config.metadata_context().expect("context should open");
        let dataflows = context
            .dataflow_manager("default")
            .list_all(true)
            .await
            .expect("listing should succeed");

        //* Then
        assert!(dataflows.is_empty());
    }
}
