//! Validated URL of the resource store holding the metadata.

use std::{path::PathBuf, sync::Arc};

use fs_err as fs;
use metadata_store::{InMemoryResourceStore, ObjectResourceStore, ResourceStore};
use object_store::{
    ObjectStore, aws::AmazonS3Builder, azure::MicrosoftAzureBuilder,
    gcp::GoogleCloudStorageBuilder, path::Path, prefix::PrefixStore,
};
use url::Url;

/// Location of the metadata: `memory://` for a process-local store, a filesystem path, or an
/// object store URL (`file://`, `s3://`, `gs://`, `az://`).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MetadataStoreUrl(Url);

impl MetadataStoreUrl {
    pub fn new(location: impl Into<String>) -> Result<Self, MetadataStoreUrlError> {
        Self::new_with_base(location, None)
    }

    /// Parses a URL or filesystem path. Relative paths are resolved against `base`.
    pub fn new_with_base(
        location: impl Into<String>,
        base: Option<&std::path::Path>,
    ) -> Result<Self, MetadataStoreUrlError> {
        let location = location.into();
        Self::try_from_url(&location).or_else(|_| Self::try_from_filesystem_path(&location, base))
    }

    fn try_from_url(url: &str) -> Result<Self, MetadataStoreUrlError> {
        let inner = Url::parse(url).map_err(MetadataStoreUrlError::UrlParse)?;
        let _: StoreProvider = inner.scheme().parse()?;
        Ok(Self(inner))
    }

    /// The path must exist.
    fn try_from_filesystem_path(
        location: &str,
        base: Option<&std::path::Path>,
    ) -> Result<Self, MetadataStoreUrlError> {
        let mut path = PathBuf::from(location);
        if !path.is_absolute()
            && let Some(base) = base
        {
            path = base.join(path);
        }

        let canonical_path = fs::canonicalize(&path)
            .map_err(|source| MetadataStoreUrlError::InvalidFilesystemPath { path, source })?;
        let url = Url::from_directory_path(&canonical_path).map_err(|_| {
            MetadataStoreUrlError::InvalidFilesystemPath {
                path: canonical_path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "absolute path could not be resolved",
                ),
            }
        })?;
        Ok(Self(url))
    }

    pub fn provider(&self) -> StoreProvider {
        // The scheme was validated on construction
        self.0.scheme().parse().unwrap_or(StoreProvider::Local)
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    /// Opens the resource store at this location.
    ///
    /// Local filesystem locations are rejected: `LocalFileSystem` has no conditional updates.
    pub fn open(&self) -> Result<Arc<dyn ResourceStore>, StoreCreationError> {
        let provider = self.provider();
        let object_store: Arc<dyn ObjectStore> = match provider {
            StoreProvider::Memory => return Ok(Arc::new(InMemoryResourceStore::new())),
            StoreProvider::Local => {
                return Err(StoreCreationError::ConditionalUpdatesUnsupported {
                    url: self.to_string(),
                    provider,
                });
            }
            StoreProvider::AmazonS3 => {
                let store = AmazonS3Builder::from_env()
                    .with_url(self.0.as_str())
                    .build()
                    .map_err(|source| self.creation_error(source))?;
                Arc::new(PrefixStore::new(store, self.prefix()))
            }
            StoreProvider::GoogleCloudStorage => {
                let store = GoogleCloudStorageBuilder::from_env()
                    .with_url(self.0.as_str())
                    .build()
                    .map_err(|source| self.creation_error(source))?;
                Arc::new(PrefixStore::new(store, self.prefix()))
            }
            StoreProvider::MicrosoftAzure => {
                let store = MicrosoftAzureBuilder::from_env()
                    .with_url(self.0.as_str())
                    .build()
                    .map_err(|source| self.creation_error(source))?;
                Arc::new(PrefixStore::new(store, self.prefix()))
            }
        };

        tracing::debug!(url = %self, ?provider, "opened metadata object store");
        Ok(Arc::new(ObjectResourceStore::new(object_store)))
    }

    fn prefix(&self) -> Path {
        Path::from(self.0.path().trim_matches('/'))
    }

    fn creation_error(&self, source: object_store::Error) -> StoreCreationError {
        StoreCreationError::Backend {
            url: self.to_string(),
            source,
        }
    }
}

impl std::str::FromStr for MetadataStoreUrl {
    type Err = MetadataStoreUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from_url(s)
    }
}

impl std::fmt::Display for MetadataStoreUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for MetadataStoreUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// Supported metadata store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreProvider {
    /// Process-local store (`memory://`)
    Memory,

    /// Local filesystem (`file://`)
    Local,

    /// Amazon S3 (`s3://`, `s3a://`)
    AmazonS3,

    /// Google Cloud Storage (`gs://`)
    GoogleCloudStorage,

    /// Microsoft Azure (`az://`, `azure://`, `abfs://`, `abfss://`)
    MicrosoftAzure,
}

impl std::str::FromStr for StoreProvider {
    type Err = MetadataStoreUrlError;

    fn from_str(scheme: &str) -> Result<Self, Self::Err> {
        match scheme.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreProvider::Memory),
            "file" => Ok(StoreProvider::Local),
            "s3" | "s3a" => Ok(StoreProvider::AmazonS3),
            "gs" => Ok(StoreProvider::GoogleCloudStorage),
            "az" | "azure" | "abfs" | "abfss" => Ok(StoreProvider::MicrosoftAzure),
            _ => Err(MetadataStoreUrlError::UnsupportedScheme(scheme.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataStoreUrlError {
    #[error("invalid URL")]
    UrlParse(#[source] url::ParseError),

    #[error("unsupported metadata store scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("invalid filesystem path {}", path.display())]
    InvalidFilesystemPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The URL is valid but no resource store can be opened on it.
#[derive(Debug, thiserror::Error)]
pub enum StoreCreationError {
    /// The backend could not be initialized, e.g. for missing credentials.
    #[error("failed to open metadata store at {url}")]
    Backend {
        url: String,
        #[source]
        source: object_store::Error,
    },

    /// The backend cannot replace an object only if it is unchanged, so concurrent writers
    /// could not be detected and every update of an existing resource would fail.
    #[error("metadata store at {url} is not supported: {provider:?} has no conditional updates")]
    ConditionalUpdatesUnsupported { url: String, provider: StoreProvider },
}
