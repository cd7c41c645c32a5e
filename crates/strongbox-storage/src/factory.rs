//! Build the storage backend configured for a backup option.

use std::path::Path;
use std::sync::Arc;

use strongbox_core::config::BackendConfig;
use strongbox_core::error::{Result, StrongboxError};
use strongbox_core::types::BackendKind;

use crate::local::LocalBackend;
use crate::provider::StorageBackend;

/// Create the backend described by `config`.
///
/// - `local`: folder from `path`, or chosen during interactive setup when unset
/// - `s3`: AWS S3 (`bucket`, optional `region`)
/// - `s3compatible`: MinIO, Garage, etc. (`bucket` + `endpoint_url`, path-style by default)
pub async fn create_backend(config: &BackendConfig) -> Result<Arc<dyn StorageBackend>> {
    let name = format!("{}-{}", config.option, config.backend_type);
    match config.backend_type {
        BackendKind::Local => {
            let backend = match config.path.as_deref() {
                Some(path) => LocalBackend::with_root(Path::new(path), &name)?,
                None => LocalBackend::new(&name),
            };
            Ok(Arc::new(backend))
        }

        #[cfg(feature = "s3")]
        BackendKind::S3 | BackendKind::S3Compatible => {
            use crate::s3::{S3Backend, S3Options};

            let compatible = config.backend_type == BackendKind::S3Compatible;
            let bucket = config.bucket.clone().ok_or_else(|| {
                StrongboxError::Config(format!("Backend '{name}' requires a bucket"))
            })?;
            if compatible && config.endpoint_url.is_none() {
                return Err(StrongboxError::Config(format!(
                    "S3Compatible backend '{name}' requires endpoint_url"
                )));
            }
            let region = match (&config.region, compatible) {
                (Some(r), _) => Some(r.clone()),
                (None, true) => Some("us-east-1".to_string()),
                (None, false) => None,
            };
            let backend = S3Backend::with_options(S3Options {
                bucket,
                region,
                name,
                endpoint_url: config.endpoint_url.clone(),
                path_style: config.path_style.unwrap_or(compatible),
                access_key: config.access_key.clone(),
                secret_key: config.secret_key.clone(),
            })
            .await?;
            Ok(Arc::new(backend))
        }

        #[cfg(not(feature = "s3"))]
        BackendKind::S3 | BackendKind::S3Compatible => Err(StrongboxError::Config(
            "s3 feature not enabled. Recompile with --features s3".to_string(),
        )),
    }
}
