use strongbox_core::error::StrongboxError;

/// Map an S3 error code / HTTP status onto the storage failure taxonomy.
/// `None` means the failure is not one the caller can act on specifically.
pub fn classify_s3_failure(code: Option<&str>, status: Option<u16>) -> Option<StrongboxError> {
    match code {
        Some(
            "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
            | "InvalidToken" | "AccountProblem",
        ) => return Some(StrongboxError::AuthRevoked),
        Some("QuotaExceeded" | "XMinioStorageFull" | "InsufficientStorage" | "EntityTooLarge") => {
            return Some(StrongboxError::QuotaExceeded);
        }
        _ => {}
    }
    match status {
        Some(401 | 403) => Some(StrongboxError::AuthRevoked),
        Some(507) => Some(StrongboxError::QuotaExceeded),
        _ => None,
    }
}

#[cfg(feature = "s3")]
mod inner {
    use async_trait::async_trait;
    use aws_sdk_s3::Client;
    use aws_sdk_s3::config::http::HttpResponse;
    use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
    use aws_sdk_s3::primitives::ByteStream;
    use std::path::Path;
    use strongbox_core::error::{Result, StrongboxError};
    use tokio::sync::RwLock;
    use tracing::debug;

    use super::classify_s3_failure;
    use crate::provider::{RemoteEntry, SetupOutcome, StorageBackend};

    /// AWS S3 and S3-compatible storage backend.
    ///
    /// Works with AWS S3, MinIO, Garage, Ceph RGW and any other service implementing
    /// the S3 API. The setup credential is `access_key:secret_key`.
    pub struct S3Backend {
        client: RwLock<Option<Client>>,
        settings: S3Options,
        /// Keys injected through setup rather than configuration.
        interactive: bool,
    }

    /// Options for creating an S3 backend.
    #[derive(Debug, Clone, Default)]
    pub struct S3Options {
        pub bucket: String,
        pub region: Option<String>,
        pub name: String,
        /// Custom endpoint URL (e.g. `http://localhost:9000` for MinIO).
        pub endpoint_url: Option<String>,
        /// Force path-style addressing (`http://host/bucket/key` instead of `http://bucket.host/key`).
        /// Most S3-compatible servers require this.
        pub path_style: bool,
        /// Explicit access key. If unset, keys come from interactive setup.
        pub access_key: Option<String>,
        pub secret_key: Option<String>,
    }

    impl S3Backend {
        /// Create with full options. Without keys the backend waits for setup.
        pub async fn with_options(opts: S3Options) -> Result<Self> {
            let client = match (opts.access_key.as_deref(), opts.secret_key.as_deref()) {
                (Some(ak), Some(sk)) => Some(build_client(&opts, ak, sk).await),
                _ => None,
            };
            Ok(Self {
                interactive: client.is_none(),
                client: RwLock::new(client),
                settings: opts,
            })
        }

        async fn client(&self) -> Result<Client> {
            self.client
                .read()
                .await
                .clone()
                .ok_or_else(|| StrongboxError::StorageNotConfigured(self.settings.name.clone()))
        }

        fn key(folder: &str, name: &str) -> String {
            let folder = folder.trim_matches('/');
            if folder.is_empty() {
                name.to_string()
            } else {
                format!("{folder}/{name}")
            }
        }
    }

    async fn build_client(opts: &S3Options, access_key: &str, secret_key: &str) -> Client {
        let mut config_loader = aws_config::from_env();

        if let Some(r) = &opts.region {
            config_loader = config_loader.region(aws_config::Region::new(r.clone()));
        }

        let creds = aws_sdk_s3::config::Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "strongbox-config",
        );
        config_loader = config_loader.credentials_provider(creds);

        let sdk_config = config_loader.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &opts.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if opts.path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Client::from_conf(s3_config_builder.build())
    }

    fn map_sdk_error<E>(err: SdkError<E, HttpResponse>) -> StrongboxError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        if matches!(
            err,
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)
        ) {
            return StrongboxError::NetworkUnavailable(DisplayErrorContext(&err).to_string());
        }
        let status = err.raw_response().map(|r| r.status().as_u16());
        classify_s3_failure(err.code(), status)
            .unwrap_or_else(|| StrongboxError::StorageIo(DisplayErrorContext(&err).to_string()))
    }

    #[async_trait]
    impl StorageBackend for S3Backend {
        async fn upload(&self, file: &Path, folder: &str) -> Result<String> {
            let name = file.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
                StrongboxError::StorageIo(format!("invalid file {}", file.display()))
            })?;
            let key = Self::key(folder, name);
            let body = ByteStream::from_path(file)
                .await
                .map_err(|e| StrongboxError::StorageIo(e.to_string()))?;

            self.client()
                .await?
                .put_object()
                .bucket(&self.settings.bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(map_sdk_error)?;
            debug!(backend = %self.settings.name, key = %key, "Uploaded to S3");
            Ok(key)
        }

        async fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>> {
            let client = self.client().await?;
            let prefix = Self::key(folder, "");
            let mut entries = Vec::new();
            let mut continuation: Option<String> = None;

            loop {
                let resp = client
                    .list_objects_v2()
                    .bucket(&self.settings.bucket)
                    .prefix(&prefix)
                    .set_continuation_token(continuation.take())
                    .send()
                    .await
                    .map_err(map_sdk_error)?;

                for object in resp.contents() {
                    let Some(key) = object.key() else { continue };
                    let Some(name) = key.strip_prefix(&prefix) else { continue };
                    if name.is_empty() || name.contains('/') {
                        continue;
                    }
                    entries.push(RemoteEntry {
                        id: key.to_string(),
                        name: name.to_string(),
                    });
                }

                match resp.next_continuation_token() {
                    Some(token) if resp.is_truncated() == Some(true) => {
                        continuation = Some(token.to_string());
                    }
                    _ => break,
                }
            }
            Ok(entries)
        }

        async fn download(&self, id: &str, destination: &Path) -> Result<()> {
            let resp = self
                .client()
                .await?
                .get_object()
                .bucket(&self.settings.bucket)
                .key(id)
                .send()
                .await
                .map_err(map_sdk_error)?;
            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| StrongboxError::NetworkUnavailable(e.to_string()))?;
            tokio::fs::write(destination, data.into_bytes()).await?;
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.client()
                .await?
                .delete_object()
                .bucket(&self.settings.bucket)
                .key(id)
                .send()
                .await
                .map_err(map_sdk_error)?;
            Ok(())
        }

        async fn requires_interactive_setup(&self) -> bool {
            self.client.read().await.is_none()
        }

        async fn complete_setup(&self, outcome: SetupOutcome) -> Result<()> {
            let credential = outcome.into_credential()?;
            let (access_key, secret_key) = credential
                .expose()
                .split_once(':')
                .filter(|(ak, sk)| !ak.is_empty() && !sk.is_empty())
                .ok_or_else(|| {
                    StrongboxError::SetupFailed(
                        "expected credential in the form access_key:secret_key".to_string(),
                    )
                })?;
            let client = build_client(&self.settings, access_key, secret_key).await;
            *self.client.write().await = Some(client);
            Ok(())
        }

        async fn sign_out(&self) -> Result<()> {
            if self.interactive {
                *self.client.write().await = None;
            }
            Ok(())
        }

        fn name(&self) -> &str {
            &self.settings.name
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use strongbox_core::types::StorageCredential;

        fn options() -> S3Options {
            S3Options {
                bucket: "wallet-backups".to_string(),
                region: Some("us-east-1".to_string()),
                name: "cloud-s3".to_string(),
                endpoint_url: Some("http://127.0.0.1:9".to_string()),
                path_style: true,
                access_key: None,
                secret_key: None,
            }
        }

        #[test]
        fn keys_join_folder_and_name() {
            assert_eq!(S3Backend::key("backups", "a.enc"), "backups/a.enc");
            assert_eq!(S3Backend::key("/backups/", "a.enc"), "backups/a.enc");
            assert_eq!(S3Backend::key("", "a.enc"), "a.enc");
            assert_eq!(S3Backend::key("backups", ""), "backups/");
        }

        #[tokio::test]
        async fn setup_parses_credential() {
            let backend = S3Backend::with_options(options()).await.unwrap();
            assert!(backend.requires_interactive_setup().await);

            let bad = SetupOutcome::Granted(StorageCredential::new("no-separator"));
            assert!(matches!(
                backend.complete_setup(bad).await,
                Err(StrongboxError::SetupFailed(_))
            ));
            assert!(matches!(
                backend.complete_setup(SetupOutcome::Denied("nope".into())).await,
                Err(StrongboxError::SetupFailed(_))
            ));

            let good = SetupOutcome::Granted(StorageCredential::new("AKIA:secret"));
            backend.complete_setup(good).await.unwrap();
            assert!(!backend.requires_interactive_setup().await);

            backend.sign_out().await.unwrap();
            assert!(backend.requires_interactive_setup().await);
        }

        #[tokio::test]
        async fn unconfigured_calls_fail_fast() {
            let backend = S3Backend::with_options(options()).await.unwrap();
            assert!(matches!(
                backend.list("backups").await,
                Err(StrongboxError::StorageNotConfigured(_))
            ));
        }
    }
}

#[cfg(feature = "s3")]
pub use inner::{S3Backend, S3Options};
