use async_trait::async_trait;

/// Abstract remote object store. Errors are opaque; the `LogWriter`
/// only distinguishes "not found" on delete (treated as success) from
/// everything else.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn write_file(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;

    /// Deletes `key`. Implementations should map a "no such key" style
    /// error to `Ok(())` themselves so the `LogWriter` never has to sniff
    /// provider-specific error codes for the common case; it still
    /// tolerates a `NotFound`-shaped `anyhow` error as a fallback (see
    /// [`looks_like_not_found`]).
    async fn delete_file(&self, key: &str) -> anyhow::Result<()>;

    /// Lists every object key under `prefix`.
    async fn walk_dir(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

/// Returns true when `err`'s rendered message looks like a "does not
/// exist" condition. Used so `delete_all_logs` can treat a missing
/// remote object as success regardless of which `RemoteStorage`
/// implementation produced the error.
pub fn looks_like_not_found(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("not found") || msg.contains("nosuchkey") || msg.contains("no such key")
}

#[cfg(feature = "s3")]
pub mod s3 {
    use super::RemoteStorage;
    use async_trait::async_trait;
    use aws_sdk_s3::config::{Credentials, Region};
    use aws_sdk_s3::error::SdkError;
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::Client;

    /// Connection options for the production `RemoteStorage`.
    #[derive(Clone, Debug)]
    pub struct S3Options {
        pub bucket_name: String,
        pub region: Option<String>,
        pub endpoint: Option<String>,
        pub access_key_id: Option<String>,
        pub secret_access_key: Option<String>,
        pub max_retries: u32,
    }

    /// Thin wrapper over `aws_sdk_s3::Client`: one struct holding a
    /// client plus the bucket it talks to, with one method per S3 verb.
    #[derive(Clone)]
    pub struct S3Storage {
        client: Client,
        bucket: String,
    }

    impl S3Storage {
        pub async fn connect(options: &S3Options) -> anyhow::Result<Self> {
            let mut loader = aws_config::from_env();
            if let Some(endpoint) = options.endpoint.as_deref() {
                loader = loader.endpoint_url(endpoint);
            }
            let mut builder = aws_sdk_s3::config::Builder::from(&loader.load().await)
                .force_path_style(true)
                .retry_config(
                    aws_sdk_s3::config::retry::RetryConfig::standard()
                        .with_max_attempts(options.max_retries.max(1)),
                );
            if let Some(region) = &options.region {
                builder = builder.region(Region::new(region.clone()));
            }
            if let (Some(key), Some(secret)) =
                (&options.access_key_id, &options.secret_access_key)
            {
                builder = builder.credentials_provider(Credentials::new(
                    key.clone(),
                    secret.clone(),
                    None,
                    None,
                    "Static",
                ));
            }
            let client = Client::from_conf(builder.build());
            Ok(Self {
                client,
                bucket: options.bucket_name.clone(),
            })
        }
    }

    #[async_trait]
    impl RemoteStorage for S3Storage {
        async fn write_file(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(bytes))
                .send()
                .await?;
            Ok(())
        }

        async fn delete_file(&self, key: &str) -> anyhow::Result<()> {
            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                // S3's DeleteObject is idempotent and returns success even
                // when the key is already gone, but some S3-compatible
                // stores (and our own `looks_like_not_found` convention)
                // still need a NotFound path handled explicitly.
                Err(SdkError::ServiceError(e)) if e.err().is_not_found() => Ok(()),
                Err(e) => Err(e.into()),
            }
        }

        async fn walk_dir(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
            let mut keys = Vec::new();
            let mut continuation_token = None;
            loop {
                let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
                if let Some(token) = continuation_token.take() {
                    req = req.continuation_token(token);
                }
                let resp = req.send().await?;
                for obj in resp.contents() {
                    if let Some(key) = obj.key() {
                        keys.push(key.to_string());
                    }
                }
                if resp.is_truncated().unwrap_or(false) {
                    continuation_token = resp.next_continuation_token().map(str::to_string);
                } else {
                    break;
                }
            }
            Ok(keys)
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_not_found_variants() {
        assert!(looks_like_not_found(&anyhow::anyhow!("NoSuchKey")));
        assert!(looks_like_not_found(&anyhow::anyhow!("key not found")));
        assert!(!looks_like_not_found(&anyhow::anyhow!("access denied")));
    }
}
