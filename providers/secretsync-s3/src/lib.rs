//! S3-backed merge store.
//!
//! Entries live at `{prefix}/{target_name}.json` with canonical-JSON bodies,
//! so byte-equal objects indicate logically equal trees. S3 object writes
//! are atomic at the whole-object level, which is exactly the replace
//! semantics the merge store requires.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use secretsync_spec::{
    canonical_json, decode_tree, DriverError, DriverResult, MergeStore, SecretTree,
};
use tracing::debug;

/// Merge store rooted at one bucket and key prefix.
pub struct S3MergeStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3MergeStore {
    /// Build the store from ambient AWS configuration.
    pub async fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::with_client(S3Client::new(&config), bucket, prefix)
    }

    pub fn with_client(
        client: S3Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    fn key(&self, target: &str) -> String {
        if self.prefix.is_empty() {
            format!("{target}.json")
        } else {
            format!("{}/{target}.json", self.prefix)
        }
    }
}

#[async_trait]
impl MergeStore for S3MergeStore {
    async fn put_tree(&self, target: &str, tree: &SecretTree) -> DriverResult<()> {
        let key = self.key(target);
        let body = canonical_json(tree);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/json")
            .body(ByteStream::from(body.into_bytes()))
            .send()
            .await
            .map_err(|err| s3_error("put_object", err))?;
        debug!(bucket = %self.bucket, key = %key, "wrote merge store entry");
        Ok(())
    }

    async fn get_tree(&self, target: &str) -> DriverResult<Option<SecretTree>> {
        let key = self.key(target);
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if is_no_such_key(&err) => return Ok(None),
            Err(err) => return Err(s3_error("get_object", err)),
        };

        let bytes = response.body.collect().await.map_err(|err| {
            DriverError::transient("get_object", format!("failed to read body: {err}"))
        })?;
        let tree = decode_tree(&bytes.into_bytes()).map_err(|err| {
            DriverError::permanent(
                "get_object",
                format!("entry `{key}` is not a valid tree: {err}"),
            )
        })?;
        Ok(Some(tree))
    }
}

fn is_no_such_key<T>(err: &SdkError<T>) -> bool
where
    T: ProvideErrorMetadata,
{
    matches!(err, SdkError::ServiceError(context)
        if matches!(context.err().code(), Some("NoSuchKey") | Some("NotFound")))
}

fn s3_error<T>(operation: &str, err: SdkError<T>) -> DriverError
where
    T: ProvideErrorMetadata + std::fmt::Debug,
{
    let message = err
        .as_service_error()
        .and_then(|service| service.message())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{err:?}"));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            DriverError::transient(operation, message)
        }
        SdkError::ServiceError(context) => match context.err().code() {
            Some("AccessDenied") => DriverError::auth(operation, message),
            Some("SlowDown") | Some("InternalError") => DriverError::transient(operation, message),
            _ => DriverError::permanent(operation, message),
        },
        _ => DriverError::permanent(operation, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn store(prefix: &str) -> S3MergeStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .build();
        S3MergeStore::with_client(S3Client::from_conf(config), "merge-bucket", prefix)
    }

    #[test]
    fn keys_follow_the_prefix_layout() {
        assert_eq!(store("merged").key("Prod"), "merged/Prod.json");
        assert_eq!(store("/merged/").key("Prod"), "merged/Prod.json");
        assert_eq!(store("").key("Prod"), "Prod.json");
    }
}
