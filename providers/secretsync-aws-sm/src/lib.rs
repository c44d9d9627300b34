//! AWS Secrets Manager destination driver.
//!
//! The provider derives a role ARN per resolved target, assumes it via STS,
//! and caches one destination session per account. Each session keeps a
//! TTL-bounded inventory cache that is invalidated by its own writes.

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::BehaviorVersion;
use aws_sdk_secretsmanager::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_secretsmanager::operation::RequestId;
use aws_sdk_secretsmanager::types::{Filter, FilterNameStringType};
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use aws_types::region::Region;
use secretsync_spec::{
    Destination, DestinationProvider, DriverError, DriverResult, ResolvedTarget, SecretPath,
    SecretTree,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

const DEFAULT_PREFIX: &str = "secretsync";
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
const SESSION_NAME: &str = "secretsync-pipeline";

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct AwsSmSettings {
    /// Secrets are named `{prefix}/{logical_path}` in every account.
    pub prefix: String,
    /// How long a listed inventory stays valid.
    pub cache_ttl: Duration,
}

impl Default for AwsSmSettings {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Opens one Secrets Manager session per target account.
pub struct AwsSmDestinationProvider {
    base_config: aws_types::SdkConfig,
    settings: AwsSmSettings,
    sessions: RwLock<HashMap<String, Arc<AwsSmDestination>>>,
}

impl AwsSmDestinationProvider {
    /// Load ambient AWS configuration and build the provider.
    pub async fn new(settings: AwsSmSettings) -> Self {
        let base_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            base_config,
            settings,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn build_session(&self, target: &ResolvedTarget) -> Arc<AwsSmDestination> {
        let credentials = AssumeRoleProvider::builder(&target.role_arn)
            .region(Region::new(target.region.clone()))
            .session_name(SESSION_NAME)
            .configure(&self.base_config)
            .build()
            .await;

        let config = aws_sdk_secretsmanager::config::Builder::from(&self.base_config)
            .region(Region::new(target.region.clone()))
            .credentials_provider(credentials)
            .build();

        info!(
            account_id = %target.account_id,
            region = %target.region,
            role_arn = %target.role_arn,
            "opened secrets manager session"
        );
        Arc::new(AwsSmDestination::new(
            SecretsManagerClient::from_conf(config),
            self.settings.clone(),
        ))
    }
}

#[async_trait]
impl DestinationProvider for AwsSmDestinationProvider {
    async fn session(&self, target: &ResolvedTarget) -> DriverResult<Arc<dyn Destination>> {
        if let Some(session) = self.sessions.read().await.get(&target.account_id) {
            return Ok(Arc::clone(session) as Arc<dyn Destination>);
        }

        let session = self.build_session(target).await;
        self.sessions
            .write()
            .await
            .insert(target.account_id.clone(), Arc::clone(&session));
        Ok(session as Arc<dyn Destination>)
    }
}

/// One account's Secrets Manager, scoped under the configured name prefix.
pub struct AwsSmDestination {
    client: SecretsManagerClient,
    settings: AwsSmSettings,
    inventory: Mutex<Option<(Instant, SecretTree)>>,
}

impl AwsSmDestination {
    fn new(client: SecretsManagerClient, settings: AwsSmSettings) -> Self {
        Self {
            client,
            settings,
            inventory: Mutex::new(None),
        }
    }

    fn secret_name(&self, path: &SecretPath) -> String {
        format!("{}/{}", self.settings.prefix, path)
    }

    fn logical_path(&self, name: &str) -> Option<SecretPath> {
        let relative = name.strip_prefix(&format!("{}/", self.settings.prefix))?;
        SecretPath::parse(relative).ok()
    }

    async fn invalidate_inventory(&self) {
        *self.inventory.lock().await = None;
    }

    async fn fetch_inventory(&self) -> DriverResult<SecretTree> {
        let prefix = format!("{}/", self.settings.prefix);
        let mut tree = SecretTree::new();
        let mut token: Option<String> = None;

        loop {
            let mut request = self.client.list_secrets().filters(
                Filter::builder()
                    .key(FilterNameStringType::Name)
                    .values(prefix.clone())
                    .build(),
            );
            if let Some(next) = &token {
                request = request.next_token(next);
            }

            let response = request
                .send()
                .await
                .map_err(|err| sdk_error("list_secrets", err))?;

            for entry in response.secret_list() {
                let Some(name) = entry.name() else { continue };
                if !name.starts_with(&prefix) {
                    continue;
                }
                let Some(path) = self.logical_path(name) else {
                    continue;
                };
                if let Some(value) = self.fetch_value(name, &path).await? {
                    tree.insert(path, value);
                }
            }

            match response.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }

        debug!(secrets = tree.len(), "listed destination inventory");
        Ok(tree)
    }

    async fn fetch_value(&self, name: &str, path: &SecretPath) -> DriverResult<Option<Value>> {
        match self
            .client
            .get_secret_value()
            .secret_id(name)
            .send()
            .await
        {
            Ok(output) => Ok(Some(decode_payload(
                output.secret_string(),
                output.secret_binary(),
            ))),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(sdk_error("get_secret_value", err).with_path(path.clone())),
        }
    }
}

#[async_trait]
impl Destination for AwsSmDestination {
    async fn list(&self) -> DriverResult<SecretTree> {
        let mut cached = self.inventory.lock().await;
        if let Some((fetched_at, tree)) = cached.as_ref() {
            if fetched_at.elapsed() < self.settings.cache_ttl {
                return Ok(tree.clone());
            }
        }

        let tree = self.fetch_inventory().await?;
        *cached = Some((Instant::now(), tree.clone()));
        Ok(tree)
    }

    async fn get(&self, path: &SecretPath) -> DriverResult<Option<Value>> {
        self.fetch_value(&self.secret_name(path), path).await
    }

    async fn put(&self, path: &SecretPath, value: &Value) -> DriverResult<()> {
        let name = self.secret_name(path);
        let payload = serde_json::to_string(value).map_err(|err| {
            DriverError::permanent("put_secret_value", format!("encode payload: {err}"))
                .with_path(path.clone())
        })?;

        let create = self
            .client
            .create_secret()
            .name(&name)
            .secret_string(&payload)
            .send()
            .await;

        match create {
            Ok(_) => {}
            Err(err) if is_already_exists(&err) => {
                self.client
                    .put_secret_value()
                    .secret_id(&name)
                    .secret_string(&payload)
                    .send()
                    .await
                    .map_err(|err| sdk_error("put_secret_value", err).with_path(path.clone()))?;
            }
            Err(err) => return Err(sdk_error("create_secret", err).with_path(path.clone())),
        }

        self.invalidate_inventory().await;
        Ok(())
    }

    async fn delete(&self, path: &SecretPath) -> DriverResult<()> {
        self.client
            .delete_secret()
            .secret_id(self.secret_name(path))
            .force_delete_without_recovery(true)
            .send()
            .await
            .map_err(|err| sdk_error("delete_secret", err).with_path(path.clone()))?;
        self.invalidate_inventory().await;
        Ok(())
    }
}

/// Secrets written by the pipeline are canonical JSON strings; anything else
/// found in the account is carried as an opaque string so comparisons fall
/// back to byte equality.
fn decode_payload(
    secret_string: Option<&str>,
    secret_binary: Option<&aws_smithy_types::Blob>,
) -> Value {
    if let Some(text) = secret_string {
        return serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
    }
    if let Some(blob) = secret_binary {
        let bytes = blob.as_ref();
        if let Ok(parsed) = serde_json::from_slice(bytes) {
            return parsed;
        }
        return Value::String(String::from_utf8_lossy(bytes).into_owned());
    }
    Value::Null
}

fn is_not_found<T>(err: &SdkError<T>) -> bool
where
    T: ProvideErrorMetadata,
{
    matches!(err, SdkError::ServiceError(context)
        if context.err().code() == Some("ResourceNotFoundException"))
}

fn is_already_exists<T>(err: &SdkError<T>) -> bool
where
    T: ProvideErrorMetadata,
{
    matches!(err, SdkError::ServiceError(context)
        if context.err().code() == Some("ResourceExistsException"))
}

fn sdk_error<T>(operation: &str, err: SdkError<T>) -> DriverError
where
    T: ProvideErrorMetadata + std::fmt::Debug,
    SdkError<T>: RequestId,
{
    let request_id = err.request_id().map(str::to_string);
    let message = err
        .as_service_error()
        .and_then(|service| service.message())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{err:?}"));

    let driver_err = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            DriverError::transient(operation, message)
        }
        SdkError::ServiceError(context) => match context.err().code() {
            Some("ResourceNotFoundException") => DriverError::not_found(operation, message),
            Some("AccessDeniedException") | Some("UnrecognizedClientException")
            | Some("ExpiredTokenException") => DriverError::auth(operation, message),
            Some("ThrottlingException") | Some("InternalServiceError")
            | Some("ServiceUnavailableException") => DriverError::transient(operation, message),
            _ => DriverError::permanent(operation, message),
        },
        _ => DriverError::permanent(operation, message),
    };

    match request_id {
        Some(id) => driver_err.with_request_id(id),
        None => driver_err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secret_names_carry_the_prefix() {
        let settings = AwsSmSettings::default();
        let config = aws_sdk_secretsmanager::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .build();
        let destination = AwsSmDestination::new(SecretsManagerClient::from_conf(config), settings);

        let path = SecretPath::parse("apps/web/token").unwrap();
        assert_eq!(destination.secret_name(&path), "secretsync/apps/web/token");
        assert_eq!(
            destination.logical_path("secretsync/apps/web/token"),
            Some(path)
        );
        assert_eq!(destination.logical_path("unrelated/name"), None);
    }

    #[test]
    fn payload_decoding_prefers_json() {
        assert_eq!(
            decode_payload(Some(r#"{"a": 1}"#), None),
            json!({"a": 1})
        );
        assert_eq!(
            decode_payload(Some("plain text"), None),
            json!("plain text")
        );
        let blob = aws_smithy_types::Blob::new(br#"{"b": 2}"#.to_vec());
        assert_eq!(decode_payload(None, Some(&blob)), json!({"b": 2}));
        assert_eq!(decode_payload(None, None), Value::Null);
    }
}
