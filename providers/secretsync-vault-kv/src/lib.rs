//! HashiCorp Vault KV v2 drivers.
//!
//! A [`VaultKvSource`] exposes the secrets under one KV v2 mount as a lazy
//! tree: `LIST` against `metadata/` enumerates leaves, `GET` against `data/`
//! reads one document. The [`VaultMergeStore`] persists each target's merged
//! tree as a single canonical-JSON blob under `{mount}/{target}`, which KV v2
//! versioned writes replace atomically.

use async_trait::async_trait;
use secretsync_spec::{
    canonical_json, decode_tree, DriverError, DriverResult, MergeStore, SecretPath, SecretSource,
    SecretTree,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const K8S_JWT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Connection settings, typically mapped from the `vault` config section.
#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub address: String,
    pub namespace: Option<String>,
    pub auth: VaultAuth,
}

#[derive(Debug, Clone)]
pub enum VaultAuth {
    Token {
        token: String,
    },
    AppRole {
        mount: String,
        role_id: String,
        secret_id: String,
    },
    Kubernetes {
        role: String,
        mount_path: String,
    },
}

/// An authenticated Vault connection shared by every driver built from it.
pub struct VaultHandle {
    http: reqwest::Client,
    address: String,
    namespace: Option<String>,
    token: String,
}

impl VaultHandle {
    /// Authenticate against Vault and return a shared handle.
    pub async fn connect(settings: &VaultSettings) -> DriverResult<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|err| DriverError::permanent("vault.connect", err.to_string()))?;

        let address = settings.address.trim_end_matches('/').to_string();
        let token = match &settings.auth {
            VaultAuth::Token { token } => token.clone(),
            VaultAuth::AppRole {
                mount,
                role_id,
                secret_id,
            } => {
                login(
                    &http,
                    &address,
                    settings.namespace.as_deref(),
                    &format!("v1/auth/{mount}/login"),
                    json!({"role_id": role_id, "secret_id": secret_id}),
                )
                .await?
            }
            VaultAuth::Kubernetes { role, mount_path } => {
                let jwt = std::fs::read_to_string(K8S_JWT_PATH).map_err(|err| {
                    DriverError::auth(
                        "vault.login",
                        format!("failed to read service account token: {err}"),
                    )
                })?;
                login(
                    &http,
                    &address,
                    settings.namespace.as_deref(),
                    &format!("v1/auth/{mount_path}/login"),
                    json!({"role": role, "jwt": jwt.trim()}),
                )
                .await?
            }
        };

        Ok(Arc::new(Self {
            http,
            address,
            namespace: settings.namespace.clone().filter(|ns| !ns.is_empty()),
            token,
        }))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> DriverResult<reqwest::Response> {
        let operation = format!("vault.{} {path}", method.as_str().to_ascii_lowercase());
        let url = format!("{}/{path}", self.address);
        let started = Instant::now();

        let mut request = self
            .http
            .request(method, url)
            .header("X-Vault-Token", &self.token);
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|err| {
            let kind_err = if err.is_timeout() || err.is_connect() {
                DriverError::transient(&operation, err.to_string())
            } else {
                DriverError::permanent(&operation, err.to_string())
            };
            kind_err.with_elapsed(started.elapsed())
        })?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(response);
        }

        let elapsed = started.elapsed();
        let body = response.text().await.unwrap_or_default();
        let request_id = extract_request_id(&body);
        let err = match status.as_u16() {
            401 | 403 => DriverError::auth(&operation, format!("{status}: {body}")),
            500..=599 => DriverError::transient(&operation, format!("{status}: {body}")),
            _ => DriverError::permanent(&operation, format!("{status}: {body}")),
        };
        let err = err.with_elapsed(elapsed);
        Err(match request_id {
            Some(id) => err.with_request_id(id),
            None => err,
        })
    }
}

async fn login(
    http: &reqwest::Client,
    address: &str,
    namespace: Option<&str>,
    path: &str,
    body: Value,
) -> DriverResult<String> {
    let mut request = http.post(format!("{address}/{path}")).json(&body);
    if let Some(namespace) = namespace {
        request = request.header("X-Vault-Namespace", namespace);
    }
    let response = request
        .send()
        .await
        .map_err(|err| DriverError::transient("vault.login", err.to_string()))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(DriverError::auth(
            "vault.login",
            format!("{status}: {body}"),
        ));
    }
    let parsed: LoginResponse = response
        .json()
        .await
        .map_err(|err| DriverError::permanent("vault.login", err.to_string()))?;
    Ok(parsed.auth.client_token)
}

fn extract_request_id(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The secrets under one KV v2 mount, presented as a source tree.
pub struct VaultKvSource {
    handle: Arc<VaultHandle>,
    mount: String,
}

impl VaultKvSource {
    pub fn new(handle: Arc<VaultHandle>, mount: impl Into<String>) -> Self {
        Self {
            handle,
            mount: trim_mount(mount.into()),
        }
    }

    fn metadata_path(&self, suffix: &str) -> String {
        format!(
            "v1/{}/metadata/{}",
            self.mount,
            suffix.trim_start_matches('/')
        )
    }

    fn data_path(&self, path: &str) -> String {
        format!("v1/{}/data/{}", self.mount, path)
    }

    /// Vault data payloads must be JSON objects; scalar documents travel
    /// under a `value` key.
    fn wrap_document(value: &Value) -> Value {
        match value {
            Value::Object(_) => value.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other.clone());
                Value::Object(map)
            }
        }
    }
}

fn trim_mount(mount: String) -> String {
    mount.trim_matches('/').to_string()
}

#[async_trait]
impl SecretSource for VaultKvSource {
    async fn list_recursive(&self) -> DriverResult<Vec<SecretPath>> {
        let mut leaves = Vec::new();
        let mut pending: Vec<String> = vec![String::new()];

        while let Some(prefix) = pending.pop() {
            let path = self.metadata_path(&prefix);
            let method = reqwest::Method::from_bytes(b"LIST").expect("LIST is a valid method");
            let response = self.handle.request(method, &path, None).await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            let listing: KeyListResponse = response.json().await.map_err(|err| {
                DriverError::permanent("vault.list", format!("failed to decode key list: {err}"))
            })?;

            for key in listing.data.keys.unwrap_or_default() {
                let child = format!("{prefix}{key}");
                if key.ends_with('/') {
                    pending.push(child);
                } else {
                    let parsed = SecretPath::parse(&child).map_err(|err| {
                        DriverError::permanent(
                            "vault.list",
                            format!("listed key is not a valid path: {err}"),
                        )
                    })?;
                    leaves.push(parsed);
                }
            }
        }

        debug!(mount = %self.mount, leaves = leaves.len(), "listed vault source");
        leaves.sort();
        Ok(leaves)
    }

    async fn read(&self, path: &SecretPath) -> DriverResult<Option<Value>> {
        let response = self
            .handle
            .request(reqwest::Method::GET, &self.data_path(path.as_str()), None)
            .await
            .map_err(|err| err.with_path(path.clone()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: KvReadResponse = response.json().await.map_err(|err| {
            DriverError::permanent("vault.read", format!("failed to decode secret: {err}"))
                .with_path(path.clone())
        })?;
        Ok(Some(parsed.data.data))
    }

    async fn write(&self, path: &SecretPath, value: &Value) -> DriverResult<()> {
        let body = json!({"data": Self::wrap_document(value)});
        self.handle
            .request(
                reqwest::Method::POST,
                &self.data_path(path.as_str()),
                Some(body),
            )
            .await
            .map_err(|err| err.with_path(path.clone()))?;
        Ok(())
    }

    async fn delete(&self, path: &SecretPath) -> DriverResult<()> {
        self.handle
            .request(
                reqwest::Method::DELETE,
                &self.metadata_path(path.as_str()),
                None,
            )
            .await
            .map_err(|err| err.with_path(path.clone()))?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        path: &SecretPath,
        expected: Option<u64>,
        value: &Value,
    ) -> DriverResult<u64> {
        let body = json!({
            "data": Self::wrap_document(value),
            "options": {"cas": expected.unwrap_or(0)},
        });
        let response = self
            .handle
            .request(
                reqwest::Method::POST,
                &self.data_path(path.as_str()),
                Some(body),
            )
            .await
            .map_err(|err| err.with_path(path.clone()))?;
        let parsed: KvWriteResponse = response.json().await.map_err(|err| {
            DriverError::permanent(
                "vault.compare_and_swap",
                format!("failed to decode write response: {err}"),
            )
            .with_path(path.clone())
        })?;
        Ok(parsed.data.version)
    }
}

/// Merge-store variant backed by a KV v2 mount: one canonical-JSON blob per
/// target.
pub struct VaultMergeStore {
    handle: Arc<VaultHandle>,
    mount: String,
}

impl VaultMergeStore {
    pub fn new(handle: Arc<VaultHandle>, mount: impl Into<String>) -> Self {
        Self {
            handle,
            mount: trim_mount(mount.into()),
        }
    }

    fn entry_path(&self, target: &str) -> String {
        format!("v1/{}/data/{target}", self.mount)
    }
}

#[async_trait]
impl MergeStore for VaultMergeStore {
    async fn put_tree(&self, target: &str, tree: &SecretTree) -> DriverResult<()> {
        let body = json!({"data": {"blob": canonical_json(tree)}});
        self.handle
            .request(reqwest::Method::POST, &self.entry_path(target), Some(body))
            .await?;
        Ok(())
    }

    async fn get_tree(&self, target: &str) -> DriverResult<Option<SecretTree>> {
        let response = self
            .handle
            .request(reqwest::Method::GET, &self.entry_path(target), None)
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: KvReadResponse = response.json().await.map_err(|err| {
            DriverError::permanent(
                "merge_store.get_tree",
                format!("failed to decode entry: {err}"),
            )
        })?;
        let blob = parsed
            .data
            .data
            .get("blob")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DriverError::permanent(
                    "merge_store.get_tree",
                    format!("entry for `{target}` has no blob field"),
                )
            })?;
        let tree = decode_tree(blob.as_bytes()).map_err(|err| {
            DriverError::permanent(
                "merge_store.get_tree",
                format!("entry for `{target}` is not a valid tree: {err}"),
            )
        })?;
        Ok(Some(tree))
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Deserialize)]
struct KeyListResponse {
    data: KeyListData,
}

#[derive(Deserialize)]
struct KeyListData {
    keys: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Deserialize)]
struct KvReadData {
    data: Value,
}

#[derive(Deserialize)]
struct KvWriteResponse {
    data: KvWriteMetadata,
}

#[derive(Deserialize)]
struct KvWriteMetadata {
    version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mounts_are_trimmed() {
        assert_eq!(trim_mount("/app-secrets/".into()), "app-secrets");
        assert_eq!(trim_mount("kv".into()), "kv");
    }

    #[test]
    fn scalar_documents_are_wrapped_for_kv() {
        let doc = VaultKvSource::wrap_document(&json!("plain"));
        assert_eq!(doc, json!({"value": "plain"}));
        let obj = VaultKvSource::wrap_document(&json!({"user": "u"}));
        assert_eq!(obj, json!({"user": "u"}));
    }

    #[test]
    fn request_id_is_parsed_from_error_bodies() {
        let body = r#"{"request_id": "abc-123", "errors": ["denied"]}"#;
        assert_eq!(extract_request_id(body).as_deref(), Some("abc-123"));
        assert_eq!(extract_request_id("not json"), None);
    }
}
