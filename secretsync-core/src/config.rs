//! Configuration model and loading.
//!
//! The file is YAML. Unknown keys are ignored so older binaries accept newer
//! configs. `${VAR}` placeholders anywhere in the document are expanded from
//! the environment before deserialization.

use crate::graph::TargetGraph;
use regex::Regex;
use secretsync_spec::{is_valid_account_id, Error, ResolvedTarget, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_EXECUTION_ROLE: &str = "AWSControlTowerExecution";
const DEFAULT_PARALLELISM: usize = 4;
const MAX_ENV_VALUE_BYTES: usize = 10_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub vault: VaultConfig,
    pub aws: AwsConfig,
    pub sources: BTreeMap<String, SourceConfig>,
    pub merge_store: MergeStoreConfig,
    pub targets: BTreeMap<String, TargetConfig>,
    pub dynamic_targets: BTreeMap<String, DynamicTargetConfig>,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub address: String,
    pub namespace: String,
    pub auth: VaultAuthConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approle: Option<AppRoleAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenAuth {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppRoleAuth {
    pub mount: String,
    pub role_id: String,
    pub secret_id: String,
}

impl Default for AppRoleAuth {
    fn default() -> Self {
        Self {
            mount: "approle".into(),
            role_id: String::new(),
            secret_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesAuth {
    pub role: String,
    pub mount_path: String,
}

impl Default for KubernetesAuth {
    fn default() -> Self {
        Self {
            role: String::new(),
            mount_path: "kubernetes".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    pub execution_context: ExecutionContextConfig,
    pub control_tower: ControlTowerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionContextConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub account_id: String,
    pub custom_role_pattern: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlTowerConfig {
    pub enabled: bool,
    pub execution_role: ExecutionRoleConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRoleConfig {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultSourceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSourceConfig {
    pub mount: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault: Option<MergeStoreVault>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<MergeStoreS3>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStoreVault {
    pub mount: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStoreS3 {
    pub bucket: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    pub imports: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicTargetConfig {
    pub discovery: DiscoveryConfig,
    pub imports: Vec<String>,
    pub exclude: Vec<String>,
    pub account_name_patterns: Vec<NamePattern>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_center: Option<IdentityCenterDiscovery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organizations: Option<OrganizationsDiscovery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounts_list: Option<AccountsListDiscovery>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityCenterDiscovery {
    pub group: String,
    pub permission_set: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationsDiscovery {
    pub ou: String,
    pub tags: BTreeMap<String, String>,
    pub recursive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsListDiscovery {
    pub accounts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NamePattern {
    pub pattern: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub merge: MergePhaseConfig,
    pub sync: SyncPhaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePhaseConfig {
    pub parallel: usize,
}

impl Default for MergePhaseConfig {
    fn default() -> Self {
        Self {
            parallel: DEFAULT_PARALLELISM,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPhaseConfig {
    pub parallel: usize,
    pub delete_orphans: bool,
}

impl Default for SyncPhaseConfig {
    fn default() -> Self {
        Self {
            parallel: DEFAULT_PARALLELISM,
            delete_orphans: false,
        }
    }
}

impl Config {
    /// Load, expand, and default a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            Error::ConfigInvalid(format!(
                "failed to read config file {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::parse(&raw)
    }

    /// Parse a configuration document from a YAML string.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut doc: serde_yaml::Value = serde_yaml::from_str(raw)
            .map_err(|err| Error::ConfigInvalid(format!("failed to parse config: {err}")))?;
        expand_env_values(&mut doc);

        let mut config: Config = serde_yaml::from_value(doc)
            .map_err(|err| Error::ConfigInvalid(format!("failed to decode config: {err}")))?;
        config.apply_defaults();
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.log.level.is_empty() {
            self.log.level = "info".into();
        }
        if self.log.format.is_empty() {
            self.log.format = "text".into();
        }
        if self.aws.region.is_empty() {
            self.aws.region = DEFAULT_REGION.into();
        }
        if self.aws.control_tower.execution_role.name.is_empty() {
            self.aws.control_tower.execution_role.name = DEFAULT_EXECUTION_ROLE.into();
        }
        if self.pipeline.merge.parallel == 0 {
            self.pipeline.merge.parallel = DEFAULT_PARALLELISM;
        }
        if self.pipeline.sync.parallel == 0 {
            self.pipeline.sync.parallel = DEFAULT_PARALLELISM;
        }
    }

    /// Validate the invariants the pipeline relies on. Called once before any
    /// phase runs; failures abort the run.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() && self.dynamic_targets.is_empty() {
            return Err(Error::ConfigInvalid(
                "at least one target or dynamic_target is required".into(),
            ));
        }

        if let Some(s3) = &self.merge_store.s3 {
            if s3.bucket.is_empty() {
                return Err(Error::ConfigInvalid(
                    "merge_store.s3.bucket is required when using the S3 merge store".into(),
                ));
            }
        }

        for (name, target) in &self.targets {
            if let Some(account_id) = &target.account_id {
                if !is_valid_account_id(account_id) {
                    return Err(Error::ConfigInvalid(format!(
                        "target `{name}`: invalid account_id `{account_id}` (must be 12 digits)"
                    )));
                }
            }
        }

        for (name, dynamic) in &self.dynamic_targets {
            for (idx, pattern) in dynamic.account_name_patterns.iter().enumerate() {
                if pattern.pattern.is_empty() {
                    continue;
                }
                if let Err(err) = Regex::new(&pattern.pattern) {
                    return Err(Error::ConfigInvalid(format!(
                        "dynamic_target `{name}`: account_name_patterns[{idx}] is invalid: {err}"
                    )));
                }
            }
        }

        TargetGraph::build(&self.targets).validate()?;
        Ok(())
    }

    /// Role ARN for syncing into `account_id`, following the precedence:
    /// explicit target role, control-tower derivation, custom pattern,
    /// control-tower default.
    pub fn role_arn(&self, account_id: &str) -> String {
        for target in self.targets.values() {
            if target.account_id.as_deref() == Some(account_id) {
                if let Some(role_arn) = &target.role_arn {
                    if !role_arn.is_empty() {
                        return role_arn.clone();
                    }
                }
            }
        }

        if self.aws.control_tower.enabled {
            let role = &self.aws.control_tower.execution_role;
            let name = if role.name.is_empty() {
                DEFAULT_EXECUTION_ROLE
            } else {
                &role.name
            };
            let path = normalize_role_path(&role.path);
            return format!("arn:aws:iam::{account_id}:role{path}{name}");
        }

        if !self.aws.execution_context.custom_role_pattern.is_empty() {
            return self
                .aws
                .execution_context
                .custom_role_pattern
                .replace("{{.AccountID}}", account_id);
        }

        format!("arn:aws:iam::{account_id}:role/{DEFAULT_EXECUTION_ROLE}")
    }

    /// Resolve a target into the concrete session parameters the destination
    /// driver needs. Fails when no account id is known.
    pub fn resolve_target(&self, name: &str, target: &TargetConfig) -> Result<ResolvedTarget> {
        let account_id = target.account_id.clone().ok_or_else(|| {
            Error::ConfigInvalid(format!(
                "target `{name}` has no account_id and none was resolved via discovery"
            ))
        })?;
        let region = target
            .region
            .clone()
            .unwrap_or_else(|| self.aws.region.clone());
        let role_arn = target
            .role_arn
            .clone()
            .filter(|arn| !arn.is_empty())
            .unwrap_or_else(|| self.role_arn(&account_id));

        Ok(ResolvedTarget {
            name: name.to_string(),
            account_id,
            region,
            role_arn,
        })
    }
}

/// IAM role paths must start and end with a slash; `""` means `/`.
fn normalize_role_path(path: &str) -> String {
    if path.is_empty() {
        return "/".into();
    }
    let mut normalized = String::new();
    if !path.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(path);
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// Expand `${VAR}` placeholders in every string of the document. Values over
/// the size limit keep the placeholder, with a warning.
fn expand_env_values(doc: &mut serde_yaml::Value) {
    match doc {
        serde_yaml::Value::String(s) => {
            *s = expand_env_str(s);
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                expand_env_values(item);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_env_values(value);
            }
        }
        _ => {}
    }
}

fn expand_env_str(input: &str) -> String {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern"));
    pattern
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let var = &caps[1];
            match std::env::var(var) {
                Ok(value) if value.len() > MAX_ENV_VALUE_BYTES => {
                    warn!(
                        variable = var,
                        "environment variable value exceeds maximum length, keeping placeholder"
                    );
                    caps[0].to_string()
                }
                Ok(value) if !value.is_empty() => value,
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config::parse(
            r#"
sources:
  base:
    vault:
      mount: app-secrets
targets:
  Production:
    account_id: "123456789012"
    imports: [base]
"#,
        )
        .expect("parse")
    }

    #[test]
    fn defaults_are_applied() {
        let config = minimal_config();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "text");
        assert_eq!(config.aws.region, "us-east-1");
        assert_eq!(config.pipeline.merge.parallel, 4);
        assert_eq!(config.pipeline.sync.parallel, 4);
        assert!(!config.pipeline.sync.delete_orphans);
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "targets:\n  T:\n    account_id: \"123456789012\"\n    imports: []\n",
        )
        .unwrap();

        let config = Config::load(&path).expect("load");
        assert!(config.targets.contains_key("T"));
        assert!(Config::load(dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = Config::parse(
            r#"
future_option: true
targets:
  T:
    account_id: "123456789012"
    imports: []
    shiny_new_field: 7
"#,
        )
        .expect("parse");
        assert!(config.targets.contains_key("T"));
    }

    #[test]
    fn requires_some_target() {
        let err = Config::parse("log:\n  level: debug\n")
            .unwrap()
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_malformed_account_id() {
        let config = Config::parse(
            r#"
targets:
  Bad:
    account_id: "not-an-account"
    imports: []
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_s3_store_without_bucket() {
        let config = Config::parse(
            r#"
merge_store:
  s3:
    prefix: merged
targets:
  T:
    account_id: "123456789012"
    imports: []
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_account_name_pattern() {
        let config = Config::parse(
            r#"
dynamic_targets:
  fleet:
    account_name_patterns:
      - pattern: "([unclosed"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_expansion_substitutes_and_keeps_unknown() {
        std::env::set_var("SECRETSYNC_TEST_TOKEN", "hvs.abc123");
        let config = Config::parse(
            r#"
vault:
  address: https://vault.internal
  auth:
    token:
      token: "${SECRETSYNC_TEST_TOKEN}"
    approle:
      role_id: "${SECRETSYNC_TEST_UNSET_VAR}"
"#,
        )
        .unwrap();
        assert_eq!(config.vault.auth.token.unwrap().token, "hvs.abc123");
        assert_eq!(
            config.vault.auth.approle.unwrap().role_id,
            "${SECRETSYNC_TEST_UNSET_VAR}"
        );
    }

    #[test]
    fn oversized_env_value_keeps_placeholder() {
        std::env::set_var("SECRETSYNC_TEST_HUGE", "x".repeat(MAX_ENV_VALUE_BYTES + 1));
        assert_eq!(
            expand_env_str("${SECRETSYNC_TEST_HUGE}"),
            "${SECRETSYNC_TEST_HUGE}"
        );
    }

    #[test]
    fn role_arn_precedence() {
        let mut config = minimal_config();

        // Default fallback with nothing configured.
        config.aws.control_tower.enabled = false;
        assert_eq!(
            config.role_arn("999999999999"),
            "arn:aws:iam::999999999999:role/AWSControlTowerExecution"
        );

        // Custom pattern beats the fallback.
        config.aws.execution_context.custom_role_pattern =
            "arn:aws:iam::{{.AccountID}}:role/Deployer".into();
        assert_eq!(
            config.role_arn("999999999999"),
            "arn:aws:iam::999999999999:role/Deployer"
        );

        // Control tower beats the custom pattern, with path normalization.
        config.aws.control_tower.enabled = true;
        config.aws.control_tower.execution_role.path = "service-role".into();
        assert_eq!(
            config.role_arn("999999999999"),
            "arn:aws:iam::999999999999:role/service-role/AWSControlTowerExecution"
        );

        // An explicit per-target role wins over everything.
        config.targets.get_mut("Production").unwrap().role_arn =
            Some("arn:aws:iam::123456789012:role/Explicit".into());
        assert_eq!(
            config.role_arn("123456789012"),
            "arn:aws:iam::123456789012:role/Explicit"
        );
    }

    #[test]
    fn resolve_target_needs_account_id() {
        let config = minimal_config();
        let unresolved = TargetConfig {
            imports: vec!["base".into()],
            ..TargetConfig::default()
        };
        assert!(config.resolve_target("Floating", &unresolved).is_err());

        let resolved = config
            .resolve_target("Production", &config.targets["Production"])
            .expect("resolve");
        assert_eq!(resolved.account_id, "123456789012");
        assert_eq!(resolved.region, "us-east-1");
        assert!(resolved.role_arn.contains("123456789012"));
    }
}
