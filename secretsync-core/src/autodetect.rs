//! Environment auto-detection for Vault and AWS clients.
//!
//! A minimal config (sources + targets) is enough to run: address, auth,
//! region, and the merge store are filled in from what the environment
//! exposes.

use crate::config::{
    AppRoleAuth, Config, KubernetesAuth, MergeStoreVault, TokenAuth,
};
use std::path::Path;
use tracing::info;

const DEFAULT_MERGE_MOUNT: &str = "merged-secrets";

/// What the environment makes available.
#[derive(Debug, Clone, Default)]
pub struct DetectedClients {
    pub vault: VaultDetection,
    pub aws: AwsDetection,
}

#[derive(Debug, Clone, Default)]
pub struct VaultDetection {
    pub available: bool,
    pub address: String,
    pub auth_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct AwsDetection {
    pub available: bool,
    pub region: String,
    pub auth_type: String,
}

/// Probe the environment for usable Vault and AWS credentials.
pub fn auto_detect_clients() -> DetectedClients {
    let detected = DetectedClients {
        vault: detect_vault(),
        aws: detect_aws(),
    };

    if detected.vault.available {
        info!(
            address = %detected.vault.address,
            auth_type = %detected.vault.auth_type,
            "vault client auto-detected"
        );
    }
    if detected.aws.available {
        info!(
            region = %detected.aws.region,
            auth_type = %detected.aws.auth_type,
            "aws client auto-detected"
        );
    }
    detected
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn detect_vault() -> VaultDetection {
    let Some(address) = env("VAULT_ADDR") else {
        return VaultDetection::default();
    };

    let auth_type = if env("VAULT_TOKEN").is_some() {
        "token"
    } else if env("VAULT_ROLE_ID").is_some() && env("VAULT_SECRET_ID").is_some() {
        "approle"
    } else if env("VAULT_ROLE").is_some() && is_kubernetes() {
        "kubernetes"
    } else {
        // A token may still live in ~/.vault-token.
        "token"
    };

    VaultDetection {
        available: true,
        address,
        auth_type: auth_type.to_string(),
    }
}

fn detect_aws() -> AwsDetection {
    let has_env_creds = env("AWS_ACCESS_KEY_ID").is_some() && env("AWS_SECRET_ACCESS_KEY").is_some();
    let has_profile = env("AWS_PROFILE").is_some();
    let has_role_arn = env("AWS_ROLE_ARN").is_some();
    let has_web_identity = env("AWS_WEB_IDENTITY_TOKEN_FILE").is_some();
    let has_sso = env("AWS_SSO_START_URL").is_some();
    let is_ecs = env("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI").is_some()
        || env("AWS_CONTAINER_CREDENTIALS_FULL_URI").is_some();
    let is_lambda = env("AWS_LAMBDA_FUNCTION_NAME").is_some();
    let is_ec2 = env("EC2_INSTANCE_ID").is_some() || env("AWS_EXECUTION_ENV").is_some();

    if !(has_env_creds
        || has_profile
        || has_role_arn
        || has_web_identity
        || has_sso
        || is_ecs
        || is_lambda
        || is_ec2)
    {
        return AwsDetection::default();
    }

    let region = env("AWS_REGION")
        .or_else(|| env("AWS_DEFAULT_REGION"))
        .unwrap_or_else(|| "us-east-1".to_string());

    let auth_type = if has_env_creds {
        "env"
    } else if has_profile {
        "profile"
    } else if has_sso {
        "sso"
    } else if has_web_identity {
        "web-identity"
    } else if has_role_arn {
        "assume-role"
    } else if is_lambda || is_ecs {
        "iam-role"
    } else {
        "ec2-metadata"
    };

    AwsDetection {
        available: true,
        region,
        auth_type: auth_type.to_string(),
    }
}

fn is_kubernetes() -> bool {
    Path::new("/var/run/secrets/kubernetes.io/serviceaccount/token").exists()
        || env("KUBERNETES_SERVICE_HOST").is_some()
}

impl Config {
    /// Fold detection results into any configuration gaps. Explicit settings
    /// always win.
    pub fn apply_auto_detection(&mut self, detected: &DetectedClients) {
        if self.vault.address.is_empty() && detected.vault.available {
            self.vault.address = detected.vault.address.clone();
            info!(address = %self.vault.address, "applied auto-detected vault address");

            let auth = &mut self.vault.auth;
            if auth.token.is_none() && auth.approle.is_none() && auth.kubernetes.is_none() {
                match detected.vault.auth_type.as_str() {
                    "token" => {
                        if let Some(token) = vault_token_from_env() {
                            auth.token = Some(TokenAuth { token });
                        }
                    }
                    "approle" => {
                        auth.approle = Some(AppRoleAuth {
                            mount: env("VAULT_APPROLE_MOUNT")
                                .unwrap_or_else(|| "approle".to_string()),
                            role_id: env("VAULT_ROLE_ID").unwrap_or_default(),
                            secret_id: env("VAULT_SECRET_ID").unwrap_or_default(),
                        });
                    }
                    "kubernetes" => {
                        auth.kubernetes = Some(KubernetesAuth {
                            role: env("VAULT_ROLE").unwrap_or_default(),
                            mount_path: env("VAULT_K8S_MOUNT")
                                .unwrap_or_else(|| "kubernetes".to_string()),
                        });
                    }
                    _ => {}
                }
            }

            if self.vault.namespace.is_empty() {
                if let Some(namespace) = env("VAULT_NAMESPACE") {
                    self.vault.namespace = namespace;
                }
            }
        }

        if detected.aws.available && !detected.aws.region.is_empty() {
            // The loader default is us-east-1; a detected region is more
            // specific.
            if self.aws.region.is_empty() || self.aws.region == "us-east-1" {
                self.aws.region = detected.aws.region.clone();
            }
        }

        if self.merge_store.vault.is_none()
            && self.merge_store.s3.is_none()
            && detected.vault.available
        {
            self.merge_store.vault = Some(MergeStoreVault {
                mount: DEFAULT_MERGE_MOUNT.to_string(),
            });
            info!("auto-configured vault merge store");
        }
    }
}

fn vault_token_from_env() -> Option<String> {
    if let Some(token) = env("VAULT_TOKEN") {
        return Some(token);
    }
    let home = env("HOME")?;
    let token = std::fs::read_to_string(Path::new(&home).join(".vault-token")).ok()?;
    let token = token.trim().to_string();
    (!token.is_empty()).then_some(token)
}
