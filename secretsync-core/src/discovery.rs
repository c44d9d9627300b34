//! Dynamic-target expansion against an upstream account registry.
//!
//! Expansion happens once, before graph construction. After it, discovered
//! targets are indistinguishable from static ones.

use crate::config::{Config, DynamicTargetConfig, TargetConfig};
use regex::Regex;
use secretsync_spec::{AccountInfo, AccountRegistry};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Expand every dynamic target into concrete targets. Discovery failures
/// skip the affected dynamic target with a warning; they never fail the
/// run.
pub async fn expand_dynamic_targets(
    config: &Config,
    registry: &dyn AccountRegistry,
) -> BTreeMap<String, TargetConfig> {
    let mut discovered = BTreeMap::new();

    for (dynamic_name, dynamic) in &config.dynamic_targets {
        let accounts = match discover_accounts(dynamic, registry).await {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(
                    dynamic_target = %dynamic_name,
                    error = %err,
                    "dynamic target discovery failed, skipping"
                );
                continue;
            }
        };

        let accounts = filter_accounts(dynamic, accounts);
        for account in accounts {
            let mut target_name = sanitize_target_name(account.name.as_deref().unwrap_or(""));
            if target_name.is_empty() {
                target_name = format!("account_{}", account.id);
            }
            if discovered.contains_key(&target_name) {
                let suffix: String = account.id.chars().take(6).collect();
                target_name = format!("{target_name}_{suffix}");
            }

            debug!(
                dynamic_target = %dynamic_name,
                target = %target_name,
                account_id = %account.id,
                "discovered target"
            );
            discovered.insert(
                target_name,
                TargetConfig {
                    account_id: Some(account.id),
                    region: Some(config.aws.region.clone()),
                    role_arn: None,
                    imports: dynamic.imports.clone(),
                },
            );
        }
    }

    info!(count = discovered.len(), "dynamic target discovery completed");
    discovered
}

/// Merge discovered targets into the static map. A name collision keeps the
/// static target and drops the dynamic one with a warning.
pub fn merge_discovered_targets(
    targets: &mut BTreeMap<String, TargetConfig>,
    discovered: BTreeMap<String, TargetConfig>,
) {
    for (name, target) in discovered {
        if targets.contains_key(&name) {
            warn!(
                target = %name,
                "dynamic target name conflicts with a static target, skipping"
            );
            continue;
        }
        targets.insert(name, target);
    }
}

async fn discover_accounts(
    dynamic: &DynamicTargetConfig,
    registry: &dyn AccountRegistry,
) -> secretsync_spec::DriverResult<Vec<AccountInfo>> {
    let mut accounts = Vec::new();

    if let Some(identity_center) = &dynamic.discovery.identity_center {
        if !identity_center.group.is_empty() {
            accounts.extend(registry.accounts_for_group(&identity_center.group).await?);
        }
        if !identity_center.permission_set.is_empty() {
            accounts.extend(
                registry
                    .accounts_for_permission_set(&identity_center.permission_set)
                    .await?,
            );
        }
    }

    if let Some(organizations) = &dynamic.discovery.organizations {
        if organizations.ou.is_empty() {
            accounts.extend(registry.organization_accounts().await?);
        } else {
            accounts.extend(
                registry
                    .accounts_in_ou(&organizations.ou, organizations.recursive)
                    .await?,
            );
        }
        if !organizations.tags.is_empty() {
            accounts.retain(|account| {
                organizations
                    .tags
                    .iter()
                    .all(|(key, value)| account.tags.get(key) == Some(value))
            });
        }
    }

    if let Some(list) = &dynamic.discovery.accounts_list {
        accounts.extend(list.accounts.iter().cloned().map(AccountInfo::new));
    }

    Ok(dedup_accounts(accounts))
}

fn filter_accounts(dynamic: &DynamicTargetConfig, accounts: Vec<AccountInfo>) -> Vec<AccountInfo> {
    let patterns: Vec<Regex> = dynamic
        .account_name_patterns
        .iter()
        .filter(|p| !p.pattern.is_empty())
        .filter_map(|p| Regex::new(&p.pattern).ok())
        .collect();

    accounts
        .into_iter()
        .filter(|account| {
            if dynamic.exclude.contains(&account.id) {
                debug!(account_id = %account.id, "account excluded");
                return false;
            }
            if patterns.is_empty() {
                return true;
            }
            let name = account.name.as_deref().unwrap_or("");
            patterns.iter().any(|pattern| pattern.is_match(name))
        })
        .collect()
}

fn dedup_accounts(accounts: Vec<AccountInfo>) -> Vec<AccountInfo> {
    let mut seen = std::collections::BTreeSet::new();
    accounts
        .into_iter()
        .filter(|account| seen.insert(account.id.clone()))
        .collect()
}

/// Turn an account display name into a target name: spaces and dashes become
/// underscores, anything else non-alphanumeric is dropped.
pub fn sanitize_target_name(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            ' ' | '-' => Some('_'),
            c if c.is_ascii_alphanumeric() || c == '_' => Some(c),
            _ => None,
        })
        .collect()
}

/// Fill in missing target account ids by fuzzy-matching target names against
/// discovered account names.
pub fn resolve_account_ids(
    targets: &mut BTreeMap<String, TargetConfig>,
    accounts: &[AccountInfo],
) {
    for (name, target) in targets.iter_mut() {
        if target.account_id.is_some() {
            continue;
        }
        if let Some(account) = fuzzy_match(name, accounts) {
            info!(
                target = %name,
                account_id = %account.id,
                account_name = account.name.as_deref().unwrap_or(""),
                "resolved target account via fuzzy match"
            );
            target.account_id = Some(account.id.clone());
        }
    }
}

fn fuzzy_match<'a>(target_name: &str, accounts: &'a [AccountInfo]) -> Option<&'a AccountInfo> {
    let wanted = sanitize_target_name(target_name).to_ascii_lowercase();

    // Exact sanitized match first, then substring either way.
    let sanitized = |account: &AccountInfo| {
        sanitize_target_name(account.name.as_deref().unwrap_or("")).to_ascii_lowercase()
    };
    accounts
        .iter()
        .find(|account| sanitized(account) == wanted)
        .or_else(|| {
            accounts.iter().find(|account| {
                let name = sanitized(account);
                !name.is_empty() && (name.contains(&wanted) || wanted.contains(&name))
            })
        })
}
