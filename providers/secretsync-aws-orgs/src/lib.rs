//! Account registry backed by AWS Organizations and Identity Center.
//!
//! Serves dynamic-target discovery: organization and OU account listings
//! (with tags, for tag filters), identity-center group assignments, and
//! permission-set provisioning. Every listing paginates to completion.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_identitystore::Client as IdentityStoreClient;
use aws_sdk_organizations::Client as OrganizationsClient;
use aws_sdk_ssoadmin::types::PrincipalType;
use aws_sdk_ssoadmin::Client as SsoAdminClient;
use secretsync_spec::{AccountInfo, AccountRegistry, DriverError, DriverResult};
use std::collections::BTreeMap;
use tracing::debug;

/// Registry handle holding the three service clients.
pub struct AwsOrgsRegistry {
    organizations: OrganizationsClient,
    sso_admin: SsoAdminClient,
    identity_store: IdentityStoreClient,
}

impl AwsOrgsRegistry {
    /// Build the registry from ambient AWS configuration.
    pub async fn new() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            organizations: OrganizationsClient::new(&config),
            sso_admin: SsoAdminClient::new(&config),
            identity_store: IdentityStoreClient::new(&config),
        }
    }

    async fn account_tags(&self, account_id: &str) -> DriverResult<BTreeMap<String, String>> {
        let mut tags = BTreeMap::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self.organizations.list_tags_for_resource().resource_id(account_id);
            if let Some(next) = &token {
                request = request.next_token(next);
            }
            let response = request
                .send()
                .await
                .map_err(|err| registry_error("list_tags_for_resource", &err))?;
            for tag in response.tags() {
                tags.insert(tag.key().to_string(), tag.value().to_string());
            }
            match response.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(tags)
    }

    async fn accounts_for_parent(&self, parent_id: &str) -> DriverResult<Vec<AccountInfo>> {
        let mut accounts = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self.organizations.list_accounts_for_parent().parent_id(parent_id);
            if let Some(next) = &token {
                request = request.next_token(next);
            }
            let response = request
                .send()
                .await
                .map_err(|err| registry_error("list_accounts_for_parent", &err))?;
            for account in response.accounts() {
                if let Some(info) = self.account_info(account.id(), account.name()).await? {
                    accounts.push(info);
                }
            }
            match response.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(accounts)
    }

    async fn child_ous(&self, parent_id: &str) -> DriverResult<Vec<String>> {
        let mut ous = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self
                .organizations
                .list_organizational_units_for_parent()
                .parent_id(parent_id);
            if let Some(next) = &token {
                request = request.next_token(next);
            }
            let response = request
                .send()
                .await
                .map_err(|err| registry_error("list_organizational_units_for_parent", &err))?;
            for ou in response.organizational_units() {
                if let Some(id) = ou.id() {
                    ous.push(id.to_string());
                }
            }
            match response.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(ous)
    }

    async fn account_info(
        &self,
        id: Option<&str>,
        name: Option<&str>,
    ) -> DriverResult<Option<AccountInfo>> {
        let Some(id) = id else { return Ok(None) };
        let tags = self.account_tags(id).await.unwrap_or_default();
        Ok(Some(AccountInfo {
            id: id.to_string(),
            name: name.map(str::to_string),
            tags,
        }))
    }

    /// Identity Center instance coordinates (instance ARN + identity store).
    async fn sso_instance(&self) -> DriverResult<(String, String)> {
        let response = self
            .sso_admin
            .list_instances()
            .send()
            .await
            .map_err(|err| registry_error("list_instances", &err))?;
        let instance = response.instances().first().ok_or_else(|| {
            DriverError::not_found("list_instances", "no identity center instances found")
        })?;
        let arn = instance
            .instance_arn()
            .ok_or_else(|| DriverError::permanent("list_instances", "instance has no ARN"))?;
        let store = instance.identity_store_id().ok_or_else(|| {
            DriverError::permanent("list_instances", "instance has no identity store id")
        })?;
        Ok((arn.to_string(), store.to_string()))
    }

    async fn group_id_by_name(&self, store_id: &str, group: &str) -> DriverResult<String> {
        let mut token: Option<String> = None;
        loop {
            let mut request = self.identity_store.list_groups().identity_store_id(store_id);
            if let Some(next) = &token {
                request = request.next_token(next);
            }
            let response = request
                .send()
                .await
                .map_err(|err| registry_error("list_groups", &err))?;
            for candidate in response.groups() {
                if candidate.display_name() == Some(group) {
                    return Ok(candidate.group_id().to_string());
                }
            }
            match response.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => {
                    return Err(DriverError::not_found(
                        "list_groups",
                        format!("group not found: {group}"),
                    ))
                }
            }
        }
    }

    async fn permission_set_arn_by_name(
        &self,
        instance_arn: &str,
        name: &str,
    ) -> DriverResult<String> {
        let mut token: Option<String> = None;
        loop {
            let mut request = self.sso_admin.list_permission_sets().instance_arn(instance_arn);
            if let Some(next) = &token {
                request = request.next_token(next);
            }
            let response = request
                .send()
                .await
                .map_err(|err| registry_error("list_permission_sets", &err))?;
            for arn in response.permission_sets() {
                let details = self
                    .sso_admin
                    .describe_permission_set()
                    .instance_arn(instance_arn)
                    .permission_set_arn(arn)
                    .send()
                    .await
                    .map_err(|err| registry_error("describe_permission_set", &err))?;
                let matches = details
                    .permission_set()
                    .and_then(|ps| ps.name())
                    .is_some_and(|candidate| candidate == name);
                if matches {
                    return Ok(arn.to_string());
                }
            }
            match response.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => {
                    return Err(DriverError::not_found(
                        "list_permission_sets",
                        format!("permission set not found: {name}"),
                    ))
                }
            }
        }
    }

    /// Fill in display names from the organization listing where available.
    async fn enrich(&self, mut accounts: Vec<AccountInfo>) -> Vec<AccountInfo> {
        let Ok(org_accounts) = self.organization_accounts().await else {
            return accounts;
        };
        let by_id: BTreeMap<&str, &AccountInfo> = org_accounts
            .iter()
            .map(|account| (account.id.as_str(), account))
            .collect();
        for account in &mut accounts {
            if account.name.is_none() {
                if let Some(known) = by_id.get(account.id.as_str()) {
                    account.name.clone_from(&known.name);
                    account.tags.clone_from(&known.tags);
                }
            }
        }
        accounts
    }
}

#[async_trait]
impl AccountRegistry for AwsOrgsRegistry {
    async fn organization_accounts(&self) -> DriverResult<Vec<AccountInfo>> {
        let mut accounts = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self.organizations.list_accounts();
            if let Some(next) = &token {
                request = request.next_token(next);
            }
            let response = request
                .send()
                .await
                .map_err(|err| registry_error("list_accounts", &err))?;
            for account in response.accounts() {
                if let Some(info) = self.account_info(account.id(), account.name()).await? {
                    accounts.push(info);
                }
            }
            match response.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        debug!(count = accounts.len(), "listed organization accounts");
        Ok(accounts)
    }

    async fn accounts_in_ou(&self, ou: &str, recursive: bool) -> DriverResult<Vec<AccountInfo>> {
        let mut accounts = Vec::new();
        let mut pending = vec![ou.to_string()];
        while let Some(parent) = pending.pop() {
            accounts.extend(self.accounts_for_parent(&parent).await?);
            if recursive {
                pending.extend(self.child_ous(&parent).await?);
            }
        }
        Ok(accounts)
    }

    async fn accounts_for_group(&self, group: &str) -> DriverResult<Vec<AccountInfo>> {
        let (instance_arn, store_id) = self.sso_instance().await?;
        let group_id = self.group_id_by_name(&store_id, group).await?;

        let mut account_ids = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self
                .sso_admin
                .list_account_assignments_for_principal()
                .instance_arn(&instance_arn)
                .principal_id(&group_id)
                .principal_type(PrincipalType::Group);
            if let Some(next) = &token {
                request = request.next_token(next);
            }
            let response = request
                .send()
                .await
                .map_err(|err| registry_error("list_account_assignments_for_principal", &err))?;
            for assignment in response.account_assignments() {
                if let Some(account_id) = assignment.account_id() {
                    if !account_ids.contains(&account_id.to_string()) {
                        account_ids.push(account_id.to_string());
                    }
                }
            }
            match response.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }

        let accounts = account_ids.into_iter().map(AccountInfo::new).collect();
        Ok(self.enrich(accounts).await)
    }

    async fn accounts_for_permission_set(&self, name: &str) -> DriverResult<Vec<AccountInfo>> {
        let (instance_arn, _) = self.sso_instance().await?;
        let permission_set_arn = self.permission_set_arn_by_name(&instance_arn, name).await?;

        let mut account_ids = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self
                .sso_admin
                .list_accounts_for_provisioned_permission_set()
                .instance_arn(&instance_arn)
                .permission_set_arn(&permission_set_arn);
            if let Some(next) = &token {
                request = request.next_token(next);
            }
            let response = request.send().await.map_err(|err| {
                registry_error("list_accounts_for_provisioned_permission_set", &err)
            })?;
            for account_id in response.account_ids() {
                account_ids.push(account_id.to_string());
            }
            match response.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }

        let accounts = account_ids.into_iter().map(AccountInfo::new).collect();
        Ok(self.enrich(accounts).await)
    }
}

fn registry_error<E: std::fmt::Debug>(operation: &str, err: &E) -> DriverError {
    DriverError::permanent(operation, format!("{err:?}"))
}
