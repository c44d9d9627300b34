//! Driver interfaces presented to the engine.
//!
//! Drivers own authentication, pagination, retries for transient failures,
//! and caching; the engine only sees the final outcome of each call. All
//! handles are cheap to clone behind `Arc` and shared across target workers.

use crate::error::DriverResult;
use crate::path::SecretPath;
use crate::types::{AccountInfo, ResolvedTarget};
use crate::value::SecretTree;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A vault-like upstream tree of secrets.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Enumerate every leaf path under the source's root.
    async fn list_recursive(&self) -> DriverResult<Vec<SecretPath>>;

    /// Read a single secret document, `None` when absent.
    async fn read(&self, path: &SecretPath) -> DriverResult<Option<Value>>;

    /// Write a secret document, creating or replacing it.
    async fn write(&self, path: &SecretPath, value: &Value) -> DriverResult<()>;

    /// Delete a secret.
    async fn delete(&self, path: &SecretPath) -> DriverResult<()>;

    /// Compare-and-swap: write `value` only when the stored version matches
    /// `expected` (`None` = must not exist). Returns the new version.
    async fn compare_and_swap(
        &self,
        path: &SecretPath,
        expected: Option<u64>,
        value: &Value,
    ) -> DriverResult<u64>;

    /// Materialize the whole tree. The default lists then reads each leaf;
    /// drivers with a cheaper bulk read may override.
    async fn read_tree(&self) -> DriverResult<SecretTree> {
        let mut tree = SecretTree::new();
        for path in self.list_recursive().await? {
            if let Some(value) = self.read(&path).await? {
                tree.insert(path, value);
            }
        }
        Ok(tree)
    }
}

/// A downstream secret store scoped to one target account.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Current inventory under the destination's scope.
    async fn list(&self) -> DriverResult<SecretTree>;

    /// Read a single destination secret.
    async fn get(&self, path: &SecretPath) -> DriverResult<Option<Value>>;

    /// Create or update a destination secret. Implementations invalidate
    /// their list cache for the affected scope as part of the write.
    async fn put(&self, path: &SecretPath, value: &Value) -> DriverResult<()>;

    /// Delete a destination secret, likewise invalidating the list cache.
    async fn delete(&self, path: &SecretPath) -> DriverResult<()>;
}

/// Opens destination sessions per resolved target account.
#[async_trait]
pub trait DestinationProvider: Send + Sync {
    async fn session(&self, target: &ResolvedTarget) -> DriverResult<Arc<dyn Destination>>;
}

/// Content-addressed store for merged trees, keyed by target name.
///
/// Writes replace the whole entry atomically from a reader's perspective: a
/// concurrent reader sees either the old tree or the new tree, never a
/// partial write.
#[async_trait]
pub trait MergeStore: Send + Sync {
    async fn put_tree(&self, target: &str, tree: &SecretTree) -> DriverResult<()>;

    async fn get_tree(&self, target: &str) -> DriverResult<Option<SecretTree>>;
}

/// Upstream account registry used to expand dynamic targets.
#[async_trait]
pub trait AccountRegistry: Send + Sync {
    /// Every account in the organization.
    async fn organization_accounts(&self) -> DriverResult<Vec<AccountInfo>>;

    /// Accounts under an organizational unit, optionally recursing into
    /// nested OUs.
    async fn accounts_in_ou(&self, ou: &str, recursive: bool) -> DriverResult<Vec<AccountInfo>>;

    /// Accounts assigned to an identity-center group.
    async fn accounts_for_group(&self, group: &str) -> DriverResult<Vec<AccountInfo>>;

    /// Accounts provisioned with a named permission set.
    async fn accounts_for_permission_set(&self, name: &str) -> DriverResult<Vec<AccountInfo>>;
}
