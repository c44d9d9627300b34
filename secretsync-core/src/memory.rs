//! In-memory drivers.
//!
//! Back the test suites and local dry-run workflows without any network.
//! The memory destination honors the same cache-invalidation contract real
//! destinations do, and the provider can be told to refuse sessions for
//! specific accounts to exercise failure isolation.

use async_trait::async_trait;
use secretsync_spec::{
    AccountInfo, AccountRegistry, Destination, DestinationProvider, DriverError, DriverResult,
    MergeStore, ResolvedTarget, SecretPath, SecretSource, SecretTree,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// An in-memory source tree.
#[derive(Default)]
pub struct MemorySource {
    state: RwLock<BTreeMap<SecretPath, (u64, Value)>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the source with a whole tree at version 1.
    pub fn with_tree(tree: SecretTree) -> Self {
        let state = tree.into_iter().map(|(path, value)| (path, (1, value)));
        Self {
            state: RwLock::new(state.collect()),
        }
    }
}

#[async_trait]
impl SecretSource for MemorySource {
    async fn list_recursive(&self) -> DriverResult<Vec<SecretPath>> {
        Ok(self.state.read().expect("lock").keys().cloned().collect())
    }

    async fn read(&self, path: &SecretPath) -> DriverResult<Option<Value>> {
        Ok(self
            .state
            .read()
            .expect("lock")
            .get(path)
            .map(|(_, value)| value.clone()))
    }

    async fn write(&self, path: &SecretPath, value: &Value) -> DriverResult<()> {
        let mut state = self.state.write().expect("lock");
        let version = state.get(path).map(|(v, _)| *v).unwrap_or(0) + 1;
        state.insert(path.clone(), (version, value.clone()));
        Ok(())
    }

    async fn delete(&self, path: &SecretPath) -> DriverResult<()> {
        self.state.write().expect("lock").remove(path);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        path: &SecretPath,
        expected: Option<u64>,
        value: &Value,
    ) -> DriverResult<u64> {
        let mut state = self.state.write().expect("lock");
        let current = state.get(path).map(|(v, _)| *v);
        if current != expected {
            return Err(DriverError::permanent(
                "compare_and_swap",
                format!("version mismatch: expected {expected:?}, found {current:?}"),
            )
            .with_path(path.clone()));
        }
        let next = current.unwrap_or(0) + 1;
        state.insert(path.clone(), (next, value.clone()));
        Ok(next)
    }
}

/// An in-memory destination for one account, with operation counters and a
/// model of the list cache real drivers keep.
#[derive(Default)]
pub struct MemoryDestination {
    secrets: RwLock<SecretTree>,
    list_cache: Mutex<Option<SecretTree>>,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tree(tree: SecretTree) -> Self {
        Self {
            secrets: RwLock::new(tree),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> SecretTree {
        self.secrets.read().expect("lock").clone()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn invalidate_cache(&self) {
        *self.list_cache.lock().expect("lock") = None;
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn list(&self) -> DriverResult<SecretTree> {
        let mut cache = self.list_cache.lock().expect("lock");
        if let Some(cached) = cache.as_ref() {
            return Ok(cached.clone());
        }
        let inventory = self.secrets.read().expect("lock").clone();
        *cache = Some(inventory.clone());
        Ok(inventory)
    }

    async fn get(&self, path: &SecretPath) -> DriverResult<Option<Value>> {
        Ok(self.secrets.read().expect("lock").get(path).cloned())
    }

    async fn put(&self, path: &SecretPath, value: &Value) -> DriverResult<()> {
        self.secrets
            .write()
            .expect("lock")
            .insert(path.clone(), value.clone());
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.invalidate_cache();
        Ok(())
    }

    async fn delete(&self, path: &SecretPath) -> DriverResult<()> {
        self.secrets.write().expect("lock").remove(path);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.invalidate_cache();
        Ok(())
    }
}

/// Hands out one [`MemoryDestination`] per account id. Accounts can be
/// marked unreachable to simulate a dead destination.
#[derive(Default)]
pub struct MemoryDestinationProvider {
    sessions: RwLock<HashMap<String, Arc<MemoryDestination>>>,
    unreachable: RwLock<BTreeSet<String>>,
}

impl MemoryDestinationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register a destination for an account (e.g. seeded with existing
    /// inventory).
    pub fn insert(&self, account_id: impl Into<String>, destination: Arc<MemoryDestination>) {
        self.sessions
            .write()
            .expect("lock")
            .insert(account_id.into(), destination);
    }

    /// Make `session` fail for the given account.
    pub fn mark_unreachable(&self, account_id: impl Into<String>) {
        self.unreachable
            .write()
            .expect("lock")
            .insert(account_id.into());
    }

    pub fn destination(&self, account_id: &str) -> Option<Arc<MemoryDestination>> {
        self.sessions
            .read()
            .expect("lock")
            .get(account_id)
            .cloned()
    }
}

#[async_trait]
impl DestinationProvider for MemoryDestinationProvider {
    async fn session(&self, target: &ResolvedTarget) -> DriverResult<Arc<dyn Destination>> {
        if self
            .unreachable
            .read()
            .expect("lock")
            .contains(&target.account_id)
        {
            return Err(DriverError::transient(
                "session",
                format!("destination account {} is unreachable", target.account_id),
            ));
        }
        let mut sessions = self.sessions.write().expect("lock");
        let destination = sessions
            .entry(target.account_id.clone())
            .or_insert_with(|| Arc::new(MemoryDestination::new()))
            .clone();
        Ok(destination)
    }
}

/// An in-memory merge store. Entries are replaced wholesale under the lock,
/// so readers always see a complete tree.
#[derive(Default)]
pub struct MemoryMergeStore {
    entries: RwLock<BTreeMap<String, SecretTree>>,
}

impl MemoryMergeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().expect("lock").len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().expect("lock").keys().cloned().collect()
    }
}

#[async_trait]
impl MergeStore for MemoryMergeStore {
    async fn put_tree(&self, target: &str, tree: &SecretTree) -> DriverResult<()> {
        self.entries
            .write()
            .expect("lock")
            .insert(target.to_string(), tree.clone());
        Ok(())
    }

    async fn get_tree(&self, target: &str) -> DriverResult<Option<SecretTree>> {
        Ok(self.entries.read().expect("lock").get(target).cloned())
    }
}

/// A static account registry for discovery tests and offline runs.
#[derive(Default)]
pub struct MemoryAccountRegistry {
    pub accounts: Vec<AccountInfo>,
    pub ou_members: BTreeMap<String, Vec<String>>,
    pub group_assignments: BTreeMap<String, Vec<String>>,
    pub permission_sets: BTreeMap<String, Vec<String>>,
}

impl MemoryAccountRegistry {
    pub fn new(accounts: Vec<AccountInfo>) -> Self {
        Self {
            accounts,
            ..Self::default()
        }
    }

    fn by_ids(&self, ids: &[String]) -> Vec<AccountInfo> {
        ids.iter()
            .map(|id| {
                self.accounts
                    .iter()
                    .find(|account| &account.id == id)
                    .cloned()
                    .unwrap_or_else(|| AccountInfo::new(id.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl AccountRegistry for MemoryAccountRegistry {
    async fn organization_accounts(&self) -> DriverResult<Vec<AccountInfo>> {
        Ok(self.accounts.clone())
    }

    async fn accounts_in_ou(&self, ou: &str, _recursive: bool) -> DriverResult<Vec<AccountInfo>> {
        match self.ou_members.get(ou) {
            Some(ids) => Ok(self.by_ids(ids)),
            None => Err(DriverError::not_found(
                "accounts_in_ou",
                format!("organizational unit {ou} not found"),
            )),
        }
    }

    async fn accounts_for_group(&self, group: &str) -> DriverResult<Vec<AccountInfo>> {
        match self.group_assignments.get(group) {
            Some(ids) => Ok(self.by_ids(ids)),
            None => Err(DriverError::not_found(
                "accounts_for_group",
                format!("group {group} not found"),
            )),
        }
    }

    async fn accounts_for_permission_set(&self, name: &str) -> DriverResult<Vec<AccountInfo>> {
        match self.permission_sets.get(name) {
            Some(ids) => Ok(self.by_ids(ids)),
            None => Err(DriverError::not_found(
                "accounts_for_permission_set",
                format!("permission set {name} not found"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> SecretPath {
        SecretPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn source_read_tree_collects_all_leaves() {
        let mut tree = SecretTree::new();
        tree.insert(path("app/db"), json!({"host": "h"}));
        tree.insert(path("app/api"), json!({"key": "k"}));
        let source = MemorySource::with_tree(tree.clone());

        assert_eq!(source.read_tree().await.unwrap(), tree);
    }

    #[tokio::test]
    async fn compare_and_swap_enforces_versions() {
        let source = MemorySource::new();
        let p = path("app/token");

        let v1 = source
            .compare_and_swap(&p, None, &json!("first"))
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let v2 = source
            .compare_and_swap(&p, Some(1), &json!("second"))
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let stale = source.compare_and_swap(&p, Some(1), &json!("third")).await;
        assert!(stale.is_err());
    }

    #[tokio::test]
    async fn destination_writes_invalidate_the_list_cache() {
        let destination = MemoryDestination::new();
        destination.put(&path("a"), &json!("1")).await.unwrap();

        let before = destination.list().await.unwrap();
        assert_eq!(before.len(), 1);

        // A second list is served from cache, a write invalidates it.
        destination.put(&path("b"), &json!("2")).await.unwrap();
        let after = destination.list().await.unwrap();
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn provider_refuses_unreachable_accounts() {
        let provider = MemoryDestinationProvider::new();
        provider.mark_unreachable("111111111111");

        let target = ResolvedTarget {
            name: "T".into(),
            account_id: "111111111111".into(),
            region: "us-east-1".into(),
            role_arn: "arn:aws:iam::111111111111:role/X".into(),
        };
        assert!(provider.session(&target).await.is_err());
    }
}
