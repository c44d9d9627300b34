//! The sync phase: project merged trees into destination accounts.

use crate::cancel::CancellationToken;
use crate::diff::Diff;
use crate::report::TargetResult;
use secretsync_spec::{
    Destination, DestinationProvider, DriverError, Error, MergeStore, Phase, ResolvedTarget,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Knobs for one sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub parallelism: usize,
    pub dry_run: bool,
    pub delete_orphans: bool,
    pub continue_on_error: bool,
    pub compute_diff: bool,
}

/// Projects merge-store entries into destinations, target by target.
pub struct SyncExecutor {
    store: Arc<dyn MergeStore>,
    destinations: Arc<dyn DestinationProvider>,
    options: SyncOptions,
    cancel: CancellationToken,
}

impl SyncExecutor {
    pub fn new(
        store: Arc<dyn MergeStore>,
        destinations: Arc<dyn DestinationProvider>,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            destinations,
            options,
            cancel,
        }
    }

    /// Sync every target. `targets` is expected in topological order purely
    /// for predictable logs; results come back in completion order.
    pub async fn run(&self, targets: Vec<ResolvedTarget>) -> Vec<(TargetResult, Option<Diff>)> {
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let mut tasks: JoinSet<(TargetResult, Option<Diff>)> = JoinSet::new();
        let mut results = Vec::with_capacity(targets.len());

        for target in targets {
            if self.cancel.is_cancelled() {
                debug!(target = %target.name, "cancellation requested, not admitting target");
                results.push((
                    TargetResult::failed(
                        Phase::Sync,
                        &target.name,
                        std::time::Duration::ZERO,
                        vec![Error::Cancelled],
                    ),
                    None,
                ));
                continue;
            }

            let store = Arc::clone(&self.store);
            let destinations = Arc::clone(&self.destinations);
            let options = self.options.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                sync_target(target, store, destinations, options).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap_or_else(|err| {
                (
                    TargetResult::failed(
                        Phase::Sync,
                        "<join>",
                        std::time::Duration::ZERO,
                        vec![Error::Internal(format!("sync task panicked: {err}"))],
                    ),
                    None,
                )
            }));
        }
        results
    }
}

async fn sync_target(
    target: ResolvedTarget,
    store: Arc<dyn MergeStore>,
    destinations: Arc<dyn DestinationProvider>,
    options: SyncOptions,
) -> (TargetResult, Option<Diff>) {
    let started = Instant::now();
    match sync_target_inner(&target, store, destinations, &options).await {
        Ok((diff, errors)) => {
            let retained = (options.dry_run || options.compute_diff).then_some(diff);
            let result = if errors.is_empty() {
                TargetResult::ok(Phase::Sync, &target.name, started.elapsed())
            } else {
                TargetResult::failed(Phase::Sync, &target.name, started.elapsed(), errors)
            };
            (result, retained)
        }
        Err(err) => (
            TargetResult::failed(Phase::Sync, &target.name, started.elapsed(), vec![err]),
            None,
        ),
    }
}

/// List, diff, apply. Returns the diff plus any per-secret errors that were
/// tolerated under `continue_on_error`.
async fn sync_target_inner(
    target: &ResolvedTarget,
    store: Arc<dyn MergeStore>,
    destinations: Arc<dyn DestinationProvider>,
    options: &SyncOptions,
) -> Result<(Diff, Vec<Error>), Error> {
    let destination = destinations.session(target).await?;

    let desired = store
        .get_tree(&target.name)
        .await?
        .ok_or_else(|| {
            Error::Driver(DriverError::not_found(
                "merge_store.get_tree",
                format!("no merged entry for target `{}`", target.name),
            ))
        })?;

    let observed = destination
        .list()
        .await
        .map_err(|err| Error::DestinationList {
            target: target.name.clone(),
            source: err,
        })?;

    let diff = Diff::compute(&desired, &observed);
    let (added, removed, modified, unchanged) = diff.counts();
    info!(
        target = %target.name,
        account_id = %target.account_id,
        added,
        removed,
        modified,
        unchanged,
        dry_run = options.dry_run,
        "computed destination diff"
    );

    if options.dry_run {
        return Ok((diff, Vec::new()));
    }

    let mut errors = Vec::new();
    apply_diff(&diff, destination.as_ref(), options, &mut errors).await?;
    Ok((diff, errors))
}

async fn apply_diff(
    diff: &Diff,
    destination: &dyn Destination,
    options: &SyncOptions,
    errors: &mut Vec<Error>,
) -> Result<(), Error> {
    for (path, value) in &diff.added {
        let write = destination.put(path, value).await;
        record(
            write.map_err(|err| Error::DestinationWrite {
                path: path.clone(),
                source: err,
            }),
            options,
            errors,
        )?;
    }

    for (path, change) in &diff.modified {
        let write = destination.put(path, &change.desired).await;
        record(
            write.map_err(|err| Error::DestinationWrite {
                path: path.clone(),
                source: err,
            }),
            options,
            errors,
        )?;
    }

    if options.delete_orphans {
        for path in diff.removed.keys() {
            let delete = destination.delete(path).await;
            record(
                delete.map_err(|err| Error::DestinationWrite {
                    path: path.clone(),
                    source: err,
                }),
                options,
                errors,
            )?;
        }
    } else if !diff.removed.is_empty() {
        debug!(
            orphans = diff.removed.len(),
            "delete_orphans disabled, leaving orphaned secrets in place"
        );
    }

    Ok(())
}

/// Accumulate or abort on a per-secret failure, per `continue_on_error`.
fn record(
    outcome: Result<(), Error>,
    options: &SyncOptions,
    errors: &mut Vec<Error>,
) -> Result<(), Error> {
    match outcome {
        Ok(()) => Ok(()),
        Err(err) if options.continue_on_error => {
            errors.push(err);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDestination, MemoryDestinationProvider, MemoryMergeStore};
    use secretsync_spec::{SecretPath, SecretTree};
    use serde_json::json;

    fn tree(entries: &[(&str, serde_json::Value)]) -> SecretTree {
        entries
            .iter()
            .map(|(path, value)| (SecretPath::parse(path).unwrap(), value.clone()))
            .collect()
    }

    fn target(name: &str, account: &str) -> ResolvedTarget {
        ResolvedTarget {
            name: name.into(),
            account_id: account.into(),
            region: "us-east-1".into(),
            role_arn: format!("arn:aws:iam::{account}:role/AWSControlTowerExecution"),
        }
    }

    fn options() -> SyncOptions {
        SyncOptions {
            parallelism: 4,
            dry_run: false,
            delete_orphans: false,
            continue_on_error: true,
            compute_diff: true,
        }
    }

    async fn seeded(
        desired: SecretTree,
        observed: SecretTree,
    ) -> (
        Arc<MemoryMergeStore>,
        Arc<MemoryDestinationProvider>,
        Arc<MemoryDestination>,
    ) {
        let store = Arc::new(MemoryMergeStore::new());
        store.put_tree("T", &desired).await.unwrap();
        let destination = Arc::new(MemoryDestination::with_tree(observed));
        let provider = Arc::new(MemoryDestinationProvider::new());
        provider.insert("111111111111", Arc::clone(&destination));
        (store, provider, destination)
    }

    #[tokio::test]
    async fn dry_run_reports_but_never_writes() {
        let desired = tree(&[("foo", json!("2")), ("bar", json!("3"))]);
        let observed = tree(&[("foo", json!("1"))]);
        let (store, provider, destination) = seeded(desired, observed.clone()).await;

        let mut opts = options();
        opts.dry_run = true;
        let executor = SyncExecutor::new(store, provider, opts, CancellationToken::new());
        let results = executor.run(vec![target("T", "111111111111")]).await;

        let (result, diff) = &results[0];
        assert!(result.success);
        let diff = diff.as_ref().expect("dry run retains diff");
        assert_eq!(diff.counts(), (1, 0, 1, 0));
        assert_eq!(destination.snapshot(), observed);
        assert_eq!(destination.put_count(), 0);
    }

    #[tokio::test]
    async fn apply_creates_and_updates() {
        let desired = tree(&[("foo", json!("2")), ("bar", json!("3"))]);
        let observed = tree(&[("foo", json!("1"))]);
        let (store, provider, destination) = seeded(desired.clone(), observed).await;

        let executor = SyncExecutor::new(store, provider, options(), CancellationToken::new());
        let results = executor.run(vec![target("T", "111111111111")]).await;

        assert!(results[0].0.success);
        assert_eq!(destination.snapshot(), desired);
        assert_eq!(destination.put_count(), 2);
        assert_eq!(destination.delete_count(), 0);
    }

    #[tokio::test]
    async fn orphans_survive_unless_deletion_is_enabled() {
        let desired = tree(&[("a", json!(1)), ("b", json!(2))]);
        let observed = tree(&[("a", json!(1)), ("b", json!(2)), ("c", json!(3))]);

        // delete_orphans = false: reported, not removed.
        let (store, provider, destination) = seeded(desired.clone(), observed.clone()).await;
        let executor = SyncExecutor::new(store, provider, options(), CancellationToken::new());
        let results = executor.run(vec![target("T", "111111111111")]).await;
        let diff = results[0].1.as_ref().unwrap();
        assert_eq!(diff.removed.len(), 1);
        assert!(destination
            .snapshot()
            .contains_key(&SecretPath::parse("c").unwrap()));

        // delete_orphans = true: removed.
        let (store, provider, destination) = seeded(desired, observed).await;
        let mut opts = options();
        opts.delete_orphans = true;
        let executor = SyncExecutor::new(store, provider, opts, CancellationToken::new());
        executor.run(vec![target("T", "111111111111")]).await;
        assert!(!destination
            .snapshot()
            .contains_key(&SecretPath::parse("c").unwrap()));
        assert_eq!(destination.delete_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_destination_fails_only_its_target() {
        let store = Arc::new(MemoryMergeStore::new());
        store.put_tree("T1", &tree(&[("k", json!(1))])).await.unwrap();
        store.put_tree("T2", &tree(&[("k", json!(1))])).await.unwrap();

        let provider = Arc::new(MemoryDestinationProvider::new());
        provider.mark_unreachable("111111111111");

        let executor = SyncExecutor::new(
            store,
            provider,
            options(),
            CancellationToken::new(),
        );
        let results = executor
            .run(vec![
                target("T1", "111111111111"),
                target("T2", "222222222222"),
            ])
            .await;

        let t1 = results.iter().find(|(r, _)| r.target == "T1").unwrap();
        let t2 = results.iter().find(|(r, _)| r.target == "T2").unwrap();
        assert!(!t1.0.success);
        assert!(t2.0.success);
    }

    #[tokio::test]
    async fn missing_merge_entry_is_fatal_for_the_target() {
        let store = Arc::new(MemoryMergeStore::new());
        let provider = Arc::new(MemoryDestinationProvider::new());
        let executor = SyncExecutor::new(store, provider, options(), CancellationToken::new());
        let results = executor.run(vec![target("T", "111111111111")]).await;
        assert!(!results[0].0.success);
    }
}
