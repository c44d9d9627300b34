//! The merge phase: fold each target's imports into a merged tree and write
//! it to the merge store.

use crate::cancel::CancellationToken;
use crate::plan::{MergePlan, PlanInput};
use crate::report::TargetResult;
use secretsync_spec::{
    merge_tree, DriverError, Error, MergeStore, Phase, Result, SecretSource, SecretTree,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

type SourceMap = BTreeMap<String, Arc<dyn SecretSource>>;

/// Executes merge plans over a DAG scheduler.
///
/// A target is admitted once every target-import it declares has completed,
/// bounded by a global parallelism pool. Edges enforce ordering; the pool is
/// otherwise flat.
pub struct MergeExecutor {
    sources: Arc<SourceMap>,
    store: Arc<dyn MergeStore>,
    parallelism: usize,
    cancel: CancellationToken,
}

impl MergeExecutor {
    pub fn new(
        sources: Arc<SourceMap>,
        store: Arc<dyn MergeStore>,
        parallelism: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sources,
            store,
            parallelism: parallelism.max(1),
            cancel,
        }
    }

    /// Run every plan, respecting `order` (topological). Returns one result
    /// per target, in completion order.
    pub async fn run(
        &self,
        order: &[String],
        plans: &BTreeMap<String, MergePlan>,
    ) -> Vec<TargetResult> {
        let run_set: HashSet<&str> = order.iter().map(String::as_str).collect();

        // Dependency bookkeeping, restricted to targets in this run.
        let mut waiting_on: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in order {
            let plan = &plans[name.as_str()];
            let deps: Vec<&str> = plan
                .target_imports()
                .filter(|import| run_set.contains(import))
                .collect();
            waiting_on.insert(name.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(name.as_str());
            }
        }

        let mut ready: VecDeque<&str> = order
            .iter()
            .map(String::as_str)
            .filter(|name| waiting_on[name] == 0)
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks: JoinSet<TargetResult> = JoinSet::new();
        let mut results = Vec::with_capacity(order.len());

        loop {
            while let Some(name) = ready.pop_front() {
                if self.cancel.is_cancelled() {
                    debug!(target = %name, "cancellation requested, not admitting target");
                    results.push(TargetResult::failed(
                        Phase::Merge,
                        name,
                        std::time::Duration::ZERO,
                        vec![Error::Cancelled],
                    ));
                    self.release_dependents(name, &mut waiting_on, &dependents, &mut ready);
                    continue;
                }

                let plan = plans[name].clone();
                let sources = Arc::clone(&self.sources);
                let store = Arc::clone(&self.store);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                    let started = Instant::now();
                    match execute_plan(&plan, &sources, store.as_ref()).await {
                        Ok(tree) => {
                            info!(
                                target = %plan.target,
                                secrets = tree.len(),
                                "merged target written to merge store"
                            );
                            TargetResult::ok(Phase::Merge, &plan.target, started.elapsed())
                        }
                        Err(err) => TargetResult::failed(
                            Phase::Merge,
                            &plan.target,
                            started.elapsed(),
                            vec![err],
                        ),
                    }
                });
            }

            match tasks.join_next().await {
                Some(joined) => {
                    let result = joined.unwrap_or_else(|err| {
                        TargetResult::failed(
                            Phase::Merge,
                            "<join>",
                            std::time::Duration::ZERO,
                            vec![Error::Internal(format!("merge task panicked: {err}"))],
                        )
                    });
                    let name = result.target.clone();
                    results.push(result);
                    self.release_dependents(&name, &mut waiting_on, &dependents, &mut ready);
                }
                None => break,
            }
        }

        results
    }

    fn release_dependents<'a>(
        &self,
        completed: &str,
        waiting_on: &mut HashMap<&'a str, usize>,
        dependents: &HashMap<&'a str, Vec<&'a str>>,
        ready: &mut VecDeque<&'a str>,
    ) {
        for &dependent in dependents.get(completed).into_iter().flatten() {
            let remaining = waiting_on.get_mut(dependent).expect("known target");
            *remaining -= 1;
            if *remaining == 0 {
                ready.push_back(dependent);
            }
        }
    }
}

/// Resolve each input in declaration order, fold, and write the result.
async fn execute_plan(
    plan: &MergePlan,
    sources: &SourceMap,
    store: &dyn MergeStore,
) -> Result<SecretTree> {
    let mut tree = SecretTree::new();

    for input in &plan.inputs {
        let resolved = match input {
            PlanInput::MergedTarget(parent) => match store.get_tree(parent).await? {
                Some(parent_tree) => parent_tree,
                // A failed parent merge can still leave a prior run's entry
                // behind; only a missing entry is fatal here.
                None => {
                    return Err(Error::Driver(DriverError::not_found(
                        "merge_store.get_tree",
                        format!("no merged entry for target `{parent}`"),
                    )))
                }
            },
            PlanInput::Source(name) => {
                let source = sources.get(name).ok_or_else(|| {
                    Error::Internal(format!("plan references unwired source `{name}`"))
                })?;
                source.read_tree().await?
            }
            PlanInput::Unknown(name) => {
                warn!(
                    target = %plan.target,
                    import = %name,
                    "unknown import, treating as empty tree"
                );
                SecretTree::new()
            }
        };
        tree = merge_tree(tree, resolved);
    }

    store
        .put_tree(&plan.target, &tree)
        .await
        .map_err(|err| Error::MergeStoreWrite {
            key: plan.target.clone(),
            source: err,
        })?;
    Ok(tree)
}
