//! The two-phase pipeline orchestrator: expand, validate, merge, sync,
//! aggregate.

use crate::cancel::CancellationToken;
use crate::config::{Config, TargetConfig};
use crate::discovery;
use crate::graph::TargetGraph;
use crate::merge::MergeExecutor;
use crate::plan::MergePlan;
use crate::report::{RunReport, TargetResult};
use crate::sync::{SyncExecutor, SyncOptions};
use secretsync_spec::{
    AccountRegistry, DestinationProvider, Error, MergeStore, Phase, Result, SecretSource,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Which phases to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    Pipeline,
    MergeOnly,
    SyncOnly,
}

/// Per-run options, typically derived from CLI flags.
#[derive(Debug, Clone)]
pub struct Options {
    pub operation: Operation,
    /// Restrict the run to these targets (plus the targets they import).
    /// Empty means all.
    pub targets: Vec<String>,
    pub dry_run: bool,
    pub continue_on_error: bool,
    /// Retain diffs even when applying changes.
    pub compute_diff: bool,
    /// Expand dynamic targets before building the graph.
    pub discover: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            operation: Operation::Pipeline,
            targets: Vec::new(),
            dry_run: false,
            continue_on_error: true,
            compute_diff: false,
            discover: false,
        }
    }
}

/// Orchestrator state, visible for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Merging,
    Syncing,
    Done,
}

/// Owns the wired drivers and runs the merge and sync phases over them.
pub struct Pipeline {
    config: Config,
    sources: Arc<BTreeMap<String, Arc<dyn SecretSource>>>,
    merge_store: Arc<dyn MergeStore>,
    destinations: Arc<dyn DestinationProvider>,
    registry: Option<Arc<dyn AccountRegistry>>,
    cancel: CancellationToken,
    state: Mutex<RunState>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        merge_store: Arc<dyn MergeStore>,
        destinations: Arc<dyn DestinationProvider>,
    ) -> Self {
        Self {
            config,
            sources: Arc::new(BTreeMap::new()),
            merge_store,
            destinations,
            registry: None,
            cancel: CancellationToken::new(),
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Wire a named source driver.
    pub fn with_source(mut self, name: impl Into<String>, source: Arc<dyn SecretSource>) -> Self {
        Arc::make_mut(&mut self.sources).insert(name.into(), source);
        self
    }

    /// Wire an account registry for discovery and fuzzy account resolution.
    pub fn with_registry(mut self, registry: Arc<dyn AccountRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Cancellation handle shared with signal handlers and drivers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().expect("state lock") = state;
    }

    /// Run the selected phases and aggregate the results.
    ///
    /// Configuration problems and graph cycles fail the run before any phase
    /// starts; everything after that is isolated per target.
    pub async fn run(&self, options: Options) -> Result<RunReport> {
        self.config.validate()?;

        let mut targets = self.config.targets.clone();
        if options.discover {
            self.expand_and_resolve(&mut targets).await;
        }

        let graph = TargetGraph::build(&targets);
        graph.validate()?;

        let order = self.select_order(&graph, &options)?;
        info!(targets = order.len(), "pipeline starting");

        let mut report = RunReport::default();

        if options.operation != Operation::SyncOnly {
            self.set_state(RunState::Merging);
            let plans = self.build_plans(&order, &targets);
            let executor = MergeExecutor::new(
                Arc::clone(&self.sources),
                Arc::clone(&self.merge_store),
                self.config.pipeline.merge.parallel,
                self.cancel.clone(),
            );
            report.results.extend(executor.run(&order, &plans).await);
        }

        if options.operation != Operation::MergeOnly {
            self.set_state(RunState::Syncing);
            self.run_sync_phase(&order, &targets, &options, &mut report)
                .await;
        }

        self.set_state(RunState::Done);
        report.sort_results();
        info!(
            success = report.success(),
            changes = report.has_changes(),
            "pipeline finished"
        );
        Ok(report)
    }

    async fn expand_and_resolve(&self, targets: &mut BTreeMap<String, TargetConfig>) {
        let Some(registry) = &self.registry else {
            warn!("discovery requested but no account registry is wired");
            return;
        };

        let discovered = discovery::expand_dynamic_targets(&self.config, registry.as_ref()).await;
        discovery::merge_discovered_targets(targets, discovered);

        match registry.organization_accounts().await {
            Ok(accounts) => discovery::resolve_account_ids(targets, &accounts),
            Err(err) => warn!(error = %err, "account listing failed, fuzzy resolution skipped"),
        }
    }

    fn select_order(&self, graph: &TargetGraph, options: &Options) -> Result<Vec<String>> {
        let order = graph.topological_order();
        if options.targets.is_empty() {
            return Ok(order);
        }

        for name in &options.targets {
            if !graph.contains(name) {
                return Err(Error::ConfigInvalid(format!(
                    "selected target `{name}` does not exist"
                )));
            }
        }
        let wanted: BTreeSet<String> = graph.closure(&options.targets);
        Ok(order
            .into_iter()
            .filter(|name| wanted.contains(name))
            .collect())
    }

    fn build_plans(
        &self,
        order: &[String],
        targets: &BTreeMap<String, TargetConfig>,
    ) -> BTreeMap<String, MergePlan> {
        let target_names: BTreeSet<String> = targets.keys().cloned().collect();
        let source_names: BTreeSet<String> = self.sources.keys().cloned().collect();
        order
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    MergePlan::build(name, &targets[name].imports, &target_names, &source_names),
                )
            })
            .collect()
    }

    async fn run_sync_phase(
        &self,
        order: &[String],
        targets: &BTreeMap<String, TargetConfig>,
        options: &Options,
        report: &mut RunReport,
    ) {
        // Targets that cannot be resolved to an account fail here, in
        // isolation, instead of blocking the run.
        let mut resolved = Vec::new();
        for name in order {
            match self.config.resolve_target(name, &targets[name]) {
                Ok(target) => resolved.push(target),
                Err(err) => {
                    report.results.push(TargetResult::failed(
                        Phase::Sync,
                        name,
                        Duration::ZERO,
                        vec![err],
                    ));
                }
            }
        }

        let executor = SyncExecutor::new(
            Arc::clone(&self.merge_store),
            Arc::clone(&self.destinations),
            SyncOptions {
                parallelism: self.config.pipeline.sync.parallel,
                dry_run: options.dry_run,
                delete_orphans: self.config.pipeline.sync.delete_orphans,
                continue_on_error: options.continue_on_error,
                compute_diff: options.compute_diff || options.dry_run,
            },
            self.cancel.clone(),
        );

        for (result, diff) in executor.run(resolved).await {
            if let Some(diff) = diff {
                report.diffs.insert(result.target.clone(), diff);
            }
            report.results.push(result);
        }
    }
}
