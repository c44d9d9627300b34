//! The SecretSync engine.
//!
//! Aggregates secret trees from upstream sources into one merged tree per
//! target, then projects the merged trees into downstream destinations. The
//! engine only ever talks to drivers through the traits in
//! [`secretsync_spec`]; concrete stores live in the provider crates.

pub mod autodetect;
pub mod cancel;
pub mod config;
pub mod diff;
pub mod discovery;
pub mod format;
pub mod graph;
pub mod memory;
pub mod merge;
pub mod pipeline;
pub mod plan;
pub mod report;
pub mod sync;

pub use cancel::CancellationToken;
pub use config::Config;
pub use diff::Diff;
pub use format::OutputFormat;
pub use graph::TargetGraph;
pub use pipeline::{Operation, Options, Pipeline, RunState};
pub use report::{RunReport, TargetResult};
