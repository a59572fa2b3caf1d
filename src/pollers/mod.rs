//! The concrete poller variants.
//!
//! Both are thin [`crate::workflow::Workflow`] implementations over the same
//! engine: the diagnostics poller collects, transfers, and awaits remote
//! analysis of a support archive; the metrics poller fetches an overview and
//! fans out per-item statistic fetches. Everything resilient about them
//! (scheduling, retry budgets, checkpointing, cancellation) lives in the
//! engine, not here.

mod diagnostics;
mod metrics;

pub use diagnostics::DiagnosticsWorkflow;
pub use metrics::MetricsWorkflow;
