// merge-steward library - conflict clustering and resolution for parallel worker branches
// This exposes the core components for testing and integration

pub mod budget;
pub mod checkpoint;
pub mod classify;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod escalation;
pub mod exec;
pub mod observability;
pub mod oracle;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod vcs;

#[cfg(test)]
pub mod testing;

// Re-export key types for easy access
pub use budget::{BudgetController, BreakerState, CircuitBreaker, Denial};
pub use checkpoint::{Checkpoint, CheckpointManager, Delivery, ProvenanceMap, RollbackRequest, SelectiveRevert};
pub use classify::{ConflictClassifier, Severity};
pub use cluster::{Cluster, ClusterBuilder, ClusterId, ClusterPlan};
pub use config::StewardConfig;
pub use coordinator::{Collaborators, Coordinator, CycleReport, RevertOutcome};
pub use escalation::{EscalationRecord, EscalationSink, HumanVerdict, OutboxEscalationSink};
pub use exec::{BuildExecutor, CommandBuildExecutor};
pub use observability::{pipeline_metrics, OperationTimer, PipelineMetrics};
pub use oracle::{CommandOracle, ReasoningOracle};
pub use pipeline::{Decision, Escalation, EscalationReason, Resolution, ResolutionPipeline};
pub use queue::{MergeQueue, QueueEntry, QueuePayload, QueueProcessor, QueueStatus};
pub use registry::{ChangeSet, ChangeSetId, ChangeSetRegistry, ChangeSetSource, GitBranchSource};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_cycle_span, create_resolution_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use vcs::{Git2Vcs, Revision, VersionControl};
