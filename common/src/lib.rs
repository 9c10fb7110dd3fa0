pub mod analyzer;
pub mod error;
pub mod executor;
pub mod generation;
pub mod job;
pub mod mapreduce;
pub mod pipeline;
pub mod plan;
pub mod replication;
pub mod report;
pub mod results;
pub mod rollup;
pub mod scheduler;
pub mod stage;
pub mod table;
pub mod worker;

pub use analyzer::{Analyzer, ItemIndex};
pub use error::{BuildError, ConfigError, ExecutionError, StageError, StageFailure, TableError};
pub use executor::{execute_with_failover, LocalExecutor, RemoteExecutor, ShardExecutor};
pub use generation::{generations, Generation, TimeRange};
pub use job::{BuildReport, PassId, PassStatus};
pub use mapreduce::{MapReduceJob, Shard, ShardId, ShardResult, Task, TaskId, TaskKind};
pub use pipeline::{BuilderOptions, LoopOptions, ReportBuilder, StageProvider};
pub use plan::{PlanConfig, ReportPlan};
pub use replication::{PartitionKey, ReplicaRef, ReplicationScheme, SingleHostScheme, StaticReplicationScheme};
pub use results::ArtifactList;
pub use rollup::RollupGraph;
pub use scheduler::{Scheduler, ShardOutcome};
pub use stage::{Stage, StageContext, StageKind};
pub use worker::{run_shard_request, ErrorResponse, ShardRequest, ShardResponse, WorkerStatus};
