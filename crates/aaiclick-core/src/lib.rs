//! Core of the aaiclick orchestration engine.
//!
//! Jobs are DAGs of tasks and groups built in memory with the `>>`/`<<`
//! operator DSL ([`dag`]), persisted atomically through an [`orch`] context,
//! claimed and executed by [`worker`] processes against a [`data`] context,
//! with data-artifact lifetimes tracked by [`lifecycle`] handlers and
//! reclaimed by the [`sweeper`].

pub mod dag;
pub mod data;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod orch;
pub mod params;
pub mod registry;
pub mod runner;
pub mod snowflake;
pub mod sweeper;
pub mod worker;

pub use dag::{Group, Node, Task, create_group, create_task};
pub use data::{ChClient, ChConfig, DataContext, Object, View, concat};
pub use error::{ClockMovedBackwards, EntrypointResolutionError, ParameterError, StaleObject};
pub use lifecycle::{DistributedLifecycle, LifecycleHandler, LocalLifecycle};
pub use orch::OrchContext;
pub use registry::{CallbackRegistry, Param, TaskContext};
pub use runner::run_job_test;
pub use snowflake::{get_snowflake_id, get_snowflake_ids, table_name};
pub use worker::{WorkerConfig, WorkerSummary, run_worker};
