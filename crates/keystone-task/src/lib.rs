//! Durable tasks for Keystone.
//!
//! A durable task is scheduled inside a business transaction and commits
//! with it: the task's data, a [`DurableTaskHandle`] pointing at that data,
//! and a `pending-task.<oid>` binding naming the handle are written together.
//! Only after commit is the handle given to the in-memory [`TaskScheduler`].
//! When the process restarts, [`TaskService::restart_tasks`] walks the
//! pending-task bindings and resubmits every surviving handle, so each task
//! runs at least once.
//!
//! # Key Types
//!
//! - [`DurableTaskHandle`]: persisted description of one pending task
//! - [`TaskRegistry`]: task kinds by name: worker plus data serialization
//! - [`TaskQueue`]: in-memory scheduler ordered by target time
//! - [`TaskService`]: scheduling, execution, cancellation, recovery

pub mod error;
pub mod handle;
pub mod registry;
pub mod scheduler;
pub mod service;

pub use error::{TaskError, TaskResult};
pub use handle::{binding_name, DurableTaskHandle, HANDLE_SERIALIZATION, PENDING_TASK_PREFIX};
pub use registry::{TaskKind, TaskRegistry, TaskWorker};
pub use scheduler::{ScheduledTask, TaskQueue, TaskScheduler};
pub use service::{RecoveryReport, TaskRun, TaskService};
