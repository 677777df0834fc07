use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use keystone_data::{
    run_transaction, DataContext, DataError, DataResult, ManagedRef, SerializationRegistry, SideEffect, Transaction,
    TxOutcome,
};
use keystone_types::{Identity, Oid};
use tracing::{debug, info, warn};

use crate::error::{TaskError, TaskResult};
use crate::handle::{binding_name, DurableTaskHandle, HANDLE_SERIALIZATION, PENDING_TASK_PREFIX};
use crate::registry::TaskRegistry;
use crate::scheduler::{ScheduledTask, TaskQueue, TaskScheduler};

/// Result of one durable task execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskRun {
    /// The worker ran and the task was removed.
    Completed,
    /// The worker ran and the task was queued again for the given time.
    Rescheduled(DateTime<Utc>),
    /// The handle no longer exists; nothing ran.
    Missing,
    /// No worker is registered for the task's kind on this node. The task
    /// stays in storage for a restart that registers it.
    Unregistered,
}

/// Counts from [`TaskService::restart_tasks`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resubmitted: usize,
    pub removed: usize,
}

/// Schedules, runs and recovers durable tasks for one application.
pub struct TaskService {
    ctx: Arc<DataContext>,
    registry: Arc<TaskRegistry>,
    scheduler: Arc<dyn TaskScheduler>,
}

impl TaskService {
    pub fn new(ctx: Arc<DataContext>, registry: Arc<TaskRegistry>, scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            ctx,
            registry,
            scheduler,
        }
    }

    /// Register the handle serialization. Must run before the data context
    /// is built.
    pub fn register_serializations(registry: &mut SerializationRegistry) -> DataResult<()> {
        registry.register_type::<DurableTaskHandle>(HANDLE_SERIALIZATION)
    }

    pub fn context(&self) -> &Arc<DataContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Persist a task inside `tx`.
    ///
    /// The data object, the handle and the recovery binding are written with
    /// the rest of `tx`; the scheduler only sees the task if `tx` commits.
    pub fn schedule<T: Any + Send>(
        &self,
        tx: &mut Transaction<'_>,
        kind: &str,
        data: T,
        identity: &Identity,
        delay: Duration,
        period: Option<Duration>,
    ) -> TaskResult<ManagedRef<DurableTaskHandle>> {
        let kind = self.registry.get(kind)?;
        if let Some(period) = period {
            if period.is_zero() {
                return Err(TaskError::InvalidPeriod(period));
            }
            to_delta(period)?;
        }
        let target = Utc::now() + to_delta(delay)?;

        let data = tx.create_reference_with(kind.data_serialization(), data)?;
        let handle = tx.create_reference_with(
            HANDLE_SERIALIZATION,
            DurableTaskHandle {
                data: data.oid(),
                data_serialization: kind.data_serialization().to_string(),
                kind: kind.name().to_string(),
                binding: None,
                identity: identity.clone(),
                repeats: period.is_some(),
                period,
                target_execution_time: target,
            },
        )?;
        let binding = binding_name(handle.oid());
        tx.dereference_mut(handle)?.binding = Some(binding.clone());
        tx.set_binding(&binding, handle)?;
        tx.defer(SideEffect::SubmitTask {
            handle: handle.oid(),
            target,
        })?;

        debug!(app = tx.app(), handle = %handle.oid(), kind = kind.name(), %target, "scheduled durable task");
        Ok(handle)
    }

    /// Stop a periodic task. Its next execution removes it.
    pub fn cancel_periodic_task(&self, tx: &mut Transaction<'_>, handle: ManagedRef<DurableTaskHandle>) -> TaskResult<()> {
        tx.dereference_mut(handle)?.repeats = false;
        debug!(app = tx.app(), handle = %handle.oid(), "cancelled periodic task");
        Ok(())
    }

    /// Hand committed side effects to the scheduler.
    pub fn dispatch(&self, effects: Vec<SideEffect>) {
        for effect in effects {
            match effect {
                SideEffect::SubmitTask { handle, target } => {
                    self.scheduler.submit(ScheduledTask { target, handle });
                }
            }
        }
    }

    /// Run `body` transactionally and dispatch its side effects on commit.
    pub fn transact<T, F>(&self, body: F) -> TaskResult<T>
    where
        F: FnMut(&mut Transaction<'_>) -> DataResult<T>,
    {
        match run_transaction(&self.ctx, body) {
            TxOutcome::Committed { value, effects, .. } => {
                self.dispatch(effects);
                Ok(value)
            }
            TxOutcome::RetryableConflict { error, .. } | TxOutcome::Fatal(error) => Err(error.into()),
        }
    }

    /// Execute the task whose handle is stored at `handle`.
    ///
    /// On success the task is removed or, if periodic, re-persisted with its
    /// next target time and resubmitted. If the task's transaction fails for
    /// good, a follow-up transaction removes the task so it is not retried
    /// forever.
    pub fn run_task(&self, handle: Oid) -> TaskResult<TaskRun> {
        match run_transaction(&self.ctx, |tx| self.execute(tx, handle)) {
            TxOutcome::Committed { value, effects, .. } => {
                self.dispatch(effects);
                Ok(value)
            }
            TxOutcome::RetryableConflict { error, attempts } => {
                warn!(%handle, attempts, %error, "durable task kept conflicting");
                self.discard(handle);
                Err(TaskError::Exhausted {
                    handle,
                    attempts,
                    source: error,
                })
            }
            TxOutcome::Fatal(error) => {
                warn!(%handle, %error, "durable task failed");
                self.discard(handle);
                Err(error.into())
            }
        }
    }

    fn execute(&self, tx: &mut Transaction<'_>, handle_oid: Oid) -> DataResult<TaskRun> {
        let Some((handle_ref, handle)) = load_handle(tx, handle_oid)? else {
            debug!(handle = %handle_oid, "durable task handle is gone");
            return Ok(TaskRun::Missing);
        };
        let Ok(kind) = self.registry.get(&handle.kind) else {
            warn!(handle = %handle_oid, kind = %handle.kind, "no worker registered for durable task");
            return Ok(TaskRun::Unregistered);
        };

        (kind.worker())(tx, &handle.identity, handle.data)?;
        if let Some(reason) = tx.rollback_reason() {
            return Err(DataError::RollbackOnly(reason));
        }

        // Cancellation may have happened inside the worker.
        let current = tx.dereference(handle_ref)?.clone();
        match current.period {
            Some(period) if current.repeats => {
                let delta = TimeDelta::from_std(period).map_err(|e| DataError::Aborted(e.to_string()))?;
                let next = current.target_execution_time + delta;
                tx.dereference_mut(handle_ref)?.target_execution_time = next;
                tx.defer(SideEffect::SubmitTask {
                    handle: handle_oid,
                    target: next,
                })?;
                Ok(TaskRun::Rescheduled(next))
            }
            _ => {
                remove_task(tx, handle_ref, &current)?;
                Ok(TaskRun::Completed)
            }
        }
    }

    /// Remove a task whose execution failed for good.
    fn discard(&self, handle: Oid) {
        let outcome = run_transaction(&self.ctx, |tx| match load_handle(tx, handle)? {
            Some((handle_ref, current)) => remove_task(tx, handle_ref, &current),
            None => Ok(()),
        });
        match outcome.into_result() {
            Ok(()) => debug!(%handle, "removed failed durable task"),
            Err(e) => warn!(%handle, error = %e, "could not remove failed durable task"),
        }
    }

    /// Execute every task in `queue` that is due at `now`.
    ///
    /// Tasks resubmitted while draining wait for the next call. Returns the
    /// number of tasks run.
    pub fn run_due(&self, queue: &TaskQueue, now: DateTime<Utc>) -> usize {
        let budget = queue.len();
        let mut ran = 0;
        while ran < budget {
            let Some(task) = queue.pop_due(now) else {
                break;
            };
            if let Err(e) = self.run_task(task.handle) {
                warn!(handle = %task.handle, error = %e, "durable task did not complete");
            }
            ran += 1;
        }
        ran
    }

    /// Resubmit every pending task found in storage.
    ///
    /// Run once at startup, before serving requests. Bindings whose handle is
    /// missing are left over from an interrupted write and are removed.
    pub fn restart_tasks(&self) -> TaskResult<RecoveryReport> {
        let report = self.transact(|tx| {
            let mut report = RecoveryReport::default();
            let mut cursor = tx.next_binding(Some(PENDING_TASK_PREFIX))?;
            while let Some(name) = cursor {
                if !name.starts_with(PENDING_TASK_PREFIX) {
                    break;
                }
                let pending = match tx.get_binding_oid(&name)? {
                    Some(oid) => load_handle(tx, oid)?.map(|(_, handle)| (oid, handle.target_execution_time)),
                    None => None,
                };
                match pending {
                    Some((handle, target)) => {
                        tx.defer(SideEffect::SubmitTask { handle, target })?;
                        report.resubmitted += 1;
                    }
                    None => {
                        warn!(binding = %name, "removing binding of missing task handle");
                        tx.remove_binding(&name)?;
                        report.removed += 1;
                    }
                }
                cursor = tx.next_binding(Some(&name))?;
            }
            Ok(report)
        })?;
        info!(
            app = self.ctx.app(),
            resubmitted = report.resubmitted,
            removed = report.removed,
            "restarted durable tasks"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("app", &self.ctx.app())
            .field("kinds", &self.registry.len())
            .finish()
    }
}

fn to_delta(duration: Duration) -> TaskResult<TimeDelta> {
    TimeDelta::from_std(duration).map_err(|_| TaskError::InvalidPeriod(duration))
}

/// The handle at `oid`, or `None` if it no longer exists.
fn load_handle(
    tx: &mut Transaction<'_>,
    oid: Oid,
) -> DataResult<Option<(ManagedRef<DurableTaskHandle>, DurableTaskHandle)>> {
    let handle_ref = tx.reference_to_oid_with::<DurableTaskHandle>(HANDLE_SERIALIZATION, oid)?;
    match tx.dereference(handle_ref) {
        Ok(handle) => Ok(Some((handle_ref, handle.clone()))),
        Err(DataError::NotFound(_)) | Err(DataError::ObjectRemoved(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_task(
    tx: &mut Transaction<'_>,
    handle_ref: ManagedRef<DurableTaskHandle>,
    handle: &DurableTaskHandle,
) -> DataResult<()> {
    match tx.remove_with(&handle.data_serialization, handle.data) {
        Ok(()) | Err(DataError::UnknownSerialization(_)) => {}
        Err(e) => return Err(e),
    }
    tx.remove(handle_ref)?;
    if let Some(binding) = &handle.binding {
        match tx.remove_binding(binding) {
            Ok(()) | Err(DataError::BindingNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_data::DataConfig;
    use keystone_storage::InMemoryStorageEngine;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Spawn {
        monster: String,
    }

    struct Fixture {
        queue: Arc<TaskQueue>,
        service: TaskService,
        runs: Arc<AtomicUsize>,
    }

    fn data_context(engine: Arc<InMemoryStorageEngine>) -> Arc<DataContext> {
        let mut serializations = SerializationRegistry::new();
        TaskService::register_serializations(&mut serializations).unwrap();
        serializations.register_type::<Spawn>("spawn").unwrap();
        let config = DataConfig {
            max_attempts: 2,
            retry_backoff_ms: 0,
            ..DataConfig::default()
        };
        Arc::new(DataContext::open("maze", engine, Arc::new(serializations), config).unwrap())
    }

    fn fixture_on(engine: Arc<InMemoryStorageEngine>) -> Fixture {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut tasks = TaskRegistry::new();
        let counter = runs.clone();
        tasks
            .register::<Spawn, _>("spawn", "spawn", move |tx, identity, data| {
                assert_eq!(identity.name(), "ada");
                assert_eq!(tx.dereference(data)?.monster, "grue");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        tasks
            .register::<Spawn, _>("explode", "spawn", |_, _, _| Err(DataError::Aborted("boom".into())))
            .unwrap();

        let queue = Arc::new(TaskQueue::new());
        let service = TaskService::new(data_context(engine), Arc::new(tasks), queue.clone());
        Fixture { queue, service, runs }
    }

    fn fixture() -> Fixture {
        fixture_on(Arc::new(InMemoryStorageEngine::new()))
    }

    fn grue() -> Spawn {
        Spawn {
            monster: "grue".into(),
        }
    }

    fn schedule(f: &Fixture, kind: &str, period: Option<Duration>) -> Oid {
        f.service
            .transact(|tx| {
                f.service
                    .schedule(tx, kind, grue(), &Identity::new("ada"), Duration::ZERO, period)
                    .map(|r| r.oid())
                    .map_err(|e| match e {
                        TaskError::Data(e) => e,
                        other => DataError::Aborted(other.to_string()),
                    })
            })
            .unwrap()
    }

    fn binding_exists(f: &Fixture, name: &str) -> bool {
        f.service.transact(|tx| tx.binding_exists(name)).unwrap()
    }

    #[test]
    fn scheduling_persists_handle_and_binding() {
        let f = fixture();
        let handle = schedule(&f, "spawn", None);

        assert_eq!(f.queue.len(), 1);
        assert!(binding_exists(&f, &binding_name(handle)));

        let stored = f
            .service
            .transact(|tx| Ok(load_handle(tx, handle)?.map(|(_, h)| h)))
            .unwrap()
            .unwrap();
        assert_eq!(stored.kind, "spawn");
        assert_eq!(stored.binding, Some(binding_name(handle)));
        assert_eq!(stored.identity, Identity::new("ada"));
        assert!(!stored.repeats);
    }

    #[test]
    fn rolled_back_schedule_never_happened() {
        let f = fixture();
        let outcome: TxOutcome<()> = run_transaction(f.service.context(), |tx| {
            f.service
                .schedule(tx, "spawn", grue(), &Identity::new("ada"), Duration::ZERO, None)
                .map_err(|e| DataError::Aborted(e.to_string()))?;
            Err(DataError::Aborted("player left".into()))
        });
        assert!(!outcome.is_committed());
        assert!(f.queue.is_empty());
        let first = f.service.transact(|tx| tx.next_binding(None)).unwrap();
        assert_eq!(first, None);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let f = fixture();
        let mut tx = f.service.context().begin().unwrap();
        let err = f
            .service
            .schedule(&mut tx, "teleport", grue(), &Identity::system(), Duration::ZERO, None)
            .unwrap_err();
        assert!(matches!(err, TaskError::UnknownKind(_)));
    }

    #[test]
    fn one_shot_task_runs_and_is_removed() {
        let f = fixture();
        let handle = schedule(&f, "spawn", None);
        let task = f.queue.pop_due(Utc::now()).unwrap();
        assert_eq!(task.handle, handle);

        assert_eq!(f.service.run_task(handle).unwrap(), TaskRun::Completed);
        assert_eq!(f.runs.load(Ordering::SeqCst), 1);
        assert!(!binding_exists(&f, &binding_name(handle)));
        assert_eq!(f.service.run_task(handle).unwrap(), TaskRun::Missing);
        assert_eq!(f.runs.load(Ordering::SeqCst), 1);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn periodic_task_reschedules_until_cancelled() {
        let f = fixture();
        let period = Duration::from_secs(5);
        let handle = schedule(&f, "spawn", Some(period));
        let first = f.queue.pop_due(Utc::now()).unwrap();

        let run = f.service.run_task(handle).unwrap();
        let expected = first.target + TimeDelta::seconds(5);
        assert_eq!(run, TaskRun::Rescheduled(expected));
        assert_eq!(f.queue.next_target(), Some(expected));
        assert!(binding_exists(&f, &binding_name(handle)));

        f.service
            .transact(|tx| {
                let r = tx.reference_to_oid_with::<DurableTaskHandle>(HANDLE_SERIALIZATION, handle)?;
                f.service
                    .cancel_periodic_task(tx, r)
                    .map_err(|e| DataError::Aborted(e.to_string()))
            })
            .unwrap();

        assert_eq!(f.service.run_task(handle).unwrap(), TaskRun::Completed);
        assert_eq!(f.runs.load(Ordering::SeqCst), 2);
        assert!(!binding_exists(&f, &binding_name(handle)));
    }

    #[test]
    fn zero_period_is_rejected() {
        let f = fixture();
        let mut tx = f.service.context().begin().unwrap();
        let err = f
            .service
            .schedule(&mut tx, "spawn", grue(), &Identity::system(), Duration::ZERO, Some(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidPeriod(_)));
    }

    #[test]
    fn failed_task_is_cleaned_up() {
        let f = fixture();
        let handle = schedule(&f, "explode", None);
        assert!(f.service.run_task(handle).is_err());
        assert!(!binding_exists(&f, &binding_name(handle)));
        assert_eq!(f.service.run_task(handle).unwrap(), TaskRun::Missing);
    }

    #[test]
    fn unregistered_kind_keeps_the_task() {
        let engine = Arc::new(InMemoryStorageEngine::new());
        let f = fixture_on(engine.clone());
        let handle = schedule(&f, "spawn", None);
        let bare = TaskService::new(
            data_context(engine),
            Arc::new(TaskRegistry::new()),
            Arc::new(TaskQueue::new()),
        );

        assert_eq!(bare.run_task(handle).unwrap(), TaskRun::Unregistered);
        assert!(binding_exists(&f, &binding_name(handle)));
        assert_eq!(f.service.run_task(handle).unwrap(), TaskRun::Completed);
        assert_eq!(f.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_due_only_runs_due_tasks() {
        let f = fixture();
        schedule(&f, "spawn", None);
        schedule(&f, "spawn", None);
        let later = ScheduledTask {
            target: Utc::now() + TimeDelta::hours(1),
            handle: Oid::new(999_999),
        };
        f.queue.submit(later);

        assert_eq!(f.service.run_due(&f.queue, Utc::now()), 2);
        assert_eq!(f.runs.load(Ordering::SeqCst), 2);
        assert_eq!(f.queue.snapshot(), vec![later]);
    }

    #[test]
    fn restart_resubmits_valid_and_removes_stale() {
        let engine = Arc::new(InMemoryStorageEngine::new());
        let before = fixture_on(engine.clone());
        let handles: Vec<Oid> = (0..3).map(|_| schedule(&before, "spawn", None)).collect();
        before
            .service
            .transact(|tx| {
                tx.set_binding(&binding_name(Oid::new(70_000)), ManagedRef::<()>::from_oid(Oid::new(70_000)))?;
                tx.set_binding_to_oid(&binding_name(Oid::new(70_001)), Oid::new(70_001))?;
                tx.set_binding_to_oid("player.ada", Oid::new(1))
            })
            .unwrap();
        drop(before);

        let after = fixture_on(engine);
        let report = after.service.restart_tasks().unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                resubmitted: 3,
                removed: 2
            }
        );

        let mut queued: Vec<Oid> = after.queue.snapshot().into_iter().map(|t| t.handle).collect();
        queued.sort();
        assert_eq!(queued, handles);
        assert!(!binding_exists(&after, &binding_name(Oid::new(70_000))));
        assert!(binding_exists(&after, "player.ada"));

        assert_eq!(after.service.run_due(&after.queue, Utc::now()), 3);
        assert_eq!(after.runs.load(Ordering::SeqCst), 3);
    }
}
