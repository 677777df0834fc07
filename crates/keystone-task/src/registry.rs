use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use keystone_data::{DataResult, ManagedRef, Transaction};
use keystone_types::{Identity, Oid};

use crate::error::{TaskError, TaskResult};

/// Body of a task kind: runs inside the task's transaction with the owning
/// identity and the oid of the task's data.
pub type TaskWorker = Arc<dyn Fn(&mut Transaction<'_>, &Identity, Oid) -> DataResult<()> + Send + Sync>;

/// A registered kind of durable task.
#[derive(Clone)]
pub struct TaskKind {
    name: String,
    data_serialization: String,
    worker: TaskWorker,
}

impl TaskKind {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialization used for this kind's data objects.
    pub fn data_serialization(&self) -> &str {
        &self.data_serialization
    }

    pub fn worker(&self) -> &TaskWorker {
        &self.worker
    }
}

impl std::fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskKind")
            .field("name", &self.name)
            .field("data_serialization", &self.data_serialization)
            .finish()
    }
}

/// Task kinds by name.
///
/// Recovery only has the kind name stored in each handle, so every kind that
/// may be pending on disk must be registered before tasks are restarted.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    kinds: HashMap<String, TaskKind>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an untyped worker.
    pub fn register_raw(&mut self, name: &str, data_serialization: &str, worker: TaskWorker) -> TaskResult<()> {
        if self.kinds.contains_key(name) {
            return Err(TaskError::DuplicateKind(name.to_string()));
        }
        self.kinds.insert(
            name.to_string(),
            TaskKind {
                name: name.to_string(),
                data_serialization: data_serialization.to_string(),
                worker,
            },
        );
        Ok(())
    }

    /// Register a worker whose data is a `T` stored with `data_serialization`.
    pub fn register<T, F>(&mut self, name: &str, data_serialization: &str, body: F) -> TaskResult<()>
    where
        T: Any + Send,
        F: Fn(&mut Transaction<'_>, &Identity, ManagedRef<T>) -> DataResult<()> + Send + Sync + 'static,
    {
        let serialization = data_serialization.to_string();
        let worker: TaskWorker = Arc::new(move |tx: &mut Transaction<'_>, identity: &Identity, data: Oid| {
            let data = tx.reference_to_oid_with::<T>(&serialization, data)?;
            body(tx, identity, data)
        });
        self.register_raw(name, data_serialization, worker)
    }

    pub fn get(&self, name: &str) -> TaskResult<&TaskKind> {
        self.kinds
            .get(name)
            .ok_or_else(|| TaskError::UnknownKind(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
