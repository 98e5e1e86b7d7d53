// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bookkeeping for long-running dispatcher tasks.
//!
//! Every migration runs as its own tokio task registered here under the VM
//! it serves, so that other requests can find it ("is anything migrating
//! this VM?"), cancel it, or wait for it to finish.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use slog::{info, warn, Logger};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::migrate::MigrateError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum TaskKind {
    MigrateSource,
    CloneSource,
    MigrateTarget,
}

impl TaskKind {
    pub const ALL_MIGRATIONS: &'static [TaskKind] = &[
        TaskKind::MigrateSource,
        TaskKind::CloneSource,
        TaskKind::MigrateTarget,
    ];
}

type Outcome = Option<Result<(), MigrateError>>;

/// A view of one registered task.
#[derive(Clone)]
pub struct TaskHandle {
    pub id: Uuid,
    pub vm_uuid: Uuid,
    pub kind: TaskKind,
    cancel: CancellationToken,
    done: watch::Receiver<Outcome>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the task to finish and returns its result.
    pub async fn wait(&mut self) -> Result<(), MigrateError> {
        loop {
            if let Some(res) = self.done.borrow_and_update().clone() {
                return res;
            }
            if self.done.changed().await.is_err() {
                // The task went away without reporting, i.e. it panicked.
                return self
                    .done
                    .borrow()
                    .clone()
                    .unwrap_or(Err(MigrateError::Cancelled));
            }
        }
    }
}

pub struct TaskManager {
    log: Logger,
    tasks: Mutex<HashMap<Uuid, TaskHandle>>,
}

impl TaskManager {
    pub fn new(log: &Logger) -> Arc<Self> {
        Arc::new(TaskManager {
            log: log.new(slog::o!("component" => "tasks")),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, TaskHandle>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts `make(token)` as a task serving `vm_uuid`, unless a task of one
    /// of the `conflicts` kinds already serves it, in which case the kind of
    /// that task is returned.
    pub fn try_spawn<F, Fut>(
        self: &Arc<Self>,
        kind: TaskKind,
        vm_uuid: Uuid,
        conflicts: &[TaskKind],
        make: F,
    ) -> Result<TaskHandle, TaskKind>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), MigrateError>> + Send + 'static,
    {
        let mut tasks = self.lock();
        if let Some(existing) = tasks
            .values()
            .find(|t| t.vm_uuid == vm_uuid && conflicts.contains(&t.kind))
        {
            return Err(existing.kind);
        }

        Ok(self.start(tasks, kind, vm_uuid, make))
    }

    /// Starts a task without checking for conflicts.
    pub fn spawn<F, Fut>(
        self: &Arc<Self>,
        kind: TaskKind,
        vm_uuid: Uuid,
        make: F,
    ) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), MigrateError>> + Send + 'static,
    {
        let tasks = self.lock();
        self.start(tasks, kind, vm_uuid, make)
    }

    fn start<F, Fut>(
        self: &Arc<Self>,
        mut tasks: MutexGuard<'_, HashMap<Uuid, TaskHandle>>,
        kind: TaskKind,
        vm_uuid: Uuid,
        make: F,
    ) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), MigrateError>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let handle = TaskHandle {
            id,
            vm_uuid,
            kind,
            cancel: cancel.clone(),
            done: done_rx,
        };
        tasks.insert(id, handle.clone());
        drop(tasks);

        let fut = make(cancel);
        let manager = self.clone();
        info!(self.log, "task started";
              "task_id" => %id, "kind" => %kind, "vm_uuid" => %vm_uuid);
        tokio::spawn(async move {
            let res = fut.await;
            match &res {
                Ok(()) => info!(manager.log, "task finished";
                                "task_id" => %id, "kind" => %kind),
                Err(e) => warn!(manager.log, "task failed";
                                "task_id" => %id,
                                "kind" => %kind,
                                "error" => %e),
            }
            manager.lock().remove(&id);
            let _ = done_tx.send(Some(res));
        });
        handle
    }

    /// The single active task serving `vm_uuid` among `kinds`.
    pub fn find(
        &self,
        vm_uuid: Uuid,
        kinds: &[TaskKind],
    ) -> Option<TaskHandle> {
        self.lock()
            .values()
            .find(|t| t.vm_uuid == vm_uuid && kinds.contains(&t.kind))
            .cloned()
    }

    /// Asks the matching task, if any, to stop. Returns whether one was found.
    pub fn cancel(&self, vm_uuid: Uuid, kinds: &[TaskKind]) -> bool {
        match self.find(vm_uuid, kinds) {
            Some(task) => {
                info!(self.log, "cancelling task";
                      "task_id" => %task.id, "kind" => %task.kind);
                task.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for task in self.lock().values() {
            task.cancel();
        }
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<TaskManager> {
        TaskManager::new(&Logger::root(slog::Discard, slog::o!()))
    }

    #[tokio::test]
    async fn finished_tasks_report_and_unregister() {
        let tasks = manager();
        let vm = Uuid::new_v4();
        let mut handle =
            tasks.spawn(TaskKind::MigrateSource, vm, |_| async { Ok(()) });
        assert_eq!(handle.wait().await, Ok(()));
        // Removal happens before the outcome is published.
        assert!(tasks.find(vm, TaskKind::ALL_MIGRATIONS).is_none());
        assert_eq!(tasks.active(), 0);
    }

    #[tokio::test]
    async fn conflicting_kind_is_rejected() {
        let tasks = manager();
        let vm = Uuid::new_v4();
        let mut first = tasks.spawn(TaskKind::MigrateTarget, vm, |token| {
            async move {
                token.cancelled().await;
                Err(MigrateError::Cancelled)
            }
        });
        let second = tasks.try_spawn(
            TaskKind::MigrateTarget,
            vm,
            &[TaskKind::MigrateTarget],
            |_| async { Ok(()) },
        );
        assert_eq!(second.err(), Some(TaskKind::MigrateTarget));

        // A different VM is unaffected.
        let mut other = tasks
            .try_spawn(
                TaskKind::MigrateTarget,
                Uuid::new_v4(),
                &[TaskKind::MigrateTarget],
                |_| async { Ok(()) },
            )
            .unwrap();
        assert_eq!(other.wait().await, Ok(()));

        assert!(tasks.cancel(vm, &[TaskKind::MigrateTarget]));
        assert_eq!(first.wait().await, Err(MigrateError::Cancelled));
        assert!(!tasks.cancel(vm, &[TaskKind::MigrateTarget]));
    }
}
