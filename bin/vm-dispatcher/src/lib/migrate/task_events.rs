// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event loop a migration task waits on.
//!
//! Incoming packages, armed timers and local cancellation are merged into a
//! single stream of [`TaskEvent`]s so a task can express "wait for Start,
//! but give up after ten minutes or when cancelled" as one `next()` call.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use slog::{debug, Logger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{Message, Package};
use super::commands::Response;
use super::conn::{Connection, Inbound};
use super::{MigrateError, MigrateRole};

/// Named deadlines a task can arm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Timer {
    /// The target's wait for Start after it answered the precondition check.
    StartWait,
    /// Any other bounded protocol wait.
    Response,
}

#[derive(Debug)]
pub(crate) enum TaskEvent {
    Package(Package),
    TimerFired(Timer),
    /// The local operator or dispatcher shutdown asked the task to stop.
    CancelRequested,
    Disconnected,
}

pub(crate) struct TaskEvents {
    log: Logger,
    inbound: Inbound,
    cancel: CancellationToken,
    timer_tx: mpsc::UnboundedSender<Timer>,
    timer_rx: mpsc::UnboundedReceiver<Timer>,
    timers: HashMap<Timer, JoinHandle<()>>,
}

impl TaskEvents {
    pub(crate) fn new(
        log: Logger,
        inbound: Inbound,
        cancel: CancellationToken,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        TaskEvents {
            log,
            inbound,
            cancel,
            timer_tx,
            timer_rx,
            timers: HashMap::new(),
        }
    }

    /// Schedules `timer` to fire after `after`, replacing any pending firing
    /// of the same timer.
    pub(crate) fn arm(&mut self, timer: Timer, after: Duration) {
        let tx = self.timer_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(timer);
        });
        if let Some(old) = self.timers.insert(timer, handle) {
            old.abort();
        }
        debug!(self.log, "armed timer"; "timer" => ?timer, "after" => ?after);
    }

    pub(crate) fn disarm(&mut self, timer: Timer) {
        if let Some(handle) = self.timers.remove(&timer) {
            handle.abort();
        }
    }

    pub(crate) fn inbound(&mut self) -> &mut Inbound {
        &mut self.inbound
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Waits for whichever event comes first. Cancellation wins ties.
    pub(crate) async fn next(&mut self) -> TaskEvent {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    return TaskEvent::CancelRequested;
                }

                res = self.inbound.recv() => {
                    return match res {
                        Ok(p) => TaskEvent::Package(p),
                        Err(_) => TaskEvent::Disconnected,
                    };
                }

                Some(timer) = self.timer_rx.recv() => {
                    // Ignore firings of timers disarmed after they sent.
                    if self.timers.remove(&timer).is_some() {
                        return TaskEvent::TimerFired(timer);
                    }
                }
            }
        }
    }

    /// Sends `message` as a request and waits for the peer's answer.
    ///
    /// The wait also ends when the task is cancelled or the peer sends a
    /// package of its own, which at this point can only be a cancellation or
    /// an error report. An error Response is returned as a remote error.
    pub(crate) async fn request(
        &mut self,
        conn: &Connection,
        peer: MigrateRole,
        message: Message,
        timeout: Duration,
    ) -> Result<Package, MigrateError> {
        let mut job = conn.send_request(message);
        cancellable(&self.cancel, conn.wait_for_send(&mut job, timeout))
            .await?;
        let inbound = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
            res = self.inbound.recv() => res,
            res = conn.wait_for_response(&mut job, timeout) => {
                return answer(peer, res?);
            }
        };
        match inbound {
            Ok(package) => Err(unsolicited(peer, package)),
            // The answer may have been routed just ahead of the close.
            Err(_) => {
                let package = conn.wait_for_response(&mut job, timeout).await?;
                answer(peer, package)
            }
        }
    }
}

fn answer(
    peer: MigrateRole,
    package: Package,
) -> Result<Package, MigrateError> {
    match package.message {
        Message::Response(Response::Error { code, message, .. }) => {
            Err(MigrateError::RemoteError(peer, code, message))
        }
        _ => Ok(package),
    }
}

impl Drop for TaskEvents {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

/// Interprets a package the peer sent outside of a reply.
pub(crate) fn unsolicited(peer: MigrateRole, package: Package) -> MigrateError {
    match package.message {
        Message::Cancel(_) | Message::CopyCancel => MigrateError::Cancelled,
        Message::Response(Response::Error { code, message, .. }) => {
            MigrateError::RemoteError(peer, code, message)
        }
        Message::CopyError(failure) => {
            MigrateError::RemoteError(peer, failure.code, failure.message)
        }
        other => MigrateError::UnexpectedMessage(format!("{:?}", other.kind())),
    }
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, MigrateError>
where
    F: Future<Output = Result<T, MigrateError>>,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(MigrateError::Cancelled),
        res = fut => res,
    }
}
