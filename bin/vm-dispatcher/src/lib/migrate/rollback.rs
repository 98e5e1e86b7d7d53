// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An ordered record of completed forward steps.
//!
//! A migration task records each step as it completes. If the task fails
//! the steps are undone strictly in reverse order; if it succeeds the record
//! is committed and nothing is undone. Undo failures are logged and do not
//! stop the remaining steps from being undone.

use std::fmt::Debug;
use std::future::Future;

use slog::{debug, info, warn, Logger};

pub struct StepsLedger<S: Debug> {
    log: Logger,
    steps: Vec<S>,
}

impl<S: Debug> StepsLedger<S> {
    pub fn new(log: &Logger) -> Self {
        StepsLedger { log: log.clone(), steps: Vec::new() }
    }

    pub fn record(&mut self, step: S) {
        debug!(self.log, "step completed"; "step" => ?step);
        self.steps.push(step);
    }

    pub fn contains(&self, pred: impl Fn(&S) -> bool) -> bool {
        self.steps.iter().any(pred)
    }

    /// Drops steps that no longer need undoing.
    pub fn forget(&mut self, pred: impl Fn(&S) -> bool) {
        self.steps.retain(|s| !pred(s));
    }

    pub fn steps(&self) -> &[S] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The forward path completed; nothing will be undone.
    pub fn commit(mut self) {
        debug!(self.log, "committing steps"; "count" => self.steps.len());
        self.steps.clear();
    }

    /// Undoes every recorded step, newest first.
    pub async fn unwind<F, Fut>(mut self, mut undo: F)
    where
        F: FnMut(S) -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        info!(self.log, "rolling back"; "steps" => self.steps.len());
        while let Some(step) = self.steps.pop() {
            let desc = format!("{step:?}");
            if let Err(e) = undo(step).await {
                warn!(self.log, "failed to undo step";
                      "step" => desc, "error" => e);
            }
        }
    }
}

impl<S: Debug> Drop for StepsLedger<S> {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            warn!(self.log, "steps dropped without commit or rollback";
                  "steps" => ?self.steps);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        Lock,
        Probe,
        Dir,
        Catalog,
    }

    fn ledger() -> StepsLedger<Step> {
        StepsLedger::new(&Logger::root(slog::Discard, slog::o!()))
    }

    #[tokio::test]
    async fn unwinds_in_reverse_and_survives_failures() {
        let mut steps = ledger();
        for s in [Step::Lock, Step::Probe, Step::Dir, Step::Catalog] {
            steps.record(s);
        }
        steps.forget(|s| *s == Step::Probe);
        assert!(steps.contains(|s| *s == Step::Dir));

        let undone = Arc::new(Mutex::new(Vec::new()));
        let seen = undone.clone();
        steps
            .unwind(move |s| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(s);
                    if s == Step::Dir {
                        Err("busy".to_string())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert_eq!(
            *undone.lock().unwrap(),
            vec![Step::Catalog, Step::Dir, Step::Lock]
        );
    }

    #[test]
    fn commit_discards_steps() {
        let mut steps = ledger();
        steps.record(Step::Lock);
        assert!(!steps.is_empty());
        steps.commit();
    }
}
