//! Dispatcher worker: sleeps until the earliest due timer, claims it,
//! dispatches the action, reschedules or deletes the row.
//!
//! One singleton worker per process node. The worker owns all of its state;
//! the rest of the system talks to it only through its mailbox, so arming
//! and re-arming never race. Dispatched actions run on independent tasks and
//! never touch worker state.

use crate::config::Config;
use crate::registry::Executor;
use crate::store::TimerStore;
use crate::timer::{Timer, expiry};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Sleeps are re-checked at least this often; an elapsed clamp simply
/// triggers another refresh.
const MAX_SLEEP: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Messages accepted by the worker.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    /// A row with this `expires_at` was just inserted somewhere in the
    /// cluster.
    SetNextExpiry(DateTime<Utc>),
    /// Re-consult the store for the earliest claimable row.
    Refresh,
    /// Stop the worker loop.
    Shutdown,
}

/// Handle to a spawned worker task.
pub struct WorkerHandle {
    mailbox: mpsc::Sender<WorkerMessage>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Sender half of the worker's inbox, e.g. for registering this worker
    /// as a peer in a [`MailboxTransport`](crate::cluster::MailboxTransport).
    pub fn mailbox(&self) -> mpsc::Sender<WorkerMessage> {
        self.mailbox.clone()
    }

    pub async fn set_next_expiry(&self, at: DateTime<Utc>) {
        let _ = self.mailbox.send(WorkerMessage::SetNextExpiry(at)).await;
    }

    pub async fn refresh(&self) {
        let _ = self.mailbox.send(WorkerMessage::Refresh).await;
    }

    /// Stop the worker and wait for its loop to end. In-flight dispatched
    /// actions keep running on their own tasks.
    pub async fn shutdown(self) {
        let _ = self.mailbox.send(WorkerMessage::Shutdown).await;
        let _ = self.join.await;
    }
}

pub struct Worker {
    store: TimerStore,
    executor: Arc<dyn Executor>,
    orphan_reclaim_window: chrono::Duration,
    execution_threshold: chrono::Duration,
    inbox: mpsc::Receiver<WorkerMessage>,
    /// The instant the current sleep is set to fire at; `None` when idle.
    armed_for: Option<DateTime<Utc>>,
}

impl Worker {
    /// Spawn the node's worker. It performs an initial refresh, which is how
    /// rows whose expiry passed while the process was down get picked up.
    pub fn spawn(store: TimerStore, executor: Arc<dyn Executor>, config: &Config) -> WorkerHandle {
        let (mailbox, inbox) = mpsc::channel(64);
        let mut worker = Worker {
            store,
            executor,
            orphan_reclaim_window: chrono::Duration::from_std(config.orphan_reclaim_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
            execution_threshold: chrono::Duration::from_std(config.execution_threshold)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(150)),
            inbox,
            armed_for: None,
        };
        let join = tokio::spawn(async move { worker.run().await });
        WorkerHandle { mailbox, join }
    }

    async fn run(&mut self) {
        self.refresh().await;
        loop {
            let deadline = self.sleep_deadline();
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(WorkerMessage::SetNextExpiry(at)) => self.consider(at).await,
                    Some(WorkerMessage::Refresh) => self.refresh().await,
                    Some(WorkerMessage::Shutdown) | None => break,
                },
                _ = sleep_until_armed(deadline) => self.fire().await,
            }
        }
        tracing::debug!("dispatcher worker stopped");
    }

    fn sleep_deadline(&self) -> Option<Instant> {
        let armed_for = self.armed_for?;
        let gap = (armed_for - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        Some(Instant::now() + gap.min(MAX_SLEEP))
    }

    /// A create hint. Only an earlier instant than the armed sleep is worth
    /// acting on; peers freely send hints for later rows.
    async fn consider(&mut self, at: DateTime<Utc>) {
        if let Some(armed_for) = self.armed_for
            && at >= armed_for
        {
            return;
        }
        self.arm_or_fire(at).await;
    }

    async fn arm_or_fire(&mut self, at: DateTime<Utc>) {
        if at - Utc::now() <= self.execution_threshold {
            self.fire().await;
        } else {
            self.armed_for = Some(at);
            tracing::debug!(armed_for = %at, "worker armed");
        }
    }

    /// Drop the armed sleep and re-derive it from the store.
    async fn refresh(&mut self) {
        self.armed_for = None;
        let now = Utc::now();
        match self
            .store
            .earliest_expiry(now - self.orphan_reclaim_window)
            .await
        {
            Ok(Some(at)) => self.arm_or_fire(at).await,
            Ok(None) => tracing::debug!("no pending timers, going idle"),
            Err(error) => tracing::error!(%error, "failed to query earliest timer expiry"),
        }
    }

    /// The claim-and-dispatch loop: claim everything due (the cutoff extends
    /// one execution threshold into the future), then re-arm for whatever
    /// comes next.
    async fn fire(&mut self) {
        self.armed_for = None;
        loop {
            let mut claim_failed = false;
            loop {
                let now = Utc::now();
                let claimed = self
                    .store
                    .claim_next(
                        now + self.execution_threshold,
                        now - self.orphan_reclaim_window,
                        now,
                    )
                    .await;
                match claimed {
                    Ok(Some(timer)) => self.dispatch_and_reschedule(timer, now).await,
                    Ok(None) => break,
                    Err(error) => {
                        tracing::error!(%error, "claim transaction failed");
                        claim_failed = true;
                        break;
                    }
                }
            }

            let now = Utc::now();
            match self
                .store
                .earliest_expiry(now - self.orphan_reclaim_window)
                .await
            {
                Ok(Some(at)) if !claim_failed && at - now <= self.execution_threshold => continue,
                Ok(Some(at)) => {
                    // After a claim failure, hold off one threshold before
                    // retrying instead of spinning on a struggling store.
                    let at = if claim_failed {
                        at.max(now + self.execution_threshold)
                    } else {
                        at
                    };
                    self.armed_for = Some(at);
                    tracing::debug!(armed_for = %at, "worker armed");
                    return;
                }
                Ok(None) => {
                    tracing::debug!("no pending timers, going idle");
                    return;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to query earliest timer expiry");
                    return;
                }
            }
        }
    }

    async fn dispatch_and_reschedule(&mut self, timer: Timer, now: DateTime<Utc>) {
        tracing::debug!(
            timer_id = %timer.id,
            module = %timer.module,
            function = %timer.function,
            calls = timer.calls,
            "dispatching timer"
        );
        self.executor.dispatch(&timer);

        let calls = timer.calls + 1;
        let reached_cap = timer.max_calls.is_some_and(|max| calls >= max);
        if reached_cap || !timer.is_recurring() {
            if let Err(error) = self.store.delete_by_id(timer.id).await {
                tracing::error!(timer_id = %timer.id, %error, "failed to delete exhausted timer");
            }
            return;
        }

        let mut fired = timer.clone();
        fired.calls = calls;
        // Stay strictly after the occurrence that just fired, even when the
        // execution threshold claimed it slightly early.
        let reference = timer.expires_at.map_or(now, |at| now.max(at));
        let next = match expiry::next_expiry(&fired, reference) {
            Ok(next) => next,
            Err(error) => {
                // The row keeps its lease; the orphan window surfaces it again.
                tracing::error!(timer_id = %timer.id, %error, "failed to compute next expiry");
                return;
            }
        };

        match self.store.reschedule(timer.id, next, calls, Utc::now()).await {
            Ok(1) => {}
            Ok(0) => {
                tracing::debug!(timer_id = %timer.id, "timer removed mid-dispatch, skipping reschedule")
            }
            Ok(affected) => {
                tracing::error!(timer_id = %timer.id, affected, "timer reschedule touched an unexpected row count")
            }
            Err(error) => tracing::error!(timer_id = %timer.id, %error, "failed to reschedule timer"),
        }
    }
}

/// Idle workers park until a hint arrives.
async fn sleep_until_armed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
