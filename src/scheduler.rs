//! Public facade: create, cancel, and query timers.
//!
//! Every successful create lands the row, then hints the local worker and
//! every cluster peer with the new `expires_at`; cancels broadcast a bare
//! refresh. The hints are purely advisory, the store is the authority.

use crate::cluster::{Fanout, HintTransport, WakeupHint};
use crate::config::Config;
use crate::error::Result;
use crate::registry::Executor;
use crate::store::TimerStore;
use crate::timer::{Callable, CreateOpts, Schedule, Timer, TimerSpec};
use crate::worker::{Worker, WorkerHandle};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub struct Scheduler {
    store: TimerStore,
    fanout: Fanout,
    worker: WorkerHandle,
}

impl Scheduler {
    /// Spawn this node's dispatcher worker and return the facade. The worker
    /// immediately refreshes, so timers left over from a previous run start
    /// firing without further ceremony.
    pub fn start(
        store: TimerStore,
        executor: Arc<dyn Executor>,
        config: Config,
        transport: Arc<dyn HintTransport>,
    ) -> Self {
        let worker = Worker::spawn(store.clone(), executor, &config);
        let fanout = Fanout::new(config.cluster_peers.clone(), transport);
        Self {
            store,
            fanout,
            worker,
        }
    }

    pub fn store(&self) -> &TimerStore {
        &self.store
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// One-shot timer firing `duration_ms` after insertion.
    pub async fn call_after(
        &self,
        callable: Callable,
        duration_ms: i64,
        opts: CreateOpts,
    ) -> Result<Timer> {
        let mut opts = opts;
        opts.max_calls = Some(1);
        self.create(TimerSpec {
            callable,
            schedule: Schedule::After { duration_ms },
            opts,
        })
        .await
    }

    /// One-shot timer firing at an absolute instant.
    pub async fn call_at(
        &self,
        callable: Callable,
        instant: DateTime<Utc>,
        opts: CreateOpts,
    ) -> Result<Timer> {
        let mut opts = opts;
        opts.max_calls = Some(1);
        self.create(TimerSpec {
            callable,
            schedule: Schedule::At { instant },
            opts,
        })
        .await
    }

    /// Recurring timer; an omitted lead-in defaults to one full interval.
    pub async fn call_interval(
        &self,
        callable: Callable,
        lead_in_ms: Option<i64>,
        interval_ms: i64,
        opts: CreateOpts,
    ) -> Result<Timer> {
        self.create(TimerSpec {
            callable,
            schedule: Schedule::Every {
                lead_in_ms,
                interval_ms,
            },
            opts,
        })
        .await
    }

    /// Recurring cron timer evaluated in `timezone` local time.
    pub async fn call_crontab(
        &self,
        callable: Callable,
        expression: &str,
        timezone: &str,
        opts: CreateOpts,
    ) -> Result<Timer> {
        self.create(TimerSpec {
            callable,
            schedule: Schedule::Cron {
                expression: expression.to_string(),
                timezone: timezone.to_string(),
            },
            opts,
        })
        .await
    }

    /// Create one timer from a spec.
    pub async fn create(&self, spec: TimerSpec) -> Result<Timer> {
        let timer = spec.into_timer(Utc::now())?;
        let timer = self.store.insert(&timer).await?;
        if let Some(at) = timer.expires_at {
            self.notify_next_expiry(at).await;
        }
        Ok(timer)
    }

    /// Bulk create in a single store round trip. Workers hear about the
    /// earliest new expiry once.
    pub async fn create_many(&self, specs: Vec<TimerSpec>) -> Result<Vec<Timer>> {
        let now = Utc::now();
        let timers = specs
            .into_iter()
            .map(|spec| spec.into_timer(now))
            .collect::<Result<Vec<_>>>()?;
        let timers = self.store.insert_many(&timers).await?;
        if let Some(earliest) = timers.iter().filter_map(|timer| timer.expires_at).min() {
            self.notify_next_expiry(earliest).await;
        }
        Ok(timers)
    }

    /// Cancel one timer. An action already dispatched keeps running; there
    /// will be no further firings.
    pub async fn cancel_by_id(&self, id: Uuid) -> Result<bool> {
        let removed = self.store.delete_by_id(id).await?;
        if removed {
            self.notify_refresh().await;
        }
        Ok(removed)
    }

    pub async fn cancel_by_name(&self, name: &str) -> Result<bool> {
        let removed = self.store.delete_by_name(name).await?;
        if removed {
            self.notify_refresh().await;
        }
        Ok(removed)
    }

    /// Cancel every timer pointing at a handler. Returns the count.
    pub async fn cancel_all(&self, module: &str, function: &str) -> Result<u64> {
        let removed = self.store.delete_all(module, function).await?;
        if removed > 0 {
            self.notify_refresh().await;
        }
        Ok(removed)
    }

    pub async fn name_exists(&self, name: &str) -> Result<bool> {
        self.store.name_exists(name).await
    }

    pub async fn id_exists(&self, id: Uuid) -> Result<bool> {
        self.store.id_exists(id).await
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Timer>> {
        self.store.get_by_id(id).await
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Timer>> {
        self.store.get_by_name(name).await
    }

    /// Stop the dispatcher worker. In-flight dispatched actions finish on
    /// their own tasks.
    pub async fn shutdown(self) {
        self.worker.shutdown().await;
    }

    async fn notify_next_expiry(&self, at: DateTime<Utc>) {
        self.worker.set_next_expiry(at).await;
        self.fanout
            .broadcast(WakeupHint::NextExpiry { expires_at: at });
    }

    async fn notify_refresh(&self) {
        self.worker.refresh().await;
        self.fanout.broadcast(WakeupHint::Refresh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MailboxTransport;
    use crate::config::PeerSource;
    use crate::error::Error;
    use crate::registry::{HandlerRegistry, RegistryExecutor};
    use crate::worker::WorkerMessage;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        scheduler: Scheduler,
        registry: Arc<HandlerRegistry>,
        peer_rx: mpsc::Receiver<WorkerMessage>,
    }

    async fn setup() -> Harness {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        let store = TimerStore::new(pool, "candle_clock_timers");
        store.migrate().await.expect("schema should be created");

        let registry = Arc::new(HandlerRegistry::new());
        let executor = Arc::new(RegistryExecutor::new(registry.clone()));

        let transport = Arc::new(MailboxTransport::new());
        let (peer_tx, peer_rx) = mpsc::channel(32);
        transport.register("node-b", peer_tx).await;

        let config = Config {
            cluster_peers: PeerSource::Static(vec!["node-b".to_string()]),
            ..Config::default()
        };
        let scheduler = Scheduler::start(store, executor, config, transport);

        Harness {
            scheduler,
            registry,
            peer_rx,
        }
    }

    fn callable() -> Callable {
        Callable::new("reports", "send_digest", b"{}".to_vec())
    }

    async fn next_peer_hint(rx: &mut mpsc::Receiver<WorkerMessage>) -> WorkerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("peer should be notified")
            .expect("peer mailbox should stay open")
    }

    #[tokio::test]
    async fn create_persists_and_hints_peers_with_the_expiry() {
        let mut harness = setup().await;
        let timer = harness
            .scheduler
            .call_after(callable(), 60_000, CreateOpts::default())
            .await
            .expect("create should succeed");

        assert_eq!(timer.max_calls, Some(1));
        assert!(harness.scheduler.id_exists(timer.id).await.unwrap());

        match next_peer_hint(&mut harness.peer_rx).await {
            WorkerMessage::SetNextExpiry(at) => assert_eq!(Some(at), timer.expires_at),
            other => panic!("expected an expiry hint, got {other:?}"),
        }
        harness.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn bulk_create_lands_all_rows_and_hints_the_earliest() {
        let mut harness = setup().await;
        let alarm_at = Utc::now() + chrono::Duration::days(2);

        let specs = vec![
            TimerSpec::new(
                callable(),
                Schedule::Cron {
                    expression: "0 12 15 * *".to_string(),
                    timezone: "Europe/Berlin".to_string(),
                },
            ),
            TimerSpec::new(
                callable(),
                Schedule::Every {
                    lead_in_ms: Some(15_000),
                    interval_ms: 10_000,
                },
            )
            .with_opts(CreateOpts {
                max_calls: Some(7),
                ..CreateOpts::default()
            }),
            TimerSpec::new(callable(), Schedule::After { duration_ms: 5_000 }).with_opts(
                CreateOpts {
                    name: Some("x".to_string()),
                    ..CreateOpts::default()
                },
            ),
            TimerSpec::new(callable(), Schedule::At { instant: alarm_at }),
        ];

        let timers = harness
            .scheduler
            .create_many(specs)
            .await
            .expect("bulk create should succeed");
        assert_eq!(timers.len(), 4);

        let interval_row = &timers[1];
        assert_eq!(
            interval_row.expires_at,
            Some(interval_row.inserted_at + chrono::Duration::milliseconds(15_000))
        );
        let duration_row = &timers[2];
        assert_eq!(
            duration_row.expires_at,
            Some(duration_row.inserted_at + chrono::Duration::milliseconds(5_000))
        );
        let alarm_row = &timers[3];
        assert_eq!(alarm_row.expires_at, Some(alarm_at));

        for timer in &timers {
            assert!(harness.scheduler.id_exists(timer.id).await.unwrap());
        }
        assert!(harness.scheduler.name_exists("x").await.unwrap());

        let earliest = timers.iter().filter_map(|timer| timer.expires_at).min();
        match next_peer_hint(&mut harness.peer_rx).await {
            WorkerMessage::SetNextExpiry(at) => assert_eq!(Some(at), earliest),
            other => panic!("expected an expiry hint, got {other:?}"),
        }
        harness.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn creating_under_the_same_name_replaces_the_row() {
        let harness = setup().await;
        let opts = CreateOpts {
            name: Some("digest".to_string()),
            ..CreateOpts::default()
        };

        let first = harness
            .scheduler
            .call_interval(callable(), None, 60_000, opts.clone())
            .await
            .unwrap();
        let second = harness
            .scheduler
            .call_interval(callable(), None, 120_000, opts)
            .await
            .unwrap();

        assert!(!harness.scheduler.id_exists(first.id).await.unwrap());
        let loaded = harness
            .scheduler
            .get_by_name("digest")
            .await
            .unwrap()
            .expect("named row should exist");
        assert_eq!(loaded.id, second.id);
        assert_eq!(loaded.interval, Some(120_000));
        harness.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_broadcasts_a_bare_refresh() {
        let mut harness = setup().await;
        let timer = harness
            .scheduler
            .call_after(callable(), 60_000, CreateOpts::default())
            .await
            .unwrap();
        // Drain the create hint first.
        next_peer_hint(&mut harness.peer_rx).await;

        assert!(harness.scheduler.cancel_by_id(timer.id).await.unwrap());
        assert!(!harness.scheduler.id_exists(timer.id).await.unwrap());
        assert!(matches!(
            next_peer_hint(&mut harness.peer_rx).await,
            WorkerMessage::Refresh
        ));

        // A second cancel is a no-op and does not notify anyone.
        assert!(!harness.scheduler.cancel_by_id(timer.id).await.unwrap());
        harness.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_all_counts_matching_timers() {
        let harness = setup().await;
        harness
            .scheduler
            .call_after(callable(), 60_000, CreateOpts::default())
            .await
            .unwrap();
        harness
            .scheduler
            .call_interval(callable(), None, 30_000, CreateOpts::default())
            .await
            .unwrap();
        harness
            .scheduler
            .call_after(
                Callable::new("billing", "close_cycle", Vec::new()),
                60_000,
                CreateOpts::default(),
            )
            .await
            .unwrap();

        let removed = harness
            .scheduler
            .cancel_all("reports", "send_digest")
            .await
            .unwrap();
        assert_eq!(removed, 2);
        harness.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_specs_surface_as_typed_errors() {
        let harness = setup().await;

        let error = harness
            .scheduler
            .call_crontab(callable(), "every other thursday", "UTC", CreateOpts::default())
            .await
            .expect_err("garbage cron must fail");
        assert!(matches!(error, Error::InvalidCron(_)));

        let error = harness
            .scheduler
            .call_crontab(
                callable(),
                "0 12 * * *",
                "Mars/Olympus_Mons",
                CreateOpts::default(),
            )
            .await
            .expect_err("unknown timezone must fail");
        assert!(matches!(error, Error::InvalidSpec(_)));

        let error = harness
            .scheduler
            .call_after(callable(), -5, CreateOpts::default())
            .await
            .expect_err("negative duration must fail");
        assert!(matches!(error, Error::InvalidSpec(_)));

        harness.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn end_to_end_a_created_timer_reaches_its_handler() {
        let harness = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        harness
            .registry
            .register_fn("reports", "send_digest", move |arguments| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(arguments);
                    Ok(())
                }
            })
            .await;

        let payload = serde_json::to_vec(&serde_json::json!({ "week": 5 })).unwrap();
        let timer = harness
            .scheduler
            .call_after(
                Callable::new("reports", "send_digest", payload.clone()),
                20,
                CreateOpts::default(),
            )
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("handler should fire")
            .expect("channel should stay open");
        assert_eq!(received, payload);

        // One-shot rows disappear after their firing.
        for _ in 0..100 {
            if !harness.scheduler.id_exists(timer.id).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!harness.scheduler.id_exists(timer.id).await.unwrap());
        harness.scheduler.shutdown().await;
    }
}
