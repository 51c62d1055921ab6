//! candle-clock: durable, cluster-aware timer scheduling over a shared SQL
//! store.
//!
//! Timers (one-off delays, fixed intervals, cron-style calendar events, and
//! absolute alarms) live as rows in a shared table, so they survive process
//! restarts and never double-fire when several application instances point
//! at the same store. Each node runs a single dispatcher worker that sleeps
//! until the earliest due row, claims it atomically, hands the action to a
//! registered handler, and reschedules or deletes the row. Creates and
//! cancels fan advisory wakeup hints out to cluster peers.
//!
//! ```rust,ignore
//! use candle_clock::{
//!     Callable, Config, CreateOpts, HandlerRegistry, MailboxTransport, RegistryExecutor,
//!     Scheduler, TimerStore,
//! };
//! use std::sync::Arc;
//!
//! let store = TimerStore::new(pool, "candle_clock_timers");
//! store.migrate().await?;
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! registry
//!     .register_fn("reports", "send_digest", |arguments| async move {
//!         // deserialize `arguments` and do the work
//!         Ok(())
//!     })
//!     .await;
//!
//! let scheduler = Scheduler::start(
//!     store,
//!     Arc::new(RegistryExecutor::new(registry)),
//!     Config::default(),
//!     Arc::new(MailboxTransport::new()),
//! );
//!
//! scheduler
//!     .call_crontab(
//!         Callable::new("reports", "send_digest", b"{}".to_vec()),
//!         "0 17 * * *",
//!         "Europe/Berlin",
//!         CreateOpts::default(),
//!     )
//!     .await?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod timer;
pub mod worker;

pub use cluster::{Fanout, HintTransport, MailboxTransport, WakeupHint};
pub use config::{Config, PeerSource};
pub use error::{Error, Result};
pub use registry::{Executor, HandlerRegistry, RegistryExecutor, TimerHandler};
pub use scheduler::Scheduler;
pub use store::TimerStore;
pub use timer::expiry::next_expiry;
pub use timer::{Callable, CreateOpts, Schedule, Timer, TimerSpec};
pub use worker::{Worker, WorkerHandle, WorkerMessage};
