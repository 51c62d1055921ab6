//! Library configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where cluster fan-out hints get delivered.
#[derive(Clone, Default)]
pub enum PeerSource {
    /// Single-node deployment: no peers to notify.
    #[default]
    None,
    /// A fixed list of peer addresses.
    Static(Vec<String>),
    /// A callback producing the current peer list on every broadcast, for
    /// deployments where membership changes at runtime.
    Dynamic(Arc<dyn Fn() -> Vec<String> + Send + Sync>),
}

impl PeerSource {
    /// Resolve the current set of peer addresses.
    pub fn peers(&self) -> Vec<String> {
        match self {
            PeerSource::None => Vec::new(),
            PeerSource::Static(peers) => peers.clone(),
            PeerSource::Dynamic(resolve) => resolve(),
        }
    }
}

impl fmt::Debug for PeerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerSource::None => write!(f, "PeerSource::None"),
            PeerSource::Static(peers) => f.debug_tuple("PeerSource::Static").field(peers).finish(),
            PeerSource::Dynamic(_) => write!(f, "PeerSource::Dynamic(..)"),
        }
    }
}

/// Scheduler configuration. The store handle itself is passed in separately
/// as an externally owned `sqlx::SqlitePool`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the timers table.
    pub timer_table_name: String,
    /// How long an `executing` row may sit untouched before any worker is
    /// allowed to reclaim it as orphaned.
    pub orphan_reclaim_window: Duration,
    /// Gap below which the worker dispatches immediately instead of arming a
    /// sleep. Amortizes timer-wheel overhead and makes startup catch-up
    /// prompt.
    pub execution_threshold: Duration,
    /// Peers to notify on create/cancel.
    pub cluster_peers: PeerSource,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timer_table_name: "candle_clock_timers".to_string(),
            orphan_reclaim_window: Duration::from_secs(3600),
            execution_threshold: Duration::from_millis(150),
            cluster_peers: PeerSource::None,
        }
    }
}
