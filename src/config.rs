use serde::{Deserialize, Serialize};

/// Which coordinator implementation backs a unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorKind {
    /// State owned by the thread driving the transaction.
    #[default]
    Local,
    /// Atomically swapped state, resource calls may run on per-resource executors.
    Threaded,
}

/// Bounds of the consolidation passes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// How far past the adjacent operation a forward/backward pass looks for a partner.
    pub max_lookahead: usize,
    /// Upper bound of alternating forward/backward rounds.
    pub max_rounds: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            max_lookahead: 10,
            max_rounds: 4,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ThothConfig {
    pub default_timeout_secs: u64,
    pub coordinator: CoordinatorKind,
    /// Only honored by [`CoordinatorKind::Threaded`].
    pub async_resources: bool,
    pub retry_on_optimistic_lock_failure: bool,
    pub flush_nested_at_commit: bool,
    pub bulk_insert_threshold: usize,
    pub consolidation: ConsolidationConfig,
}

impl Default for ThothConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
            coordinator: CoordinatorKind::Local,
            async_resources: false,
            retry_on_optimistic_lock_failure: false,
            flush_nested_at_commit: false,
            bulk_insert_threshold: 0,
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl ThothConfig {
    pub fn threaded(mut self, async_resources: bool) -> Self {
        self.coordinator = CoordinatorKind::Threaded;
        self.async_resources = async_resources;
        self
    }
}
