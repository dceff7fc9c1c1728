use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info};

use crate::config::{CoordinatorKind, ThothConfig};
use crate::coordinator::{LocalCoordinator, ThreadedCoordinator, TransactionCoordinator};
use crate::errors::{Result, ThothError};
use crate::transaction::RootTransaction;
use crate::twopc::{BranchId, GlobalTransactionId, RecoverFlag, ResourceManager};
use crate::wait_chain::WaitChain;

/// Thoth Prelude
pub mod prelude {
    pub use crate::config::*;
    pub use crate::coordinator::*;
    pub use crate::errors::*;
    pub use crate::model::*;
    pub use crate::nested::*;
    pub use crate::persister::*;
    pub use crate::portal::*;
    pub use crate::transaction::*;
    pub use crate::twopc::*;
    pub use crate::*;
}

/// The main entry point: hands out units of work, each backed by its own
/// transaction coordinator.
///
/// One `Thoth` is shared by every thread of the process. Units of work that
/// wait on each other are checked for deadlocks through a single waits-for
/// chain owned here.
pub struct Thoth {
    config: ThothConfig,
    /// Low half of every global transaction id; the process id is the high half.
    next_id: AtomicU64,
    wait_chain: Arc<WaitChain>,
}

impl Thoth {
    pub fn new(config: ThothConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            wait_chain: Arc::new(WaitChain::new()),
        }
    }

    pub fn config(&self) -> &ThothConfig {
        &self.config
    }

    /// Begins a unit of work with the configured default timeout.
    pub fn begin(&self) -> Result<Arc<RootTransaction>> {
        self.begin_with_timeout(Duration::from_secs(self.config.default_timeout_secs))
    }

    pub fn begin_with_timeout(&self, timeout: Duration) -> Result<Arc<RootTransaction>> {
        self.begin_named("", timeout)
    }

    /// Begins a named unit of work.
    ///
    /// # Arguments
    ///
    /// * `name` - Shown in logs and in the names of nested units of work.
    ///   An empty name is replaced by `tx-{id}`.
    /// * `timeout` - Deadline of the underlying coordinator. Once it passes,
    ///   the transaction is marked rollback-only.
    ///
    /// # Errors
    ///
    /// Returns `ThothError::Configuration` for a zero timeout.
    pub fn begin_named(&self, name: &str, timeout: Duration) -> Result<Arc<RootTransaction>> {
        if timeout.is_zero() {
            return Err(ThothError::Configuration(
                "transaction timeout must be positive".to_string(),
            ));
        }
        let counter = self.next_id.fetch_add(1, Ordering::SeqCst);
        let global_id = GlobalTransactionId(((process::id() as u64) << 32) | (counter & 0xFFFF_FFFF));
        let coordinator: Arc<dyn TransactionCoordinator> = match self.config.coordinator {
            CoordinatorKind::Local => Arc::new(LocalCoordinator::new(global_id, timeout)),
            CoordinatorKind::Threaded => Arc::new(ThreadedCoordinator::new(
                global_id,
                timeout,
                self.config.async_resources,
            )),
        };
        let name = if name.is_empty() {
            format!("tx-{}", counter)
        } else {
            name.to_string()
        };
        debug!("beginning {} as {:?}", name, global_id);
        RootTransaction::begin(
            counter,
            name,
            timeout,
            self.config.clone(),
            coordinator,
            Arc::clone(&self.wait_chain),
        )
    }

    /// Lists the branches `resource` holds prepared but undecided.
    ///
    /// Completing them is left to the operator.
    pub fn recover(&self, resource: &Arc<dyn ResourceManager>) -> Result<Vec<BranchId>> {
        let branches = resource.recover(RecoverFlag::StartEndScan).map_err(|e| {
            ThothError::resource(format!("could not recover {}", resource.name()), e)
        })?;
        if !branches.is_empty() {
            info!(
                "{} holds {} in-doubt branches",
                resource.name(),
                branches.len()
            );
        }
        Ok(branches)
    }

    pub fn wait_chain(&self) -> &Arc<WaitChain> {
        &self.wait_chain
    }
}
