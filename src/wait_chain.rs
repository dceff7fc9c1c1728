use std::sync::{Arc, Weak};

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::debug;
use parking_lot::Mutex;

use crate::errors::{Result, ThothError};

/// Waits-for edges between units of work.
///
/// A unit of work registers an edge before it blocks on another one. If
/// the target already waits (directly or transitively) on the waiter, the
/// edge would close a cycle and [`WaitChain::begin_wait`] reports a
/// deadlock instead.
#[derive(Default)]
pub struct WaitChain {
    edges: Mutex<HashMap<u64, u64>>,
}

impl WaitChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `waiter` is about to block on `target`.
    ///
    /// # Returns
    ///
    /// A guard that removes the edge when dropped.
    ///
    /// # Errors
    ///
    /// Returns `ThothError::DeadlockDetected` if `target` already waits on `waiter`.
    pub fn begin_wait(&self, waiter: u64, target: u64) -> Result<WaitGuard<'_>> {
        let mut edges = self.edges.lock();
        if Self::reaches(&edges, target, waiter) {
            return Err(ThothError::DeadlockDetected(format!(
                "transaction {} waits on {} which waits on {}",
                waiter, target, waiter
            )));
        }
        debug!("transaction {} waits on {}", waiter, target);
        edges.insert(waiter, target);
        Ok(WaitGuard {
            chain: self,
            waiter,
        })
    }

    /// The unit of work `waiter` currently waits on.
    pub fn waiting_on(&self, waiter: u64) -> Option<u64> {
        self.edges.lock().get(&waiter).copied()
    }

    fn reaches(edges: &HashMap<u64, u64>, from: u64, to: u64) -> bool {
        let mut visited = HashSet::new();
        let mut current = from;
        loop {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                return false;
            }
            match edges.get(&current) {
                Some(next) => current = *next,
                None => return false,
            }
        }
    }
}

pub struct WaitGuard<'a> {
    chain: &'a WaitChain,
    waiter: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.chain.edges.lock().remove(&self.waiter);
    }
}

thread_local! {
    static LIVENESS_TOKEN: Arc<()> = Arc::new(());
}

/// Observes whether a thread is still running.
///
/// Each thread owns a token in its thread-local storage, the token is
/// dropped when the thread exits.
#[derive(Clone, Debug)]
pub struct ThreadLiveness {
    token: Weak<()>,
    thread_name: Option<String>,
}

impl ThreadLiveness {
    /// Liveness of the calling thread.
    pub fn current() -> Self {
        Self {
            token: LIVENESS_TOKEN.with(Arc::downgrade),
            thread_name: std::thread::current().name().map(str::to_string),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.token.strong_count() > 0
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }
}
