//! Correlation of async command replies with the callers waiting on them.
//!
//! A caller parks a oneshot sender under a random id, the id travels to the
//! backend inside the command, and the reply carrying the same id takes the
//! sender back out. Entries nobody claims are evicted after [`REPLY_TTL`].

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// How long a caller waits for a reply, and how long an entry is kept.
pub const REPLY_TTL: Duration = Duration::from_secs(9);

struct Pending<T> {
    tx: oneshot::Sender<T>,
    created: Instant,
}

pub struct ReplyTable<T> {
    pending: Mutex<HashMap<u32, Pending<T>>>,
}

impl<T> ReplyTable<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Park `tx` and return the id its reply must carry.
    pub fn set(&self, tx: oneshot::Sender<T>) -> u32 {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        sweep(&mut pending);
        let mut rng = rand::thread_rng();
        let id = loop {
            let id: u32 = rng.gen();
            if !pending.contains_key(&id) {
                break id;
            }
        };
        pending.insert(
            id,
            Pending {
                tx,
                created: Instant::now(),
            },
        );
        id
    }

    /// Take the sender registered under `id`, if it is still there.
    pub fn get(&self, id: u32) -> Option<oneshot::Sender<T>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        sweep(&mut pending);
        pending.remove(&id).map(|p| p.tx)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ReplyTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep<T>(pending: &mut HashMap<u32, Pending<T>>) {
    let before = pending.len();
    pending.retain(|_, p| p.created.elapsed() <= REPLY_TTL);
    let evicted = before - pending.len();
    if evicted > 0 {
        debug!(evicted, "expired reply channels evicted");
    }
}
