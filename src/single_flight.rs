//! Lazily fetched value with at most one fetch in flight.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio::sync::Mutex;

use crate::prelude::*;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

enum Slot<T> {
    Empty,
    InFlight { generation: u64, fetch: SharedFetch<T> },
    Ready(T),
}

/// What the cell holds at the moment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Snapshot<T> {
    Empty,
    InFlight,
    Ready(T),
}

/// Cell that fetches its value on demand.
///
/// Concurrent callers share one fetch and all of them observe its outcome, error included. The
/// fetch runs on its own task, so cancelling the caller that started it does not abort it.
pub struct SingleFlight<T> {
    slot: Arc<Mutex<Slot<T>>>,
    next_generation: AtomicU64,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self { slot: Arc::new(Mutex::new(Slot::Empty)), next_generation: AtomicU64::new(0) }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    /// Return the stored value while it is fresh, otherwise join or start a fetch.
    pub async fn get_or_fetch<F, Fut>(&self, is_fresh: impl Fn(&T) -> bool, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = {
            let mut slot = self.slot.lock().await;
            match &*slot {
                Slot::Ready(value) if is_fresh(value) => return Ok(value.clone()),
                Slot::InFlight { fetch, .. } => fetch.clone(),
                Slot::Ready(_) | Slot::Empty => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let publish = Self::publish(Arc::clone(&self.slot), generation, fetch());
                    let handle = tokio::spawn(publish);
                    let fetch = async move {
                        handle.await.unwrap_or_else(|error| Err(Error::Task(error.to_string())))
                    }
                    .boxed()
                    .shared();
                    *slot = Slot::InFlight { generation, fetch: fetch.clone() };
                    fetch
                }
            }
        };
        shared.await
    }

    /// Store the fetch outcome unless the cell has been reset or refetched in the meantime.
    async fn publish(
        slot: Arc<Mutex<Slot<T>>>,
        generation: u64,
        fetch: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = fetch.await;
        let mut slot = slot.lock().await;
        if matches!(&*slot, Slot::InFlight { generation: current, .. } if *current == generation) {
            *slot = match &result {
                Ok(value) => Slot::Ready(value.clone()),
                Err(_) => Slot::Empty,
            };
        }
        result
    }

    /// Drop the stored value, a pending fetch will not be stored either.
    pub async fn reset(&self) {
        *self.slot.lock().await = Slot::Empty;
    }

    /// Drop the stored value only if it matches, so that a stale observation does not discard
    /// a value fetched after it.
    ///
    /// Returns whether the value has been dropped.
    pub async fn invalidate_if(&self, matches: impl FnOnce(&T) -> bool) -> bool {
        let mut slot = self.slot.lock().await;
        match &*slot {
            Slot::Ready(value) if matches(value) => {
                *slot = Slot::Empty;
                true
            }
            _ => false,
        }
    }

    /// Swap the stored value for a newer one if the stored value still matches.
    ///
    /// Returns whether the value has been replaced.
    pub async fn replace_if(&self, matches: impl FnOnce(&T) -> bool, value: T) -> bool {
        let mut slot = self.slot.lock().await;
        match &*slot {
            Slot::Ready(current) if matches(current) => {
                *slot = Slot::Ready(value);
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Snapshot<T> {
        match &*self.slot.lock().await {
            Slot::Empty => Snapshot::Empty,
            Slot::InFlight { .. } => Snapshot::InFlight,
            Slot::Ready(value) => Snapshot::Ready(value.clone()),
        }
    }

    /// Take the stored value out, leaving the cell empty.
    pub async fn take(&self) -> Option<T> {
        let mut slot = self.slot.lock().await;
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Ready(value) => Some(value),
            Slot::InFlight { .. } | Slot::Empty => None,
        }
    }
}
