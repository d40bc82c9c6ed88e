//! Restartable, monotone change streams over a key prefix.

use std::collections::VecDeque;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// One committed change. `value: None` is a deletion tombstone.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub key: String,
    pub value: Option<Value>,
    pub rev: u64,
}

#[derive(Error, Debug)]
pub enum WatchError {
    /// The watcher fell behind the replay buffer. Re-read a snapshot and
    /// restart the watch from its revision.
    #[error("watch stream lost events, resync required")]
    Resync,
    /// The store was dropped.
    #[error("store closed")]
    Closed,
}

/// A change stream created by [`Store::watch`](crate::Store::watch).
///
/// Yields events with strictly increasing batch revisions per key prefix;
/// buffered history is replayed before live events.
pub struct Watcher {
    prefix: String,
    last_rev: u64,
    replay: VecDeque<WatchEvent>,
    live: broadcast::Receiver<WatchEvent>,
    needs_resync: bool,
}

pub(crate) fn watcher_from_tail(
    prefix: &str,
    from_rev: u64,
    tail: &VecDeque<WatchEvent>,
    oldest_retained: u64,
    live: broadcast::Receiver<WatchEvent>,
) -> Watcher {
    // The stream must deliver every event with rev > from_rev. If the replay
    // buffer no longer reaches back that far, signal resync instead of
    // silently skipping.
    let needs_resync = from_rev + 1 < oldest_retained;

    let replay = tail
        .iter()
        .filter(|event| event.rev > from_rev && event.key.starts_with(prefix))
        .cloned()
        .collect();

    Watcher {
        prefix: prefix.to_string(),
        last_rev: from_rev,
        replay,
        live,
        needs_resync,
    }
}

impl Watcher {
    /// Wait for the next matching event.
    pub async fn next(&mut self) -> Result<WatchEvent, WatchError> {
        if self.needs_resync {
            return Err(WatchError::Resync);
        }

        if let Some(event) = self.replay.pop_front() {
            self.last_rev = event.rev;
            return Ok(event);
        }

        loop {
            match self.live.recv().await {
                Ok(event) => {
                    // replay and the live subscription overlap; drop
                    // anything already delivered
                    if event.rev <= self.last_rev || !event.key.starts_with(&self.prefix) {
                        continue;
                    }
                    self.last_rev = event.rev;
                    return Ok(event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    self.needs_resync = true;
                    return Err(WatchError::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(WatchError::Closed),
            }
        }
    }

    /// Revision of the last delivered event.
    pub fn last_rev(&self) -> u64 {
        self.last_rev
    }
}
