//! Deduplication registry
//!
//! Maps request fingerprints to in-flight entries. The first caller for a
//! fingerprint becomes the owner and performs the upstream call; concurrent
//! duplicates attach as waiters (unary) or broadcaster subscribers
//! (streaming) and receive the owner's result. Entries are evicted on
//! terminal completion and after `deduplication_ttl`; a stale owner is
//! demoted so a hung request cannot wedge the pipeline.

use crate::broadcaster::Broadcaster;
use dashmap::DashMap;
use nimbus_core::Fingerprint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

/// Shared result of a unary request: the HTTP status and the exact response
/// body every duplicate client receives.
#[derive(Debug, Clone)]
pub struct UnaryOutcome {
    pub status: u16,
    pub body: serde_json::Value,
}

static OWNER_IDS: AtomicU64 = AtomicU64::new(1);

enum Entry {
    Unary {
        owner_id: u64,
        tx: broadcast::Sender<UnaryOutcome>,
        created: Instant,
    },
    Stream {
        owner_id: u64,
        slot: watch::Receiver<Option<Arc<Broadcaster>>>,
        created: Instant,
    },
}

impl Entry {
    fn owner_id(&self) -> u64 {
        match self {
            Entry::Unary { owner_id, .. } | Entry::Stream { owner_id, .. } => *owner_id,
        }
    }

    fn created(&self) -> Instant {
        match self {
            Entry::Unary { created, .. } | Entry::Stream { created, .. } => *created,
        }
    }
}

/// Result of [`DedupRegistry::begin_unary`]
pub enum BeginUnary {
    Owner(UnaryOwner),
    Waiter(broadcast::Receiver<UnaryOutcome>),
}

/// Result of [`DedupRegistry::begin_stream`]
pub enum BeginStream {
    Owner(StreamOwner),
    /// A duplicate stream; await the owner's broadcaster and subscribe
    Subscriber(StreamFollower),
}

/// Thread-safe fingerprint → in-flight entry map
pub struct DedupRegistry {
    entries: DashMap<Fingerprint, Entry>,
    self_ref: Weak<Self>,
}

impl DedupRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            entries: DashMap::new(),
            self_ref: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("registry is alive")
    }

    /// Register interest in a unary fingerprint.
    pub fn begin_unary(&self, fp: Fingerprint, ttl: Duration) -> BeginUnary {
        let owner_id = OWNER_IDS.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.entries.entry(fp.clone()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(4);
            Entry::Unary {
                owner_id,
                tx,
                created: Instant::now(),
            }
        });

        match &mut *slot {
            Entry::Unary {
                owner_id: existing,
                tx,
                created,
            } => {
                if *existing == owner_id {
                    let tx = tx.clone();
                    drop(slot);
                    return BeginUnary::Owner(UnaryOwner {
                        registry: self.arc(),
                        fp,
                        owner_id,
                        tx,
                        done: false,
                    });
                }
                if created.elapsed() > ttl {
                    // Stale owner: demote it and take over. Its waiters are
                    // woken with a closed channel and retry on their own.
                    tracing::warn!(fingerprint = %fp, "demoting stale deduplication owner");
                    let (new_tx, _) = broadcast::channel(4);
                    *slot = Entry::Unary {
                        owner_id,
                        tx: new_tx.clone(),
                        created: Instant::now(),
                    };
                    drop(slot);
                    return BeginUnary::Owner(UnaryOwner {
                        registry: self.arc(),
                        fp,
                        owner_id,
                        tx: new_tx,
                        done: false,
                    });
                }
                BeginUnary::Waiter(tx.subscribe())
            }
            // A streaming entry under the same fingerprint cannot happen:
            // the stream flag is part of the fingerprint. Treat it as a
            // fresh owner slot for robustness.
            Entry::Stream { .. } => {
                let (tx, _) = broadcast::channel(4);
                *slot = Entry::Unary {
                    owner_id,
                    tx: tx.clone(),
                    created: Instant::now(),
                };
                drop(slot);
                BeginUnary::Owner(UnaryOwner {
                    registry: self.arc(),
                    fp,
                    owner_id,
                    tx,
                    done: false,
                })
            }
        }
    }

    /// Register interest in a streaming fingerprint.
    pub fn begin_stream(&self, fp: Fingerprint, ttl: Duration) -> BeginStream {
        let owner_id = OWNER_IDS.fetch_add(1, Ordering::Relaxed);
        let mut publisher = None;
        let mut slot = self.entries.entry(fp.clone()).or_insert_with(|| {
            let (tx, rx) = watch::channel(None);
            publisher = Some(tx);
            Entry::Stream {
                owner_id,
                slot: rx,
                created: Instant::now(),
            }
        });

        if let Some(tx) = publisher {
            drop(slot);
            return BeginStream::Owner(StreamOwner {
                registry: self.arc(),
                fp,
                owner_id,
                slot: tx,
                published: false,
            });
        }

        match &mut *slot {
            Entry::Stream {
                slot: rx, created, ..
            } => {
                if created.elapsed() > ttl {
                    tracing::warn!(fingerprint = %fp, "demoting stale stream owner");
                    let (tx, rx) = watch::channel(None);
                    *slot = Entry::Stream {
                        owner_id,
                        slot: rx,
                        created: Instant::now(),
                    };
                    drop(slot);
                    return BeginStream::Owner(StreamOwner {
                        registry: self.arc(),
                        fp,
                        owner_id,
                        slot: tx,
                        published: false,
                    });
                }
                BeginStream::Subscriber(StreamFollower { slot: rx.clone() })
            }
            Entry::Unary { .. } => {
                let (tx, rx) = watch::channel(None);
                *slot = Entry::Stream {
                    owner_id,
                    slot: rx,
                    created: Instant::now(),
                };
                drop(slot);
                BeginStream::Owner(StreamOwner {
                    registry: self.arc(),
                    fp,
                    owner_id,
                    slot: tx,
                    published: false,
                })
            }
        }
    }

    /// Number of live entries (test and status use).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_if_owner(&self, fp: &Fingerprint, owner_id: u64) {
        self.entries
            .remove_if(fp, |_, entry| entry.owner_id() == owner_id);
    }

    /// Drop entries older than the TTL (called opportunistically).
    pub fn evict_expired(&self, ttl: Duration) {
        self.entries.retain(|_, entry| entry.created().elapsed() <= ttl);
    }
}

/// Owner handle for a unary fingerprint. Completing or failing wakes every
/// waiter with the same outcome and removes the entry; dropping the handle
/// without completing removes the entry so waiters can retry.
pub struct UnaryOwner {
    registry: Arc<DedupRegistry>,
    fp: Fingerprint,
    owner_id: u64,
    tx: broadcast::Sender<UnaryOutcome>,
    done: bool,
}

impl UnaryOwner {
    /// Publish the final outcome (success or error body) to all waiters.
    pub fn complete(mut self, outcome: UnaryOutcome) {
        self.done = true;
        let waiters = self.tx.receiver_count();
        if waiters > 0 {
            tracing::debug!(fingerprint = %self.fp, waiters, "waking duplicate waiters");
        }
        let _ = self.tx.send(outcome);
        self.registry.remove_if_owner(&self.fp, self.owner_id);
    }
}

impl Drop for UnaryOwner {
    fn drop(&mut self) {
        if !self.done {
            self.registry.remove_if_owner(&self.fp, self.owner_id);
        }
    }
}

/// Owner handle for a streaming fingerprint.
pub struct StreamOwner {
    registry: Arc<DedupRegistry>,
    fp: Fingerprint,
    owner_id: u64,
    slot: watch::Sender<Option<Arc<Broadcaster>>>,
    published: bool,
}

impl StreamOwner {
    /// Announce the live broadcaster so duplicate subscribers can attach.
    /// The entry stays in the registry for the TTL so post-terminal
    /// subscribers can still replay.
    pub fn publish(&mut self, broadcaster: Arc<Broadcaster>) {
        self.published = true;
        let _ = self.slot.send(Some(broadcaster));
    }

    /// Abandon ownership before any broadcaster was created (all candidates
    /// failed). Subscribers waiting on the slot observe the close and retry.
    pub fn abandon(mut self) {
        self.published = false;
        self.registry.remove_if_owner(&self.fp, self.owner_id);
        self.done();
    }

    fn done(&mut self) {
        self.published = true; // suppress the Drop cleanup
    }
}

impl Drop for StreamOwner {
    fn drop(&mut self) {
        if !self.published {
            self.registry.remove_if_owner(&self.fp, self.owner_id);
        }
    }
}

/// A duplicate streaming caller's handle to the (future) broadcaster
pub struct StreamFollower {
    slot: watch::Receiver<Option<Arc<Broadcaster>>>,
}

impl StreamFollower {
    /// Wait until the owner publishes its broadcaster. Returns `None` when
    /// the owner abandoned the request before streaming started; the caller
    /// should retry `begin_stream` and may become the new owner.
    pub async fn broadcaster(mut self) -> Option<Arc<Broadcaster>> {
        loop {
            if let Some(b) = self.slot.borrow_and_update().clone() {
                return Some(b);
            }
            if self.slot.changed().await.is_err() {
                return None;
            }
        }
    }
}
