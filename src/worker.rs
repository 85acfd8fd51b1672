//! The background worker: sole owner of the recency list and accounting.
//!
//! ```text
//!   facade threads                        worker thread
//!   ──────────────                        ─────────────
//!   get ──► promotables (try_send) ──┐
//!   set ──► promotables + deletables ├──► select! ──► link / move-to-front
//!   del ──► deletables (blocking) ───┤              ──► unlink, size −=, on_delete
//!   ctl ──► control (rendezvous) ────┘              ──► gc / clear / sync / stop
//! ```
//!
//! Three channels connect the facades to the worker:
//!
//! - **promotables** (bounded, lossy): recency hints. A full channel drops
//!   the hint; reads never block and only LRU precision degrades.
//! - **deletables** (bounded, blocking): deletions and size deltas. Never
//!   lossy; senders block when the worker falls behind.
//! - **control** (rendezvous): management commands with per-call reply
//!   channels. After the worker exits, sends fail and every control
//!   operation returns its zero default.
//!
//! The worker is the only code that touches the list, the size total, and
//! the promotion counters, so none of that state needs locks. Shard maps
//! are reached through the [`EntryIndex`] seam, which is also how the flat
//! and layered caches share this module.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::config::{Configuration, DeleteCallback};
use crate::entry::Entry;
use crate::list::RecencyList;

/// Index seam between the worker and the shard layout above it.
pub(crate) trait EntryIndex<V>: Send + Sync + 'static {
    /// Removes the index mapping for an entry chosen by eviction.
    fn evict(&self, entry: &Entry<V>);

    /// Empties every shard and runs `drain` while still holding all of
    /// their exclusive locks.
    fn clear_all<F: FnOnce()>(&self, drain: F);
}

/// Non-droppable work for the worker.
pub(crate) enum Event<V> {
    /// The entry left its shard and must leave the list.
    Delete(Arc<Entry<V>>),
    /// An in-place `replace` changed an entry's size by this much.
    SizeChange(i64),
}

/// Management commands. Replies go over per-call bounded(1) channels.
pub(crate) enum Control {
    GetDropped(Sender<usize>),
    SetMaxSize(i64, Sender<()>),
    GetSize(Sender<i64>),
    Gc(Sender<()>),
    Clear(Sender<()>),
    SyncUpdates(Sender<()>),
    Stop,
}

/// Sending half of the control channel, shared by the facades.
#[derive(Clone)]
pub(crate) struct ControlHandle {
    tx: Sender<Control>,
}

impl ControlHandle {
    pub(crate) fn get_dropped(&self) -> usize {
        let (reply, rx) = bounded(1);
        if self.tx.send(Control::GetDropped(reply)).is_err() {
            return 0;
        }
        rx.recv().unwrap_or(0)
    }

    pub(crate) fn set_max_size(&self, size: i64) {
        let (done, rx) = bounded(1);
        if self.tx.send(Control::SetMaxSize(size, done)).is_ok() {
            let _ = rx.recv();
        }
    }

    pub(crate) fn get_size(&self) -> i64 {
        let (reply, rx) = bounded(1);
        if self.tx.send(Control::GetSize(reply)).is_err() {
            return 0;
        }
        rx.recv().unwrap_or(0)
    }

    pub(crate) fn gc(&self) {
        let (done, rx) = bounded(1);
        if self.tx.send(Control::Gc(done)).is_ok() {
            let _ = rx.recv();
        }
    }

    pub(crate) fn clear(&self) {
        let (done, rx) = bounded(1);
        if self.tx.send(Control::Clear(done)).is_ok() {
            let _ = rx.recv();
        }
    }

    pub(crate) fn sync_updates(&self) {
        let (done, rx) = bounded(1);
        if self.tx.send(Control::SyncUpdates(done)).is_ok() {
            let _ = rx.recv();
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(Control::Stop);
    }
}

/// The sending side of the worker's channels, owned by a facade.
pub(crate) struct Channels<V> {
    pub(crate) promotables: Sender<Arc<Entry<V>>>,
    pub(crate) deletables: Sender<Event<V>>,
    pub(crate) control: ControlHandle,
}

/// Builds the channel set and starts the worker thread over `index`.
pub(crate) fn spawn<V, I>(index: Arc<I>, config: &Configuration<V>) -> (Channels<V>, JoinHandle<()>)
where
    V: Send + Sync + 'static,
    I: EntryIndex<V>,
{
    let (promote_tx, promote_rx) = bounded(config.promote_buffer);
    let (delete_tx, delete_rx) = bounded(config.delete_buffer);
    let (control_tx, control_rx) = bounded(0);

    let worker = Worker {
        index,
        list: RecencyList::new(),
        size: 0,
        max_size: config.max_size,
        items_to_prune: config.items_to_prune,
        percent_to_prune: config.percent_to_prune,
        gets_per_promote: config.gets_per_promote,
        tracking: config.tracking,
        on_delete: config.on_delete.clone(),
        dropped: 0,
        promotables: promote_rx,
        deletables: delete_rx,
        control: control_rx,
    };
    let handle = std::thread::spawn(move || worker.run());

    (
        Channels {
            promotables: promote_tx,
            deletables: delete_tx,
            control: ControlHandle { tx: control_tx },
        },
        handle,
    )
}

struct Worker<V, I> {
    index: Arc<I>,
    list: RecencyList<V>,
    size: i64,
    max_size: i64,
    items_to_prune: usize,
    percent_to_prune: Option<u8>,
    gets_per_promote: i32,
    tracking: bool,
    on_delete: Option<DeleteCallback<V>>,
    dropped: usize,
    promotables: Receiver<Arc<Entry<V>>>,
    deletables: Receiver<Event<V>>,
    control: Receiver<Control>,
}

impl<V, I> Worker<V, I>
where
    V: Send + Sync + 'static,
    I: EntryIndex<V>,
{
    fn run(mut self) {
        tracing::debug!("cache worker started");
        let promotables = self.promotables.clone();
        let deletables = self.deletables.clone();
        let control = self.control.clone();
        loop {
            crossbeam::select! {
                recv(promotables) -> msg => match msg {
                    Ok(entry) => self.on_promote(entry),
                    Err(_) => break,
                },
                recv(deletables) -> msg => match msg {
                    Ok(event) => self.on_event(event),
                    Err(_) => break,
                },
                recv(control) -> msg => match msg {
                    Ok(control) => {
                        if self.on_control(control) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }

        // pending deletions must not be lost on shutdown
        while let Ok(event) = self.deletables.try_recv() {
            self.on_event(event);
        }
        if !self.list.is_empty() {
            tracing::debug!(remaining = self.list.len(), "discarding recency list");
        }
        self.list.reset();
        tracing::debug!(dropped = self.dropped, "cache worker stopped");
    }

    fn on_promote(&mut self, entry: Arc<Entry<V>>) {
        if self.promote(entry) && self.size > self.max_size {
            let dropped = self.gc();
            self.dropped += dropped;
        }
    }

    /// Links fresh entries at the head, moves resident ones when the gate
    /// fires. Returns `true` when a new entry was linked (the only case
    /// that can push the cache over its budget).
    fn promote(&mut self, entry: Arc<Entry<V>>) -> bool {
        if entry.is_tombstoned() {
            return false;
        }
        if entry.in_list() {
            if entry.should_promote(self.gets_per_promote) {
                self.list.move_to_front(&entry);
                entry.reset_promotions();
            }
            return false;
        }

        self.size += entry.size();
        entry.reset_promotions();
        self.list.push_front(entry);
        true
    }

    fn on_event(&mut self, event: Event<V>) {
        match event {
            Event::Delete(entry) => self.delete_entry(&entry),
            Event::SizeChange(delta) => {
                self.size += delta;
                if self.size > self.max_size {
                    let dropped = self.gc();
                    self.dropped += dropped;
                }
            }
        }
    }

    fn delete_entry(&mut self, entry: &Entry<V>) {
        if !entry.in_list() {
            // deleted before it ever got linked
            entry.tombstone();
            return;
        }
        self.size -= entry.size();
        self.fire_on_delete(entry);
        self.list.remove(entry);
        entry.tombstone();
    }

    fn on_control(&mut self, control: Control) -> bool {
        match control {
            Control::GetDropped(reply) => {
                let _ = reply.send(std::mem::take(&mut self.dropped));
            }
            Control::SetMaxSize(size, done) => {
                self.max_size = size;
                if self.size > self.max_size {
                    let dropped = self.gc();
                    self.dropped += dropped;
                }
                let _ = done.send(());
            }
            Control::GetSize(reply) => {
                let _ = reply.send(self.size);
            }
            Control::Gc(done) => {
                let dropped = self.gc();
                self.dropped += dropped;
                let _ = done.send(());
            }
            Control::Clear(done) => {
                self.clear();
                let _ = done.send(());
            }
            Control::SyncUpdates(done) => {
                self.drain_updates();
                let _ = done.send(());
            }
            Control::Stop => return true,
        }
        false
    }

    /// Processes everything queued on both data channels. Anything a
    /// caller enqueued before issuing `SyncUpdates` is reflected in the
    /// list and accounting by the time the reply is sent.
    fn drain_updates(&mut self) {
        loop {
            let mut progressed = false;
            while let Ok(entry) = self.promotables.try_recv() {
                self.on_promote(entry);
                progressed = true;
            }
            while let Ok(event) = self.deletables.try_recv() {
                self.on_event(event);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    /// Empties the shards and discards queued updates while every shard
    /// lock is held, then rebuilds the list state from nothing.
    fn clear(&mut self) {
        let promotables = self.promotables.clone();
        let deletables = self.deletables.clone();
        self.index.clear_all(move || {
            while promotables.try_recv().is_ok() {}
            while deletables.try_recv().is_ok() {}
        });
        self.list.reset();
        self.size = 0;
    }

    /// Evicts from the tail. Count mode examines
    /// `max(items_to_prune, size − max_size)` entries; percent mode keeps
    /// evicting until the size reaches the prune target. Pinned entries
    /// are skipped, never a stop condition.
    fn gc(&mut self) -> usize {
        let mut dropped = 0;
        let mut node = self.list.tail;

        if let Some(target) = self.prune_target() {
            while !node.is_null() && self.size > target {
                // SAFETY: tail-to-head walk over worker-owned nodes;
                // `prev` is read before `evict` can free the node.
                let (prev, entry) = unsafe { ((*node).prev, Arc::clone(&(*node).entry)) };
                if self.evictable(&entry) {
                    self.evict(&entry);
                    dropped += 1;
                }
                node = prev;
            }
            return dropped;
        }

        let mut budget = self.items_to_prune as i64;
        let overflow = self.size - self.max_size;
        if overflow > budget {
            budget = overflow;
        }
        for _ in 0..budget {
            if node.is_null() {
                break;
            }
            // SAFETY: as above.
            let (prev, entry) = unsafe { ((*node).prev, Arc::clone(&(*node).entry)) };
            if self.evictable(&entry) {
                self.evict(&entry);
                dropped += 1;
            }
            node = prev;
        }
        dropped
    }

    fn prune_target(&self) -> Option<i64> {
        self.percent_to_prune
            .map(|pct| self.max_size - self.max_size * i64::from(pct) / 100)
    }

    fn evictable(&self, entry: &Entry<V>) -> bool {
        !self.tracking || entry.ref_count() == 0
    }

    fn evict(&mut self, entry: &Arc<Entry<V>>) {
        self.index.evict(entry);
        self.size -= entry.size();
        self.fire_on_delete(entry);
        self.list.remove(entry);
        entry.tombstone();
    }

    /// The callback runs outside any lock; a panic inside it must not take
    /// the worker down.
    fn fire_on_delete(&self, entry: &Entry<V>) {
        if let Some(callback) = &self.on_delete {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(entry))).is_err() {
                tracing::error!(key = entry.key(), "delete callback panicked");
            }
        }
    }
}
