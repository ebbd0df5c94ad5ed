//! Handle manager: a concurrency-safe table mapping opaque integer ids to
//! server-side stateful objects.
//!
//! Every object a remote client holds a reference to (open transaction,
//! prepared statement, open cursor) lives here under a [`HandleId`]. A single
//! lock guards the table and is held only for map mutation, never across a
//! backing-engine call or a releaser. When an idle expiry is configured, each
//! handle carries a deadline that every successful use resets; a background
//! task pops due deadlines from a min-heap and disposes of the handles under
//! the same lock discipline as an explicit release, so a timer firing
//! concurrently with an explicit release is naturally idempotent: exactly one
//! path finds the entry present.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use wiresql_client::protocol::HandleId;

/// A value that can live in a [`HandleTable`].
///
/// Values are cheap clones (typically `Arc`s around the real object) so they
/// can be handed out of the table without holding its lock.
pub trait HandleValue: Clone + Send + 'static {
    /// Dispose of the underlying object: roll back a transaction, close a
    /// statement or cursor. The table guarantees this runs at most once per
    /// handle, after the entry has been removed.
    fn release(&self);

    /// Short tag describing the kind of object, for diagnostics.
    fn kind(&self) -> &'static str;
}

struct Entry<T> {
    value: T,
    deadline: Option<Instant>,
}

struct Inner<T> {
    entries: BTreeMap<HandleId, Entry<T>>,
    next_id: u64,
    /// Pending deadlines, lazily invalidated: a record whose instant no
    /// longer matches the entry's current deadline is stale and skipped.
    deadlines: BinaryHeap<Reverse<(Instant, HandleId)>>,
}

impl<T> Inner<T> {
    /// Ids are strictly increasing, skip occupied slots, and wrap only at
    /// integer overflow, so a freed id is not reissued within a counter sweep.
    fn alloc_id(&mut self) -> HandleId {
        loop {
            let id = HandleId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

pub struct HandleTable<T> {
    inner: Mutex<Inner<T>>,
    expiry: Option<Duration>,
    /// Wakes the expiry task when a new deadline may be earlier than the one
    /// it is sleeping towards.
    wake: Notify,
}

impl<T: HandleValue> HandleTable<T> {
    /// `expiry` of `None` means handles live until explicitly released or the
    /// process ends.
    pub fn new(expiry: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_id: 0,
                deadlines: BinaryHeap::new(),
            }),
            expiry,
            wake: Notify::new(),
        }
    }

    /// Store a value and return its freshly allocated id.
    pub fn create(&self, value: T) -> HandleId {
        let deadline = self.expiry.map(|d| Instant::now() + d);
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.alloc_id();
            if let Some(when) = deadline {
                inner.deadlines.push(Reverse((when, id)));
            }
            inner.entries.insert(id, Entry { value, deadline });
            id
        };
        if deadline.is_some() {
            self.wake.notify_one();
        }
        id
    }

    /// Look up without removing. A hit counts as use and resets the handle's
    /// expiry deadline.
    pub fn get(&self, id: HandleId) -> Option<T> {
        let deadline = self.expiry.map(|d| Instant::now() + d);
        let mut inner = self.inner.lock().unwrap();
        let value = match inner.entries.get_mut(&id) {
            Some(entry) => {
                if deadline.is_some() {
                    entry.deadline = deadline;
                }
                entry.value.clone()
            }
            None => return None,
        };
        if let Some(when) = deadline {
            inner.deadlines.push(Reverse((when, id)));
        }
        Some(value)
    }

    /// Look up and atomically remove, cancelling any pending expiry. Used by
    /// inherently consuming operations (commit, rollback, close).
    pub fn take(&self, id: HandleId) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(&id).map(|e| e.value)
    }

    /// Remove the handle and run its releaser (outside the table lock).
    /// Returns false when the id was already gone, which callers that only
    /// want to guarantee cleanup treat as a harmless no-op.
    pub fn release(&self, id: HandleId) -> bool {
        match self.take(id) {
            Some(value) => {
                value.release();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of live handle ids and kind tags, sorted by id.
    /// The lock is dropped before the caller formats anything.
    pub fn snapshot(&self) -> Vec<(HandleId, &'static str)> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.value.kind()))
            .collect()
    }

    /// Start the background task that disposes of idle handles. Does nothing
    /// when no expiry is configured.
    pub fn spawn_expiry(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        self.expiry?;
        let table = Arc::clone(self);
        Some(tokio::spawn(async move { table.expiry_loop().await }))
    }

    async fn expiry_loop(&self) {
        loop {
            let (due, next) = self.pop_due();
            for (id, value) in due {
                tracing::debug!(%id, kind = value.kind(), "expiring idle handle");
                // Releasers can block (an abandoned transaction rolls back in
                // the engine), so they run on the blocking pool, not here.
                tokio::task::spawn_blocking(move || value.release());
            }
            match next {
                Some(when) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(when) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }

    /// Remove all entries whose deadline has passed, returning them together
    /// with the next pending deadline, if any.
    fn pop_due(&self) -> (Vec<(HandleId, T)>, Option<Instant>) {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let next = loop {
            let Some(&Reverse((when, id))) = inner.deadlines.peek() else {
                break None;
            };
            let current = inner.entries.get(&id).and_then(|e| e.deadline);
            if current != Some(when) {
                // Stale record: the handle was released, taken, or touched.
                inner.deadlines.pop();
                continue;
            }
            if when > now {
                break Some(when);
            }
            inner.deadlines.pop();
            if let Some(entry) = inner.entries.remove(&id) {
                due.push((id, entry.value));
            }
        };
        (due, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Obj {
        released: Arc<AtomicUsize>,
    }

    impl Obj {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let counter = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    released: Arc::clone(&counter),
                },
                counter,
            )
        }
    }

    impl HandleValue for Obj {
        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn kind(&self) -> &'static str {
            "obj"
        }
    }

    // Expired releasers run on the blocking pool in real time, even under a
    // paused clock, so counter checks need a short settle.
    fn wait_released(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "releaser count stuck at {} (wanted {})",
            counter.load(Ordering::SeqCst),
            expected
        );
    }

    #[test]
    fn get_after_release_is_none() {
        let table = HandleTable::new(None);
        let (obj, released) = Obj::new();
        let id = table.create(obj);
        assert!(table.get(id).is_some());
        assert!(table.release(id));
        assert!(table.get(id).is_none());
        assert!(table.take(id).is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let table = HandleTable::new(None);
        let (obj, released) = Obj::new();
        let id = table.create(obj);
        assert!(table.release(id));
        assert!(!table.release(id));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let table = HandleTable::new(None);
        let mut last = None;
        for _ in 0..100 {
            let (obj, _) = Obj::new();
            let id = table.create(obj);
            if let Some(prev) = last {
                assert!(id > prev);
            }
            last = Some(id);
        }
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn snapshot_is_sorted() {
        let table = HandleTable::new(None);
        let ids: Vec<_> = (0..10)
            .map(|_| {
                let (obj, _) = Obj::new();
                table.create(obj)
            })
            .collect();
        table.release(ids[3]);
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 9);
        assert!(snapshot.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_handle_expires_once() {
        let table = Arc::new(HandleTable::new(Some(Duration::from_secs(5))));
        let task = table.spawn_expiry().unwrap();
        let (obj, released) = Obj::new();
        let id = table.create(obj);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(table.get(id).is_none());
        assert_eq!(table.len(), 0);
        wait_released(&released, 1);

        // The losing explicit-release path observes "already gone".
        assert!(!table.release(id));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn use_resets_the_deadline() {
        let table = Arc::new(HandleTable::new(Some(Duration::from_secs(5))));
        let task = table.spawn_expiry().unwrap();
        let (obj, released) = Obj::new();
        let id = table.create(obj);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(table.get(id).is_some()); // touch at t=3, new deadline t=8

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(table.len(), 1, "touched handle survived past t=5");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(table.len(), 0);
        wait_released(&released, 1);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn take_cancels_expiry() {
        let table = Arc::new(HandleTable::new(Some(Duration::from_secs(5))));
        let task = table.spawn_expiry().unwrap();
        let (obj, released) = Obj::new();
        let id = table.create(obj);

        assert!(table.take(id).is_some());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(released.load(Ordering::SeqCst), 0, "releaser must not run for taken handles");
        task.abort();
    }

    #[tokio::test]
    async fn blocking_releaser_does_not_stall_the_runtime() {
        #[derive(Clone)]
        struct Slow {
            released: Arc<AtomicUsize>,
        }

        impl HandleValue for Slow {
            fn release(&self) {
                std::thread::sleep(Duration::from_millis(400));
                self.released.fetch_add(1, Ordering::SeqCst);
            }

            fn kind(&self) -> &'static str {
                "slow"
            }
        }

        let table = Arc::new(HandleTable::new(Some(Duration::from_millis(50))));
        let task = table.spawn_expiry().unwrap();
        let released = Arc::new(AtomicUsize::new(0));
        table.create(Slow {
            released: Arc::clone(&released),
        });

        // A single-threaded runtime: if the expiry task ran the releaser
        // inline, its 400ms block would hold up this timer too.
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(
            started.elapsed() < Duration::from_millis(350),
            "expiry stalled the runtime for {:?}",
            started.elapsed()
        );

        wait_released(&released, 1);
        task.abort();
    }

    #[test]
    fn freed_slot_is_not_reissued_within_sweep() {
        let table = HandleTable::new(None);
        let (a, _) = Obj::new();
        let (b, _) = Obj::new();
        let first = table.create(a);
        table.release(first);
        let second = table.create(b);
        assert!(second > first);
    }
}
