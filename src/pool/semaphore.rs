//! Counting semaphore whose waiters are served by priority.
//!
//! Lower priority values go first; waiters with equal priority are served
//! in arrival order. A released permit is handed directly to the best
//! waiter, so a newcomer can never overtake the queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

struct Waiter {
    priority: i32,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // BinaryHeap is a max-heap: the smallest (priority, seq) must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    permits: usize,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

pub struct PrioritySemaphore {
    state: Mutex<State>,
}

/// Holds one permit; releasing it on drop.
#[must_use = "the permit is released as soon as it is dropped"]
pub struct PriorityPermit<'a> {
    semaphore: &'a PrioritySemaphore,
}

impl Drop for PriorityPermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

impl fmt::Debug for PriorityPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityPermit").finish_non_exhaustive()
    }
}

/// A permit that keeps its semaphore alive, so it can move into a spawned task.
#[must_use = "the permit is released as soon as it is dropped"]
pub struct OwnedPriorityPermit {
    semaphore: Arc<PrioritySemaphore>,
}

impl Drop for OwnedPriorityPermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

impl fmt::Debug for OwnedPriorityPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedPriorityPermit").finish_non_exhaustive()
    }
}

/// A queued acquisition. If dropped after the permit was handed over but
/// before it was observed, the permit is passed on instead of leaking.
struct PendingAcquire<'a> {
    semaphore: &'a PrioritySemaphore,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.semaphore.release();
            return;
        }
        // Prune our closed entry so the heap only holds live waiters.
        self.semaphore
            .lock()
            .waiters
            .retain(|waiter| !waiter.wake.is_closed());
    }
}

impl PrioritySemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                next_seq: 0,
                waiters: BinaryHeap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a permit.
    pub async fn acquire(&self, priority: i32) -> PriorityPermit<'_> {
        self.reserve(priority).await;
        PriorityPermit { semaphore: self }
    }

    /// Wait for a permit that is not tied to a borrow of the semaphore.
    pub async fn acquire_owned(self: Arc<Self>, priority: i32) -> OwnedPriorityPermit {
        self.reserve(priority).await;
        OwnedPriorityPermit { semaphore: self }
    }

    async fn reserve(&self, priority: i32) {
        loop {
            let rx = {
                let mut state = self.lock();
                if state.permits > 0 && state.waiters.is_empty() {
                    state.permits -= 1;
                    return;
                }
                let (wake, rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiters.push(Waiter {
                    priority,
                    seq,
                    wake,
                });
                rx
            };

            let mut pending = PendingAcquire {
                semaphore: self,
                rx,
                granted: false,
            };
            if (&mut pending.rx).await.is_ok() {
                pending.granted = true;
                return;
            }
        }
    }

    /// Take a permit only if one is free and nobody is queued.
    pub fn try_acquire(&self) -> Option<PriorityPermit<'_>> {
        let mut state = self.lock();
        if state.permits > 0 && state.waiters.is_empty() {
            state.permits -= 1;
            Some(PriorityPermit { semaphore: self })
        } else {
            None
        }
    }

    pub fn available_permits(&self) -> usize {
        self.lock().permits
    }

    /// Number of acquisitions currently waiting.
    pub fn queued(&self) -> usize {
        self.lock().waiters.len()
    }

    fn release(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop() {
            // A failed send means the waiter gave up; try the next one.
            if waiter.wake.send(()).is_ok() {
                return;
            }
        }
        state.permits += 1;
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready};

    use super::*;

    #[test]
    fn acquires_up_to_capacity_without_blocking() {
        let sem = PrioritySemaphore::new(2);
        let mut a = task::spawn(sem.acquire(0));
        let mut b = task::spawn(sem.acquire(0));
        let _pa = assert_ready!(a.poll());
        let _pb = assert_ready!(b.poll());
        assert_eq!(sem.available_permits(), 0);

        let mut c = task::spawn(sem.acquire(0));
        assert_pending!(c.poll());
    }

    #[test]
    fn release_wakes_a_waiter() {
        let sem = PrioritySemaphore::new(1);
        let held = sem.try_acquire().unwrap();

        let mut waiter = task::spawn(sem.acquire(3));
        assert_pending!(waiter.poll());

        drop(held);
        assert!(waiter.is_woken());
        let _permit = assert_ready!(waiter.poll());
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn lower_priority_value_is_served_first() {
        let sem = PrioritySemaphore::new(1);
        let held = sem.try_acquire().unwrap();

        let mut low = task::spawn(sem.acquire(5));
        assert_pending!(low.poll());
        let mut high = task::spawn(sem.acquire(1));
        assert_pending!(high.poll());

        drop(held);
        assert!(high.is_woken());
        assert!(!low.is_woken());
        let permit = assert_ready!(high.poll());
        assert_pending!(low.poll());

        drop(permit);
        assert!(low.is_woken());
        let _permit = assert_ready!(low.poll());
    }

    #[test]
    fn equal_priorities_are_fifo() {
        let sem = PrioritySemaphore::new(1);
        let held = sem.try_acquire().unwrap();

        let mut first = task::spawn(sem.acquire(2));
        let mut second = task::spawn(sem.acquire(2));
        let mut third = task::spawn(sem.acquire(2));
        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert_pending!(third.poll());

        drop(held);
        let p1 = assert_ready!(first.poll());
        assert_pending!(second.poll());
        assert_pending!(third.poll());

        drop(p1);
        let p2 = assert_ready!(second.poll());
        assert_pending!(third.poll());

        drop(p2);
        let _p3 = assert_ready!(third.poll());
    }

    #[test]
    fn newcomer_cannot_jump_the_queue() {
        let sem = PrioritySemaphore::new(1);
        let held = sem.try_acquire().unwrap();
        let mut queued = task::spawn(sem.acquire(0));
        assert_pending!(queued.poll());

        drop(held);
        // The permit went straight to the queued waiter.
        assert!(sem.try_acquire().is_none());
        let _permit = assert_ready!(queued.poll());
    }

    #[test]
    fn abandoned_waiter_is_skipped() {
        let sem = PrioritySemaphore::new(1);
        let held = sem.try_acquire().unwrap();

        let mut gone = task::spawn(sem.acquire(0));
        assert_pending!(gone.poll());
        let mut next = task::spawn(sem.acquire(1));
        assert_pending!(next.poll());

        assert_eq!(sem.queued(), 2);

        drop(gone);
        assert_eq!(sem.queued(), 1);
        drop(held);
        let _permit = assert_ready!(next.poll());
        assert_eq!(sem.queued(), 0);
    }

    #[test]
    fn permit_granted_to_dropped_waiter_is_not_leaked() {
        let sem = PrioritySemaphore::new(1);
        let held = sem.try_acquire().unwrap();

        let mut waiter = task::spawn(sem.acquire(0));
        assert_pending!(waiter.poll());
        drop(held);
        // Granted but never polled again.
        drop(waiter);

        assert_eq!(sem.available_permits(), 1);
        assert!(sem.try_acquire().is_some());
    }

    #[test]
    fn owned_permit_outlives_the_borrow() {
        let sem = Arc::new(PrioritySemaphore::new(1));
        let mut first = task::spawn(Arc::clone(&sem).acquire_owned(0));
        let permit = assert_ready!(first.poll());

        let mut second = task::spawn(Arc::clone(&sem).acquire_owned(0));
        assert_pending!(second.poll());

        let moved = std::thread::spawn(move || drop(permit));
        moved.join().unwrap();
        assert!(second.is_woken());
        let _permit = assert_ready!(second.poll());
        assert_eq!(sem.available_permits(), 0);
    }
}
