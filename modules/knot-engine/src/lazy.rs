//! Reference-counted lazy resource.
//!
//! The resource is opened when the first lease is taken and dropped when the
//! last lease is returned. A later lease opens it again. Counting and the
//! open/close transitions happen under one lock, so two observers attaching
//! and detaching at the same time cannot race each other.
//!
//! The factory may be installed after leases were handed out (`arm`). This
//! is how a composite knot lets observers attach before it is composed.
//! `disarm` is terminal: once disarmed, nothing opens again, even if `arm`
//! is called afterwards.

use std::sync::Arc;

use parking_lot::Mutex;

type Factory<R> = Box<dyn Fn() -> R + Send + Sync>;

pub struct SharedLazy<R> {
    slot: Mutex<Slot<R>>,
}

struct Slot<R> {
    holders: usize,
    factory: Option<Factory<R>>,
    live: Option<R>,
    retired: bool,
}

impl<R: Send + 'static> SharedLazy<R> {
    /// A lazy resource without a factory yet. Leases are counted but nothing
    /// opens until [`arm`](Self::arm) is called.
    pub fn unarmed() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot {
                holders: 0,
                factory: None,
                live: None,
                retired: false,
            }),
        })
    }

    pub fn new(factory: impl Fn() -> R + Send + Sync + 'static) -> Arc<Self> {
        let lazy = Self::unarmed();
        lazy.arm(factory);
        lazy
    }

    /// Installs the factory. Opens the resource right away if leases are
    /// already held. Ignored after [`disarm`](Self::disarm).
    pub fn arm(&self, factory: impl Fn() -> R + Send + Sync + 'static) {
        let mut slot = self.slot.lock();
        if slot.retired {
            return;
        }
        if slot.holders > 0 && slot.live.is_none() {
            slot.live = Some(factory());
        }
        slot.factory = Some(Box::new(factory));
    }

    /// Drops the factory and the live resource. Outstanding leases stay
    /// valid but nothing opens again.
    pub fn disarm(&self) {
        let closed = {
            let mut slot = self.slot.lock();
            slot.retired = true;
            slot.factory = None;
            slot.live.take()
        };
        drop(closed);
    }

    pub fn acquire(self: &Arc<Self>) -> Lease<R> {
        let mut guard = self.slot.lock();
        let slot = &mut *guard;
        slot.holders += 1;
        if slot.holders == 1 && slot.live.is_none() {
            if let Some(factory) = &slot.factory {
                slot.live = Some(factory());
            }
        }
        Lease {
            owner: Arc::clone(self),
        }
    }

    fn release(&self) {
        let closed = {
            let mut slot = self.slot.lock();
            slot.holders = slot.holders.saturating_sub(1);
            if slot.holders == 0 {
                slot.live.take()
            } else {
                None
            }
        };
        drop(closed);
    }

    pub fn holders(&self) -> usize {
        self.slot.lock().holders
    }

    pub fn is_live(&self) -> bool {
        self.slot.lock().live.is_some()
    }
}

/// One counted holder of a [`SharedLazy`]. Returned on drop.
pub struct Lease<R: Send + 'static> {
    owner: Arc<SharedLazy<R>>,
}

impl<R: Send + 'static> Drop for Lease<R> {
    fn drop(&mut self) {
        self.owner.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked() -> (Arc<SharedLazy<Tracked>>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (o, c) = (opened.clone(), closed.clone());
        let lazy = SharedLazy::new(move || {
            o.fetch_add(1, Ordering::SeqCst);
            Tracked(c.clone())
        });
        (lazy, opened, closed)
    }

    #[test]
    fn opens_on_first_and_closes_on_last() {
        let (lazy, opened, closed) = tracked();
        assert_eq!(opened.load(Ordering::SeqCst), 0);

        let first = lazy.acquire();
        let second = lazy.acquire();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.holders(), 2);

        drop(first);
        assert!(lazy.is_live());
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        drop(second);
        assert!(!lazy.is_live());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let _again = lazy.acquire();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn arming_late_opens_for_existing_holders() {
        let lazy = SharedLazy::<u8>::unarmed();
        let lease = lazy.acquire();
        assert!(!lazy.is_live());

        lazy.arm(|| 1);
        assert!(lazy.is_live());

        drop(lease);
        assert!(!lazy.is_live());
    }

    #[test]
    fn disarm_closes_and_stays_closed() {
        let (lazy, opened, closed) = tracked();
        let lease = lazy.acquire();
        lazy.disarm();
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let _other = lazy.acquire();
        drop(lease);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arm_after_disarm_is_ignored() {
        let lazy = SharedLazy::<u8>::unarmed();
        lazy.disarm();

        let held = lazy.acquire();
        lazy.arm(|| 1);
        assert!(!lazy.is_live());

        drop(held);
        let _later = lazy.acquire();
        assert!(!lazy.is_live());
    }

    #[test]
    fn concurrent_leases_open_once() {
        let (lazy, opened, closed) = tracked();
        let anchor = lazy.acquire();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let lazy = lazy.clone();
                scope.spawn(move || {
                    for _ in 0..100 {
                        let _lease = lazy.acquire();
                    }
                });
            }
        });

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        drop(anchor);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
