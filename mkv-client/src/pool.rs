//! # Resource Pool
//!
//! Purpose: Own a reentrant, thread-safe pool of opaque per-node resources
//! (transports) with claim/release tracking and destroy-on-error semantics.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep reusable resources; build new ones on
//!    demand instead of blocking a caller that finds none free.
//! 2. **RAII Release**: The guard returns or destroys its resource on every
//!    exit path, including panics.
//! 3. **Minimal Locking**: The mutex covers membership and claim flags only;
//!    the factory runs unlocked because connecting can be slow.
//! 4. **Coordinated Teardown**: `clear` sweeps a membership snapshot, waiting
//!    on a condvar for claimed members to come home.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use mkv_common::Result;

type Factory<T> = dyn Fn() -> Result<T> + Send + Sync;
type CloseFn<T> = dyn Fn(T) + Send + Sync;

/// One pool member. `object` is `None` exactly while the member is claimed:
/// the live value travels inside the guard that claimed it.
struct Slot<T> {
    id: u64,
    object: Option<T>,
    claimed: bool,
}

struct PoolInner<T> {
    slots: Vec<Slot<T>>,
    next_id: u64,
}

struct Shared<T> {
    inner: Mutex<PoolInner<T>>,
    freed: Condvar,
    factory: Box<Factory<T>>,
    close: Box<CloseFn<T>>,
    max_idle: usize,
}

/// Thread-safe pool of reusable resources.
///
/// Acquisition is reentrant: a thread already holding a claimed resource that
/// acquires again receives a different one (another free member or a fresh
/// build), never the one it holds, and never deadlocks.
pub struct Pool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool { shared: Arc::clone(&self.shared) }
    }
}

impl<T> Pool<T> {
    /// Creates a pool with no idle cap.
    pub fn new<F, C>(factory: F, close: C) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        Self::with_max_idle(usize::MAX, factory, close)
    }

    /// Creates a pool that destroys resources released while `max_idle`
    /// members are already free. Acquisition still never blocks.
    pub fn with_max_idle<F, C>(max_idle: usize, factory: F, close: C) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        Pool {
            shared: Arc::new(Shared {
                inner: Mutex::new(PoolInner { slots: Vec::new(), next_id: 0 }),
                freed: Condvar::new(),
                factory: Box::new(factory),
                close: Box::new(close),
                max_idle,
            }),
        }
    }

    /// Acquires any free resource, building a new one when none is free.
    pub fn acquire(&self) -> Result<PooledResource<T>> {
        self.acquire_where(|_| true)
    }

    /// Acquires the first free resource accepted by `filter`, building a new
    /// one (via the factory) when no free member qualifies.
    pub fn acquire_where<F>(&self, filter: F) -> Result<PooledResource<T>>
    where
        F: Fn(&T) -> bool,
    {
        {
            let mut inner = lock(&self.shared.inner);
            for slot in inner.slots.iter_mut() {
                if slot.claimed {
                    continue;
                }
                let accepted = slot.object.as_ref().map(&filter).unwrap_or(false);
                if accepted {
                    slot.claimed = true;
                    let object = slot.object.take();
                    let id = slot.id;
                    return Ok(self.guard(id, object));
                }
            }
        }

        // No free match; build outside the lock.
        let object = (self.shared.factory)()?;
        Ok(self.adopt(object))
    }

    /// Adopts `object` as a new claimed member, bypassing the factory.
    /// Useful for tests and for callers that already built a resource.
    pub fn acquire_seeded(&self, object: T) -> PooledResource<T> {
        self.adopt(object)
    }

    /// Scoped acquisition: acquire, run `f`, release (or destroy when marked
    /// bad) no matter how `f` exits.
    pub fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut PooledResource<T>) -> Result<R>,
    {
        let mut resource = self.acquire()?;
        f(&mut resource)
    }

    /// Destroys every member known when the sweep began, waiting for claimed
    /// members to be released. Terminates provided holders eventually release.
    pub fn clear(&self) {
        let snapshot: Vec<u64> = {
            let inner = lock(&self.shared.inner);
            inner.slots.iter().map(|slot| slot.id).collect()
        };

        for id in snapshot {
            let object = {
                let mut inner = lock(&self.shared.inner);
                loop {
                    let Some(pos) = inner.slots.iter().position(|slot| slot.id == id) else {
                        // destroyed meanwhile by an errored release
                        break None;
                    };
                    if !inner.slots[pos].claimed {
                        break inner.slots.remove(pos).object;
                    }
                    inner = wait(&self.shared.freed, inner);
                }
            };
            if let Some(object) = object {
                (self.shared.close)(object);
            }
        }
    }

    /// Current member count, claimed and free alike.
    pub fn len(&self) -> usize {
        lock(&self.shared.inner).slots.len()
    }

    /// Whether the pool currently has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn adopt(&self, object: T) -> PooledResource<T> {
        let mut inner = lock(&self.shared.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.push(Slot { id, object: None, claimed: true });
        drop(inner);
        self.guard(id, Some(object))
    }

    fn guard(&self, id: u64, object: Option<T>) -> PooledResource<T> {
        PooledResource {
            shared: Arc::clone(&self.shared),
            id,
            object,
            errored: false,
        }
    }
}

/// Exclusive claim on one pooled resource.
///
/// Dropping the guard releases the resource: back to the free set normally,
/// destroyed (close callback invoked) when it was marked bad or the idle cap
/// is already met.
pub struct PooledResource<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    object: Option<T>,
    errored: bool,
}

impl<T> PooledResource<T> {
    /// Marks the resource unusable; it will be destroyed on release instead
    /// of returning to the free set.
    pub fn mark_bad(&mut self) {
        self.errored = true;
    }

    /// Whether the resource has been marked bad.
    pub fn is_bad(&self) -> bool {
        self.errored
    }
}

impl<T> Deref for PooledResource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // object is Some for the guard's whole lifetime
        self.object.as_ref().expect("pooled resource already released")
    }
}

impl<T> DerefMut for PooledResource<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("pooled resource already released")
    }
}

impl<T> Drop for PooledResource<T> {
    fn drop(&mut self) {
        let Some(object) = self.object.take() else { return };

        let destroyed = {
            let mut inner = lock(&self.shared.inner);
            match inner.slots.iter().position(|slot| slot.id == self.id) {
                Some(pos) if self.errored => {
                    inner.slots.remove(pos);
                    Some(object)
                }
                Some(pos) => {
                    let idle = inner.slots.iter().filter(|slot| !slot.claimed).count();
                    if idle >= self.shared.max_idle {
                        inner.slots.remove(pos);
                        Some(object)
                    } else {
                        let slot = &mut inner.slots[pos];
                        slot.object = Some(object);
                        slot.claimed = false;
                        None
                    }
                }
                // membership was dropped out from under us; just destroy
                None => Some(object),
            }
        };

        self.shared.freed.notify_all();
        if let Some(object) = destroyed {
            (self.shared.close)(object);
        }
    }
}

fn lock<T>(mutex: &Mutex<PoolInner<T>>) -> MutexGuard<'_, PoolInner<T>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn wait<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, PoolInner<T>>,
) -> MutexGuard<'a, PoolInner<T>> {
    match condvar.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Pool whose factory yields 1, 2, 3, ... and whose close callback counts
    /// destructions.
    fn counting_pool(max_idle: usize) -> (Pool<usize>, Arc<AtomicUsize>) {
        let next = AtomicUsize::new(1);
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_in_pool = Arc::clone(&closed);
        let pool = Pool::with_max_idle(
            max_idle,
            move || Ok(next.fetch_add(1, Ordering::SeqCst)),
            move |_| {
                closed_in_pool.fetch_add(1, Ordering::SeqCst);
            },
        );
        (pool, closed)
    }

    #[test]
    fn test_serial_transactions_reuse_first_resource() {
        let (pool, _) = counting_pool(usize::MAX);
        let first = pool.transaction(|res| Ok(**res)).expect("txn");
        let second = pool.transaction(|res| Ok(**res)).expect("txn");
        assert_eq!(first, 1);
        assert_eq!(second, 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_nested_transactions_get_distinct_resources() {
        let (pool, _) = counting_pool(usize::MAX);
        let (outer, inner) = pool
            .transaction(|outer| {
                let outer_value = **outer;
                let inner_value = pool.transaction(|inner| Ok(**inner))?;
                Ok((outer_value, inner_value))
            })
            .expect("txn");
        assert_eq!(outer, 1);
        assert_eq!(inner, 2);
    }

    #[test]
    fn test_mark_bad_removes_member_for_good() {
        let (pool, closed) = counting_pool(usize::MAX);
        {
            let mut res = pool.acquire().expect("acquire");
            assert_eq!(*res, 1);
            res.mark_bad();
            assert!(res.is_bad());
        }
        assert_eq!(pool.len(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        // the destroyed identity is never handed out again
        let res = pool.acquire().expect("acquire");
        assert_eq!(*res, 2);
    }

    #[test]
    fn test_panicking_transaction_still_releases() {
        let (pool, closed) = counting_pool(usize::MAX);
        let result = catch_unwind(AssertUnwindSafe(|| {
            pool.transaction(|_res| -> Result<()> { panic!("caller blew up") })
        }));
        assert!(result.is_err());
        assert_eq!(pool.len(), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        // the released member is reusable
        let res = pool.acquire().expect("acquire");
        assert_eq!(*res, 1);
    }

    #[test]
    fn test_acquire_where_skips_filtered_members() {
        let (pool, _) = counting_pool(usize::MAX);
        drop(pool.acquire().expect("acquire")); // member 1 now free
        let res = pool.acquire_where(|value| *value != 1).expect("acquire");
        assert_eq!(*res, 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_acquire_seeded_bypasses_factory() {
        let (pool, _) = counting_pool(usize::MAX);
        let res = pool.acquire_seeded(99);
        assert_eq!(*res, 99);
        drop(res);
        // the seeded member is pooled like any other
        let res = pool.acquire().expect("acquire");
        assert_eq!(*res, 99);
    }

    #[test]
    fn test_max_idle_trims_on_release() {
        let (pool, closed) = counting_pool(1);
        let first = pool.acquire().expect("acquire");
        let second = pool.acquire().expect("acquire");
        drop(first);
        drop(second);
        assert_eq!(pool.len(), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_resource_claimed_twice_under_contention() {
        let pool = Pool::new(
            || Ok(Arc::new(AtomicBool::new(false))),
            |_: Arc<AtomicBool>| {},
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let res = pool.acquire().expect("acquire");
                    let was_claimed = res.swap(true, Ordering::SeqCst);
                    assert!(!was_claimed, "resource observed claimed twice");
                    res.store(false, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
    }

    #[test]
    fn test_clear_waits_for_claimed_members() {
        let (pool, closed) = counting_pool(usize::MAX);
        let held_a = pool.acquire().expect("acquire");
        let held_b = pool.acquire().expect("acquire");
        drop(pool.acquire().expect("acquire")); // third member, already free
        assert_eq!(pool.len(), 3);

        let sweeper = {
            let pool = pool.clone();
            thread::spawn(move || pool.clear())
        };

        thread::sleep(Duration::from_millis(30));
        drop(held_a);
        thread::sleep(Duration::from_millis(10));
        drop(held_b);
        sweeper.join().expect("join");

        assert_eq!(pool.len(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_clear_ignores_members_created_after_snapshot() {
        let (pool, closed) = counting_pool(usize::MAX);
        let held = pool.acquire().expect("acquire");

        let sweeper = {
            let pool = pool.clone();
            thread::spawn(move || pool.clear())
        };

        thread::sleep(Duration::from_millis(20));
        // created after the sweep snapshot; must survive
        let late = pool.acquire().expect("acquire");
        drop(held);
        sweeper.join().expect("join");

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        drop(late);
        assert_eq!(pool.len(), 1);
    }
}
