// Thread-affine bind-group pools
//
// Native binding objects are expensive to allocate and often unsafe to share
// between threads, so each thread recycles groups through its own pools.
// A pool holds at most POOL_CAPACITY groups; a saturated pool is never an
// error, the manager simply opens another pool for that thread.

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::thread::{self, ThreadId};

use super::{GroupDriver, GroupResources, Layout, LayoutId};
use crate::error::{Error, Result};

/// Number of groups one pool can allocate
pub const POOL_CAPACITY: usize = 128;

new_key_type! {
    /// Group slot inside one pool
    pub struct GroupKey;
    /// Pool slot inside a manager
    pub struct PoolKey;
}

/// Where a requested group lives. Only valid on the thread that requested it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupHandle {
    pub pool: PoolKey,
    pub group: GroupKey,
}

struct GroupEntry<G> {
    layout: LayoutId,
    group: G,
    in_use: bool,
}

pub struct Pool<D: GroupDriver> {
    thread_id: ThreadId,
    raw: D::Pool,
    groups: SlotMap<GroupKey, GroupEntry<D::Group>>,
    free: Vec<GroupKey>,
    allocations: usize,
}

impl<D: GroupDriver> Pool<D> {
    fn new(raw: D::Pool, thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            raw,
            groups: SlotMap::with_key(),
            free: Vec::new(),
            allocations: 0,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn allocations(&self) -> usize {
        self.allocations
    }

    fn free_slot_for(&self, layout: LayoutId) -> Option<usize> {
        self.free
            .iter()
            .position(|key| self.groups[*key].layout == layout)
    }

    /// A pool can serve a layout if a matching group is free or capacity remains
    pub fn can_serve(&self, layout: LayoutId) -> bool {
        self.allocations < POOL_CAPACITY || self.free_slot_for(layout).is_some()
    }

    fn request(&mut self, driver: &D, layout: &Layout<D>) -> Result<GroupKey> {
        if let Some(index) = self.free_slot_for(layout.id) {
            let key = self.free.swap_remove(index);
            self.groups[key].in_use = true;
            return Ok(key);
        }

        if self.allocations >= POOL_CAPACITY {
            return Err(Error::DeviceAllocationFailed);
        }

        let group = driver.allocate_group(&mut self.raw, layout)?;
        self.allocations += 1;
        Ok(self.groups.insert(GroupEntry {
            layout: layout.id,
            group,
            in_use: true,
        }))
    }

    fn give_back(&mut self, key: GroupKey) -> Result<()> {
        match self.groups.get_mut(key) {
            Some(entry) if entry.in_use => {
                entry.in_use = false;
                self.free.push(key);
                Ok(())
            }
            _ => Err(Error::InvalidInternalPointer),
        }
    }

    pub fn is_used(&self, key: GroupKey) -> bool {
        self.groups.get(key).map_or(false, |e| e.in_use)
    }

    pub fn is_free(&self, key: GroupKey) -> bool {
        self.free.contains(&key)
    }

    pub fn used_count(&self) -> usize {
        self.groups.values().filter(|e| e.in_use).count()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn group_keys(&self) -> impl Iterator<Item = GroupKey> + '_ {
        self.groups.keys()
    }
}

/// Per-device owner of every thread's pools
pub struct PoolManager<D: GroupDriver> {
    pools: Mutex<SlotMap<PoolKey, Pool<D>>>,
}

impl<D: GroupDriver> Default for PoolManager<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: GroupDriver> PoolManager<D> {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(SlotMap::with_key()),
        }
    }

    /// Hand out a group for `layout` from one of the calling thread's pools
    pub fn request_group(&self, driver: &D, layout: &Layout<D>) -> Result<GroupHandle> {
        let thread_id = thread::current().id();
        let mut pools = self.pools.lock();

        let existing = pools
            .iter()
            .find(|(_, pool)| pool.thread_id == thread_id && pool.can_serve(layout.id))
            .map(|(key, _)| key);

        let pool_key = match existing {
            Some(key) => key,
            None => {
                let raw = driver.create_pool()?;
                let key = pools.insert(Pool::new(raw, thread_id));
                log::debug!("Opened bind group pool {:?} for thread {:?}", key, thread_id);
                key
            }
        };

        let group = pools[pool_key].request(driver, layout)?;
        Ok(GroupHandle {
            pool: pool_key,
            group,
        })
    }

    /// Fill the group with resources and return a copy for recording
    pub fn write_group(
        &self,
        driver: &D,
        handle: GroupHandle,
        layout: &Layout<D>,
        resources: &GroupResources,
    ) -> Result<D::Group> {
        let mut pools = self.pools.lock();
        let pool = Self::owned_pool(&mut pools, handle.pool)?;
        let entry = pool
            .groups
            .get_mut(handle.group)
            .ok_or(Error::InvalidInternalPointer)?;
        driver.write_group(&mut entry.group, layout, resources)?;
        Ok(entry.group.clone())
    }

    pub fn return_group(&self, handle: GroupHandle) -> Result<()> {
        let mut pools = self.pools.lock();
        Self::owned_pool(&mut pools, handle.pool)?.give_back(handle.group)
    }

    fn owned_pool(
        pools: &mut SlotMap<PoolKey, Pool<D>>,
        key: PoolKey,
    ) -> Result<&mut Pool<D>> {
        let pool = pools.get_mut(key).ok_or(Error::InvalidInternalPointer)?;
        if pool.thread_id != thread::current().id() {
            log::error!("Bind group pool {:?} touched from a foreign thread", key);
            return Err(Error::InvalidInternalPointer);
        }
        Ok(pool)
    }

    /// Pools opened by the given thread
    pub fn pools_of(&self, thread_id: ThreadId) -> Vec<PoolKey> {
        self.pools
            .lock()
            .iter()
            .filter(|(_, pool)| pool.thread_id == thread_id)
            .map(|(key, _)| key)
            .collect()
    }

    /// Run `f` against one pool, for inspection
    pub fn inspect<R>(&self, key: PoolKey, f: impl FnOnce(&Pool<D>) -> R) -> Option<R> {
        self.pools.lock().get(key).map(f)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Destroy every pool and the groups in them
    pub fn destroy(&self, driver: &D) {
        for (_, mut pool) in self.pools.lock().drain() {
            driver.destroy_pool(&mut pool.raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::test_driver::CountingDriver;
    use crate::binding::{LayoutCache, LayoutSignature};
    use std::collections::HashSet;

    fn setup() -> (CountingDriver, LayoutCache<CountingDriver>, PoolManager<CountingDriver>) {
        (CountingDriver::default(), LayoutCache::new(), PoolManager::new())
    }

    fn check_partition(manager: &PoolManager<CountingDriver>, key: PoolKey, ever: &HashSet<GroupKey>) {
        manager
            .inspect(key, |pool| {
                let all: HashSet<GroupKey> = pool.group_keys().collect();
                assert_eq!(&all, ever);
                for group in all {
                    assert!(pool.is_used(group) != pool.is_free(group));
                }
            })
            .unwrap();
    }

    #[test]
    fn groups_are_recycled_per_layout() {
        let (driver, cache, manager) = setup();
        let read = cache.get_layout(&driver, LayoutSignature::read_only(0, 1)).unwrap();
        let write = cache.get_layout(&driver, LayoutSignature::read_write(0, 1)).unwrap();

        let a = manager.request_group(&driver, &read).unwrap();
        manager.return_group(a).unwrap();

        // A free group of another layout is not reused
        let b = manager.request_group(&driver, &write).unwrap();
        assert_ne!(a.group, b.group);

        let c = manager.request_group(&driver, &read).unwrap();
        assert_eq!(a, c);
        assert_eq!(driver.groups_allocated(), 2);
    }

    #[test]
    fn used_and_free_partition_every_allocated_group() {
        let (driver, cache, manager) = setup();
        let layouts = [
            cache.get_layout(&driver, LayoutSignature::read_only(0, 1)).unwrap(),
            cache.get_layout(&driver, LayoutSignature::read_write(1, 0)).unwrap(),
            cache.get_layout(&driver, LayoutSignature::uniform(1)).unwrap(),
        ];

        let mut ever = HashSet::new();
        let mut held = Vec::new();
        for round in 0..40usize {
            let layout = &layouts[round % 3];
            let handle = manager.request_group(&driver, layout).unwrap();
            ever.insert(handle.group);
            held.push(handle);
            if round % 4 == 3 {
                let back = held.remove(round % held.len());
                manager.return_group(back).unwrap();
            }
            check_partition(&manager, handle.pool, &ever);
        }

        // Returning twice is rejected and changes nothing
        let handle = held.pop().unwrap();
        manager.return_group(handle).unwrap();
        assert_eq!(manager.return_group(handle), Err(Error::InvalidInternalPointer));
        check_partition(&manager, handle.pool, &ever);
    }

    #[test]
    fn saturated_pool_grows_a_new_one() {
        let (driver, cache, manager) = setup();
        let layout = cache.get_layout(&driver, LayoutSignature::read_only(0, 1)).unwrap();

        let handles: Vec<_> = (0..POOL_CAPACITY + 1)
            .map(|_| manager.request_group(&driver, &layout).unwrap())
            .collect();

        let pools = manager.pools_of(thread::current().id());
        assert_eq!(pools.len(), 2);
        assert_eq!(handles[0].pool, handles[POOL_CAPACITY - 1].pool);
        assert_ne!(handles[0].pool, handles[POOL_CAPACITY].pool);
        assert_eq!(
            manager.inspect(handles[0].pool, |p| p.allocations()),
            Some(POOL_CAPACITY)
        );

        // A full pool still serves its own free groups
        manager.return_group(handles[3]).unwrap();
        let again = manager.request_group(&driver, &layout).unwrap();
        assert_eq!(again, handles[3]);
    }

    #[test]
    fn pools_are_thread_affine() {
        let (driver, cache, manager) = setup();
        let layout = cache.get_layout(&driver, LayoutSignature::read_write(0, 1)).unwrap();

        let (a, a_thread) = thread::scope(|s| {
            s.spawn(|| {
                let handle = manager.request_group(&driver, &layout).unwrap();
                (handle, thread::current().id())
            })
            .join()
            .unwrap()
        });
        let (b, b_thread, foreign_return) = thread::scope(|s| {
            s.spawn(|| {
                let handle = manager.request_group(&driver, &layout).unwrap();
                let foreign = manager.return_group(a);
                (handle, thread::current().id(), foreign)
            })
            .join()
            .unwrap()
        });

        assert_ne!(a.pool, b.pool);
        assert_eq!(foreign_return, Err(Error::InvalidInternalPointer));
        assert_eq!(manager.pools_of(a_thread), vec![a.pool]);
        assert_eq!(manager.pools_of(b_thread), vec![b.pool]);
        manager
            .inspect(b.pool, |pool| {
                assert_eq!(pool.thread_id(), b_thread);
                assert_eq!(pool.used_count(), 1);
                assert_eq!(pool.free_count(), 0);
            })
            .unwrap();
        manager
            .inspect(a.pool, |pool| {
                assert_eq!(pool.thread_id(), a_thread);
                assert!(pool.is_used(a.group));
            })
            .unwrap();
    }

    #[test]
    fn write_group_copies_resources() {
        let (driver, cache, manager) = setup();
        let layout = cache.get_layout(&driver, LayoutSignature::read_only(0, 2)).unwrap();
        let handle = manager.request_group(&driver, &layout).unwrap();
        let resources = GroupResources::default();
        let group = manager.write_group(&driver, handle, &layout, &resources).unwrap();
        assert_eq!(group.writes, 1);
        manager.destroy(&driver);
        assert_eq!(manager.pool_count(), 0);
        assert_eq!(driver.pools_destroyed(), 1);
    }
}
