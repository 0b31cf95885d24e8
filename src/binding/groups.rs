// Per-pass group tracking
//
// Holds the group currently bound for each category and rebuilds the dirty
// ones right before a dispatch is recorded.

use super::{BindingCategory, GroupDriver, GroupHandle, PipelineLayouts, PoolManager};
use crate::compute_pass::{DirtyFlags, PassBindings};
use crate::error::Result;

pub struct PassGroups<D: GroupDriver> {
    current: [Option<(GroupHandle, D::Group)>; 3],
    retired: Vec<GroupHandle>,
}

impl<D: GroupDriver> Default for PassGroups<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: GroupDriver> PassGroups<D> {
    pub fn new() -> Self {
        Self {
            current: [None, None, None],
            retired: Vec::new(),
        }
    }

    /// Group bound for `category`, if its layout has any bindings
    pub fn current(&self, category: BindingCategory) -> Option<&D::Group> {
        self.current[category as usize].as_ref().map(|(_, g)| g)
    }

    /// Replace every dirty group with a freshly written one.
    ///
    /// All resources are gathered before any pool is touched, so a missing
    /// binding leaves groups and dirty flags as they were.
    pub fn rebuild(
        &mut self,
        driver: &D,
        pools: &PoolManager<D>,
        layouts: &PipelineLayouts<D>,
        bindings: &PassBindings,
        dirty: &mut DirtyFlags,
    ) -> Result<()> {
        let mut pending = Vec::with_capacity(3);
        for category in BindingCategory::ALL {
            if !dirty.contains(DirtyFlags::of(category)) {
                continue;
            }
            let layout = &layouts[category as usize];
            let resources = if layout.signature.is_empty() {
                None
            } else {
                Some(bindings.resources_for(category, &layout.signature)?)
            };
            pending.push((category, resources));
        }

        for (category, resources) in pending {
            let slot = category as usize;
            if let Some((handle, _)) = self.current[slot].take() {
                self.retire(pools, handle)?;
            }

            if let Some(resources) = resources {
                let layout = &layouts[slot];
                let handle = pools.request_group(driver, layout)?;
                let group = match pools.write_group(driver, handle, layout, &resources) {
                    Ok(group) => group,
                    Err(e) => {
                        pools.return_group(handle)?;
                        return Err(e);
                    }
                };
                self.current[slot] = Some((handle, group));
            }
            dirty.remove(DirtyFlags::of(category));
        }
        Ok(())
    }

    fn retire(&mut self, pools: &PoolManager<D>, handle: GroupHandle) -> Result<()> {
        if D::DEFERRED_RECYCLE {
            self.retired.push(handle);
            Ok(())
        } else {
            pools.return_group(handle)
        }
    }

    /// Give up every current group, as when a pass ends.
    ///
    /// Every slot is cleared even if one of them fails; the first error is
    /// reported.
    pub fn retire_all(&mut self, pools: &PoolManager<D>) -> Result<()> {
        let mut first_error = None;
        for slot in 0..self.current.len() {
            if let Some((handle, _)) = self.current[slot].take() {
                if let Err(e) = self.retire(pools, handle) {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Return deferred groups to their pools once native work has finished.
    ///
    /// Every handle is given back before the first error is reported.
    pub fn recycle(&mut self, pools: &PoolManager<D>) -> Result<()> {
        let mut first_error = None;
        for handle in self.retired.drain(..) {
            if let Err(e) = pools.return_group(handle) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::test_driver::CountingDriver;
    use crate::binding::{LayoutCache, LayoutSignature};
    use crate::error::Error;
    use std::thread;

    #[test]
    fn recycle_returns_every_handle_despite_a_failure() {
        let driver = CountingDriver::default();
        let cache = LayoutCache::new();
        let manager = PoolManager::new();
        let layout = cache.get_layout(&driver, LayoutSignature::read_write(0, 1)).unwrap();

        let foreign = thread::scope(|s| {
            s.spawn(|| manager.request_group(&driver, &layout).unwrap())
                .join()
                .unwrap()
        });
        let own: Vec<GroupHandle> = (0..3)
            .map(|_| manager.request_group(&driver, &layout).unwrap())
            .collect();

        let mut groups = PassGroups::<CountingDriver>::new();
        groups.retired.push(foreign);
        groups.retired.extend(own.iter().copied());

        assert_eq!(groups.recycle(&manager), Err(Error::InvalidInternalPointer));
        assert_eq!(groups.retired_count(), 0);

        let pools = manager.pools_of(thread::current().id());
        assert_eq!(pools.len(), 1);
        manager
            .inspect(pools[0], |pool| {
                assert_eq!(pool.used_count(), 0);
                assert_eq!(pool.free_count(), 3);
            })
            .unwrap();
        manager.destroy(&driver);
        cache.destroy(&driver);
    }
}
