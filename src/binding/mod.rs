// Binding runtime shared by every backend
//
// Layout interning, thread-affine group pools and the per-pass group rebuild
// are written once here. A backend only supplies a `GroupDriver` that knows
// how to create its native layout, pool and group objects.

pub mod groups;
pub mod layout;
pub mod pool;

use std::sync::Arc;

use crate::buffer::BufferInner;
use crate::error::Result;
use crate::image::ImageInner;

pub use groups::PassGroups;
pub use layout::{BindingCategory, Layout, LayoutCache, LayoutId, LayoutSignature};
pub use pool::{GroupHandle, GroupKey, Pool, PoolKey, PoolManager, POOL_CAPACITY};

/// Resources written into one group, images first then buffers
#[derive(Clone, Default)]
pub struct GroupResources {
    pub images: Vec<Arc<ImageInner>>,
    pub buffers: Vec<Arc<BufferInner>>,
}

/// Native side of layouts, pools and groups for one backend
pub trait GroupDriver: Send + Sync {
    type Layout: Send + Sync;
    type Pool: Send;
    type Group: Clone + Send;

    /// Retired groups may still be referenced by recorded native commands,
    /// so they are returned to their pool only once the command list is
    /// released. Backends that copy resources into their commands return
    /// groups immediately.
    const DEFERRED_RECYCLE: bool;

    fn create_layout(&self, signature: &LayoutSignature, category: BindingCategory) -> Result<Self::Layout>;

    fn destroy_layout(&self, _layout: &Self::Layout) {}

    fn create_pool(&self) -> Result<Self::Pool>;

    fn destroy_pool(&self, _pool: &mut Self::Pool) {}

    fn allocate_group(&self, pool: &mut Self::Pool, layout: &Layout<Self>) -> Result<Self::Group>;

    fn write_group(
        &self,
        group: &mut Self::Group,
        layout: &Layout<Self>,
        resources: &GroupResources,
    ) -> Result<()>;
}

/// Layouts of the three descriptor sets of one pipeline, indexed by category
pub type PipelineLayouts<D> = [Arc<Layout<D>>; 3];

/// Build the three per-category layouts for a pipeline's resource counts
pub fn pipeline_layouts<D: GroupDriver>(
    cache: &LayoutCache<D>,
    driver: &D,
    read_only: (u32, u32),
    read_write: (u32, u32),
    uniforms: u32,
) -> Result<PipelineLayouts<D>> {
    Ok([
        cache.get_layout(driver, LayoutSignature::read_only(read_only.0, read_only.1))?,
        cache.get_layout(driver, LayoutSignature::read_write(read_write.0, read_write.1))?,
        cache.get_layout(driver, LayoutSignature::uniform(uniforms))?,
    ])
}

#[cfg(test)]
pub(crate) mod test_driver {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Driver with no native objects, counting every call
    #[derive(Default)]
    pub struct CountingDriver {
        layouts_created: AtomicUsize,
        layouts_destroyed: AtomicUsize,
        groups_allocated: AtomicUsize,
        pools_destroyed: AtomicUsize,
    }

    #[derive(Clone, Debug, Default)]
    pub struct CountingGroup {
        pub writes: usize,
        pub images: usize,
        pub buffers: usize,
    }

    impl CountingDriver {
        pub fn layouts_created(&self) -> usize {
            self.layouts_created.load(Ordering::SeqCst)
        }
        pub fn layouts_destroyed(&self) -> usize {
            self.layouts_destroyed.load(Ordering::SeqCst)
        }
        pub fn groups_allocated(&self) -> usize {
            self.groups_allocated.load(Ordering::SeqCst)
        }
        pub fn pools_destroyed(&self) -> usize {
            self.pools_destroyed.load(Ordering::SeqCst)
        }
    }

    impl GroupDriver for CountingDriver {
        type Layout = ();
        type Pool = ();
        type Group = CountingGroup;

        const DEFERRED_RECYCLE: bool = false;

        fn create_layout(&self, _: &LayoutSignature, _: BindingCategory) -> Result<()> {
            self.layouts_created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn destroy_layout(&self, _: &()) {
            self.layouts_destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn create_pool(&self) -> Result<()> {
            Ok(())
        }

        fn destroy_pool(&self, _: &mut ()) {
            self.pools_destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn allocate_group(&self, _: &mut (), _: &Layout<Self>) -> Result<CountingGroup> {
            self.groups_allocated.fetch_add(1, Ordering::SeqCst);
            Ok(CountingGroup::default())
        }

        fn write_group(
            &self,
            group: &mut CountingGroup,
            _: &Layout<Self>,
            resources: &GroupResources,
        ) -> Result<()> {
            group.writes += 1;
            group.images = resources.images.len();
            group.buffers = resources.buffers.len();
            Ok(())
        }
    }
}
