// CPU bind groups
//
// A group is just the list of backing memories in binding order. Dispatch
// commands keep their own clone, so groups go back to the pool as soon as
// they are replaced.

use std::sync::Arc;

use super::memory::{SoftImage, SoftMemory};
use crate::binding::{BindingCategory, GroupDriver, GroupResources, Layout, LayoutSignature};
use crate::error::Result;

/// Resources of one descriptor set, images first then buffers
#[derive(Clone, Default, Debug)]
pub struct SoftGroup {
    pub images: Vec<Arc<SoftImage>>,
    pub buffers: Vec<Arc<SoftMemory>>,
}

#[derive(Debug, Default)]
pub struct SoftBinder;

impl GroupDriver for SoftBinder {
    type Layout = LayoutSignature;
    type Pool = ();
    type Group = SoftGroup;

    const DEFERRED_RECYCLE: bool = false;

    fn create_layout(&self, signature: &LayoutSignature, _category: BindingCategory) -> Result<LayoutSignature> {
        Ok(*signature)
    }

    fn create_pool(&self) -> Result<()> {
        Ok(())
    }

    fn allocate_group(&self, _pool: &mut (), layout: &Layout<Self>) -> Result<SoftGroup> {
        let (images, buffers) = layout.raw.binding_counts();
        Ok(SoftGroup {
            images: Vec::with_capacity(images as usize),
            buffers: Vec::with_capacity(buffers as usize),
        })
    }

    fn write_group(&self, group: &mut SoftGroup, _layout: &Layout<Self>, resources: &GroupResources) -> Result<()> {
        group.images = resources
            .images
            .iter()
            .map(|image| image.soft().cloned())
            .collect::<Result<_>>()?;
        group.buffers = resources
            .buffers
            .iter()
            .map(|buffer| buffer.soft().cloned())
            .collect::<Result<_>>()?;
        Ok(())
    }
}
