// Binding layout cache
//
// Interns per-category binding shapes so identical shapes share one
// driver-level layout object. Layouts live as long as their device.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use super::GroupDriver;
use crate::error::Result;

/// The three disjoint groups a pipeline's resource bindings fall into.
/// The discriminant is the descriptor set index used by shaders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingCategory {
    ReadOnly = 0,
    ReadWrite = 1,
    Uniform = 2,
}

impl BindingCategory {
    pub const ALL: [BindingCategory; 3] = [
        BindingCategory::ReadOnly,
        BindingCategory::ReadWrite,
        BindingCategory::Uniform,
    ];

    pub fn set_index(self) -> u32 {
        self as u32
    }
}

/// Resource counts describing one binding layout
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LayoutSignature {
    pub read_buffers: u32,
    pub read_images: u32,
    pub write_buffers: u32,
    pub write_images: u32,
    pub uniforms: u32,
}

impl LayoutSignature {
    pub fn read_only(images: u32, buffers: u32) -> Self {
        Self {
            read_images: images,
            read_buffers: buffers,
            ..Default::default()
        }
    }

    pub fn read_write(images: u32, buffers: u32) -> Self {
        Self {
            write_images: images,
            write_buffers: buffers,
            ..Default::default()
        }
    }

    pub fn uniform(buffers: u32) -> Self {
        Self {
            uniforms: buffers,
            ..Default::default()
        }
    }

    pub fn category(&self) -> BindingCategory {
        if self.uniforms > 0 {
            BindingCategory::Uniform
        } else if self.write_buffers > 0 || self.write_images > 0 {
            BindingCategory::ReadWrite
        } else {
            BindingCategory::ReadOnly
        }
    }

    /// (images, buffers) bound through a layout of this shape.
    /// Images always come first in binding order.
    pub fn binding_counts(&self) -> (u32, u32) {
        match self.category() {
            BindingCategory::ReadOnly => (self.read_images, self.read_buffers),
            BindingCategory::ReadWrite => (self.write_images, self.write_buffers),
            BindingCategory::Uniform => (0, self.uniforms),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == LayoutSignature::default()
    }
}

/// Identifier of a layout inside its cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutId(pub u32);

pub struct Layout<D: GroupDriver + ?Sized> {
    pub id: LayoutId,
    pub signature: LayoutSignature,
    pub category: BindingCategory,
    pub raw: D::Layout,
}

impl<D: GroupDriver + ?Sized> fmt::Debug for Layout<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layout")
            .field("id", &self.id)
            .field("signature", &self.signature)
            .field("category", &self.category)
            .finish()
    }
}

/// One cache per device
pub struct LayoutCache<D: GroupDriver> {
    layouts: Mutex<Vec<Arc<Layout<D>>>>,
}

impl<D: GroupDriver> Default for LayoutCache<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: GroupDriver> LayoutCache<D> {
    pub fn new() -> Self {
        Self {
            layouts: Mutex::new(Vec::new()),
        }
    }

    /// Exact-match lookup, creating the layout on a miss
    pub fn get_layout(&self, driver: &D, signature: LayoutSignature) -> Result<Arc<Layout<D>>> {
        let mut layouts = self.layouts.lock();
        if let Some(layout) = layouts.iter().find(|l| l.signature == signature) {
            return Ok(layout.clone());
        }

        let category = signature.category();
        let raw = driver.create_layout(&signature, category)?;
        let layout = Arc::new(Layout {
            id: LayoutId(layouts.len() as u32),
            signature,
            category,
            raw,
        });
        log::debug!("New binding layout {:?} ({:?})", layout.id, signature);
        layouts.push(layout.clone());
        Ok(layout)
    }

    pub fn len(&self) -> usize {
        self.layouts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every driver layout. Only called while the device shuts down.
    pub fn destroy(&self, driver: &D) {
        for layout in self.layouts.lock().drain(..) {
            driver.destroy_layout(&layout.raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::test_driver::CountingDriver;

    #[test]
    fn category_selection() {
        assert_eq!(LayoutSignature::read_only(1, 2).category(), BindingCategory::ReadOnly);
        assert_eq!(LayoutSignature::read_write(0, 1).category(), BindingCategory::ReadWrite);
        assert_eq!(LayoutSignature::uniform(1).category(), BindingCategory::Uniform);
        assert_eq!(LayoutSignature::default().category(), BindingCategory::ReadOnly);

        let mixed = LayoutSignature {
            read_buffers: 1,
            write_buffers: 1,
            uniforms: 1,
            ..Default::default()
        };
        assert_eq!(mixed.category(), BindingCategory::Uniform);
    }

    #[test]
    fn identical_signatures_share_one_layout() {
        let driver = CountingDriver::default();
        let cache = LayoutCache::new();

        let a = cache.get_layout(&driver, LayoutSignature::read_write(0, 1)).unwrap();
        let b = cache.get_layout(&driver, LayoutSignature::read_write(0, 1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(driver.layouts_created(), 1);

        let c = cache.get_layout(&driver, LayoutSignature::read_write(1, 1)).unwrap();
        let d = cache.get_layout(&driver, LayoutSignature::read_only(0, 1)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(!Arc::ptr_eq(&a, &d));
        assert_ne!(a.id, c.id);
        assert_eq!(cache.len(), 3);
        assert_eq!(driver.layouts_created(), 3);
    }

    #[test]
    fn destroy_releases_all_layouts() {
        let driver = CountingDriver::default();
        let cache = LayoutCache::new();
        cache.get_layout(&driver, LayoutSignature::uniform(2)).unwrap();
        cache.get_layout(&driver, LayoutSignature::read_only(1, 0)).unwrap();
        cache.destroy(&driver);
        assert!(cache.is_empty());
        assert_eq!(driver.layouts_destroyed(), 2);
    }
}
