// CPU-side storage for buffers and images
//
// Memory is a slice of 32-bit atomics so that many workgroup jobs can read
// and write one buffer at once. Byte-granular access goes through CAS on the
// containing word.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::image::TexelBox;
use crate::types::{ImageFormat, ImageType};

pub struct SoftMemory {
    words: Box<[AtomicU32]>,
    len: usize,
}

impl SoftMemory {
    pub fn new(len: usize) -> Result<Self> {
        let count = len.div_ceil(4);
        let mut words = Vec::new();
        words
            .try_reserve_exact(count)
            .map_err(|_| Error::CpuAllocationFailed)?;
        words.resize_with(count, || AtomicU32::new(0));
        Ok(Self {
            words: words.into_boxed_slice(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn in_bounds(&self, offset: usize, size: usize) -> bool {
        offset.checked_add(size).map_or(false, |end| end <= self.len)
    }

    /// Copy bytes out. Out-of-range bytes read as zero.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.read_byte(offset + i);
        }
    }

    pub fn read_vec(&self, offset: usize, size: usize) -> Vec<u8> {
        let mut out = vec![0; size];
        self.read(offset, &mut out);
        out
    }

    /// Copy bytes in. Out-of-range bytes are dropped.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut i = 0;
        while i < data.len() {
            let at = offset + i;
            if at % 4 == 0 && i + 4 <= data.len() && self.in_bounds(at, 4) {
                let word = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
                self.words[at / 4].store(word, Ordering::Relaxed);
                i += 4;
            } else {
                self.write_byte(at, data[i]);
                i += 1;
            }
        }
    }

    fn read_byte(&self, at: usize) -> u8 {
        if at >= self.len {
            return 0;
        }
        self.words[at / 4].load(Ordering::Relaxed).to_le_bytes()[at % 4]
    }

    fn write_byte(&self, at: usize, value: u8) {
        if at >= self.len {
            return;
        }
        let shift = (at % 4) * 8;
        let mask = !(0xffu32 << shift);
        // fetch_update only fails if the closure returns None
        let _ = self.words[at / 4].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |word| {
            Some((word & mask) | ((value as u32) << shift))
        });
    }

    pub fn load_u32(&self, offset: usize) -> u32 {
        if !self.in_bounds(offset, 4) {
            return 0;
        }
        if offset % 4 == 0 {
            return self.words[offset / 4].load(Ordering::Relaxed);
        }
        let mut bytes = [0; 4];
        self.read(offset, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    pub fn store_u32(&self, offset: usize, value: u32) {
        if !self.in_bounds(offset, 4) {
            return;
        }
        if offset % 4 == 0 {
            self.words[offset / 4].store(value, Ordering::Relaxed);
        } else {
            self.write(offset, &value.to_le_bytes());
        }
    }

    /// Atomic read-modify-write on an aligned word, returning the old value
    pub fn update_u32(&self, offset: usize, f: impl Fn(u32) -> u32) -> u32 {
        if !self.in_bounds(offset, 4) || offset % 4 != 0 {
            return 0;
        }
        match self.words[offset / 4].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(f(v))) {
            Ok(old) | Err(old) => old,
        }
    }

    pub fn compare_exchange_u32(&self, offset: usize, current: u32, new: u32) -> u32 {
        if !self.in_bounds(offset, 4) || offset % 4 != 0 {
            return 0;
        }
        match self.words[offset / 4].compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(old) | Err(old) => old,
        }
    }
}

impl std::fmt::Debug for SoftMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftMemory").field("len", &self.len).finish()
    }
}

/// Linear texel storage: x fastest, then y, then layer or depth slice
#[derive(Debug)]
pub struct SoftImage {
    pub memory: SoftMemory,
    pub ty: ImageType,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub layers_or_depth: u32,
}

impl SoftImage {
    pub fn new(
        ty: ImageType,
        format: ImageFormat,
        width: u32,
        height: u32,
        layers_or_depth: u32,
    ) -> Result<Self> {
        let size = width as usize
            * height as usize
            * layers_or_depth.max(1) as usize
            * format.texel_size() as usize;
        Ok(Self {
            memory: SoftMemory::new(size)?,
            ty,
            format,
            width,
            height,
            layers_or_depth: layers_or_depth.max(1),
        })
    }

    pub fn texel_size(&self) -> usize {
        self.format.texel_size() as usize
    }

    /// Byte offset of a texel, or None when outside the image
    pub fn texel_offset(&self, x: u32, y: u32, slice: u32) -> Option<usize> {
        if x >= self.width || y >= self.height || slice >= self.layers_or_depth {
            return None;
        }
        let index = (slice as usize * self.height as usize + y as usize) * self.width as usize + x as usize;
        Some(index * self.texel_size())
    }

    /// Slice index for a region: depth for 3D images, layer otherwise
    fn slice_of(&self, region: &TexelBox, dz: u32) -> u32 {
        match self.ty {
            ImageType::Image3D => region.z + dz,
            _ => region.layer + dz,
        }
    }

    /// Read a region into tightly packed rows
    pub fn read_region(&self, region: &TexelBox) -> Vec<u8> {
        let texel = self.texel_size();
        let mut out = Vec::with_capacity(region.texel_count() * texel);
        for dz in 0..region.depth.max(1) {
            let slice = self.slice_of(region, dz);
            for y in region.y..region.y + region.height {
                for x in region.x..region.x + region.width {
                    match self.texel_offset(x, y, slice) {
                        Some(offset) => out.extend_from_slice(&self.memory.read_vec(offset, texel)),
                        None => out.extend(std::iter::repeat(0).take(texel)),
                    }
                }
            }
        }
        out
    }

    /// Write tightly packed rows into a region
    pub fn write_region(&self, region: &TexelBox, data: &[u8]) {
        let texel = self.texel_size();
        let mut cursor = 0;
        for dz in 0..region.depth.max(1) {
            let slice = self.slice_of(region, dz);
            for y in region.y..region.y + region.height {
                for x in region.x..region.x + region.width {
                    if cursor + texel > data.len() {
                        return;
                    }
                    if let Some(offset) = self.texel_offset(x, y, slice) {
                        self.memory.write(offset, &data[cursor..cursor + texel]);
                    }
                    cursor += texel;
                }
            }
        }
    }

    /// Nearest-texel scaled copy between two regions of the same format
    pub fn blit(&self, src_region: &TexelBox, dst: &SoftImage, dst_region: &TexelBox) {
        let texel = self.texel_size();
        let dst_depth = dst_region.depth.max(1);
        let src_depth = src_region.depth.max(1);
        for dz in 0..dst_depth {
            let sz = dz * src_depth / dst_depth;
            for dy in 0..dst_region.height {
                let sy = dy * src_region.height / dst_region.height.max(1);
                for dx in 0..dst_region.width {
                    let sx = dx * src_region.width / dst_region.width.max(1);
                    let from = self.texel_offset(
                        src_region.x + sx,
                        src_region.y + sy,
                        self.slice_of(src_region, sz),
                    );
                    let to = dst.texel_offset(
                        dst_region.x + dx,
                        dst_region.y + dy,
                        dst.slice_of(dst_region, dz),
                    );
                    if let (Some(from), Some(to)) = (from, to) {
                        dst.memory.write(to, &self.memory.read_vec(from, texel));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_bytes_round_trip_through_words() {
        let memory = SoftMemory::new(10).unwrap();
        memory.write(1, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(memory.read_vec(0, 10), vec![0, 1, 2, 3, 4, 5, 6, 7, 0, 0]);
        assert_eq!(memory.load_u32(4), u32::from_le_bytes([4, 5, 6, 7]));
        assert_eq!(memory.load_u32(8), 0, "partial word past the end reads as zero");
    }

    #[test]
    fn atomic_updates_return_previous_value() {
        let memory = SoftMemory::new(8).unwrap();
        memory.store_u32(4, 10);
        assert_eq!(memory.update_u32(4, |v| v + 5), 10);
        assert_eq!(memory.load_u32(4), 15);
        assert_eq!(memory.compare_exchange_u32(4, 15, 1), 15);
        assert_eq!(memory.compare_exchange_u32(4, 15, 2), 1);
        assert_eq!(memory.load_u32(4), 1);
    }

    #[test]
    fn image_regions_are_row_major() {
        let image = SoftImage::new(ImageType::Image2D, ImageFormat::R8Uint, 4, 2, 1).unwrap();
        let all = TexelBox { layer: 0, x: 0, y: 0, z: 0, width: 4, height: 2, depth: 1 };
        image.write_region(&all, &[0, 1, 2, 3, 4, 5, 6, 7]);
        let inner = TexelBox { layer: 0, x: 1, y: 0, z: 0, width: 2, height: 2, depth: 1 };
        assert_eq!(image.read_region(&inner), vec![1, 2, 5, 6]);
    }

    #[test]
    fn blit_scales_by_nearest_texel() {
        let src = SoftImage::new(ImageType::Image2D, ImageFormat::R8Uint, 2, 1, 1).unwrap();
        let dst = SoftImage::new(ImageType::Image2D, ImageFormat::R8Uint, 4, 1, 1).unwrap();
        src.memory.write(0, &[7, 9]);
        let src_box = TexelBox { layer: 0, x: 0, y: 0, z: 0, width: 2, height: 1, depth: 1 };
        let dst_box = TexelBox { layer: 0, x: 0, y: 0, z: 0, width: 4, height: 1, depth: 1 };
        src.blit(&src_box, &dst, &dst_box);
        assert_eq!(dst.memory.read_vec(0, 4), vec![7, 7, 9, 9]);
    }
}
