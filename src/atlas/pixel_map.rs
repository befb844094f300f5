// CPU-side pixel sources for atlas images.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PIXEL_MAP_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one revision of one pixel map's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub id: u64,
    pub revision: u64,
}

/// A row-major grid of texels with a dirty counter.
///
/// Every mutable access bumps the revision, so images backed by this map know when
/// to upload again without hashing the pixels.
#[derive(Debug)]
pub struct PixelMap<T> {
    id: u64,
    revision: u64,
    width: u32,
    height: u32,
    pixels: Vec<T>,
}

impl<T: Copy + Default> PixelMap<T> {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            id: NEXT_PIXEL_MAP_ID.fetch_add(1, Ordering::Relaxed),
            revision: 0,
            width,
            height,
            pixels: vec![T::default(); (width as usize) * (height as usize)],
        }
    }
}

impl<T> PixelMap<T> {
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<T>) -> anyhow::Result<Self> {
        if pixels.len() != (width as usize) * (height as usize) {
            anyhow::bail!(
                "pixel buffer holds {} texels, {}x{} needs {}",
                pixels.len(),
                width,
                height,
                (width as usize) * (height as usize)
            );
        }
        Ok(Self {
            id: NEXT_PIXEL_MAP_ID.fetch_add(1, Ordering::Relaxed),
            revision: 0,
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn source_key(&self) -> SourceKey {
        SourceKey {
            id: self.id,
            revision: self.revision,
        }
    }

    pub fn row(&self, y: u32) -> &[T] {
        let start = (y * self.width) as usize;
        &self.pixels[start..start + self.width as usize]
    }

    pub fn pixels_mut(&mut self) -> &mut [T] {
        self.revision += 1;
        &mut self.pixels
    }

    pub fn set(&mut self, x: u32, y: u32, texel: T) {
        let index = (y * self.width + x) as usize;
        self.pixels_mut()[index] = texel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_bumps_revision_only() {
        let mut map = PixelMap::<u8>::new(4, 2);
        let before = map.source_key();
        map.set(3, 1, 9);
        let after = map.source_key();
        assert_eq!(before.id, after.id);
        assert_eq!(after.revision, before.revision + 1);
        assert_eq!(map.row(1), &[0, 0, 0, 9]);
    }

    #[test]
    fn every_map_is_its_own_source() {
        let a = PixelMap::<[u8; 4]>::new(2, 2);
        let b = PixelMap::from_pixels(2, 2, vec![[0u8; 4]; 4]).unwrap();
        assert_ne!(a.source_key().id, b.source_key().id);
        assert_eq!(b.source_key().revision, 0);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        assert!(PixelMap::from_pixels(3, 3, vec![0u8; 8]).is_err());
    }
}
