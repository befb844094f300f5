// Atlas-backed images: page ownership, staging and per-page geometry.

use std::sync::Arc;

use anyhow::Result;
use glam::Vec2;

use super::page::{AtlasLayout, Page, PageAllocator, PageOrigin, PAGE_SIZE};
use super::pixel_map::{PixelMap, SourceKey};
use crate::error::AtlasError;
use crate::small_text::SmallText;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Uninitialized,
    Drawing,
    Uploaded,
    Failed,
}

/// One staging-to-atlas copy, in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCopy {
    pub page: Page,
    pub src_x: u32,
    pub src_y: u32,
    pub width: u32,
    pub height: u32,
    pub dst: PageOrigin,
}

/// Screen rectangle of one page and the atlas texels it samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageQuad {
    pub min: Vec2,
    pub max: Vec2,
    pub atlas_min: Vec2,
    pub atlas_max: Vec2,
    pub layer: u32,
}

#[derive(Debug)]
struct Lease {
    allocator: Arc<PageAllocator>,
    generation: u64,
}

impl Lease {
    fn is_current(&self) -> bool {
        self.allocator.generation() == self.generation
    }
}

/// An image whose pixels live in atlas pages.
///
/// Pages go back to the free list when the image is dropped or re-uploaded with a
/// different extent.
#[derive(Debug)]
pub struct Image {
    name: SmallText,
    state: ImageState,
    width: u32,
    height: u32,
    pages: Vec<Page>,
    lease: Option<Lease>,
    source: Option<SourceKey>,
    staged: bool,
}

impl Image {
    pub fn new(name: impl Into<SmallText>) -> Self {
        Self {
            name: name.into(),
            state: ImageState::Uninitialized,
            width: 0,
            height: 0,
            pages: Vec::new(),
            lease: None,
            source: None,
            staged: false,
        }
    }

    pub fn name(&self) -> &SmallText {
        &self.name
    }

    /// Current state; an image whose atlas was reset reads as uninitialized.
    pub fn state(&self) -> ImageState {
        match (&self.state, &self.lease) {
            (ImageState::Drawing | ImageState::Uploaded, Some(lease)) if !lease.is_current() => {
                ImageState::Uninitialized
            }
            (state, _) => *state,
        }
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Whether `source` has to be (re)uploaded before this image can be drawn.
    ///
    /// A failed image is not retried until its source changes.
    pub fn needs_upload(&self, source: SourceKey) -> bool {
        match self.state() {
            ImageState::Uninitialized => true,
            _ => self.source != Some(source),
        }
    }

    /// Claim pages for a `width`x`height` upload and enter `Drawing`.
    ///
    /// Returns false and enters `Failed` when the atlas cannot supply every page; in
    /// that case no page is held.
    pub fn begin_upload(
        &mut self,
        allocator: &Arc<PageAllocator>,
        width: u32,
        height: u32,
        source: SourceKey,
    ) -> bool {
        self.release_pages();
        self.width = width;
        self.height = height;
        self.source = Some(source);
        self.staged = false;

        let needed = AtlasLayout::pages_for_extent(width, height);
        match allocator.allocate(needed) {
            Some((pages, generation)) => {
                self.pages = pages;
                self.lease = Some(Lease {
                    allocator: allocator.clone(),
                    generation,
                });
                self.state = ImageState::Drawing;
                true
            }
            None => {
                log::warn!(
                    "Image '{}' ({}x{}) needs {} atlas pages, only {} free",
                    self.name,
                    width,
                    height,
                    needed,
                    allocator.free_count()
                );
                self.state = ImageState::Failed;
                false
            }
        }
    }

    /// Copy `pixels` into the top-left of a staging area `staging_width` texels wide.
    pub fn stage<T: Copy>(
        &mut self,
        pixels: &PixelMap<T>,
        staging: &mut [T],
        staging_width: u32,
    ) -> Result<()> {
        if self.state != ImageState::Drawing {
            anyhow::bail!("image '{}' staged while {:?}", self.name, self.state);
        }
        if (pixels.width(), pixels.height()) != (self.width, self.height) {
            anyhow::bail!(
                "image '{}' is {}x{} but its source is {}x{}",
                self.name,
                self.width,
                self.height,
                pixels.width(),
                pixels.height()
            );
        }
        let staging_height = (staging.len() as u32).checked_div(staging_width).unwrap_or(0);
        if self.width > staging_width || self.height > staging_height {
            return Err(AtlasError::ImageTooLarge {
                name: self.name.clone(),
                width: self.width,
                height: self.height,
                max_width: staging_width,
                max_height: staging_height,
            }
            .into());
        }

        let row_len = self.width as usize;
        for y in 0..self.height {
            let start = (y * staging_width) as usize;
            staging[start..start + row_len].copy_from_slice(pixels.row(y));
        }
        self.staged = true;
        Ok(())
    }

    /// Staging-to-atlas copies for every page of a `Drawing` image.
    pub fn copy_regions(&self) -> Vec<PageCopy> {
        let Some(lease) = &self.lease else {
            return Vec::new();
        };
        let layout = lease.allocator.layout();
        self.page_cells()
            .map(|(page, column, row)| {
                let src_x = column * PAGE_SIZE;
                let src_y = row * PAGE_SIZE;
                PageCopy {
                    page,
                    src_x,
                    src_y,
                    width: PAGE_SIZE.min(self.width - src_x),
                    height: PAGE_SIZE.min(self.height - src_y),
                    dst: layout.page_origin(page),
                }
            })
            .collect()
    }

    /// Mark the GPU copy complete. Only a staged image can become `Uploaded`.
    pub fn finish_upload(&mut self) -> Result<()> {
        if self.state != ImageState::Drawing || !self.staged {
            anyhow::bail!(
                "image '{}' cannot finish upload while {:?} (staged: {})",
                self.name,
                self.state,
                self.staged
            );
        }
        self.state = ImageState::Uploaded;
        Ok(())
    }

    /// Enter `Failed`, returning any pages.
    pub fn fail(&mut self) {
        self.release_pages();
        self.state = ImageState::Failed;
    }

    /// Per-page quads with the image's top-left at `origin`, scaled by `scale`.
    pub fn quads(&self, origin: Vec2, scale: f32) -> Vec<PageQuad> {
        if self.state() != ImageState::Uploaded {
            return Vec::new();
        }
        self.copy_regions()
            .into_iter()
            .map(|copy| {
                let offset = Vec2::new(copy.src_x as f32, copy.src_y as f32);
                let size = Vec2::new(copy.width as f32, copy.height as f32);
                let atlas_min = Vec2::new(copy.dst.x as f32, copy.dst.y as f32);
                PageQuad {
                    min: origin + offset * scale,
                    max: origin + (offset + size) * scale,
                    atlas_min,
                    atlas_max: atlas_min + size,
                    layer: copy.dst.layer,
                }
            })
            .collect()
    }

    fn page_cells(&self) -> impl Iterator<Item = (Page, u32, u32)> + '_ {
        let (columns, _) = AtlasLayout::page_grid(self.width, self.height);
        self.pages
            .iter()
            .enumerate()
            .map(move |(index, &page)| (page, index as u32 % columns, index as u32 / columns))
    }

    fn release_pages(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.allocator.release(&self.pages, lease.generation);
        }
        self.pages.clear();
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.release_pages();
    }
}
