// Texture atlas shared by every window on a device
//
// An atlas is an array of square layers cut into PAGE_SIZE pages. Images claim
// pages from one free list, stage their pixels in a mapped buffer, and copy
// them page by page into the layers. Layers are created the first time a page
// on them is handed out; every new layer bumps `version` so pipelines know to
// rewrite their descriptor sets.

pub mod image;
pub mod page;
pub mod pixel_map;

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::backend::buffer::transition_image;
use crate::backend::{GpuImage, MappedBuffer, VulkanDevice};
use crate::config::AtlasConfig;
use crate::error::AtlasError;

pub use image::{Image, ImageState, PageCopy, PageQuad};
pub use page::{AtlasLayout, Page, PageAllocator, PageOrigin, PAGE_SIZE};
pub use pixel_map::{PixelMap, SourceKey};

/// A texel type an atlas can store.
pub trait Texel: bytemuck::Pod + Default {
    const FORMAT: vk::Format;
}

/// RGBA, 8 bits per channel
impl Texel for [u8; 4] {
    const FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
}

/// Single channel: coverage or distance
impl Texel for u8 {
    const FORMAT: vk::Format = vk::Format::R8_UNORM;
}

pub struct Atlas<T: Texel> {
    name: &'static str,
    allocator: Arc<PageAllocator>,
    // Kept in SHADER_READ_ONLY_OPTIMAL outside of uploads
    layers: Vec<GpuImage>,
    version: u64,
    staging: MappedBuffer<T>,
    staging_width: u32,
    sampler: vk::Sampler,
}

impl<T: Texel> Atlas<T> {
    pub fn new(device: &VulkanDevice, config: &AtlasConfig, name: &'static str) -> Result<Self> {
        config.validate()?;
        let layout = AtlasLayout::from_config(config);
        log::info!(
            "Creating {} atlas: {} layers of {}x{} ({} pages)",
            name,
            layout.max_layers,
            layout.layer_extent(),
            layout.layer_extent(),
            layout.capacity()
        );

        let staging = MappedBuffer::new(
            device,
            config.staging_width as usize * config.staging_height as usize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            &format!("{} atlas staging", name),
        )?;

        let sampler_info = vk::SamplerCreateInfo::default()
            // Quads clamp their samples to their own page, so filtering never bleeds
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(0.0);
        let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create atlas sampler")?;

        let mut atlas = Self {
            name,
            allocator: Arc::new(PageAllocator::new(layout)),
            layers: Vec::new(),
            version: 0,
            staging,
            staging_width: config.staging_width,
            sampler,
        };
        // Descriptor sets always need one valid view
        if let Err(e) = atlas.ensure_layer(device, 0) {
            atlas.destroy(device);
            return Err(e);
        }
        Ok(atlas)
    }

    pub fn allocator(&self) -> &Arc<PageAllocator> {
        &self.allocator
    }

    pub fn layout(&self) -> AtlasLayout {
        self.allocator.layout()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Bumped whenever the set of layer views changes.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// One view per descriptor slot; slots without a layer yet repeat layer 0.
    pub fn layer_views(&self) -> Vec<vk::ImageView> {
        let Some(first) = self.layers.first() else {
            return Vec::new();
        };
        (0..self.layout().max_layers as usize)
            .map(|index| self.layers.get(index).unwrap_or(first).view)
            .collect()
    }

    /// Side length of a layer in texels
    pub fn extent(&self) -> u32 {
        self.layout().layer_extent()
    }

    /// Make `image` hold the current contents of `pixels`.
    ///
    /// Uploads only when the pixel source changed since the last attempt. An
    /// exhausted atlas is not an error: the image becomes `Failed` and the caller
    /// draws nothing for it.
    pub fn prepare(
        &mut self,
        device: &VulkanDevice,
        image: &mut Image,
        pixels: &PixelMap<T>,
    ) -> Result<ImageState> {
        let source = pixels.source_key();
        if !image.needs_upload(source) {
            return Ok(image.state());
        }
        if !image.begin_upload(&self.allocator, pixels.width(), pixels.height(), source) {
            return Ok(ImageState::Failed);
        }
        if let Err(e) = self.upload(device, image, pixels) {
            image.fail();
            let context = format!("Failed to upload '{}' to the {} atlas", image.name(), self.name);
            return Err(e.context(context));
        }
        Ok(image.state())
    }

    fn upload(
        &mut self,
        device: &VulkanDevice,
        image: &mut Image,
        pixels: &PixelMap<T>,
    ) -> Result<()> {
        image.stage(pixels, self.staging.as_mut_slice()?, self.staging_width)?;

        // Exactly the rows written
        let written = match pixels.height() {
            0 => 0,
            rows => ((rows - 1) * self.staging_width + pixels.width()) as usize,
        };
        self.staging.flush(device, 0, written)?;

        let copies = image.copy_regions();
        let mut touched: Vec<u32> = copies.iter().map(|copy| copy.dst.layer).collect();
        touched.sort_unstable();
        touched.dedup();
        for &layer in &touched {
            self.ensure_layer(device, layer)?;
        }

        let texel_size = std::mem::size_of::<T>() as vk::DeviceSize;
        let regions: Vec<(u32, vk::BufferImageCopy)> = copies
            .iter()
            .map(|copy| {
                let first_texel = (copy.src_y * self.staging_width + copy.src_x) as vk::DeviceSize;
                let region = vk::BufferImageCopy::default()
                    .buffer_offset(first_texel * texel_size)
                    .buffer_row_length(self.staging_width)
                    .buffer_image_height(0)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_offset(vk::Offset3D {
                        x: copy.dst.x as i32,
                        y: copy.dst.y as i32,
                        z: 0,
                    })
                    .image_extent(vk::Extent3D {
                        width: copy.width,
                        height: copy.height,
                        depth: 1,
                    });
                (copy.dst.layer, region)
            })
            .collect();

        let staging_buffer = self.staging.buffer;
        let layers = &self.layers;
        // Same queue as drawing, so the barriers also order this against earlier frames
        device.submit_once(|cmd| {
            for &layer in &touched {
                let Some(target) = layers.get(layer as usize) else {
                    continue;
                };
                transition_image(
                    device,
                    cmd,
                    target.image,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
                let layer_regions: Vec<vk::BufferImageCopy> = regions
                    .iter()
                    .filter(|(index, _)| *index == layer)
                    .map(|(_, region)| *region)
                    .collect();
                unsafe {
                    device.device.cmd_copy_buffer_to_image(
                        cmd,
                        staging_buffer,
                        target.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &layer_regions,
                    );
                }
                transition_image(
                    device,
                    cmd,
                    target.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            }
        })?;

        log::debug!(
            "Uploaded '{}' ({} pages) to the {} atlas",
            image.name(),
            copies.len(),
            self.name
        );
        image.finish_upload()
    }

    fn ensure_layer(&mut self, device: &VulkanDevice, layer: u32) -> Result<()> {
        let max_layers = self.layout().max_layers;
        if layer >= max_layers {
            return Err(AtlasError::LayerOutOfRange { layer, max_layers }.into());
        }
        while self.layers.len() <= layer as usize {
            let extent = self.extent();
            let mut image = GpuImage::new(
                device,
                vk::Extent2D {
                    width: extent,
                    height: extent,
                },
                T::FORMAT,
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                &format!("{} atlas layer {}", self.name, self.layers.len()),
            )?;
            let prepared = device.submit_once(|cmd| {
                transition_image(
                    device,
                    cmd,
                    image.image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            });
            if let Err(e) = prepared {
                image.destroy(device);
                return Err(e);
            }
            self.layers.push(image);
            self.version += 1;
            log::debug!("{} atlas grew to {} layers", self.name, self.layers.len());
        }
        Ok(())
    }

    /// Free GPU resources and reclaim every page. Callers make sure the device is idle.
    pub fn destroy(&mut self, device: &VulkanDevice) {
        for layer in &mut self.layers {
            layer.destroy(device);
        }
        self.layers.clear();
        self.staging.destroy(device);
        if self.sampler != vk::Sampler::null() {
            unsafe { device.device.destroy_sampler(self.sampler, None) };
            self.sampler = vk::Sampler::null();
        }
        self.allocator.reset();
        self.version += 1;
    }
}
