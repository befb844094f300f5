// =============================================================================
// WIDGET PRESENTATION DEMO
// =============================================================================
//
// Opens one OS window, links it to a Vulkan device and draws a small widget
// set every frame: flat rectangles, a generated picture from the image atlas,
// and generated distance-field glyphs.
//
// WINDOW LIFECYCLE:
//   resumed        -> Instance, surface, device, swapchain (NoDevice -> ReadyToDraw)
//   Resized        -> new display size, rebuild
//   RedrawRequested-> frame_update (device loss relinks on the next frame)
//   CloseRequested -> teardown, unlink, exit
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use glam::Vec2;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use widget_present::atlas::PixelMap;
use widget_present::config::Config;
use widget_present::instance::Instance;
use widget_present::pipeline::sdf::{GlyphKey, SDF_DISTANCE_RANGE};
use widget_present::widget::{ColorRect, ImageWidget, Renderable, SdfGlyph};
use widget_present::window::{FrameStatus, VulkanSurface, Window};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window as OsWindow, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting widget presentation demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config)?;
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging; RUST_LOG overrides the configured level
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = config
        .debug
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);

    let mut builder = Builder::new();
    builder.filter_level(level);
    builder.parse_default_env();
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Widget Presentation Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the presentation window releases its
/// swapchain and surface before the OS window goes away.
struct App {
    config: Config,
    scene: Vec<Box<dyn Renderable>>,
    window: Option<Window<VulkanSurface>>,
    os_window: Option<Arc<OsWindow>>,
    is_fullscreen: bool,
}

impl App {
    fn new(config: Config) -> Result<Self> {
        let is_fullscreen = config.window.fullscreen;
        Ok(Self {
            config,
            scene: demo_scene()?,
            window: None,
            os_window: None,
            is_fullscreen,
        })
    }

    /// Create the Vulkan instance and surface, then link and build.
    fn init_vulkan(&mut self, os_window: &OsWindow) -> Result<()> {
        let display = os_window
            .display_handle()
            .context("Window has no display handle")?
            .as_raw();
        let handle = os_window
            .window_handle()
            .context("Window has no window handle")?
            .as_raw();

        let instance = Instance::new(self.config.clone(), display)?;
        let surface = VulkanSurface::new(instance, display, handle)?;
        let window = Window::new(
            self.config.window.title.as_str(),
            surface,
            display_size(os_window),
        );
        link_and_build(&window)?;
        self.window = Some(window);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<()> {
        let Some(window) = &self.window else {
            return Ok(());
        };

        match window.frame_update(&mut self.scene)? {
            FrameStatus::DeviceLost => {
                log::warn!("Device lost, relinking");
                link_and_build(window)?;
            }
            FrameStatus::Rebuilt => log::debug!("Swapchain rebuilt"),
            FrameStatus::Presented | FrameStatus::Skipped(_) => {}
        }
        Ok(())
    }

    fn resize(&mut self, size: vk::Extent2D) {
        let Some(window) = &self.window else {
            return;
        };
        window.set_display_size(size);
        if let Err(e) = window.rebuild_swapchain() {
            log::error!("Failed to rebuild swapchain: {:?}", e);
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref os_window) = self.os_window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                os_window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                os_window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows rebuilds the swapchain
        }
    }

    fn close(&mut self) {
        if let Some(window) = self.window.take() {
            if let Err(e) = window.close() {
                log::error!("Failed to close window cleanly: {:?}", e);
            }
        }
    }
}

fn display_size(os_window: &OsWindow) -> vk::Extent2D {
    let size = os_window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

/// Link `window` to a device that can present to it and build its swapchain.
fn link_and_build(window: &Window<VulkanSurface>) -> Result<()> {
    let surface = window.backend();
    let device = surface.instance().device_for_surface(surface.surface())?;
    window.set_device(Some(device))?;
    if !window.build_swapchain_and_pipeline()? {
        log::info!("Window starts minimized; swapchain deferred");
    }
    Ok(())
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.os_window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let os_window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&os_window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.os_window = Some(os_window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resize(vk::Extent2D {
                    width: size.width,
                    height: size.height,
                });
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    log::error!("Render error: {:?}", e);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.close();
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref os_window) = self.os_window {
            os_window.request_redraw();
        }
    }
}

// =============================================================================
// DEMO SCENE
// =============================================================================

fn demo_scene() -> Result<Vec<Box<dyn Renderable>>> {
    let mut scene: Vec<Box<dyn Renderable>> = vec![
        Box::new(ColorRect::new(
            Vec2::new(24.0, 24.0),
            Vec2::new(424.0, 304.0),
            [0.18, 0.2, 0.25, 1.0],
        )),
        Box::new(ColorRect::new(
            Vec2::new(24.0, 24.0),
            Vec2::new(424.0, 56.0),
            [0.3, 0.45, 0.8, 1.0],
        )),
    ];

    let gradient = gradient_pixels(256, 192)?;
    let mut picture = ImageWidget::new("gradient", gradient, Vec2::new(48.0, 80.0));
    picture.alpha = 0.9;
    scene.push(Box::new(picture));

    for (index, x) in [320.0, 360.0, 400.0].into_iter().enumerate() {
        scene.push(Box::new(SdfGlyph::new(
            GlyphKey { font: 0, glyph: 0 },
            Vec2::new(x - 20.0 * index as f32, 120.0),
            0.5 + index as f32 * 0.5,
            [0.95, 0.9, 0.6, 1.0],
            Box::new(|_| Ok(circle_distance_field(48, 18.0))),
        )));
    }
    Ok(scene)
}

/// Red across, green down, blue fixed
fn gradient_pixels(width: u32, height: u32) -> Result<PixelMap<[u8; 4]>> {
    let texels = (0..height)
        .flat_map(|y| {
            (0..width).map(move |x| {
                let r = (x * 255 / width.max(1)) as u8;
                let g = (y * 255 / height.max(1)) as u8;
                [r, g, 160, 255]
            })
        })
        .collect();
    PixelMap::from_pixels(width, height, texels)
}

/// A disc of `radius` texels centred in a `size` square, 0.5 on the outline.
fn circle_distance_field(size: u32, radius: f32) -> PixelMap<u8> {
    let mut field = PixelMap::new(size, size);
    let center = size as f32 / 2.0;
    for y in 0..size {
        for x in 0..size {
            let offset = Vec2::new(x as f32 + 0.5 - center, y as f32 + 0.5 - center);
            let inside = radius - offset.length();
            let value = (0.5 + inside / SDF_DISTANCE_RANGE).clamp(0.0, 1.0);
            field.set(x, y, (value * 255.0).round() as u8);
        }
    }
    field
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_runs_corner_to_corner() {
        let pixels = gradient_pixels(4, 2).unwrap();
        assert_eq!(pixels.row(0)[0], [0, 0, 160, 255]);
        assert_eq!(pixels.row(1)[3], [191, 127, 160, 255]);
    }

    #[test]
    fn circle_field_crosses_half_on_the_outline() {
        let field = circle_distance_field(48, 18.0);
        // Centre is deep inside, corner far outside
        assert_eq!(field.row(24)[24], 255);
        assert_eq!(field.row(0)[0], 0);
        // One texel either side of the outline straddles 128
        let outline = field.row(24);
        assert!(outline[24 + 17] > 128);
        assert!(outline[24 + 18] < 128);
    }
}
