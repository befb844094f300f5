// Window - binds an OS surface to a Device
//
// STATE MACHINE:
//
//   NoDevice --set_device(Some)--> LinkedToDevice --build_swapchain_and_pipeline--> ReadyToDraw
//   NoDevice <--set_device(None)-- LinkedToDevice <--teardown_swapchain_and_pipeline-- ReadyToDraw
//
// Transitions take the upgradable lock, do their slow work, and upgrade to the
// exclusive lock only to swap state (teardown and unlink run under it). The
// render thread's `frame_update` only ever tries the shared lock and skips the
// frame when a transition holds it.

pub mod vulkan;

use anyhow::Result;
use ash::vk;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use std::sync::Arc;

use crate::backend::{QueueFamilies, SwapchainPlan};
use crate::error::{RenderError, WindowStateError};
use crate::small_text::SmallText;

pub use vulkan::{SurfaceTarget, VulkanSurface};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStateKind {
    NoDevice,
    LinkedToDevice,
    ReadyToDraw,
}

/// What a device settled on for one surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceLink {
    pub families: QueueFamilies,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A transition holds the state lock
    Contended,
    /// No swapchain to draw into
    NotReady,
    /// Zero-sized draw area
    Minimized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    Skipped(SkipReason),
    /// The swapchain was out of date, or the frame was abandoned after
    /// acquire, and has been rebuilt; nothing was shown
    Rebuilt,
    /// The device was lost; the window is back in NoDevice
    DeviceLost,
}

/// The surface-specific half of a window: how to link, build, draw and tear down.
pub trait PresentationBackend: Send + Sync {
    type Device: Send + Sync;
    /// Swapchain and pipelines; exists only while ReadyToDraw.
    type Target: Send;
    type Scene: ?Sized;

    fn link(&self, device: &Arc<Self::Device>) -> Result<SurfaceLink>;

    fn surface_capabilities(&self, device: &Self::Device) -> Result<vk::SurfaceCapabilitiesKHR>;

    fn build(&self, device: &Arc<Self::Device>, plan: &SwapchainPlan) -> Result<Self::Target>;

    fn teardown(&self, device: &Self::Device, target: Self::Target);

    /// Draw one frame. Out-of-date swapchains and lost devices come back as
    /// `RenderError`.
    fn draw(
        &self,
        device: &Self::Device,
        target: &mut Self::Target,
        scene: &mut Self::Scene,
    ) -> Result<()>;

    fn unlink(&self, _device: &Self::Device) {}
}

enum WindowState<B: PresentationBackend> {
    NoDevice,
    LinkedToDevice {
        device: Arc<B::Device>,
        link: SurfaceLink,
    },
    ReadyToDraw {
        device: Arc<B::Device>,
        link: SurfaceLink,
        plan: SwapchainPlan,
        target: Mutex<B::Target>,
    },
}

impl<B: PresentationBackend> WindowState<B> {
    fn kind(&self) -> WindowStateKind {
        match self {
            WindowState::NoDevice => WindowStateKind::NoDevice,
            WindowState::LinkedToDevice { .. } => WindowStateKind::LinkedToDevice,
            WindowState::ReadyToDraw { .. } => WindowStateKind::ReadyToDraw,
        }
    }
}

pub struct Window<B: PresentationBackend> {
    title: SmallText,
    // Declared before `backend`: targets go before the surface they draw to
    state: RwLock<WindowState<B>>,
    backend: B,
    display_size: Mutex<vk::Extent2D>,
}

impl<B: PresentationBackend> Window<B> {
    pub fn new(title: impl Into<SmallText>, backend: B, display_size: vk::Extent2D) -> Self {
        Self {
            title: title.into(),
            state: RwLock::new(WindowState::NoDevice),
            backend,
            display_size: Mutex::new(display_size),
        }
    }

    pub fn title(&self) -> &SmallText {
        &self.title
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> WindowStateKind {
        self.state.read().kind()
    }

    pub fn display_size(&self) -> vk::Extent2D {
        *self.display_size.lock()
    }

    /// Record the OS draw-area size. Takes effect at the next swapchain build.
    pub fn set_display_size(&self, size: vk::Extent2D) {
        *self.display_size.lock() = size;
    }

    /// Extent of the current swapchain, if there is one.
    pub fn swapchain_plan(&self) -> Option<SwapchainPlan> {
        match &*self.state.read() {
            WindowState::ReadyToDraw { plan, .. } => Some(*plan),
            _ => None,
        }
    }

    pub fn device(&self) -> Option<Arc<B::Device>> {
        match &*self.state.read() {
            WindowState::NoDevice => None,
            WindowState::LinkedToDevice { device, .. }
            | WindowState::ReadyToDraw { device, .. } => Some(device.clone()),
        }
    }

    fn state_error(&self, operation: &'static str, state: WindowStateKind) -> anyhow::Error {
        WindowStateError {
            window: self.title.clone(),
            operation,
            state,
        }
        .into()
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    /// Link to `device` (NoDevice -> LinkedToDevice) or unlink with `None`
    /// (LinkedToDevice -> NoDevice).
    pub fn set_device(&self, device: Option<Arc<B::Device>>) -> Result<()> {
        let state = self.state.upgradable_read();
        match device {
            Some(device) => {
                if !matches!(*state, WindowState::NoDevice) {
                    return Err(self.state_error("link a device", state.kind()));
                }
                let link = self.backend.link(&device)?;
                let mut state = RwLockUpgradableReadGuard::upgrade(state);
                *state = WindowState::LinkedToDevice { device, link };
                log::info!("Window '{}' linked to device", self.title);
            }
            None => {
                if !matches!(*state, WindowState::LinkedToDevice { .. }) {
                    return Err(self.state_error("unlink its device", state.kind()));
                }
                let mut state = RwLockUpgradableReadGuard::upgrade(state);
                self.unlink_locked(&mut state);
            }
        }
        Ok(())
    }

    /// Plan and create the swapchain and pipelines (LinkedToDevice -> ReadyToDraw).
    ///
    /// Returns false, staying linked, while the draw area is empty.
    pub fn build_swapchain_and_pipeline(&self) -> Result<bool> {
        self.build_locked(self.state.upgradable_read())
    }

    /// Build from the state `state` guards, upgrading only to store the target.
    fn build_locked(&self, state: RwLockUpgradableReadGuard<'_, WindowState<B>>) -> Result<bool> {
        let WindowState::LinkedToDevice { device, link } = &*state else {
            return Err(self.state_error("build a swapchain", state.kind()));
        };

        let capabilities = self.backend.surface_capabilities(device)?;
        let plan = SwapchainPlan::new(
            &capabilities,
            self.display_size(),
            link.families,
            link.surface_format,
            link.present_mode,
        );
        if !plan.is_drawable() {
            log::debug!("Window '{}' is minimized, not building a swapchain", self.title);
            return Ok(false);
        }

        let target = self.backend.build(device, &plan)?;
        let (device, link) = (device.clone(), *link);
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        *state = WindowState::ReadyToDraw {
            device,
            link,
            plan,
            target: Mutex::new(target),
        };
        log::info!(
            "Window '{}' ready: {}x{}, {} images",
            self.title,
            plan.extent.width,
            plan.extent.height,
            plan.image_count
        );
        Ok(true)
    }

    /// Destroy the swapchain and every pipeline (ReadyToDraw -> LinkedToDevice).
    pub fn teardown_swapchain_and_pipeline(&self) -> Result<()> {
        let state = self.state.upgradable_read();
        if state.kind() != WindowStateKind::ReadyToDraw {
            return Err(self.state_error("tear down its swapchain", state.kind()));
        }
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        self.teardown_locked(&mut state);
        Ok(())
    }

    /// Caller holds the exclusive lock. A no-op unless ReadyToDraw.
    fn teardown_locked(&self, state: &mut WindowState<B>) {
        if !matches!(state, WindowState::ReadyToDraw { .. }) {
            return;
        }
        if let WindowState::ReadyToDraw {
            device,
            link,
            target,
            ..
        } = std::mem::replace(state, WindowState::NoDevice)
        {
            self.backend.teardown(&device, target.into_inner());
            *state = WindowState::LinkedToDevice { device, link };
            log::info!("Window '{}' swapchain torn down", self.title);
        }
    }

    /// Tear down if drawing, then build again for the current display size.
    ///
    /// Both steps happen under one guard, so concurrent rebuilds run one after
    /// the other and each ends ReadyToDraw.
    pub fn rebuild_swapchain(&self) -> Result<bool> {
        let state = self.state.upgradable_read();
        let state = if state.kind() == WindowStateKind::ReadyToDraw {
            let mut state = RwLockUpgradableReadGuard::upgrade(state);
            self.teardown_locked(&mut state);
            RwLockWriteGuard::downgrade_to_upgradable(state)
        } else {
            state
        };
        self.build_locked(state)
    }

    /// Caller holds the exclusive lock. A no-op unless LinkedToDevice.
    fn unlink_locked(&self, state: &mut WindowState<B>) {
        if !matches!(state, WindowState::LinkedToDevice { .. }) {
            return;
        }
        if let WindowState::LinkedToDevice { device, .. } =
            std::mem::replace(state, WindowState::NoDevice)
        {
            self.backend.unlink(&device);
            log::info!("Window '{}' unlinked from device", self.title);
        }
    }

    /// Release everything before the OS window goes away. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        self.teardown_locked(&mut state);
        self.unlink_locked(&mut state);
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Draw one frame if the window can, without ever waiting on a transition.
    pub fn frame_update(&self, scene: &mut B::Scene) -> Result<FrameStatus> {
        let drawn = {
            let Some(state) = self.state.try_read() else {
                log::trace!("Window '{}' busy, skipping frame", self.title);
                return Ok(FrameStatus::Skipped(SkipReason::Contended));
            };
            let WindowState::ReadyToDraw { device, target, .. } = &*state else {
                return Ok(FrameStatus::Skipped(SkipReason::NotReady));
            };
            let size = self.display_size();
            if size.width == 0 || size.height == 0 {
                return Ok(FrameStatus::Skipped(SkipReason::Minimized));
            }
            let Some(mut target) = target.try_lock() else {
                return Ok(FrameStatus::Skipped(SkipReason::Contended));
            };
            self.backend.draw(device, &mut target, scene)
        };

        let Err(error) = drawn else {
            return Ok(FrameStatus::Presented);
        };
        match error.downcast_ref::<RenderError>() {
            Some(RenderError::SwapchainOutOfDate) => {
                log::debug!("Window '{}' swapchain out of date, rebuilding", self.title);
                self.rebuild_swapchain()?;
                Ok(FrameStatus::Rebuilt)
            }
            Some(RenderError::FrameAbandoned) => {
                log::warn!("Window '{}' dropped a frame, rebuilding: {:#}", self.title, error);
                self.rebuild_swapchain()?;
                Ok(FrameStatus::Rebuilt)
            }
            Some(RenderError::DeviceLost) => {
                log::error!("Window '{}' lost its device", self.title);
                let mut state = self.state.write();
                self.teardown_locked(&mut state);
                self.unlink_locked(&mut state);
                Ok(FrameStatus::DeviceLost)
            }
            _ => Err(error),
        }
    }
}

impl<B: PresentationBackend> Drop for Window<B> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Window '{}' closed uncleanly: {}", self.title, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Duration;

    const UNDEFINED: vk::Extent2D = vk::Extent2D {
        width: u32::MAX,
        height: u32::MAX,
    };

    struct MockDevice {
        families: QueueFamilies,
    }

    struct MockTarget {
        plan: SwapchainPlan,
        frames: usize,
    }

    #[derive(Default)]
    struct MockScene {
        placed: usize,
    }

    /// Records every backend call; draws return whatever is queued in `draw_results`.
    struct RecordingBackend {
        capabilities: Mutex<vk::SurfaceCapabilitiesKHR>,
        calls: Mutex<Vec<String>>,
        draw_results: Mutex<VecDeque<RenderError>>,
        // Teardown blocks until this receives, after announcing itself on `entered`
        teardown_gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
        // Stands in for the device wait a real teardown does
        teardown_delay: Mutex<Option<Duration>>,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                capabilities: Mutex::new(vk::SurfaceCapabilitiesKHR {
                    min_image_count: 2,
                    max_image_count: 4,
                    current_extent: UNDEFINED,
                    min_image_extent: vk::Extent2D {
                        width: 64,
                        height: 64,
                    },
                    max_image_extent: vk::Extent2D {
                        width: 4096,
                        height: 4096,
                    },
                    ..Default::default()
                }),
                calls: Mutex::new(Vec::new()),
                draw_results: Mutex::new(VecDeque::new()),
                teardown_gate: Mutex::new(None),
                teardown_delay: Mutex::new(None),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().push(call.to_string());
        }
    }

    impl PresentationBackend for RecordingBackend {
        type Device = MockDevice;
        type Target = MockTarget;
        type Scene = MockScene;

        fn link(&self, device: &Arc<MockDevice>) -> Result<SurfaceLink> {
            self.record("link");
            Ok(SurfaceLink {
                families: device.families,
                surface_format: vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                present_mode: vk::PresentModeKHR::FIFO,
            })
        }

        fn surface_capabilities(&self, _device: &MockDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
            Ok(*self.capabilities.lock())
        }

        fn build(&self, _device: &Arc<MockDevice>, plan: &SwapchainPlan) -> Result<MockTarget> {
            self.record("build");
            Ok(MockTarget {
                plan: *plan,
                frames: 0,
            })
        }

        fn teardown(&self, _device: &MockDevice, _target: MockTarget) {
            if let Some((entered, release)) = self.teardown_gate.lock().take() {
                let _ = entered.send(());
                let _ = release.recv();
            }
            let delay = *self.teardown_delay.lock();
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            self.record("teardown");
        }

        fn draw(
            &self,
            _device: &MockDevice,
            target: &mut MockTarget,
            scene: &mut MockScene,
        ) -> Result<()> {
            if let Some(error) = self.draw_results.lock().pop_front() {
                self.record("draw failed");
                return Err(error.into());
            }
            target.frames += 1;
            scene.placed += 1;
            self.record("draw");
            Ok(())
        }

        fn unlink(&self, _device: &MockDevice) {
            self.record("unlink");
        }
    }

    fn device(graphics: u32, present: u32) -> Arc<MockDevice> {
        Arc::new(MockDevice {
            families: QueueFamilies { graphics, present },
        })
    }

    fn window() -> Window<RecordingBackend> {
        Window::new(
            "test",
            RecordingBackend::new(),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        )
    }

    fn ready_window() -> Window<RecordingBackend> {
        let window = window();
        window.set_device(Some(device(0, 0))).unwrap();
        assert!(window.build_swapchain_and_pipeline().unwrap());
        window
    }

    fn state_error(result: Result<impl std::fmt::Debug>) -> WindowStateError {
        result
            .unwrap_err()
            .downcast::<WindowStateError>()
            .expect("expected a WindowStateError")
    }

    #[test]
    fn walks_every_edge_and_back() {
        let window = window();
        assert_eq!(window.state(), WindowStateKind::NoDevice);

        window.set_device(Some(device(0, 0))).unwrap();
        assert_eq!(window.state(), WindowStateKind::LinkedToDevice);

        assert!(window.build_swapchain_and_pipeline().unwrap());
        assert_eq!(window.state(), WindowStateKind::ReadyToDraw);

        window.teardown_swapchain_and_pipeline().unwrap();
        assert_eq!(window.state(), WindowStateKind::LinkedToDevice);

        window.set_device(None).unwrap();
        assert_eq!(window.state(), WindowStateKind::NoDevice);

        assert_eq!(
            window.backend().calls(),
            vec!["link", "build", "teardown", "unlink"]
        );
    }

    #[test]
    fn off_edge_calls_fail_and_leave_state_alone() {
        let window = window();
        let error = state_error(window.build_swapchain_and_pipeline());
        assert_eq!(error.state, WindowStateKind::NoDevice);
        assert!(window.teardown_swapchain_and_pipeline().is_err());
        assert!(window.set_device(None).is_err());
        assert_eq!(window.state(), WindowStateKind::NoDevice);

        window.set_device(Some(device(0, 0))).unwrap();
        let error = state_error(window.set_device(Some(device(1, 1))));
        assert_eq!(error.state, WindowStateKind::LinkedToDevice);
        assert!(window.teardown_swapchain_and_pipeline().is_err());
        assert_eq!(window.state(), WindowStateKind::LinkedToDevice);

        window.build_swapchain_and_pipeline().unwrap();
        assert!(window.build_swapchain_and_pipeline().is_err());
        assert!(window.set_device(None).is_err());
        assert!(window.set_device(Some(device(0, 0))).is_err());
        assert_eq!(window.state(), WindowStateKind::ReadyToDraw);

        // Only the successful transitions reached the backend
        assert_eq!(window.backend().calls(), vec!["link", "build"]);
    }

    #[test]
    fn state_error_names_the_window() {
        let window = window();
        let error = state_error(window.set_device(None));
        assert_eq!(error.window.as_str(), "test");
        assert!(error.to_string().contains("NoDevice"));
    }

    #[test]
    fn build_plans_from_surface_and_display() {
        let window = ready_window();
        let plan = window.swapchain_plan().unwrap();
        assert_eq!(
            plan.extent,
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
        assert_eq!(plan.image_count, 3);
        assert_eq!(plan.sharing, crate::backend::Sharing::Exclusive);
    }

    #[test]
    fn separate_queue_families_build_concurrent_swapchains() {
        let window = window();
        window.set_device(Some(device(0, 1))).unwrap();
        window.build_swapchain_and_pipeline().unwrap();
        assert_eq!(
            window.swapchain_plan().unwrap().sharing,
            crate::backend::Sharing::Concurrent([0, 1])
        );
    }

    #[test]
    fn minimized_window_stays_linked() {
        let window = window();
        let zero = vk::Extent2D { width: 0, height: 0 };
        window.set_display_size(zero);
        {
            // What a minimized surface reports
            let mut caps = window.backend().capabilities.lock();
            caps.current_extent = zero;
            caps.min_image_extent = zero;
            caps.max_image_extent = zero;
        }
        window.set_device(Some(device(0, 0))).unwrap();
        assert!(!window.build_swapchain_and_pipeline().unwrap());
        assert_eq!(window.state(), WindowStateKind::LinkedToDevice);
    }

    #[test]
    fn frames_draw_only_when_ready() {
        let window = window();
        let mut scene = MockScene::default();
        assert_eq!(
            window.frame_update(&mut scene).unwrap(),
            FrameStatus::Skipped(SkipReason::NotReady)
        );

        window.set_device(Some(device(0, 0))).unwrap();
        window.build_swapchain_and_pipeline().unwrap();
        assert_eq!(window.frame_update(&mut scene).unwrap(), FrameStatus::Presented);
        assert_eq!(scene.placed, 1);

        window.set_display_size(vk::Extent2D { width: 0, height: 0 });
        assert_eq!(
            window.frame_update(&mut scene).unwrap(),
            FrameStatus::Skipped(SkipReason::Minimized)
        );
        assert_eq!(scene.placed, 1);
    }

    #[test]
    fn out_of_date_swapchain_is_rebuilt_once() {
        let window = ready_window();
        window
            .backend()
            .draw_results
            .lock()
            .push_back(RenderError::SwapchainOutOfDate);
        window.set_display_size(vk::Extent2D {
            width: 1024,
            height: 768,
        });

        let mut scene = MockScene::default();
        assert_eq!(window.frame_update(&mut scene).unwrap(), FrameStatus::Rebuilt);
        assert_eq!(window.state(), WindowStateKind::ReadyToDraw);
        assert_eq!(window.swapchain_plan().unwrap().extent.width, 1024);
        assert_eq!(window.frame_update(&mut scene).unwrap(), FrameStatus::Presented);
        assert_eq!(
            window.backend().calls(),
            vec!["link", "build", "draw failed", "teardown", "build", "draw"]
        );
    }

    #[test]
    fn lost_device_unlinks_the_window() {
        let window = ready_window();
        window
            .backend()
            .draw_results
            .lock()
            .push_back(RenderError::DeviceLost);

        let mut scene = MockScene::default();
        assert_eq!(window.frame_update(&mut scene).unwrap(), FrameStatus::DeviceLost);
        assert_eq!(window.state(), WindowStateKind::NoDevice);
        assert!(window.device().is_none());

        // A new device can be linked afterwards
        window.set_device(Some(device(0, 0))).unwrap();
        assert_eq!(window.state(), WindowStateKind::LinkedToDevice);
    }

    #[test]
    fn other_draw_errors_propagate() {
        let window = ready_window();
        window
            .backend()
            .draw_results
            .lock()
            .push_back(RenderError::VertexOverflow {
                pipeline: crate::pipeline::PipelineKind::Flat,
                capacity: 4,
            });
        let mut scene = MockScene::default();
        let error = window.frame_update(&mut scene).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<RenderError>(),
            Some(RenderError::VertexOverflow { .. })
        ));
        assert_eq!(window.state(), WindowStateKind::ReadyToDraw);
    }

    #[test]
    fn close_tears_down_then_unlinks() {
        let window = ready_window();
        window.close().unwrap();
        assert_eq!(window.state(), WindowStateKind::NoDevice);
        assert_eq!(
            window.backend().calls(),
            vec!["link", "build", "teardown", "unlink"]
        );
        // Closing twice is harmless
        window.close().unwrap();
    }

    #[test_log::test]
    fn frame_update_skips_while_a_transition_holds_the_lock() {
        let window = Arc::new(ready_window());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *window.backend().teardown_gate.lock() = Some((entered_tx, release_rx));

        let closing = {
            let window = window.clone();
            thread::spawn(move || window.close())
        };

        // Teardown is now running under the exclusive lock
        entered_rx.recv().unwrap();
        let mut scene = MockScene::default();
        assert_eq!(
            window.frame_update(&mut scene).unwrap(),
            FrameStatus::Skipped(SkipReason::Contended)
        );
        assert_eq!(scene.placed, 0);

        release_tx.send(()).unwrap();
        closing.join().unwrap().unwrap();
        assert_eq!(window.state(), WindowStateKind::NoDevice);
        assert!(!window.backend().calls().iter().any(|call| call.starts_with("draw")));
    }

    #[test_log::test]
    fn concurrent_rebuilds_both_end_ready() {
        for _ in 0..50 {
            let window = Arc::new(ready_window());
            *window.backend().teardown_delay.lock() = Some(Duration::from_millis(1));
            let barrier = Arc::new(Barrier::new(2));

            let rebuilders: Vec<_> = (0..2)
                .map(|_| {
                    let window = window.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        window.rebuild_swapchain()
                    })
                })
                .collect();
            for rebuilder in rebuilders {
                assert!(rebuilder.join().unwrap().unwrap());
            }

            assert_eq!(window.state(), WindowStateKind::ReadyToDraw);
            let calls = window.backend().calls();
            assert_eq!(calls.iter().filter(|call| *call == "teardown").count(), 2);
            assert_eq!(calls.iter().filter(|call| *call == "build").count(), 3);
        }
    }

    #[test]
    fn rebuild_without_a_device_is_a_state_error() {
        let window = window();
        let error = state_error(window.rebuild_swapchain());
        assert_eq!(error.state, WindowStateKind::NoDevice);
        assert!(window.backend().calls().is_empty());
    }

    #[test]
    fn abandoned_frame_rebuilds_instead_of_failing() {
        let window = ready_window();
        window
            .backend()
            .draw_results
            .lock()
            .push_back(RenderError::FrameAbandoned);

        let mut scene = MockScene::default();
        assert_eq!(window.frame_update(&mut scene).unwrap(), FrameStatus::Rebuilt);
        assert_eq!(window.state(), WindowStateKind::ReadyToDraw);
        assert_eq!(window.frame_update(&mut scene).unwrap(), FrameStatus::Presented);
        assert_eq!(
            window.backend().calls(),
            vec!["link", "build", "draw failed", "teardown", "build", "draw"]
        );
    }

    #[test]
    fn abandoned_frame_keeps_its_cause() {
        let cause =
            anyhow::anyhow!("descriptor update failed").context(RenderError::FrameAbandoned);
        assert_eq!(
            cause.downcast_ref::<RenderError>(),
            Some(&RenderError::FrameAbandoned)
        );
        assert!(format!("{:#}", cause).contains("descriptor update failed"));
    }

    #[test]
    fn targets_see_the_plan_they_were_built_with() {
        let window = ready_window();
        let mut scene = MockScene::default();
        window.frame_update(&mut scene).unwrap();
        let state = window.state.read();
        let WindowState::ReadyToDraw { plan, target, .. } = &*state else {
            panic!("window should be ready");
        };
        let target = target.lock();
        assert_eq!(target.plan, *plan);
        assert_eq!(target.frames, 1);
    }
}
