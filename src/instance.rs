// Vulkan Instance - process-wide entry point
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation for OS windows
// - Physical device selection (prefer discrete GPU), reusing a live Device when
//   it can present to the new surface

use anyhow::{Context, Result};
use ash::{vk, Entry};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::{Arc, Weak};

use crate::backend::QueueFamilies;
use crate::config::Config;
use crate::device::Device;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct Instance {
    pub instance: ash::Instance,
    pub surface_loader: ash::khr::surface::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    config: Config,
    // Weak so that a Device dies with its last window
    devices: Mutex<Vec<Weak<Device>>>,
    entry: Entry,
}

impl Instance {
    /// Create the instance with the surface extensions `display` needs.
    pub fn new(config: Config, display: RawDisplayHandle) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", config.window.title);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let enable_validation = cfg!(debug_assertions)
            && config.debug.validation_layers
            && Self::has_validation_layer(&entry);
        let instance =
            Self::create_instance(&entry, &config.window.title, display, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        Ok(Arc::new(Self {
            instance,
            surface_loader,
            debug_utils,
            config,
            devices: Mutex::new(Vec::new()),
            entry,
        }))
    }

    fn has_validation_layer(entry: &Entry) -> bool {
        let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
        let found = layers
            .iter()
            .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        if !found {
            log::warn!("Validation layers requested but not installed");
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display: RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"widget-present";

        // Descriptor indexing is core in 1.2
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Platform surface extensions
        let mut extensions = ash_window::enumerate_required_extensions(display)
            .context("Display has no Vulkan surface support")?
            .to_vec();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a presentable surface for an OS window.
    pub fn create_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<vk::SurfaceKHR> {
        unsafe { ash_window::create_surface(&self.entry, &self.instance, display, window, None) }
            .context("Failed to create window surface")
    }

    pub fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }

    /// A Device that can present to `surface`: a live one if possible, else the
    /// best-scoring GPU.
    pub fn device_for_surface(self: &Arc<Self>, surface: vk::SurfaceKHR) -> Result<Arc<Device>> {
        let mut devices = self.devices.lock();
        devices.retain(|device| device.strong_count() > 0);

        for device in devices.iter().filter_map(Weak::upgrade) {
            let families = device.vulkan.queue_families();
            if self.supports_present(device.vulkan.physical_device, families.present, surface) {
                log::debug!("Reusing existing device for new surface");
                return Ok(device);
            }
        }

        let (physical_device, families) = self.pick_physical_device(surface)?;
        let device = Device::new(self.clone(), physical_device, families)?;
        devices.push(Arc::downgrade(&device));
        Ok(device)
    }

    fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        family: u32,
        surface: vk::SurfaceKHR,
    ) -> bool {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(physical_device, family, surface)
        }
        .unwrap_or(false)
    }

    fn pick_physical_device(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { self.instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if props.api_version < vk::API_VERSION_1_2 || !self.supports_required_features(device) {
                log::debug!("Skipping {}: missing Vulkan 1.2 descriptor indexing", name);
                continue;
            }

            let queue_families =
                unsafe { self.instance.get_physical_device_queue_family_properties(device) };
            let Some(families) = QueueFamilies::find(&queue_families, |index| {
                self.supports_present(device, index, surface)
            }) else {
                log::debug!("Skipping {}: cannot present to this surface", name);
                continue;
            };

            let score = device_type_score(props.device_type);
            log::debug!("Candidate GPU {} (score {}, {:?})", name, score, families);
            if score > best_score {
                best_score = score;
                best_device = Some((device, families));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn supports_required_features(&self, device: vk::PhysicalDevice) -> bool {
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan12);
        unsafe {
            self.instance
                .get_physical_device_features2(device, &mut features)
        };
        vulkan12.shader_sampled_image_array_non_uniform_indexing == vk::TRUE
    }
}

/// Prefer discrete GPUs, then integrated, then anything else.
pub fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 1,
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_beats_integrated_beats_cpu() {
        let discrete = device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU);
        let cpu = device_type_score(vk::PhysicalDeviceType::CPU);
        assert!(discrete > integrated && integrated > cpu);
        assert!(cpu > 0);
    }
}
