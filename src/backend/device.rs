// Vulkan Device - shared core behind every handle
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation through the window collaborator
// - Physical device selection (first match, see physical.rs)
// - Logical device + graphics/present queues
// - Memory allocator setup
//
// Handles keep an `Arc<VulkanDevice>` back-reference, so the device can only
// be destroyed after the last handle is gone.

use anyhow::{Context, Result};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::allocator::GpuAllocator;
use super::physical::{self, DeviceCandidate, DeviceSelection, PresentTarget, QueueFamilySupport};
use super::surface::{self, WindowSurface};
use crate::config::Config;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct PresentSurface {
    pub loader: khr::Surface,
    pub surface: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub allocator: GpuAllocator,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    entry: Entry,

    // Queue handles (may share a family)
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    surface: Option<PresentSurface>,
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // Owned device objects not yet destroyed
    live_objects: AtomicUsize,

    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create the device. With `window == None` the device is headless and
    /// only a graphics queue is required.
    pub fn new(config: &Config, window: Option<&dyn WindowSurface>) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", config.window.title);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = config.validation_enabled();
        let window_extensions = match window {
            Some(window) => window.required_extensions()?,
            None => Vec::new(),
        };
        let instance = Self::create_instance(
            &entry,
            &config.window.title,
            &window_extensions,
            enable_validation,
        )?;

        // Owns the instance-level objects until the device is fully built
        let mut guard = InstanceGuard::new(instance);

        if enable_validation {
            guard.debug_utils = Some(Self::setup_debug_messenger(&entry, &guard.instance)?);
        }

        if let Some(window) = window {
            let (display, handle) = window.raw_handles()?;
            let raw = unsafe { surface::create_surface(&entry, &guard.instance, display, handle)? };
            guard.surface = Some((khr::Surface::new(&entry, &guard.instance), raw));
        }

        let target = match guard.surface {
            Some(_) => PresentTarget::Surface {
                preferred_mode: config.graphics.present_mode(),
            },
            None => PresentTarget::Headless,
        };
        let candidates = Self::query_candidates(&guard.instance, guard.surface.as_ref())?;
        let selection = physical::select_device(&candidates, target)
            .context("Failed to find a suitable Vulkan physical device")?;

        log::info!(
            "Found physical device {} with graphics queue family {} and present queue family {}",
            selection.name,
            selection.graphics_family,
            selection.present_family
        );

        let device =
            Self::create_logical_device(&guard.instance, &selection, guard.surface.is_some())?;
        let graphics_queue = unsafe { device.get_device_queue(selection.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(selection.present_family, 0) };

        let properties =
            unsafe { guard.instance.get_physical_device_properties(selection.physical_device) };
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let allocator = match GpuAllocator::new(&guard.instance, selection.physical_device, &device)
        {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let (instance, debug_utils, surface) = guard.into_parts();

        Ok(Arc::new(Self {
            allocator,
            device,
            physical_device: selection.physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family: selection.graphics_family,
            present_queue,
            present_queue_family: selection.present_family,
            surface: surface.map(|(loader, surface)| PresentSurface {
                loader,
                surface,
                format: selection.surface_format,
                present_mode: selection.present_mode,
            }),
            debug_utils,
            live_objects: AtomicUsize::new(0),
            properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        window_extensions: &[&CStr],
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"Paced Renderer";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<*const c_char> =
            window_extensions.iter().map(|name| name.as_ptr()).collect();
        if enable_validation {
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create Vulkan debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn query_candidates(
        instance: &ash::Instance,
        surface: Option<&(khr::Surface, vk::SurfaceKHR)>,
    ) -> Result<Vec<DeviceCandidate>> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let queried = devices
            .into_iter()
            .map(|device| Self::query_candidate(instance, device, surface));
        Ok(physical::usable_candidates(queried))
    }

    fn query_candidate(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
        surface: Option<&(khr::Surface, vk::SurfaceKHR)>,
    ) -> Result<DeviceCandidate> {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut queue_families = Vec::with_capacity(families.len());
        for (index, family) in families.iter().enumerate() {
            let present = match surface {
                Some((loader, surface)) => unsafe {
                    loader.get_physical_device_surface_support(device, index as u32, *surface)
                }
                .with_context(|| format!("Failed to query surface support on {}", name))?,
                None => false,
            };
            queue_families.push(QueueFamilySupport {
                graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                present,
            });
        }

        let (surface_formats, present_modes) = match surface {
            Some((loader, surface)) => unsafe {
                (
                    loader
                        .get_physical_device_surface_formats(device, *surface)
                        .with_context(|| format!("Failed to query surface formats on {}", name))?,
                    loader
                        .get_physical_device_surface_present_modes(device, *surface)
                        .with_context(|| format!("Failed to query present modes on {}", name))?,
                )
            },
            None => (Vec::new(), Vec::new()),
        };

        Ok(DeviceCandidate {
            handle: device,
            name,
            queue_families,
            surface_formats,
            present_modes,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        selection: &DeviceSelection,
        with_swapchain: bool,
    ) -> Result<ash::Device> {
        // One queue per distinct family
        let families: BTreeSet<u32> = [selection.graphics_family, selection.present_family]
            .into_iter()
            .collect();
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = if with_swapchain {
            vec![khr::Swapchain::name().as_ptr()]
        } else {
            vec![]
        };

        let supported =
            unsafe { instance.get_physical_device_features(selection.physical_device) };
        let features = vk::PhysicalDeviceFeatures::builder()
            .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe { instance.create_device(selection.physical_device, &create_info, None) }
            .context("Failed to create Vulkan logical device")
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn surface(&self) -> Option<&PresentSurface> {
        self.surface.as_ref()
    }

    /// Device objects held by `Owned` handles and not yet destroyed
    pub fn live_objects(&self) -> usize {
        self.live_objects.load(Ordering::Relaxed)
    }

    pub(crate) fn track_object(&self) {
        self.live_objects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn untrack_object(&self) {
        self.live_objects.fetch_sub(1, Ordering::Relaxed);
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("{:#}", e);
        }

        self.allocator.shutdown();

        unsafe {
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.surface, None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Instance, debug messenger and surface created before the logical device.
/// Destroys them on drop unless `into_parts` handed them over.
struct InstanceGuard {
    instance: ash::Instance,
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface: Option<(khr::Surface, vk::SurfaceKHR)>,
    armed: bool,
}

impl InstanceGuard {
    fn new(instance: ash::Instance) -> Self {
        Self {
            instance,
            debug_utils: None,
            surface: None,
            armed: true,
        }
    }

    #[allow(clippy::type_complexity)]
    fn into_parts(
        mut self,
    ) -> (
        ash::Instance,
        Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
        Option<(khr::Surface, vk::SurfaceKHR)>,
    ) {
        self.armed = false;
        (
            self.instance.clone(),
            self.debug_utils.take(),
            self.surface.take(),
        )
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::debug!("Device creation failed, releasing the instance");
        unsafe {
            if let Some((loader, surface)) = self.surface.take() {
                loader.destroy_surface(surface, None);
            }
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
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("[Vulkan] {}", message),
        _ => log::trace!("[Vulkan] {}", message),
    }

    vk::FALSE
}
