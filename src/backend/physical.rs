// Physical device selection
//
// Selection is a pure function over queried capabilities so the rules can be
// checked without a GPU. First match wins; there is no scoring.

use ash::vk;

/// What one queue family of a candidate can do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub graphics: bool,
    pub present: bool,
}

/// Everything selection needs to know about one enumerated GPU
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub queue_families: Vec<QueueFamilySupport>,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Whether the context will present to a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentTarget {
    /// Requires a present queue, a surface format and a present mode
    Surface { preferred_mode: vk::PresentModeKHR },
    /// Offscreen: only a graphics queue is required
    Headless,
}

#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub graphics_family: u32,
    pub present_family: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl DeviceSelection {
    pub fn queue_families_differ(&self) -> bool {
        self.graphics_family != self.present_family
    }
}

/// Keep the candidates whose capability query succeeded. A device that fails
/// its query is skipped rather than failing selection as a whole.
pub fn usable_candidates(
    queried: impl IntoIterator<Item = anyhow::Result<DeviceCandidate>>,
) -> Vec<DeviceCandidate> {
    queried
        .into_iter()
        .filter_map(|result| match result {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                log::debug!("Skipping physical device: {:#}", e);
                None
            }
        })
        .collect()
}

/// Pick the first candidate that satisfies every requirement of `target`.
pub fn select_device(
    candidates: &[DeviceCandidate],
    target: PresentTarget,
) -> Option<DeviceSelection> {
    candidates.iter().find_map(|candidate| evaluate(candidate, target))
}

fn evaluate(candidate: &DeviceCandidate, target: PresentTarget) -> Option<DeviceSelection> {
    let graphics_family = first_family(&candidate.queue_families, |q| q.graphics);
    let Some(graphics_family) = graphics_family else {
        log::debug!("Skipping {}: no graphics queue family", candidate.name);
        return None;
    };

    match target {
        PresentTarget::Headless => Some(DeviceSelection {
            physical_device: candidate.handle,
            name: candidate.name.clone(),
            graphics_family,
            present_family: graphics_family,
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
        }),
        PresentTarget::Surface { preferred_mode } => {
            let Some(present_family) = first_family(&candidate.queue_families, |q| q.present)
            else {
                log::debug!("Skipping {}: no present queue family", candidate.name);
                return None;
            };
            let Some(surface_format) = pick_surface_format(&candidate.surface_formats) else {
                log::debug!("Skipping {}: no surface formats", candidate.name);
                return None;
            };
            if candidate.present_modes.is_empty() {
                log::debug!("Skipping {}: no present modes", candidate.name);
                return None;
            }

            Some(DeviceSelection {
                physical_device: candidate.handle,
                name: candidate.name.clone(),
                graphics_family,
                present_family,
                surface_format,
                present_mode: pick_present_mode(&candidate.present_modes, preferred_mode),
            })
        }
    }
}

fn first_family(
    families: &[QueueFamilySupport],
    predicate: impl Fn(&QueueFamilySupport) -> bool,
) -> Option<u32> {
    families
        .iter()
        .position(predicate)
        .map(|index| index as u32)
}

/// Prefer B8G8R8A8_UNORM / SRGB_NONLINEAR, otherwise take the first format.
pub fn pick_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Preferred mode if offered, then MAILBOX, then FIFO (always supported).
pub fn pick_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    [preferred, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}
