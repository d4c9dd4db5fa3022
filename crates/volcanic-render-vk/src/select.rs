// SPDX-License-Identifier: CEPL-1.0
//! Physical device ranking and queue family resolution.
//!
//! Everything here works on plain data gathered by [`crate::device::probe_candidates`],
//! so the policy can be exercised without a GPU.
use ash::khr::swapchain;
use ash::vk;
use std::ffi::{CStr, CString};
use tracing::{debug, info};

use crate::error::VkError;

bitflags::bitflags! {
    /// Queue capabilities the current feature set needs.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct QueueRoles: u8 {
        const GRAPHICS = 1;
        const PRESENT = 1 << 1;
        const TRANSFER = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self, required: QueueRoles) -> bool {
        (!required.contains(QueueRoles::GRAPHICS) || self.graphics.is_some())
            && (!required.contains(QueueRoles::PRESENT) || self.present.is_some())
            && (!required.contains(QueueRoles::TRANSFER) || self.transfer.is_some())
    }

    /// Distinct resolved families, ascending.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut fams: Vec<u32> = [self.graphics, self.present, self.transfer]
            .into_iter()
            .flatten()
            .collect();
        fams.sort_unstable();
        fams.dedup();
        fams
    }

    pub fn has_dedicated_transfer(&self) -> bool {
        matches!((self.graphics, self.transfer), (Some(g), Some(t)) if g != t)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub count: u32,
    /// Can present to the surface being rendered to; always false without one.
    pub present: bool,
}

/// Pick a family per role.
///
/// Present prefers the graphics family. Transfer prefers a family without
/// graphics (a dedicated DMA engine) and otherwise shares the graphics family,
/// which is always transfer-capable.
pub fn resolve_queue_families(families: &[QueueFamilyInfo]) -> QueueFamilyIndices {
    let usable = || {
        families
            .iter()
            .enumerate()
            .filter(|(_, f)| f.count > 0)
            .map(|(i, f)| (i as u32, f))
    };

    let graphics = usable()
        .find(|(_, f)| f.flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i);

    let present = match graphics {
        Some(g) if families[g as usize].present => Some(g),
        _ => usable().find(|(_, f)| f.present).map(|(i, _)| i),
    };

    let transfer = usable()
        .find(|(_, f)| {
            f.flags.contains(vk::QueueFlags::TRANSFER) && !f.flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|(i, _)| i)
        .or(graphics);

    QueueFamilyIndices {
        graphics,
        present,
        transfer,
    }
}

/// Immutable snapshot of one physical device.
#[derive(Clone, Debug)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub max_sampler_anisotropy: f32,
    pub geometry_shader: bool,
    pub sampler_anisotropy: bool,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub extensions: Vec<CString>,
    /// At least one surface format and one present mode; `None` without a surface.
    pub surface_adequate: Option<bool>,
}

impl DeviceCandidate {
    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|e| e.as_c_str() == name)
    }
}

#[derive(Clone, Debug)]
pub struct DeviceRequirements {
    pub roles: QueueRoles,
    pub extensions: Vec<&'static CStr>,
    pub geometry_shader: bool,
}

impl DeviceRequirements {
    pub fn windowed(geometry_shader: bool) -> Self {
        Self {
            roles: QueueRoles::all(),
            extensions: vec![swapchain::NAME],
            geometry_shader,
        }
    }

    pub fn headless() -> Self {
        Self {
            roles: QueueRoles::GRAPHICS | QueueRoles::TRANSFER,
            extensions: Vec::new(),
            geometry_shader: false,
        }
    }
}

/// 0 disqualifies. Otherwise discrete GPUs win, then larger max texture size.
pub fn score(candidate: &DeviceCandidate, req: &DeviceRequirements) -> u32 {
    if req.geometry_shader && !candidate.geometry_shader {
        return 0;
    }
    let discrete = if candidate.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        1000
    } else {
        0
    };
    discrete + candidate.max_image_dimension_2d
}

/// Why a candidate cannot serve the requirements, or the queue families it would use.
pub fn check_suitable(
    candidate: &DeviceCandidate,
    req: &DeviceRequirements,
) -> Result<QueueFamilyIndices, String> {
    let indices = resolve_queue_families(&candidate.queue_families);
    if !indices.is_complete(req.roles) {
        return Err(format!("missing queue roles (resolved {indices:?})"));
    }
    if let Some(missing) = req
        .extensions
        .iter()
        .find(|e| !candidate.supports_extension(e))
    {
        return Err(format!("missing extension {}", missing.to_string_lossy()));
    }
    if req.roles.contains(QueueRoles::PRESENT) && candidate.surface_adequate != Some(true) {
        return Err("no surface formats or present modes".to_string());
    }
    if req.geometry_shader && !candidate.geometry_shader {
        return Err("no geometry shader support".to_string());
    }
    Ok(indices)
}

#[derive(Clone, Debug)]
pub struct SelectedDevice {
    pub candidate: DeviceCandidate,
    pub indices: QueueFamilyIndices,
}

/// Walk candidates best score first and take the first that is also suitable.
pub fn select_device(
    candidates: &[DeviceCandidate],
    req: &DeviceRequirements,
) -> Result<SelectedDevice, VkError> {
    let mut ranked: Vec<(u32, &DeviceCandidate)> =
        candidates.iter().map(|c| (score(c, req), c)).collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));

    let mut rejected = Vec::new();
    for (s, c) in ranked {
        if s == 0 {
            rejected.push(format!("{}: score 0", c.name));
            continue;
        }
        match check_suitable(c, req) {
            Ok(indices) => {
                info!(
                    "vk: selected '{}' ({:?}, score {}) queues {:?}",
                    c.name, c.device_type, s, indices
                );
                return Ok(SelectedDevice {
                    candidate: c.clone(),
                    indices,
                });
            }
            Err(why) => {
                debug!("vk: rejected '{}' (score {}): {}", c.name, s, why);
                rejected.push(format!("{}: {}", c.name, why));
            }
        }
    }

    Err(VkError::NoSuitableDevice {
        checked: candidates.len(),
        reason: if rejected.is_empty() {
            "no Vulkan devices reported".to_string()
        } else {
            rejected.join("; ")
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            flags,
            count: 1,
            present,
        }
    }

    fn gpu(name: &str, ty: vk::PhysicalDeviceType, max_dim: u32) -> DeviceCandidate {
        DeviceCandidate {
            handle: vk::PhysicalDevice::null(),
            name: name.to_string(),
            device_type: ty,
            max_image_dimension_2d: max_dim,
            max_sampler_anisotropy: 16.0,
            geometry_shader: true,
            sampler_anisotropy: true,
            queue_families: vec![family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                true,
            )],
            extensions: vec![swapchain::NAME.to_owned()],
            surface_adequate: Some(true),
        }
    }

    #[test]
    fn discrete_outranks_larger_integrated() {
        let req = DeviceRequirements::windowed(false);
        let integrated = gpu("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 16384);
        let discrete = gpu("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        assert_eq!(score(&integrated, &req), 16384);
        assert_eq!(score(&discrete, &req), 9192);

        let both = [
            gpu("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192),
            gpu("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
        ];
        assert_eq!(select_device(&both, &req).unwrap().candidate.name, "dgpu");
    }

    #[test]
    fn missing_geometry_shader_scores_zero_when_required() {
        let mut c = gpu("g", vk::PhysicalDeviceType::DISCRETE_GPU, 4096);
        c.geometry_shader = false;
        assert_eq!(score(&c, &DeviceRequirements::windowed(true)), 0);
        assert_eq!(score(&c, &DeviceRequirements::windowed(false)), 5096);
    }

    #[test]
    fn falls_through_to_next_ranked_candidate() {
        let req = DeviceRequirements::windowed(false);
        let mut best = gpu("best", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        best.queue_families = vec![family(vk::QueueFlags::GRAPHICS, false)];
        let fallback = gpu("fallback", vk::PhysicalDeviceType::INTEGRATED_GPU, 4096);
        let picked = select_device(&[best, fallback], &req).unwrap();
        assert_eq!(picked.candidate.name, "fallback");
    }

    #[test]
    fn graphics_without_present_is_rejected() {
        let req = DeviceRequirements::windowed(false);
        let mut c = gpu("nopresent", vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        c.queue_families = vec![
            family(vk::QueueFlags::GRAPHICS, false),
            family(vk::QueueFlags::COMPUTE, false),
        ];
        let err = select_device(&[c], &req).unwrap_err();
        assert!(matches!(err, VkError::NoSuitableDevice { checked: 1, .. }));
    }

    #[test]
    fn missing_swapchain_extension_is_rejected() {
        let req = DeviceRequirements::windowed(false);
        let mut c = gpu("noswap", vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        c.extensions.clear();
        assert!(check_suitable(&c, &req)
            .unwrap_err()
            .contains("VK_KHR_swapchain"));
        // offscreen work does not need it
        assert!(check_suitable(&c, &DeviceRequirements::headless()).is_ok());
    }

    #[test]
    fn inadequate_surface_is_rejected() {
        let req = DeviceRequirements::windowed(false);
        let mut c = gpu("nosurf", vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        c.surface_adequate = Some(false);
        assert!(check_suitable(&c, &req).is_err());
    }

    #[test]
    fn empty_list_reports_no_device() {
        let err = select_device(&[], &DeviceRequirements::headless()).unwrap_err();
        match err {
            VkError::NoSuitableDevice { checked, reason } => {
                assert_eq!(checked, 0);
                assert!(reason.contains("no Vulkan devices"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_score_is_never_selected() {
        let mut c = gpu("weak", vk::PhysicalDeviceType::CPU, 0);
        c.geometry_shader = false;
        let err = select_device(&[c], &DeviceRequirements::windowed(false)).unwrap_err();
        assert!(matches!(err, VkError::NoSuitableDevice { .. }));
    }

    #[test]
    fn dedicated_transfer_family_is_preferred() {
        let fams = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, true),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::TRANSFER, false),
        ];
        let ix = resolve_queue_families(&fams);
        assert_eq!(ix.graphics, Some(0));
        assert_eq!(ix.present, Some(0));
        assert_eq!(ix.transfer, Some(1));
        assert!(ix.has_dedicated_transfer());
        assert_eq!(ix.unique_families(), vec![0, 1]);
    }

    #[test]
    fn transfer_falls_back_to_graphics() {
        let fams = [family(vk::QueueFlags::GRAPHICS, true)];
        let ix = resolve_queue_families(&fams);
        assert_eq!(ix.transfer, Some(0));
        assert!(!ix.has_dedicated_transfer());
        assert_eq!(ix.unique_families(), vec![0]);
    }

    #[test]
    fn present_uses_separate_family_when_graphics_cannot() {
        let fams = [
            family(vk::QueueFlags::GRAPHICS, false),
            family(vk::QueueFlags::COMPUTE, true),
        ];
        let ix = resolve_queue_families(&fams);
        assert_eq!(ix.present, Some(1));
        assert!(ix.is_complete(QueueRoles::all()));
    }

    #[test]
    fn completeness_only_checks_required_roles() {
        let ix = QueueFamilyIndices {
            graphics: Some(0),
            present: None,
            transfer: Some(0),
        };
        assert!(ix.is_complete(QueueRoles::GRAPHICS | QueueRoles::TRANSFER));
        assert!(!ix.is_complete(QueueRoles::all()));
    }
}
