// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::vk;
use std::ffi::{c_char, CStr};
use tracing::info;

use crate::error::VkError;
use crate::instance::InstanceContext;
use crate::select::{
    DeviceCandidate, DeviceRequirements, QueueFamilyIndices, QueueFamilyInfo, QueueRoles,
    SelectedDevice,
};
use crate::swapchain::SurfaceSupport;

/// Gather everything the selector needs about each physical device.
pub fn probe_candidates(ctx: &InstanceContext) -> Result<Vec<DeviceCandidate>> {
    let instance = &ctx.instance;
    let physicals =
        unsafe { instance.enumerate_physical_devices() }.context("enumerate_physical_devices")?;

    let mut out = Vec::with_capacity(physicals.len());
    for phys in physicals {
        let props = unsafe { instance.get_physical_device_properties(phys) };
        let feats = unsafe { instance.get_physical_device_features(phys) };
        let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        let name = props
            .device_name_as_c_str()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_string());

        let mut queue_families = Vec::with_capacity(qprops.len());
        for (i, q) in qprops.iter().enumerate() {
            let present = if ctx.has_surface() {
                unsafe {
                    ctx.surface_loader.get_physical_device_surface_support(
                        phys,
                        i as u32,
                        ctx.surface,
                    )
                }
                .context("get_physical_device_surface_support")?
            } else {
                false
            };
            queue_families.push(QueueFamilyInfo {
                flags: q.queue_flags,
                count: q.queue_count,
                present,
            });
        }

        let extensions = unsafe { instance.enumerate_device_extension_properties(phys) }
            .context("enumerate_device_extension_properties")?
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();

        let surface_adequate = if ctx.has_surface() {
            let support = SurfaceSupport::query(&ctx.surface_loader, phys, ctx.surface)?;
            Some(support.is_adequate())
        } else {
            None
        };

        out.push(DeviceCandidate {
            handle: phys,
            name,
            device_type: props.device_type,
            max_image_dimension_2d: props.limits.max_image_dimension2_d,
            max_sampler_anisotropy: props.limits.max_sampler_anisotropy,
            geometry_shader: feats.geometry_shader == vk::TRUE,
            sampler_anisotropy: feats.sampler_anisotropy == vk::TRUE,
            queue_families,
            extensions,
            surface_adequate,
        });
    }
    Ok(out)
}

/// Logical device plus the queues and limits every other component reads.
pub struct DeviceContext {
    pub(crate) instance: ash::Instance,
    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) indices: QueueFamilyIndices,
    pub(crate) graphics_queue: vk::Queue,
    /// Null when presenting was not requested.
    pub(crate) present_queue: vk::Queue,
    pub(crate) transfer_queue: vk::Queue,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Set only when the device supports and we enabled sampler anisotropy.
    pub(crate) max_anisotropy: Option<f32>,
    pub(crate) name: String,
}

impl DeviceContext {
    pub fn new(
        ctx: &InstanceContext,
        selected: &SelectedDevice,
        req: &DeviceRequirements,
    ) -> Result<Self> {
        let instance = &ctx.instance;
        let cand = &selected.candidate;
        let indices = selected.indices;
        let phys = cand.handle;

        // --- One queue per distinct family ---
        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = indices
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        // --- Features: only what we use and the device has ---
        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: cand.sampler_anisotropy.into(),
            geometry_shader: (req.geometry_shader && cand.geometry_shader).into(),
            ..Default::default()
        };

        let ext_names: Vec<*const c_char> = req.extensions.iter().map(|e| e.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&ext_names)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(phys, &create_info, None) }
            .context("create_device")?;

        let queue = |family: Option<u32>| match family {
            Some(f) => unsafe { device.get_device_queue(f, 0) },
            None => vk::Queue::null(),
        };
        let graphics_queue = queue(indices.graphics);
        let present_queue = if req.roles.contains(QueueRoles::PRESENT) {
            queue(indices.present)
        } else {
            vk::Queue::null()
        };
        let transfer_queue = queue(indices.transfer);

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(phys) };
        let max_anisotropy = cand
            .sampler_anisotropy
            .then_some(cand.max_sampler_anisotropy);

        info!(
            "vk: device '{}' ready (families {:?}, dedicated transfer = {}, anisotropy = {:?})",
            cand.name,
            indices.unique_families(),
            indices.has_dedicated_transfer(),
            max_anisotropy
        );

        Ok(Self {
            instance: instance.clone(),
            phys,
            device,
            indices,
            graphics_queue,
            present_queue,
            transfer_queue,
            memory_properties,
            max_anisotropy,
            name: cand.name.clone(),
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indices(&self) -> QueueFamilyIndices {
        self.indices
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.phys, format)
        }
    }

    /// First candidate whose optimal-tiling features contain `features`.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        features: vk::FormatFeatureFlags,
    ) -> Result<vk::Format, VkError> {
        pick_format(candidates, features, |f| {
            self.format_properties(f).optimal_tiling_features
        })
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("device_wait_idle")
    }
}

pub(crate) fn pick_format(
    candidates: &[vk::Format],
    features: vk::FormatFeatureFlags,
    optimal_features: impl Fn(vk::Format) -> vk::FormatFeatureFlags,
) -> Result<vk::Format, VkError> {
    candidates
        .iter()
        .copied()
        .find(|&f| optimal_features(f).contains(features))
        .ok_or_else(|| VkError::NoSupportedFormat {
            candidates: candidates.to_vec(),
            features,
        })
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_format_takes_first_match_in_order() {
        let cands = [vk::Format::D32_SFLOAT, vk::Format::D24_UNORM_S8_UINT];
        let picked = pick_format(&cands, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT, |f| {
            if f == vk::Format::D24_UNORM_S8_UINT {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            }
        })
        .unwrap();
        assert_eq!(picked, vk::Format::D24_UNORM_S8_UINT);
    }

    #[test]
    fn pick_format_reports_all_candidates_on_failure() {
        let cands = [vk::Format::D32_SFLOAT];
        let err = pick_format(&cands, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT, |_| {
            vk::FormatFeatureFlags::empty()
        })
        .unwrap_err();
        assert!(matches!(err, VkError::NoSupportedFormat { ref candidates, .. } if candidates == &cands));
    }
}
