// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan backend: device selection, swapchain lifecycle, frames in flight
//! and staged resource uploads.

mod device;
mod error;
mod frame;
mod headless;
mod image;
mod instance;
mod memory;
mod pipeline;
mod renderer;
mod select;
mod swapchain;
mod transfer;

pub use device::{probe_candidates, DeviceContext};
pub use error::VkError;
pub use frame::{FrameSynchronizer, FrameTracker};
pub use headless::HeadlessContext;
pub use image::{has_stencil_component, mip_level_count, Texture};
pub use instance::{InstanceContext, ValidationMode};
pub use memory::{find_memory_type, GpuBuffer};
pub use pipeline::{load_spirv, spirv_from_bytes, vertex_attributes, vertex_binding};
pub use renderer::{VkConfig, VkRenderer};
pub use select::{
    check_suitable, resolve_queue_families, score, select_device, DeviceCandidate,
    DeviceRequirements, QueueFamilyIndices, QueueFamilyInfo, QueueRoles, SelectedDevice,
};
pub use swapchain::{
    choose_present_mode, choose_surface_format, extent_from_caps, plan_swapchain,
    rebuild_is_retryable, PresentPreference, SurfaceSupport, SwapchainLifecycle, SwapchainPlan,
    SwapchainStatus,
};
pub use transfer::{MeshBuffers, TransferEngine, TEXTURE_FORMAT};

pub use ash::vk;
