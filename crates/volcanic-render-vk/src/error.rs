// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;
use volcanic_render::AssetError;

#[derive(Debug, Error)]
pub enum VkError {
    #[error("failed to load the Vulkan loader: {0}")]
    Loader(#[from] ash::LoadingError),
    #[error("validation layer {layer} was required but is not installed")]
    ValidationUnavailable { layer: &'static str },
    #[error("no suitable GPU among {checked} candidate(s): {reason}")]
    NoSuitableDevice { checked: usize, reason: String },
    #[error("no memory type in mask {type_bits:#x} has {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },
    #[error("format {format:?} does not support linear blitting")]
    UnsupportedBlitFormat { format: vk::Format },
    #[error("none of {candidates:?} supports {features:?}")]
    NoSupportedFormat {
        candidates: Vec<vk::Format>,
        features: vk::FormatFeatureFlags,
    },
    #[error("swapchain creation failed: {0}")]
    SwapchainCreation(String),
    #[error("invalid upload: {0}")]
    InvalidUpload(#[from] AssetError),
    #[error("timed out waiting on {0}")]
    Timeout(&'static str),
}
