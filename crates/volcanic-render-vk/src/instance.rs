// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::ext::debug_utils;
use ash::khr::surface;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, c_void, CStr};
use tracing::{debug, error, info, trace, warn};

use crate::error::VkError;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const VALIDATION_LAYER_NAME: &str = "VK_LAYER_KHRONOS_validation";

/// Whether to run under the Khronos validation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationMode {
    Off,
    /// Enable when installed, otherwise warn and carry on.
    Auto,
    /// Enable or fail.
    Required,
}

impl Default for ValidationMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            ValidationMode::Auto
        } else {
            ValidationMode::Off
        }
    }
}

/// Decide whether validation gets enabled given what the loader reports.
pub fn resolve_validation(
    mode: ValidationMode,
    layer_available: bool,
    debug_ext_available: bool,
) -> Result<bool, VkError> {
    let available = layer_available && debug_ext_available;
    match mode {
        ValidationMode::Off => Ok(false),
        ValidationMode::Auto if !available => {
            warn!(
                "vk: validation requested but unavailable (layer={}, debug_utils={}); continuing without it",
                layer_available, debug_ext_available
            );
            Ok(false)
        }
        ValidationMode::Required if !available => Err(VkError::ValidationUnavailable {
            layer: VALIDATION_LAYER_NAME,
        }),
        _ => Ok(true),
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader hands us a valid callback struct for the duration of the call.
    let p_message = unsafe { (*data).p_message };
    if p_message.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr(p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vk {:?}] {}", types, msg);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vk {:?}] {}", types, msg);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!("[vk {:?}] {}", types, msg);
    } else {
        trace!("[vk {:?}] {}", types, msg);
    }
    vk::FALSE
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
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
        .pfn_user_callback(Some(debug_callback))
}

/// Loader entry, instance, optional debug messenger and optional surface.
///
/// Extension loaders are created here once and live exactly as long as the
/// instance they were loaded from.
pub struct InstanceContext {
    pub(crate) entry: Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) surface_loader: surface::Instance,
    pub(crate) surface: vk::SurfaceKHR,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    validation: bool,
}

impl InstanceContext {
    /// Create an instance. `display` adds the window-system extensions needed
    /// for a surface; pass `None` for offscreen work.
    pub fn new(display: Option<RawDisplayHandle>, mode: ValidationMode) -> Result<Self> {
        // --- Loader ---
        let entry = unsafe { Entry::load() }.map_err(VkError::from)?;

        // --- What the loader offers ---
        let layers = unsafe { entry.enumerate_instance_layer_properties() }
            .context("enumerate_instance_layer_properties")?;
        let layer_available = layers
            .iter()
            .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        let inst_exts = unsafe { entry.enumerate_instance_extension_properties(None) }
            .context("enumerate_instance_extension_properties")?;
        let debug_ext_available = inst_exts
            .iter()
            .any(|e| e.extension_name_as_c_str() == Ok(debug_utils::NAME));

        let validation = resolve_validation(mode, layer_available, debug_ext_available)?;
        info!("vk: validation = {}", validation);

        // --- Extensions + layers ---
        let mut ext_names: Vec<*const c_char> = match display {
            Some(dh) => ash_window::enumerate_required_extensions(dh)
                .context("enumerate_required_extensions")?
                .to_vec(),
            None => Vec::new(),
        };
        let mut layer_names: Vec<*const c_char> = Vec::new();
        if validation {
            ext_names.push(debug_utils::NAME.as_ptr());
            layer_names.push(VALIDATION_LAYER.as_ptr());
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"Volcanic")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"Volcanic Engine")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        // Chained so instance creation/destruction itself is also validated.
        let mut instance_debug = debug_messenger_info();
        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&ext_names)
            .enabled_layer_names(&layer_names);
        if validation {
            create_info = create_info.push_next(&mut instance_debug);
        }

        let instance =
            unsafe { entry.create_instance(&create_info, None) }.context("create_instance")?;
        let surface_loader = surface::Instance::new(&entry, &instance);

        let mut ctx = Self {
            entry,
            instance,
            surface_loader,
            surface: vk::SurfaceKHR::null(),
            debug: None,
            validation,
        };

        // --- Debug messenger (instance-scoped) ---
        if validation {
            let loader = debug_utils::Instance::new(&ctx.entry, &ctx.instance);
            let messenger =
                unsafe { loader.create_debug_utils_messenger(&debug_messenger_info(), None) }
                    .context("create_debug_utils_messenger")?;
            ctx.debug = Some((loader, messenger));
        }

        Ok(ctx)
    }

    /// Create an instance plus a surface for the given window.
    pub fn with_surface(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        mode: ValidationMode,
    ) -> Result<Self> {
        // STRICT ORDER: the surface must come from this instance before any
        // physical device is queried for present support against it.
        let mut ctx = Self::new(Some(display), mode)?;
        ctx.surface =
            unsafe { ash_window::create_surface(&ctx.entry, &ctx.instance, display, window, None) }
                .context("ash_window::create_surface")?;
        Ok(ctx)
    }

    pub fn has_surface(&self) -> bool {
        self.surface != vk::SurfaceKHR::null()
    }

    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }
}

// STRICT TEARDOWN ORDER: surface, messenger, instance. Every device created
// from this instance must already be gone.
impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            if self.has_surface() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
