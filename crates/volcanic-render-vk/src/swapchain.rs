// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::khr::{surface, swapchain};
use ash::vk;
use tracing::{info, warn};
use volcanic_render::RenderSize;

use crate::device::DeviceContext;
use crate::error::VkError;
use crate::image::{self, GpuImage};
use crate::instance::InstanceContext;
use crate::memory::sharing_for;

#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(
        loader: &surface::Instance,
        phys: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(phys, surface)
                    .context("get_physical_device_surface_capabilities")?,
                formats: loader
                    .get_physical_device_surface_formats(phys, surface)
                    .context("get_physical_device_surface_formats")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(phys, surface)
                    .context("get_physical_device_surface_present_modes")?,
            })
        }
    }

    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresentPreference {
    /// Mailbox when offered, FIFO otherwise.
    #[default]
    LowLatency,
    Fifo,
}

pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Result<vk::SurfaceFormatKHR, VkError> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .ok_or_else(|| VkError::SwapchainCreation("surface reports no formats".to_string()))
}

/// FIFO is always available, so it is the fallback.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preference: PresentPreference,
) -> vk::PresentModeKHR {
    match preference {
        PresentPreference::LowLatency if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        _ => vk::PresentModeKHR::FIFO,
    }
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            // max/min rather than clamp: a driver reporting min > max must not panic
            width: want
                .width
                .max(caps.min_image_extent.width)
                .min(caps.max_image_extent.width),
            height: want
                .height
                .max(caps.min_image_extent.height)
                .min(caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count != 0 {
        want.min(caps.max_image_count)
    } else {
        want
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

pub fn plan_swapchain(
    support: &SurfaceSupport,
    window: RenderSize,
    preference: PresentPreference,
) -> Result<SwapchainPlan, VkError> {
    let caps = &support.capabilities;
    let format = choose_surface_format(&support.formats)?;
    let present_mode = choose_present_mode(&support.present_modes, preference);
    let extent = extent_from_caps(caps, window);
    if extent.width == 0 || extent.height == 0 {
        return Err(VkError::SwapchainCreation(format!(
            "surface extent is {}x{}",
            extent.width, extent.height
        )));
    }
    let image_count = choose_image_count(caps);
    if image_count == 0 || image_count < caps.min_image_count {
        return Err(VkError::SwapchainCreation(format!(
            "cannot satisfy image count (min {}, max {})",
            caps.min_image_count, caps.max_image_count
        )));
    }
    Ok(SwapchainPlan {
        format,
        present_mode,
        extent,
        image_count,
        transform: caps.current_transform,
    })
}

/// Swapchain, its images and views, the matching depth buffer and framebuffers.
///
/// The image and view lists always have the same length as the count the
/// swapchain reported when it was created.
pub struct SwapchainBundle {
    device: ash::Device,
    loader: swapchain::Device,
    pub(crate) swapchain: vk::SwapchainKHR,
    pub(crate) plan: SwapchainPlan,
    pub(crate) images: Vec<vk::Image>,
    pub(crate) views: Vec<vk::ImageView>,
    pub(crate) framebuffers: Vec<vk::Framebuffer>,
    pub(crate) depth: GpuImage,
}

impl SwapchainBundle {
    fn new(
        dev: &DeviceContext,
        loader: &swapchain::Device,
        surface: vk::SurfaceKHR,
        plan: SwapchainPlan,
        depth_format: vk::Format,
    ) -> Result<Self> {
        // Depth first so a failure here leaves nothing swapchain-side behind.
        let depth = GpuImage::depth(dev, depth_format, plan.extent).context("depth attachment")?;

        let families: Vec<u32> = [dev.indices.graphics, dev.indices.present]
            .into_iter()
            .flatten()
            .collect();
        let (sharing_mode, family_list) = sharing_for(&families);

        // old_swapchain stays null: the previous one is fully torn down first.
        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(plan.image_count)
            .image_format(plan.format.format)
            .image_color_space(plan.format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_list)
            .pre_transform(plan.transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let swapchain = unsafe { loader.create_swapchain(&info, None) }
            .map_err(|e| VkError::SwapchainCreation(format!("create_swapchain: {e}")))?;

        let mut bundle = Self {
            device: dev.device.clone(),
            loader: loader.clone(),
            swapchain,
            plan,
            images: Vec::new(),
            views: Vec::new(),
            framebuffers: Vec::new(),
            depth,
        };

        bundle.images = unsafe { loader.get_swapchain_images(swapchain) }
            .context("get_swapchain_images")?;
        let device = &dev.device;
        bundle.views = views_for_images(
            &bundle.images,
            |img| {
                image::create_view(
                    device,
                    img,
                    plan.format.format,
                    vk::ImageAspectFlags::COLOR,
                    1,
                )
            },
            |view| unsafe { device.destroy_image_view(view, None) },
        )?;
        Ok(bundle)
    }

    pub(crate) fn attach_framebuffers(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        debug_assert!(self.framebuffers.is_empty());
        for &view in &self.views {
            let attachments = [view, self.depth.view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.plan.extent.width)
                .height(self.plan.extent.height)
                .layers(1);
            let fb = unsafe { self.device.create_framebuffer(&info, None) }
                .context("create_framebuffer")?;
            self.framebuffers.push(fb);
        }
        Ok(())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }

    pub fn format(&self) -> vk::Format {
        self.plan.format.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// One view per image, or none: on failure the views made so far go to
/// `destroy` before the error is returned.
pub(crate) fn views_for_images<M, D>(
    images: &[vk::Image],
    mut make: M,
    mut destroy: D,
) -> Result<Vec<vk::ImageView>>
where
    M: FnMut(vk::Image) -> Result<vk::ImageView>,
    D: FnMut(vk::ImageView),
{
    let mut views = Vec::with_capacity(images.len());
    for &img in images {
        match make(img) {
            Ok(view) => views.push(view),
            Err(e) => {
                views.drain(..).for_each(&mut destroy);
                return Err(e);
            }
        }
    }
    Ok(views)
}

// STRICT TEARDOWN ORDER: framebuffers (they reference the views), views,
// swapchain. The depth image field drops after this body.
impl Drop for SwapchainBundle {
    fn drop(&mut self) {
        unsafe {
            for &fb in &self.framebuffers {
                self.device.destroy_framebuffer(fb, None);
            }
            for &view in &self.views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainStatus {
    Uninitialized,
    Live,
    Stale,
}

/// Tracks whether the swapchain must be rebuilt and at what size.
/// Several resize notifications between frames collapse into one rebuild.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainLifecycle {
    status: SwapchainStatus,
    size: RenderSize,
    rebuilds: u64,
}

impl SwapchainLifecycle {
    pub fn new(size: RenderSize) -> Self {
        Self {
            status: SwapchainStatus::Uninitialized,
            size,
            rebuilds: 0,
        }
    }

    pub fn status(&self) -> SwapchainStatus {
        self.status
    }

    pub fn is_stale(&self) -> bool {
        self.status == SwapchainStatus::Stale
    }

    /// Size the next build will target.
    pub fn target_size(&self) -> RenderSize {
        self.size
    }

    pub fn mark_stale(&mut self, size: Option<RenderSize>) {
        if let Some(s) = size {
            self.size = s;
        }
        if self.status == SwapchainStatus::Live {
            self.status = SwapchainStatus::Stale;
        }
    }

    pub fn mark_live(&mut self) {
        if self.status != SwapchainStatus::Uninitialized {
            self.rebuilds += 1;
        }
        self.status = SwapchainStatus::Live;
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

/// A failed rebuild of an existing swapchain stays Stale and is retried on
/// the next frame when the failure came from swapchain creation itself.
pub fn rebuild_is_retryable(status: SwapchainStatus, err: &anyhow::Error) -> bool {
    status != SwapchainStatus::Uninitialized
        && err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<VkError>(),
                Some(VkError::SwapchainCreation(_))
            )
        })
}

pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    /// Out of date, timed out or not ready. The swapchain is now stale.
    Stale,
}

/// Owns the swapchain loader and the current bundle, and drives the
/// Uninitialized → Live → Stale → Live cycle.
pub struct SwapchainManager {
    bundle: Option<SwapchainBundle>,
    loader: swapchain::Device,
    lifecycle: SwapchainLifecycle,
    preference: PresentPreference,
    depth_format: vk::Format,
}

impl SwapchainManager {
    pub fn new(
        inst: &InstanceContext,
        dev: &DeviceContext,
        size: RenderSize,
        preference: PresentPreference,
    ) -> Result<Self> {
        let depth_format = image::depth_format(dev)?;
        let mut mgr = Self {
            bundle: None,
            loader: swapchain::Device::new(&inst.instance, &dev.device),
            lifecycle: SwapchainLifecycle::new(size),
            preference,
            depth_format,
        };
        mgr.build(inst, dev)?;
        Ok(mgr)
    }

    /// Create a bundle for the target size. `Ok(false)` when the surface is
    /// currently zero-sized (minimized) or a rebuild hit a retryable creation
    /// error; the status is left unchanged.
    pub fn build(&mut self, inst: &InstanceContext, dev: &DeviceContext) -> Result<bool> {
        debug_assert!(self.bundle.is_none());
        let support = SurfaceSupport::query(&inst.surface_loader, dev.phys, inst.surface)?;
        let target = self.lifecycle.target_size();
        let extent = extent_from_caps(&support.capabilities, target);
        // At startup a zero extent is fatal and is reported by plan_swapchain.
        if (extent.width == 0 || extent.height == 0)
            && self.lifecycle.status() != SwapchainStatus::Uninitialized
        {
            info!("vk: surface is 0x0, deferring swapchain rebuild");
            return Ok(false);
        }
        let created = plan_swapchain(&support, target, self.preference)
            .map_err(anyhow::Error::from)
            .and_then(|plan| {
                SwapchainBundle::new(dev, &self.loader, inst.surface, plan, self.depth_format)
                    .map(|bundle| (plan, bundle))
            });
        let (plan, bundle) = match created {
            Ok(created) => created,
            Err(e) if rebuild_is_retryable(self.lifecycle.status(), &e) => {
                warn!("vk: swapchain rebuild failed, retrying next frame: {e:#}");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        info!(
            "vk: swapchain {}x{} format={:?} color_space={:?} present_mode={:?} images={}",
            plan.extent.width,
            plan.extent.height,
            plan.format.format,
            plan.format.color_space,
            plan.present_mode,
            bundle.image_count()
        );
        self.bundle = Some(bundle);
        self.lifecycle.mark_live();
        Ok(true)
    }

    /// Drop the current bundle. The caller has already idled the device.
    pub fn teardown(&mut self) {
        self.bundle = None;
    }

    pub fn bundle(&self) -> Option<&SwapchainBundle> {
        self.bundle.as_ref()
    }

    pub fn bundle_mut(&mut self) -> Option<&mut SwapchainBundle> {
        self.bundle.as_mut()
    }

    pub fn lifecycle(&self) -> &SwapchainLifecycle {
        &self.lifecycle
    }

    pub fn mark_stale(&mut self, size: Option<RenderSize>) {
        self.lifecycle.mark_stale(size);
    }

    pub fn set_preference(&mut self, preference: PresentPreference) {
        if self.preference != preference {
            self.preference = preference;
            self.lifecycle.mark_stale(None);
        }
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn acquire(&mut self, signal: vk::Semaphore, timeout_ns: u64) -> Result<Acquired> {
        let Some(bundle) = &self.bundle else {
            return Ok(Acquired::Stale);
        };
        let res = unsafe {
            self.loader
                .acquire_next_image(bundle.swapchain, timeout_ns, signal, vk::Fence::null())
        };
        match res {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
            | Err(vk::Result::TIMEOUT)
            | Err(vk::Result::NOT_READY) => {
                self.lifecycle.mark_stale(None);
                Ok(Acquired::Stale)
            }
            Err(e) => Err(e).context("acquire_next_image"),
        }
    }

    /// Present `index` once `wait` signals. Returns whether a rebuild is due.
    pub fn present(&mut self, queue: vk::Queue, wait: vk::Semaphore, index: u32) -> Result<bool> {
        let Some(bundle) = &self.bundle else {
            return Ok(true);
        };
        let waits = [wait];
        let swapchains = [bundle.swapchain];
        let indices = [index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { self.loader.queue_present(queue, &info) } {
            Ok(false) => Ok(false),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.lifecycle.mark_stale(None);
                Ok(true)
            }
            Err(e) => Err(e).context("queue_present"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn sf(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn prefers_bgra_srgb_nonlinear() {
        let formats = [
            sf(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            sf(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap(), formats[1]);
    }

    #[test]
    fn falls_back_to_first_format() {
        let only = [sf(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(choose_surface_format(&only).unwrap(), only[0]);
        assert!(matches!(
            choose_surface_format(&[]),
            Err(VkError::SwapchainCreation(_))
        ));
    }

    #[test]
    fn fifo_only_surface_gets_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, PresentPreference::LowLatency),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn mailbox_only_when_asked() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, PresentPreference::LowLatency),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, PresentPreference::Fifo),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn sentinel_extent_uses_window_size() {
        let c = caps((u32::MAX, u32::MAX), (1, 1), (4096, 4096));
        let e = extent_from_caps(
            &c,
            RenderSize {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!((e.width, e.height), (1920, 1080));
    }

    #[test]
    fn sentinel_extent_is_clamped() {
        let c = caps((u32::MAX, u32::MAX), (64, 64), (1024, 768));
        let e = extent_from_caps(
            &c,
            RenderSize {
                width: 1920,
                height: 10,
            },
        );
        assert_eq!((e.width, e.height), (1024, 64));
    }

    #[test]
    fn fixed_extent_is_used_verbatim() {
        let c = caps((800, 600), (1, 1), (4096, 4096));
        let e = extent_from_caps(
            &c,
            RenderSize {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn image_count_respects_max() {
        let mut c = caps((800, 600), (1, 1), (4096, 4096));
        assert_eq!(choose_image_count(&c), 3);
        c.max_image_count = 2;
        assert_eq!(choose_image_count(&c), 2);
        c.max_image_count = 0;
        c.min_image_count = 4;
        assert_eq!(choose_image_count(&c), 5);
    }

    #[test]
    fn plan_rejects_zero_extent_and_empty_formats() {
        let mut support = SurfaceSupport {
            capabilities: caps((0, 0), (0, 0), (4096, 4096)),
            formats: vec![sf(
                vk::Format::B8G8R8A8_SRGB,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            )],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let size = RenderSize {
            width: 800,
            height: 600,
        };
        assert!(plan_swapchain(&support, size, PresentPreference::LowLatency).is_err());

        support.capabilities.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let plan = plan_swapchain(&support, size, PresentPreference::LowLatency).unwrap();
        assert_eq!(plan.image_count, 3);
        assert_eq!(plan.present_mode, vk::PresentModeKHR::FIFO);

        support.formats.clear();
        assert!(!support.is_adequate());
        assert!(plan_swapchain(&support, size, PresentPreference::LowLatency).is_err());
    }

    #[test]
    fn resizes_coalesce_into_one_rebuild() {
        let mut lc = SwapchainLifecycle::new(RenderSize {
            width: 800,
            height: 600,
        });
        assert_eq!(lc.status(), SwapchainStatus::Uninitialized);
        lc.mark_live();
        assert_eq!(lc.rebuilds(), 0);

        for w in [900, 1000, 1100] {
            lc.mark_stale(Some(RenderSize {
                width: w,
                height: 700,
            }));
        }
        assert!(lc.is_stale());
        assert_eq!(
            lc.target_size(),
            RenderSize {
                width: 1100,
                height: 700
            }
        );
        lc.mark_live();
        assert_eq!(lc.rebuilds(), 1);
        assert!(!lc.is_stale());
    }

    #[test]
    fn staleness_without_size_keeps_target() {
        let size = RenderSize {
            width: 640,
            height: 480,
        };
        let mut lc = SwapchainLifecycle::new(size);
        lc.mark_live();
        lc.mark_stale(None);
        assert!(lc.is_stale());
        assert_eq!(lc.target_size(), size);
    }

    fn fake_images(n: u64) -> Vec<vk::Image> {
        (1..=n).map(vk::Image::from_raw).collect()
    }

    #[test]
    fn one_view_per_image_on_every_build() {
        for count in [2, 3, 4, 3] {
            let images = fake_images(count);
            let views = views_for_images(
                &images,
                |img| Ok(vk::ImageView::from_raw(img.as_raw() + 100)),
                |_| panic!("nothing to destroy on success"),
            )
            .unwrap();
            assert_eq!(views.len(), images.len());
            assert_eq!(views.len() as u64, count);
        }
    }

    #[test]
    fn failed_view_creation_releases_earlier_views() {
        let images = fake_images(4);
        let mut destroyed = Vec::new();
        let res = views_for_images(
            &images,
            |img| {
                if img.as_raw() == 3 {
                    Err(anyhow::anyhow!("create_image_view"))
                } else {
                    Ok(vk::ImageView::from_raw(img.as_raw() + 100))
                }
            },
            |view| destroyed.push(view.as_raw()),
        );
        assert!(res.is_err());
        assert_eq!(destroyed, vec![101, 102]);
    }

    #[test]
    fn creation_errors_are_retryable_after_startup() {
        let err = anyhow::Error::from(VkError::SwapchainCreation(
            "create_swapchain: ERROR_OUT_OF_DATE_KHR".to_string(),
        ))
        .context("rebuild");
        assert!(rebuild_is_retryable(SwapchainStatus::Stale, &err));
        assert!(rebuild_is_retryable(SwapchainStatus::Live, &err));
        assert!(!rebuild_is_retryable(SwapchainStatus::Uninitialized, &err));

        let other = anyhow::Error::from(VkError::Timeout("swapchain image fence"));
        assert!(!rebuild_is_retryable(SwapchainStatus::Stale, &other));
        let plain = anyhow::anyhow!("create_framebuffer");
        assert!(!rebuild_is_retryable(SwapchainStatus::Stale, &plain));
    }

    #[test]
    fn uninitialized_does_not_become_stale() {
        let mut lc = SwapchainLifecycle::new(RenderSize {
            width: 1,
            height: 1,
        });
        lc.mark_stale(Some(RenderSize {
            width: 2,
            height: 2,
        }));
        assert_eq!(lc.status(), SwapchainStatus::Uninitialized);
        assert_eq!(lc.target_size().width, 2);
    }
}
