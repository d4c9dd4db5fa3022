// SPDX-License-Identifier: CEPL-1.0
pub use glam::{Mat4, Vec3};

use bytemuck::{Pod, Zeroable};

/// Per-frame uniform block: model, view and projection, std140-compatible.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FrameTransforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl Default for FrameTransforms {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
        }
    }
}

impl FrameTransforms {
    /// Model spinning about +Z at 90 degrees per second, camera at (2, 2, 2) looking at the origin.
    pub fn spinning(seconds: f32, aspect: f32) -> Self {
        Self {
            model: Mat4::from_rotation_z(seconds * 90f32.to_radians()),
            view: Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z),
            proj: vulkan_perspective(45f32.to_radians(), aspect, 0.1, 10.0),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Right-handed perspective with a 0..1 depth range and clip-space Y pointing down.
pub fn vulkan_perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(fov_y, aspect, near, far);
    proj.y_axis.y *= -1.0;
    proj
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn uniform_block_is_three_packed_matrices() {
        assert_eq!(std::mem::size_of::<FrameTransforms>(), 3 * 64);
        assert_eq!(FrameTransforms::default().as_bytes().len(), 192);
    }

    #[test]
    fn projection_flips_y() {
        let gl = Mat4::perspective_rh(1.0, 1.0, 0.1, 10.0);
        let vk = vulkan_perspective(1.0, 1.0, 0.1, 10.0);
        assert_eq!(vk.y_axis.y, -gl.y_axis.y);
        assert_eq!(vk.x_axis.x, gl.x_axis.x);
    }

    #[test]
    fn origin_lands_inside_clip_volume() {
        let t = FrameTransforms::spinning(0.0, 800.0 / 600.0);
        let clip = t.proj * t.view * t.model * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn model_rotates_a_quarter_turn_per_second() {
        let t = FrameTransforms::spinning(1.0, 1.0);
        let p = t.model.transform_point3(Vec3::X);
        assert!((p - Vec3::Y).length() < 1e-5);
    }
}
