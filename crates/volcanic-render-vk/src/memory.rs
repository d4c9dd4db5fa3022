// SPDX-License-Identifier: CEPL-1.0
use anyhow::{ensure, Context, Result};
use ash::vk;

use crate::device::DeviceContext;
use crate::error::VkError;

/// First memory type allowed by `type_bits` whose flags contain `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, VkError> {
    (0..props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32))
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(VkError::NoSuitableMemoryType {
            type_bits,
            required,
        })
}

/// Sharing mode for a resource touched by `families`. Two or more distinct
/// families get concurrent sharing so no ownership transfer is needed.
pub(crate) fn sharing_for(families: &[u32]) -> (vk::SharingMode, Vec<u32>) {
    let mut fams = families.to_vec();
    fams.sort_unstable();
    fams.dedup();
    if fams.len() >= 2 {
        (vk::SharingMode::CONCURRENT, fams)
    } else {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    }
}

/// Buffer plus the memory bound to it, released together on drop.
pub struct GpuBuffer {
    device: ash::Device,
    pub(crate) buffer: vk::Buffer,
    pub(crate) memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    host_visible: bool,
}

impl GpuBuffer {
    /// create → requirements → allocate → bind. Partial failures are cleaned
    /// up by `Drop` since null handles are skipped by Vulkan.
    pub fn new(
        dev: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        families: &[u32],
    ) -> Result<Self> {
        ensure!(size > 0, "buffer size must be non-zero (usage {usage:?})");
        let device = &dev.device;
        let (sharing_mode, family_list) = sharing_for(families);

        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&family_list);
        let buffer = unsafe { device.create_buffer(&info, None) }
            .with_context(|| format!("create_buffer(size {size}, usage {usage:?})"))?;

        let mut out = Self {
            device: device.clone(),
            buffer,
            memory: vk::DeviceMemory::null(),
            size,
            host_visible: properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
        };

        let req = unsafe { device.get_buffer_memory_requirements(buffer) };
        let type_index =
            find_memory_type(&dev.memory_properties, req.memory_type_bits, properties)?;
        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(req.size)
            .memory_type_index(type_index);
        out.memory = unsafe { device.allocate_memory(&alloc, None) }.with_context(|| {
            format!(
                "allocate_memory({} bytes for buffer, usage {usage:?}, {properties:?})",
                req.size
            )
        })?;
        unsafe { device.bind_buffer_memory(buffer, out.memory, 0) }
            .context("bind_buffer_memory")?;
        Ok(out)
    }

    /// Host-visible, coherent, exclusive. Used for staging and per-frame uniforms.
    pub fn host_visible(
        dev: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(
            dev,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            &[],
        )
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn write_bytes(&self, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        ensure!(self.host_visible, "write to a buffer that is not host visible");
        ensure!(
            offset + bytes.len() as vk::DeviceSize <= self.size,
            "write of {} bytes at {offset} overflows buffer of {}",
            bytes.len(),
            self.size
        );
        if bytes.is_empty() {
            return Ok(());
        }
        unsafe {
            let ptr = self
                .device
                .map_memory(
                    self.memory,
                    offset,
                    bytes.len() as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .context("map_memory")?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        ensure!(self.host_visible, "read from a buffer that is not host visible");
        let len = self.size as usize;
        let mut out = vec![0u8; len];
        unsafe {
            let ptr = self
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("map_memory")?;
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.as_mut_ptr(), len);
            self.device.unmap_memory(self.memory);
        }
        Ok(out)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            p.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        p
    }

    const DL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HV: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HC: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    #[test]
    fn picks_first_allowed_type_with_flags() {
        let p = props(&[DL, HV | HC, DL | HV | HC]);
        assert_eq!(find_memory_type(&p, 0b111, HV | HC).unwrap(), 1);
        // type 1 masked out
        assert_eq!(find_memory_type(&p, 0b101, HV | HC).unwrap(), 2);
        assert_eq!(find_memory_type(&p, 0b111, DL).unwrap(), 0);
    }

    #[test]
    fn never_falls_back_to_weaker_flags() {
        let p = props(&[DL, HV]);
        let err = find_memory_type(&p, 0b11, HV | HC).unwrap_err();
        assert!(matches!(
            err,
            VkError::NoSuitableMemoryType { type_bits: 0b11, required } if required == HV | HC
        ));
    }

    #[test]
    fn bits_beyond_type_count_are_ignored() {
        let p = props(&[DL]);
        assert!(find_memory_type(&p, 0b10, DL).is_err());
    }

    #[test]
    fn sharing_is_concurrent_only_across_families() {
        assert_eq!(sharing_for(&[0, 0]).0, vk::SharingMode::EXCLUSIVE);
        assert_eq!(sharing_for(&[]).0, vk::SharingMode::EXCLUSIVE);
        let (mode, fams) = sharing_for(&[2, 0]);
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(fams, vec![0, 2]);
    }
}
