use ash::{prelude::VkResult, khr::acceleration_structure, vk};

use super::{alloc::Allocator, buffer::VulkanBuffer};
use crate::backend::{BackendAccelStruct, BackendBuffer, Residency};

/// An acceleration structure together with the buffer backing it.
///
/// Dropping it destroys the handle first, then releases the buffer.
pub struct VulkanAccelStruct {
    loader: acceleration_structure::Device,
    buffer: VulkanBuffer,
    raw: vk::AccelerationStructureKHR,
    ty: vk::AccelerationStructureTypeKHR,
    device_address: vk::DeviceAddress,
}
impl Drop for VulkanAccelStruct {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_acceleration_structure(self.raw, None);
        }
    }
}

impl BackendAccelStruct for VulkanAccelStruct {
    fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.ty
    }

    fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
}

impl VulkanAccelStruct {
    /// Allocates a device-local backing buffer of `size` bytes and creates the structure on it.
    pub fn new(
        loader: acceleration_structure::Device,
        allocator: Allocator,
        size: vk::DeviceSize,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> VkResult<Self> {
        let buffer = VulkanBuffer::new(
            allocator,
            size,
            // Structure offsets must be 256-byte aligned.
            256,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            Residency::DeviceLocal,
        )?;
        unsafe {
            let raw = loader.create_acceleration_structure(
                &vk::AccelerationStructureCreateInfoKHR {
                    ty,
                    size,
                    buffer: buffer.raw(),
                    ..Default::default()
                },
                None,
            )?;
            let device_address = loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR {
                    acceleration_structure: raw,
                    ..Default::default()
                },
            );
            Ok(Self {
                loader,
                buffer,
                raw,
                ty,
                device_address,
            })
        }
    }

    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }
}
