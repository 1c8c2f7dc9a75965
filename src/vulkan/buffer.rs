use std::fmt::Debug;

use ash::{prelude::VkResult, vk};
use vk_mem::Alloc;

use super::alloc::Allocator;
use crate::backend::{BackendBuffer, Residency};

/// A buffer bound to its own VMA allocation.
///
/// Host-visible buffers are persistently mapped.
pub struct VulkanBuffer {
    allocator: Allocator,
    allocation: vk_mem::Allocation,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    device_address: vk::DeviceAddress,
    memory_properties: vk::MemoryPropertyFlags,
}
unsafe impl Send for VulkanBuffer {}
unsafe impl Sync for VulkanBuffer {}
impl Debug for VulkanBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBuffer")
            .field("size", &self.size)
            .field("device_address", &self.device_address)
            .field("memory_properties", &self.memory_properties)
            .finish_non_exhaustive()
    }
}
impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.allocator
                .destroy_buffer(self.buffer, &mut self.allocation);
        }
    }
}

impl BackendBuffer for VulkanBuffer {
    fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    fn as_slice(&self) -> Option<&[u8]> {
        let mapped_data = self.mapped_ptr()?;
        Some(unsafe { std::slice::from_raw_parts(mapped_data, self.size as usize) })
    }
}

impl VulkanBuffer {
    pub fn new(
        allocator: Allocator,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: Residency,
    ) -> VkResult<Self> {
        let allocation_info = match residency {
            Residency::DeviceLocal => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::empty(),
                ..Default::default()
            },
            Residency::HostVisible => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
        };
        unsafe {
            let (buffer, allocation) = allocator.create_buffer_with_alignment(
                &vk::BufferCreateInfo {
                    size,
                    usage,
                    ..Default::default()
                },
                &allocation_info,
                alignment,
            )?;
            let info = allocator.get_allocation_info(&allocation);
            let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
                allocator
                    .device()
                    .get_buffer_device_address(&vk::BufferDeviceAddressInfo {
                        buffer,
                        ..Default::default()
                    })
            } else {
                0
            };
            Ok(Self {
                memory_properties: allocator.memory_properties(info.memory_type),
                allocator,
                allocation,
                buffer,
                size,
                device_address,
            })
        }
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    fn mapped_ptr(&self) -> Option<*mut u8> {
        if !self
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return None;
        }
        let mapped_data = self.allocator.get_allocation_info(&self.allocation).mapped_data as *mut u8;
        (!mapped_data.is_null()).then_some(mapped_data)
    }

    /// Copies `data` into the mapped memory at `offset` and flushes the written range.
    ///
    /// Returns `None` if the buffer is not host-visible or the range is out of bounds.
    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) -> Option<VkResult<()>> {
        let end = offset.checked_add(data.len() as vk::DeviceSize)?;
        if end > self.size {
            return None;
        }
        let mapped_data = self.mapped_ptr()?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped_data.add(offset as usize),
                data.len(),
            );
        }
        if self
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Some(Ok(()));
        }
        Some(
            self.allocator
                .flush_allocation(&self.allocation, offset, data.len() as vk::DeviceSize),
        )
    }
}
