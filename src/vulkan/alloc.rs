//! Device memory allocation through the Vulkan Memory Allocator (VMA).

use std::{ops::Deref, sync::Arc};

use ash::{prelude::VkResult, vk};

/// A reference-counted VMA allocator.
///
/// Buffer device address support is always enabled: every acceleration structure input and
/// shader binding table is addressed by device address.
#[derive(Clone)]
pub struct Allocator(Arc<AllocatorInner>);
struct AllocatorInner {
    device: ash::Device,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    inner: vk_mem::Allocator,
}

impl Allocator {
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<Self> {
        let mut info = vk_mem::AllocatorCreateInfo::new(instance, &device, physical_device);
        info.flags |= vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        info.vulkan_api_version = vk::API_VERSION_1_3;
        let inner = unsafe { vk_mem::Allocator::new(info)? };

        let properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let memory_types = properties.memory_types_as_slice()
            .iter()
            .map(|ty| ty.property_flags)
            .collect();
        Ok(Self(Arc::new(AllocatorInner {
            device,
            memory_types,
            inner,
        })))
    }

    pub fn device(&self) -> &ash::Device {
        &self.0.device
    }

    /// Property flags of the memory type an allocation landed in.
    pub(crate) fn memory_properties(&self, memory_type: u32) -> vk::MemoryPropertyFlags {
        self.0
            .memory_types
            .get(memory_type as usize)
            .copied()
            .unwrap_or_default()
    }
}

impl Deref for Allocator {
    type Target = vk_mem::Allocator;

    fn deref(&self) -> &Self::Target {
        &self.0.inner
    }
}
