//! Shader binding table layout.
//!
//! The table is one host-visible buffer of `stride * group_count` bytes. Group `i` starts at
//! `i * stride`: its opaque handle comes first, followed by up to
//! [`ShaderGroupConfig::record_size`] bytes of inline record data. The remainder of each slot is
//! padding.
//!
//! Group order must match the order in which the pipeline declared its shader groups:
//!
//! | Groups | Kind |
//! |---|---|
//! | `0` | raygen |
//! | `1 ..= miss` | miss |
//! | `1 + miss ..` | hit groups, one per distinct closest-hit program |
//! | after the hit groups | callable |

use ash::vk;

use crate::{
    backend::{BackendBuffer, RayTracingBackend, Residency, ShaderGroupProperties},
    config::ShaderGroupConfig,
    error::{BuildError, Result},
    utils::align_up,
};

/// Per-device record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    handle_size: u32,
    handle_alignment: u32,
    base_alignment: u32,
    record_size: u32,
    stride: u32,
}

impl SbtLayout {
    /// Computes the stride of a table whose groups carry `record_size` bytes of inline data.
    ///
    /// Fails if the device reports a zero handle size or an alignment that is not a power of
    /// two, or if the stride exceeds `max_stride`.
    pub fn new(properties: ShaderGroupProperties, record_size: u32) -> Result<Self> {
        if properties.handle_size == 0 {
            return Err(BuildError::ZeroHandleSize);
        }
        for alignment in [properties.handle_alignment, properties.base_alignment] {
            if !alignment.is_power_of_two() {
                return Err(BuildError::InvalidAlignment(alignment));
            }
        }
        let header_size = align_up(
            properties.handle_size as u64,
            properties.handle_alignment as u64,
        );
        let stride = align_up(
            header_size + record_size as u64,
            properties.base_alignment as u64,
        );
        if stride > properties.max_stride as u64 {
            return Err(BuildError::StrideExceedsLimit {
                stride: stride.min(u32::MAX as u64) as u32,
                max: properties.max_stride,
            });
        }
        let stride = stride as u32;
        if stride % properties.base_alignment != 0 {
            return Err(BuildError::MisalignedStride {
                stride,
                alignment: properties.base_alignment,
            });
        }
        Ok(Self {
            handle_size: properties.handle_size,
            handle_alignment: properties.handle_alignment,
            base_alignment: properties.base_alignment,
            record_size,
            stride,
        })
    }

    /// Size of the opaque group handle at the start of every slot.
    pub fn header_size(&self) -> u32 {
        self.handle_size
    }
    pub fn base_alignment(&self) -> u32 {
        self.base_alignment
    }
    pub fn handle_alignment(&self) -> u32 {
        self.handle_alignment
    }
    pub fn stride(&self) -> u32 {
        self.stride
    }
    pub fn record_size(&self) -> u32 {
        self.record_size
    }
    /// Byte offset of inline record data within a slot.
    pub fn record_offset(&self) -> u32 {
        align_up(self.handle_size as u64, self.handle_alignment as u64) as u32
    }
}

/// Dispatch regions for `vkCmdTraceRaysKHR`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

pub struct ShaderBindingTable<B: RayTracingBackend> {
    layout: SbtLayout,
    groups: ShaderGroupConfig,
    buffer: B::Buffer,
}

impl<B: RayTracingBackend> ShaderBindingTable<B> {
    /// Fetches every group handle of `pipeline` and lays them out in a new table.
    pub fn new(backend: &mut B, pipeline: &B::Pipeline, groups: ShaderGroupConfig) -> Result<Self> {
        let layout = SbtLayout::new(backend.shader_group_properties(), groups.record_size)?;
        let group_count = groups.group_count();
        let handles = backend.shader_group_handles(pipeline, group_count)?;
        let handle_size = layout.handle_size as usize;
        let expected = handle_size * group_count as usize;
        if handles.len() != expected {
            return Err(BuildError::ShaderGroupHandleMismatch {
                expected,
                actual: handles.len(),
            });
        }

        let stride = layout.stride as usize;
        let mut data = vec![0u8; stride * group_count as usize];
        for (slot, handle) in data.chunks_exact_mut(stride).zip(handles.chunks_exact(handle_size)) {
            slot[..handle_size].copy_from_slice(handle);
        }
        let mut buffer = backend.allocate_buffer(
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            Residency::HostVisible,
        )?;
        backend.write_buffer(&mut buffer, 0, &data)?;
        tracing::info!(
            groups = group_count,
            stride = layout.stride,
            bytes = data.len(),
            "Shader binding table created"
        );
        Ok(Self {
            layout,
            groups,
            buffer,
        })
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }
    pub fn groups(&self) -> &ShaderGroupConfig {
        &self.groups
    }
    pub fn buffer(&self) -> &B::Buffer {
        &self.buffer
    }
    pub fn hit_group_count(&self) -> u32 {
        self.groups.hit
    }

    /// Byte offset of `group`'s slot.
    pub fn group_offset(&self, group: u32) -> vk::DeviceSize {
        group as vk::DeviceSize * self.layout.stride as vk::DeviceSize
    }

    /// Writes inline record data for `group`, right after its handle.
    pub fn write_record(&mut self, backend: &mut B, group: u32, data: &[u8]) -> Result<()> {
        let count = self.groups.group_count();
        if group >= count {
            return Err(BuildError::UnknownShaderGroup { group, count });
        }
        if data.len() > self.layout.record_size as usize {
            return Err(BuildError::RecordTooLarge {
                group,
                size: data.len(),
                capacity: self.layout.record_size,
            });
        }
        let offset = self.group_offset(group) + self.layout.record_offset() as vk::DeviceSize;
        backend.write_buffer(&mut self.buffer, offset, data)
    }

    pub fn regions(&self) -> SbtRegions {
        let base = self.buffer.device_address();
        let stride = self.layout.stride as vk::DeviceSize;
        let region = |first: u32, count: u32| {
            if count == 0 {
                return vk::StridedDeviceAddressRegionKHR::default();
            }
            vk::StridedDeviceAddressRegionKHR {
                device_address: base + self.group_offset(first),
                stride,
                size: stride * count as vk::DeviceSize,
            }
        };
        SbtRegions {
            raygen: region(0, 1),
            miss: region(self.groups.first_miss(), self.groups.miss),
            hit: region(self.groups.first_hit(), self.groups.hit),
            callable: region(self.groups.first_callable(), self.groups.callable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SoftwareBackend, software::SoftwarePipeline};

    fn properties(max_stride: u32) -> ShaderGroupProperties {
        ShaderGroupProperties {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
            max_stride,
        }
    }

    #[test]
    fn test_stride_rounds_to_base_alignment() {
        let layout = SbtLayout::new(properties(4096), 0).unwrap();
        assert_eq!(layout.stride(), 64);
        assert_eq!(layout.stride() % layout.base_alignment(), 0);
        assert_eq!(layout.header_size(), 32);

        let layout = SbtLayout::new(properties(4096), 40).unwrap();
        assert_eq!(layout.stride(), 128);
        assert_eq!(layout.record_offset(), 32);
    }

    #[test]
    fn test_stride_over_device_limit() {
        assert!(matches!(
            SbtLayout::new(properties(32), 0),
            Err(BuildError::StrideExceedsLimit {
                stride: 64,
                max: 32
            })
        ));
    }

    #[test]
    fn test_invalid_alignment() {
        let mut props = properties(4096);
        props.base_alignment = 48;
        assert!(matches!(
            SbtLayout::new(props, 0),
            Err(BuildError::InvalidAlignment(48))
        ));
    }

    #[test]
    fn test_zero_handle_size() {
        let mut props = properties(4096);
        props.handle_size = 0;
        assert!(matches!(
            SbtLayout::new(props, 0),
            Err(BuildError::ZeroHandleSize)
        ));
        let mut backend = SoftwareBackend::with_shader_group_properties(props);
        let pipeline = SoftwarePipeline::new(3);
        assert!(matches!(
            ShaderBindingTable::new(&mut backend, &pipeline, ShaderGroupConfig::default()),
            Err(BuildError::ZeroHandleSize)
        ));
    }

    fn table(
        backend: &mut SoftwareBackend,
        groups: ShaderGroupConfig,
    ) -> ShaderBindingTable<SoftwareBackend> {
        let pipeline = SoftwarePipeline::new(groups.group_count());
        ShaderBindingTable::new(backend, &pipeline, groups).unwrap()
    }

    #[test]
    fn test_handles_are_placed_at_stride() {
        let mut backend = SoftwareBackend::new();
        let groups = ShaderGroupConfig {
            miss: 2,
            hit: 3,
            ..Default::default()
        };
        let sbt = table(&mut backend, groups);
        assert_eq!(sbt.buffer().size(), 64 * 6);
        let bytes = sbt.buffer().as_slice().unwrap();
        for group in 0..6u32 {
            let offset = sbt.group_offset(group) as usize;
            assert_eq!(&bytes[offset..offset + 4], &group.to_le_bytes());
            assert!(bytes[offset + 32..offset + 64].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_regions() {
        let mut backend = SoftwareBackend::new();
        let groups = ShaderGroupConfig {
            miss: 2,
            hit: 3,
            ..Default::default()
        };
        let sbt = table(&mut backend, groups);
        let base = sbt.buffer().device_address();
        let regions = sbt.regions();
        assert_eq!(regions.raygen.device_address, base);
        assert_eq!(regions.raygen.size, regions.raygen.stride);
        assert_eq!(regions.miss.device_address, base + 64);
        assert_eq!(regions.miss.size, 128);
        assert_eq!(regions.hit.device_address, base + 3 * 64);
        assert_eq!(regions.hit.size, 3 * 64);
        assert_eq!(regions.callable.size, 0);
        assert_eq!(regions.callable.device_address, 0);
        assert_eq!(regions.hit.device_address % 64, 0);
    }

    #[test]
    fn test_write_record() {
        let mut backend = SoftwareBackend::new();
        let groups = ShaderGroupConfig {
            record_size: 16,
            ..Default::default()
        };
        let mut sbt = table(&mut backend, groups);
        sbt.write_record(&mut backend, 2, &[7; 16]).unwrap();
        let bytes = sbt.buffer().as_slice().unwrap();
        let offset = sbt.group_offset(2) as usize;
        assert_eq!(&bytes[offset..offset + 4], &2u32.to_le_bytes());
        assert_eq!(&bytes[offset + 32..offset + 48], &[7; 16]);

        assert!(matches!(
            sbt.write_record(&mut backend, 2, &[0; 17]),
            Err(BuildError::RecordTooLarge { .. })
        ));
        assert!(matches!(
            sbt.write_record(&mut backend, 3, &[0; 4]),
            Err(BuildError::UnknownShaderGroup { group: 3, count: 3 })
        ));
    }

    #[test]
    fn test_pipeline_with_too_few_groups() {
        let mut backend = SoftwareBackend::new();
        let pipeline = SoftwarePipeline::new(2);
        let result =
            ShaderBindingTable::new(&mut backend, &pipeline, ShaderGroupConfig::default());
        assert!(result.is_err());
    }
}
