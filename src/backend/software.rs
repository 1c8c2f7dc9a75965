//! A CPU-only [`RayTracingBackend`].
//!
//! The software backend hands out fake, 256-byte aligned device addresses and keeps every
//! allocation in a ledger so address ranges can be checked against live buffers. Acceleration
//! structures are never actually built; instead the backend enforces the lifecycle a real
//! driver requires:
//!
//! - the destination of a build must be at least as large as [`build_sizes`](RayTracingBackend::build_sizes) reported,
//! - vertex, index, instance and scratch ranges must lie inside live buffers with the right usage,
//! - scratch ranges of one submission must not overlap,
//! - compacted sizes can only be queried after a build with `ALLOW_COMPACTION`,
//! - a compaction destination must be at least the queried compacted size.
//!
//! Buffer contents are kept on the host regardless of residency, so the exact bytes the
//! shaders would read can be inspected in tests.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use ash::vk;

use super::{
    BackendAccelStruct, BackendBuffer, BuildGeometry, BuildInput, BuildRequest, BuildSizes,
    RayTracingBackend, Residency, ShaderGroupProperties,
};
use crate::{
    error::{BuildError, Result},
    utils::align_up,
};

const ADDRESS_ALIGNMENT: u64 = 256;
const BASE_ADDRESS: u64 = 0x1000_0000;

struct Allocation {
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
}

#[derive(Default)]
struct Ledger {
    allocations: Mutex<BTreeMap<vk::DeviceAddress, Allocation>>,
    next_address: AtomicU64,
    submissions: AtomicU64,
}
impl Ledger {
    fn allocate(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> vk::DeviceAddress {
        let address = self
            .next_address
            .fetch_add(align_up(size, ADDRESS_ALIGNMENT), Ordering::Relaxed)
            + BASE_ADDRESS;
        self.allocations
            .lock()
            .unwrap()
            .insert(address, Allocation { size, usage });
        address
    }

    fn release(&self, address: vk::DeviceAddress) {
        self.allocations.lock().unwrap().remove(&address);
    }

    /// Checks that `[address, address + len)` lies inside one live buffer created with `usage`.
    fn check_range(
        &self,
        what: &str,
        address: vk::DeviceAddress,
        len: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<()> {
        let allocations = self.allocations.lock().unwrap();
        let Some((&start, allocation)) = allocations.range(..=address).next_back() else {
            return Err(BuildError::Backend(format!(
                "{what} address {address:#x} does not belong to any buffer"
            )));
        };
        if address + len > start + allocation.size {
            return Err(BuildError::Backend(format!(
                "{what} range {address:#x}+{len} overruns its buffer ({start:#x}+{})",
                allocation.size
            )));
        }
        if !allocation.usage.contains(usage) {
            return Err(BuildError::Backend(format!(
                "{what} buffer is missing usage {usage:?}"
            )));
        }
        Ok(())
    }

    fn submit(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }
}

/// A buffer in the software backend's simulated device memory.
pub struct SoftwareBuffer {
    ledger: Arc<Ledger>,
    address: vk::DeviceAddress,
    usage: vk::BufferUsageFlags,
    residency: Residency,
    data: Vec<u8>,
}
impl Drop for SoftwareBuffer {
    fn drop(&mut self) {
        self.ledger.release(self.address);
    }
}
impl std::fmt::Debug for SoftwareBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBuffer")
            .field("address", &self.address)
            .field("size", &self.data.len())
            .field("usage", &self.usage)
            .field("residency", &self.residency)
            .finish_non_exhaustive()
    }
}
impl BackendBuffer for SoftwareBuffer {
    fn size(&self) -> vk::DeviceSize {
        self.data.len() as vk::DeviceSize
    }

    fn device_address(&self) -> vk::DeviceAddress {
        if self
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            self.address
        } else {
            0
        }
    }

    fn as_slice(&self) -> Option<&[u8]> {
        Some(&self.data)
    }
}
impl SoftwareBuffer {
    pub fn residency(&self) -> Residency {
        self.residency
    }
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }
}

/// An acceleration structure in the software backend.
pub struct SoftwareAccelStruct {
    buffer: SoftwareBuffer,
    ty: vk::AccelerationStructureTypeKHR,
    built: AtomicBool,
    build_flags: AtomicU32,
    compacted_size: AtomicU64,
    primitive_count: AtomicU32,
}
impl BackendAccelStruct for SoftwareAccelStruct {
    fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.ty
    }

    fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.buffer.address
    }
}
impl SoftwareAccelStruct {
    /// Whether a build or compacting copy has written this structure.
    pub fn is_built(&self) -> bool {
        self.built.load(Ordering::Acquire)
    }

    /// Number of primitives in the build that last wrote this structure.
    pub fn primitive_count(&self) -> u32 {
        self.primitive_count.load(Ordering::Acquire)
    }

    fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        vk::BuildAccelerationStructureFlagsKHR::from_raw(self.build_flags.load(Ordering::Acquire))
    }

    fn mark_built(
        &self,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        compacted_size: vk::DeviceSize,
        primitive_count: u32,
    ) {
        self.build_flags.store(flags.as_raw(), Ordering::Release);
        self.compacted_size.store(compacted_size, Ordering::Release);
        self.primitive_count
            .store(primitive_count, Ordering::Release);
        self.built.store(true, Ordering::Release);
    }
}

/// A pipeline stand-in: only the number of shader groups matters to the software backend.
#[derive(Debug, Clone, Copy)]
pub struct SoftwarePipeline {
    pub group_count: u32,
}
impl SoftwarePipeline {
    pub fn new(group_count: u32) -> Self {
        Self { group_count }
    }
}

/// A [`RayTracingBackend`] that runs entirely on the CPU.
pub struct SoftwareBackend {
    ledger: Arc<Ledger>,
    shader_group_properties: ShaderGroupProperties,
    scratch_alignment: vk::DeviceSize,
}
impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}
impl SoftwareBackend {
    /// Creates a backend reporting limits typical of current discrete GPUs.
    pub fn new() -> Self {
        Self::with_shader_group_properties(ShaderGroupProperties {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
            max_stride: 4096,
        })
    }

    pub fn with_shader_group_properties(properties: ShaderGroupProperties) -> Self {
        Self {
            ledger: Arc::new(Ledger::default()),
            shader_group_properties: properties,
            scratch_alignment: 128,
        }
    }

    /// Total bytes held by live buffers, including acceleration structure storage.
    pub fn live_bytes(&self) -> vk::DeviceSize {
        self.ledger
            .allocations
            .lock()
            .unwrap()
            .values()
            .map(|allocation| allocation.size)
            .sum()
    }

    /// Number of live buffers, including acceleration structure storage.
    pub fn live_buffers(&self) -> usize {
        self.ledger.allocations.lock().unwrap().len()
    }

    /// Number of submit-and-wait operations performed so far.
    pub fn submissions(&self) -> u64 {
        self.ledger.submissions.load(Ordering::Relaxed)
    }

    fn new_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: Residency,
    ) -> Result<SoftwareBuffer> {
        if size == 0 {
            return Err(BuildError::Backend(
                "buffers must not be zero-sized".to_string(),
            ));
        }
        let address = self.ledger.allocate(size, usage);
        Ok(SoftwareBuffer {
            ledger: self.ledger.clone(),
            address,
            usage,
            residency,
            data: vec![0; size as usize],
        })
    }

    fn validate_build(&self, input: &BuildInput) -> Result<()> {
        let input_usage = vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let count = input.primitive_count() as u64;
        let offset = input.range.primitive_offset as u64;
        match input.geometry {
            BuildGeometry::Triangles {
                vertex_data,
                vertex_stride,
                max_vertex,
                index_data,
                ..
            } => {
                if input.ty != vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL {
                    return Err(BuildError::Backend(
                        "triangle geometry requires a bottom-level structure".to_string(),
                    ));
                }
                if offset % 4 != 0 {
                    return Err(BuildError::Backend(format!(
                        "index offset {offset} is not aligned to the index size"
                    )));
                }
                self.ledger.check_range(
                    "vertex",
                    vertex_data,
                    (max_vertex as u64 + 1) * vertex_stride,
                    input_usage,
                )?;
                self.ledger
                    .check_range("index", index_data + offset, count * 12, input_usage)?;
            }
            BuildGeometry::Instances { data } => {
                if input.ty != vk::AccelerationStructureTypeKHR::TOP_LEVEL {
                    return Err(BuildError::Backend(
                        "instance geometry requires a top-level structure".to_string(),
                    ));
                }
                if (data + offset) % 16 != 0 {
                    return Err(BuildError::Backend(
                        "instance data must be aligned to 16 bytes".to_string(),
                    ));
                }
                if count > 0 {
                    self.ledger.check_range(
                        "instance",
                        data + offset,
                        count * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64,
                        input_usage,
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl RayTracingBackend for SoftwareBackend {
    type Buffer = SoftwareBuffer;
    type AccelStruct = SoftwareAccelStruct;
    type Pipeline = SoftwarePipeline;

    fn allocate_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: Residency,
    ) -> Result<SoftwareBuffer> {
        self.new_buffer(size, usage, residency)
    }

    fn write_buffer(
        &mut self,
        buffer: &mut SoftwareBuffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        if buffer.residency != Residency::HostVisible {
            return Err(BuildError::Backend(
                "cannot map a device-local buffer".to_string(),
            ));
        }
        let start = offset as usize;
        let Some(dst) = buffer.data.get_mut(start..start + data.len()) else {
            return Err(BuildError::Backend(format!(
                "write of {} bytes at {offset} overruns a {} byte buffer",
                data.len(),
                buffer.size()
            )));
        };
        dst.copy_from_slice(data);
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: &SoftwareBuffer,
        dst: &mut SoftwareBuffer,
        size: vk::DeviceSize,
    ) -> Result<()> {
        if !src.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC)
            || !dst.usage.contains(vk::BufferUsageFlags::TRANSFER_DST)
        {
            return Err(BuildError::Backend(
                "copy requires TRANSFER_SRC and TRANSFER_DST usage".to_string(),
            ));
        }
        if size > src.size() || size > dst.size() {
            return Err(BuildError::Backend(format!(
                "copy of {size} bytes overruns its buffers"
            )));
        }
        let size = size as usize;
        dst.data[..size].copy_from_slice(&src.data[..size]);
        self.ledger.submit();
        Ok(())
    }

    fn build_sizes(&self, input: &BuildInput) -> Result<BuildSizes> {
        let count = input.primitive_count() as u64;
        let sizes = match input.geometry {
            BuildGeometry::Triangles { .. } => BuildSizes {
                accel_struct_size: align_up(512 + 96 * count, ADDRESS_ALIGNMENT),
                build_scratch_size: align_up(256 + 64 * count, ADDRESS_ALIGNMENT),
            },
            BuildGeometry::Instances { .. } => BuildSizes {
                accel_struct_size: align_up(1024 + 128 * count, ADDRESS_ALIGNMENT),
                build_scratch_size: align_up(512 + 64 * count, ADDRESS_ALIGNMENT),
            },
        };
        Ok(sizes)
    }

    fn min_scratch_alignment(&self) -> vk::DeviceSize {
        self.scratch_alignment
    }

    fn create_accel_struct(
        &mut self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> Result<SoftwareAccelStruct> {
        let buffer = self.new_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            Residency::DeviceLocal,
        )?;
        Ok(SoftwareAccelStruct {
            buffer,
            ty,
            built: AtomicBool::new(false),
            build_flags: AtomicU32::new(0),
            compacted_size: AtomicU64::new(0),
            primitive_count: AtomicU32::new(0),
        })
    }

    fn build_accel_structs(
        &mut self,
        requests: &[BuildRequest<'_, SoftwareAccelStruct>],
    ) -> Result<()> {
        let mut scratch_ranges: Vec<(u64, u64)> = Vec::with_capacity(requests.len());
        let mut destinations: Vec<u64> = Vec::with_capacity(requests.len());
        for request in requests {
            self.validate_build(&request.input)?;
            let sizes = self.build_sizes(&request.input)?;
            if request.dst.ty != request.input.ty {
                return Err(BuildError::Backend(
                    "build type does not match the destination structure".to_string(),
                ));
            }
            if request.dst.size() < sizes.accel_struct_size {
                return Err(BuildError::Backend(format!(
                    "destination holds {} bytes, build needs {}",
                    request.dst.size(),
                    sizes.accel_struct_size
                )));
            }
            if destinations.contains(&request.dst.device_address()) {
                return Err(BuildError::Backend(
                    "the same structure is built twice in one submission".to_string(),
                ));
            }
            destinations.push(request.dst.device_address());

            if request.scratch_data % self.scratch_alignment != 0 {
                return Err(BuildError::Backend(format!(
                    "scratch address {:#x} is not aligned to {}",
                    request.scratch_data, self.scratch_alignment
                )));
            }
            self.ledger.check_range(
                "scratch",
                request.scratch_data,
                sizes.build_scratch_size,
                vk::BufferUsageFlags::STORAGE_BUFFER,
            )?;
            let range = (
                request.scratch_data,
                request.scratch_data + sizes.build_scratch_size,
            );
            if scratch_ranges
                .iter()
                .any(|&(start, end)| range.0 < end && start < range.1)
            {
                return Err(BuildError::Backend(
                    "scratch ranges of concurrent builds overlap".to_string(),
                ));
            }
            scratch_ranges.push(range);
        }
        for request in requests {
            let sizes = self.build_sizes(&request.input)?;
            let compacted_size =
                align_up(sizes.accel_struct_size * 5 / 8, ADDRESS_ALIGNMENT).max(ADDRESS_ALIGNMENT);
            request.dst.mark_built(
                request.input.flags,
                compacted_size,
                request.input.primitive_count(),
            );
        }
        self.ledger.submit();
        Ok(())
    }

    fn query_compacted_sizes(
        &mut self,
        accel_structs: &[&SoftwareAccelStruct],
    ) -> Result<Vec<vk::DeviceSize>> {
        let sizes = accel_structs
            .iter()
            .map(|accel_struct| {
                if !accel_struct.is_built() {
                    return Err(BuildError::Backend(
                        "compacted size queried before the build retired".to_string(),
                    ));
                }
                if !accel_struct
                    .flags()
                    .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
                {
                    return Err(BuildError::Backend(
                        "structure was built without ALLOW_COMPACTION".to_string(),
                    ));
                }
                Ok(accel_struct.compacted_size.load(Ordering::Acquire))
            })
            .collect::<Result<Vec<_>>>()?;
        self.ledger.submit();
        Ok(sizes)
    }

    fn compact_accel_struct(
        &mut self,
        src: &SoftwareAccelStruct,
        dst: &SoftwareAccelStruct,
    ) -> Result<()> {
        if !src.is_built() {
            return Err(BuildError::Backend(
                "cannot compact a structure that was never built".to_string(),
            ));
        }
        let compacted_size = src.compacted_size.load(Ordering::Acquire);
        if dst.ty != src.ty || dst.size() < compacted_size {
            return Err(BuildError::Backend(format!(
                "compaction destination holds {} bytes, needs {compacted_size}",
                dst.size()
            )));
        }
        dst.mark_built(src.flags(), compacted_size, src.primitive_count());
        self.ledger.submit();
        Ok(())
    }

    fn shader_group_properties(&self) -> ShaderGroupProperties {
        self.shader_group_properties
    }

    fn shader_group_handles(
        &self,
        pipeline: &SoftwarePipeline,
        group_count: u32,
    ) -> Result<Vec<u8>> {
        if group_count > pipeline.group_count {
            return Err(BuildError::Backend(format!(
                "requested {group_count} shader group handles from a pipeline with {} groups",
                pipeline.group_count
            )));
        }
        let handle_size = self.shader_group_properties.handle_size as usize;
        let mut data = vec![0xAB_u8; handle_size * group_count as usize];
        for (group, handle) in data.chunks_exact_mut(handle_size).enumerate() {
            let tag = (group as u32).to_le_bytes();
            let len = tag.len().min(handle_size);
            handle[..len].copy_from_slice(&tag[..len]);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_buffer(backend: &mut SoftwareBackend, size: u64) -> SoftwareBuffer {
        backend
            .allocate_buffer(
                size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                Residency::DeviceLocal,
            )
            .unwrap()
    }

    fn triangle_input(vertices: &SoftwareBuffer, indices: &SoftwareBuffer) -> BuildInput {
        BuildInput {
            ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags: vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
            geometry: BuildGeometry::Triangles {
                vertex_data: vertices.device_address(),
                vertex_stride: 16,
                max_vertex: 2,
                index_data: indices.device_address(),
                opaque: true,
            },
            range: vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: 1,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_dropping_releases_memory() {
        let mut backend = SoftwareBackend::new();
        let a = input_buffer(&mut backend, 100);
        let b = input_buffer(&mut backend, 300);
        assert_eq!(backend.live_bytes(), 400);
        assert_ne!(a.device_address(), b.device_address());
        assert_eq!(a.device_address() % ADDRESS_ALIGNMENT, 0);
        drop(a);
        assert_eq!(backend.live_bytes(), 300);
        assert_eq!(backend.live_buffers(), 1);
    }

    #[test]
    fn test_buffer_without_device_address_usage() {
        let mut backend = SoftwareBackend::new();
        let buffer = backend
            .allocate_buffer(64, vk::BufferUsageFlags::STORAGE_BUFFER, Residency::HostVisible)
            .unwrap();
        assert_eq!(buffer.device_address(), 0);
    }

    #[test]
    fn test_write_to_device_local_fails() {
        let mut backend = SoftwareBackend::new();
        let mut buffer = input_buffer(&mut backend, 64);
        assert!(backend.write_buffer(&mut buffer, 0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_build_lifecycle() {
        let mut backend = SoftwareBackend::new();
        let vertices = input_buffer(&mut backend, 48);
        let indices = input_buffer(&mut backend, 12);
        let input = triangle_input(&vertices, &indices);
        let sizes = backend.build_sizes(&input).unwrap();
        let blas = backend
            .create_accel_struct(input.ty, sizes.accel_struct_size)
            .unwrap();
        assert!(backend.query_compacted_sizes(&[&blas]).is_err());

        let scratch = backend
            .allocate_buffer(
                sizes.build_scratch_size,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                Residency::DeviceLocal,
            )
            .unwrap();
        backend
            .build_accel_structs(&[BuildRequest {
                input,
                dst: &blas,
                scratch_data: scratch.device_address(),
            }])
            .unwrap();
        assert!(blas.is_built());
        let compacted = backend.query_compacted_sizes(&[&blas]).unwrap()[0];
        assert!(compacted <= blas.size());

        let too_small = backend
            .create_accel_struct(input.ty, compacted - ADDRESS_ALIGNMENT.min(compacted - 1))
            .unwrap();
        assert!(backend.compact_accel_struct(&blas, &too_small).is_err());
        let target = backend.create_accel_struct(input.ty, compacted).unwrap();
        backend.compact_accel_struct(&blas, &target).unwrap();
        assert!(target.is_built());
        assert_eq!(target.primitive_count(), 1);
    }

    #[test]
    fn test_overlapping_scratch_is_rejected() {
        let mut backend = SoftwareBackend::new();
        let vertices = input_buffer(&mut backend, 48);
        let indices = input_buffer(&mut backend, 12);
        let input = triangle_input(&vertices, &indices);
        let sizes = backend.build_sizes(&input).unwrap();
        let a = backend
            .create_accel_struct(input.ty, sizes.accel_struct_size)
            .unwrap();
        let b = backend
            .create_accel_struct(input.ty, sizes.accel_struct_size)
            .unwrap();
        let scratch = backend
            .allocate_buffer(
                sizes.build_scratch_size * 2,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                Residency::DeviceLocal,
            )
            .unwrap();
        let result = backend.build_accel_structs(&[
            BuildRequest {
                input,
                dst: &a,
                scratch_data: scratch.device_address(),
            },
            BuildRequest {
                input,
                dst: &b,
                scratch_data: scratch.device_address(),
            },
        ]);
        assert!(result.is_err());
        assert!(!a.is_built());
    }

    #[test]
    fn test_index_range_outside_buffer() {
        let mut backend = SoftwareBackend::new();
        let vertices = input_buffer(&mut backend, 48);
        let indices = input_buffer(&mut backend, 12);
        let mut input = triangle_input(&vertices, &indices);
        input.range.primitive_count = 2;
        let sizes = backend.build_sizes(&input).unwrap();
        let blas = backend
            .create_accel_struct(input.ty, sizes.accel_struct_size)
            .unwrap();
        let scratch = backend
            .allocate_buffer(
                sizes.build_scratch_size,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                Residency::DeviceLocal,
            )
            .unwrap();
        let result = backend.build_accel_structs(&[BuildRequest {
            input,
            dst: &blas,
            scratch_data: scratch.device_address(),
        }]);
        assert!(matches!(result, Err(BuildError::Backend(_))));
    }

    #[test]
    fn test_shader_group_handles() {
        let backend = SoftwareBackend::new();
        let pipeline = SoftwarePipeline::new(3);
        let handles = backend.shader_group_handles(&pipeline, 3).unwrap();
        assert_eq!(handles.len(), 96);
        assert_eq!(&handles[32..36], &1u32.to_le_bytes());
        assert!(backend.shader_group_handles(&pipeline, 4).is_err());
    }
}
