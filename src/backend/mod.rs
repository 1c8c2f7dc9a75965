//! The GPU capability the scene build runs on.
//!
//! Everything in this crate talks to the device through [`RayTracingBackend`]. The trait
//! covers exactly what a scene build needs: allocating buffers, sizing, building, querying
//! and compacting acceleration structures, and reading shader group metadata from a pipeline.
//!
//! Two implementations are provided:
//!
//! - [`VulkanBackend`](crate::vulkan::VulkanBackend) (feature `vulkan`), running on a real device.
//! - [`SoftwareBackend`], which simulates device memory and the acceleration structure
//!   lifecycle on the CPU. It never produces a traversable structure, but it validates every
//!   request the way a strict driver would and keeps a ledger of live allocations.
//!
//! # Synchronization
//!
//! Every operation that records GPU work returns only after that work has retired. Callers can
//! therefore read results or release inputs as soon as the call returns.
//!
//! # Resource lifetime
//!
//! Buffers and acceleration structures are released when dropped. An acceleration structure
//! owns its backing buffer, so dropping it releases both.

pub mod software;

use ash::vk;

pub use software::SoftwareBackend;

use crate::error::Result;

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Mapped memory the host writes directly. Used for staging, instance records and the SBT.
    HostVisible,
    /// GPU-only memory, filled through a staging copy.
    DeviceLocal,
}

/// Common interface for backend buffers.
pub trait BackendBuffer {
    /// Returns the size of the buffer in bytes.
    fn size(&self) -> vk::DeviceSize;

    /// Returns the buffer device address, or 0 if the buffer was created without
    /// `SHADER_DEVICE_ADDRESS` usage.
    fn device_address(&self) -> vk::DeviceAddress;

    /// Returns the buffer contents if the host can read them.
    fn as_slice(&self) -> Option<&[u8]>;
}

/// Common interface for backend acceleration structures.
pub trait BackendAccelStruct {
    fn ty(&self) -> vk::AccelerationStructureTypeKHR;

    /// Returns the size of the backing buffer in bytes.
    fn size(&self) -> vk::DeviceSize;

    /// Returns the device address for use in shaders and TLAS instances.
    fn device_address(&self) -> vk::DeviceAddress;
}

/// Geometry consumed by a single acceleration structure build.
#[derive(Debug, Clone, Copy)]
pub enum BuildGeometry {
    /// Indexed triangles with `R32G32B32_SFLOAT` positions and `UINT32` indices.
    Triangles {
        vertex_data: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        /// Highest vertex index addressed by this build, after `first_vertex` is applied.
        max_vertex: u32,
        index_data: vk::DeviceAddress,
        opaque: bool,
    },
    /// A tightly packed array of [`vk::AccelerationStructureInstanceKHR`].
    Instances { data: vk::DeviceAddress },
}

/// Everything needed to size and build one acceleration structure.
#[derive(Debug, Clone, Copy)]
pub struct BuildInput {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometry: BuildGeometry,
    /// `primitive_offset` is a byte offset into the index (or instance) data;
    /// `first_vertex` is added to every index.
    pub range: vk::AccelerationStructureBuildRangeInfoKHR,
}

impl BuildInput {
    pub fn primitive_count(&self) -> u32 {
        self.range.primitive_count
    }
}

/// Sizes reported by the backend for a [`BuildInput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    pub accel_struct_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
}

/// One build recorded by [`RayTracingBackend::build_accel_structs`].
pub struct BuildRequest<'a, A> {
    pub input: BuildInput,
    pub dst: &'a A,
    /// Device address of this build's scratch memory. Scratch ranges of requests
    /// submitted together must not overlap.
    pub scratch_data: vk::DeviceAddress,
}

/// Device limits governing the shader binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroupProperties {
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub base_alignment: u32,
    pub max_stride: u32,
}

/// The device operations a scene build depends on.
pub trait RayTracingBackend {
    type Buffer: BackendBuffer;
    type AccelStruct: BackendAccelStruct;
    type Pipeline;

    fn allocate_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: Residency,
    ) -> Result<Self::Buffer>;

    /// Writes `data` into a host-visible buffer at `offset`.
    fn write_buffer(
        &mut self,
        buffer: &mut Self::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()>;

    /// Copies the first `size` bytes of `src` into `dst` and waits for the copy to retire.
    fn copy_buffer(
        &mut self,
        src: &Self::Buffer,
        dst: &mut Self::Buffer,
        size: vk::DeviceSize,
    ) -> Result<()>;

    fn build_sizes(&self, input: &BuildInput) -> Result<BuildSizes>;

    /// Required alignment of scratch addresses passed to [`build_accel_structs`](Self::build_accel_structs).
    fn min_scratch_alignment(&self) -> vk::DeviceSize;

    /// Allocates a backing buffer of `size` bytes and creates an acceleration structure on it.
    fn create_accel_struct(
        &mut self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> Result<Self::AccelStruct>;

    /// Records all builds into one submission and waits for it to retire.
    fn build_accel_structs(
        &mut self,
        requests: &[BuildRequest<'_, Self::AccelStruct>],
    ) -> Result<()>;

    /// Returns the compacted size of each structure. Every structure must have been built
    /// with `ALLOW_COMPACTION`, and its build must have retired.
    fn query_compacted_sizes(
        &mut self,
        accel_structs: &[&Self::AccelStruct],
    ) -> Result<Vec<vk::DeviceSize>>;

    /// Copy-compacts `src` into `dst` and waits for the copy to retire.
    fn compact_accel_struct(
        &mut self,
        src: &Self::AccelStruct,
        dst: &Self::AccelStruct,
    ) -> Result<()>;

    fn shader_group_properties(&self) -> ShaderGroupProperties;

    /// Returns the opaque handles of the first `group_count` shader groups of `pipeline`,
    /// tightly packed, `handle_size` bytes each.
    fn shader_group_handles(&self, pipeline: &Self::Pipeline, group_count: u32) -> Result<Vec<u8>>;
}

/// Smallest buffer the upload helpers allocate. Zero-sized buffers are not allowed.
const MIN_BUFFER_SIZE: vk::DeviceSize = 16;

/// Creates a buffer filled with `data`.
///
/// Device-local buffers are filled through a host-visible staging buffer. The staging buffer
/// is released only after the copy has retired.
pub fn upload_buffer<B: RayTracingBackend>(
    backend: &mut B,
    data: &[u8],
    usage: vk::BufferUsageFlags,
    residency: Residency,
) -> Result<B::Buffer> {
    let size = (data.len() as vk::DeviceSize).max(MIN_BUFFER_SIZE);
    match residency {
        Residency::HostVisible => {
            let mut buffer = backend.allocate_buffer(size, usage, Residency::HostVisible)?;
            backend.write_buffer(&mut buffer, 0, data)?;
            Ok(buffer)
        }
        Residency::DeviceLocal => {
            let mut buffer = backend.allocate_buffer(
                size,
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                Residency::DeviceLocal,
            )?;
            if data.is_empty() {
                return Ok(buffer);
            }
            let mut staging = backend.allocate_buffer(
                size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                Residency::HostVisible,
            )?;
            backend.write_buffer(&mut staging, 0, data)?;
            backend.copy_buffer(&staging, &mut buffer, data.len() as vk::DeviceSize)?;
            drop(staging);
            Ok(buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_local_upload_releases_staging() {
        let mut backend = SoftwareBackend::new();
        let data: Vec<u8> = (0..100).collect();
        let buffer = upload_buffer(
            &mut backend,
            &data,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            Residency::DeviceLocal,
        )
        .unwrap();
        assert_eq!(&buffer.as_slice().unwrap()[..100], &data[..]);
        assert_eq!(backend.live_buffers(), 1);
        assert_eq!(backend.live_bytes(), 100);
        assert_eq!(backend.submissions(), 1);
    }

    #[test]
    fn test_empty_upload_is_not_zero_sized() {
        let mut backend = SoftwareBackend::new();
        let buffer = upload_buffer(
            &mut backend,
            &[],
            vk::BufferUsageFlags::STORAGE_BUFFER,
            Residency::DeviceLocal,
        )
        .unwrap();
        assert_eq!(buffer.size(), MIN_BUFFER_SIZE);
        assert_eq!(backend.submissions(), 0);
    }
}
