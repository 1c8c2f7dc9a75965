//! [`RayTracingBackend`] over a real Vulkan device.
//!
//! The device, queue and instance stay owned by the caller. [`VulkanBackend`] only creates the
//! objects it needs for scene builds: a VMA allocator, a transient command pool with one
//! reusable command buffer, and a fence. The caller must keep the device alive until the
//! backend and every buffer and acceleration structure created through it have been dropped.
//!
//! The device must have been created with `VK_KHR_acceleration_structure`,
//! `VK_KHR_ray_tracing_pipeline` and `VK_KHR_deferred_host_operations` enabled, and with the
//! `bufferDeviceAddress`, `synchronization2` and `accelerationStructure` features.

mod accel;
mod alloc;
mod buffer;
mod command;

use std::ffi::CStr;

use ash::{
    khr::{acceleration_structure, deferred_host_operations, ray_tracing_pipeline},
    vk,
};

pub use accel::VulkanAccelStruct;
pub use alloc::Allocator;
pub use buffer::VulkanBuffer;
use command::{OneShotEncoder, memory_barrier};

use crate::{
    backend::{
        BuildGeometry, BuildInput, BuildRequest, BuildSizes, RayTracingBackend,
        Residency, ShaderGroupProperties,
    },
    error::{BuildError, Result},
};

const REQUIRED_EXTENSIONS: [&CStr; 3] = [
    acceleration_structure::NAME,
    ray_tracing_pipeline::NAME,
    deferred_host_operations::NAME,
];

pub struct VulkanBackend {
    device: ash::Device,
    allocator: Allocator,
    accel_struct_loader: acceleration_structure::Device,
    rt_pipeline_loader: ray_tracing_pipeline::Device,
    encoder: OneShotEncoder,
    min_scratch_alignment: vk::DeviceSize,
    buffer_alignment: vk::DeviceSize,
    shader_group_properties: ShaderGroupProperties,
}

impl VulkanBackend {
    /// Creates a backend on a device created by the caller.
    ///
    /// Fails with [`BuildError::MissingExtension`] if the physical device does not support one of
    /// the ray tracing extensions.
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        queue: vk::Queue,
    ) -> Result<Self> {
        let available = unsafe { instance.enumerate_device_extension_properties(physical_device)? };
        for required in REQUIRED_EXTENSIONS {
            let supported = available
                .iter()
                .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == required));
            if !supported {
                return Err(BuildError::MissingExtension(required));
            }
        }

        let mut accel_struct_properties =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut rt_pipeline_properties =
            vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        {
            let mut properties = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut accel_struct_properties)
                .push_next(&mut rt_pipeline_properties);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties) };
        }
        let shader_group_properties = ShaderGroupProperties {
            handle_size: rt_pipeline_properties.shader_group_handle_size,
            handle_alignment: rt_pipeline_properties.shader_group_handle_alignment,
            base_alignment: rt_pipeline_properties.shader_group_base_alignment,
            max_stride: rt_pipeline_properties.max_shader_group_stride,
        };
        let min_scratch_alignment = accel_struct_properties
            .min_acceleration_structure_scratch_offset_alignment
            .max(1) as vk::DeviceSize;
        tracing::info!(
            handle_size = shader_group_properties.handle_size,
            base_alignment = shader_group_properties.base_alignment,
            max_stride = shader_group_properties.max_stride,
            min_scratch_alignment,
            "Ray tracing device ready"
        );

        let allocator = Allocator::new(instance, device.clone(), physical_device)?;
        let accel_struct_loader = acceleration_structure::Device::new(instance, &device);
        let rt_pipeline_loader = ray_tracing_pipeline::Device::new(instance, &device);
        let encoder = OneShotEncoder::new(device.clone(), queue_family_index, queue)?;
        Ok(Self {
            device,
            allocator,
            accel_struct_loader,
            rt_pipeline_loader,
            encoder,
            min_scratch_alignment,
            buffer_alignment: min_scratch_alignment
                .max(shader_group_properties.base_alignment as vk::DeviceSize)
                .max(16),
            shader_group_properties,
        })
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }
}

fn geometry_data(input: &BuildInput) -> vk::AccelerationStructureGeometryKHR<'static> {
    match input.geometry {
        BuildGeometry::Triangles {
            vertex_data,
            vertex_stride,
            max_vertex,
            index_data,
            opaque,
        } => vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::TRIANGLES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                    vertex_format: vk::Format::R32G32B32_SFLOAT,
                    vertex_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: vertex_data,
                    },
                    vertex_stride,
                    max_vertex,
                    index_type: vk::IndexType::UINT32,
                    index_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: index_data,
                    },
                    ..Default::default()
                },
            },
            flags: if opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            },
            ..Default::default()
        },
        BuildGeometry::Instances { data } => vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::INSTANCES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                    array_of_pointers: vk::FALSE,
                    data: vk::DeviceOrHostAddressConstKHR {
                        device_address: data,
                    },
                    ..Default::default()
                },
            },
            ..Default::default()
        },
    }
}

impl RayTracingBackend for VulkanBackend {
    type Buffer = VulkanBuffer;
    type AccelStruct = VulkanAccelStruct;
    type Pipeline = vk::Pipeline;

    fn allocate_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: Residency,
    ) -> Result<VulkanBuffer> {
        Ok(VulkanBuffer::new(
            self.allocator.clone(),
            size,
            self.buffer_alignment,
            usage,
            residency,
        )?)
    }

    fn write_buffer(
        &mut self,
        buffer: &mut VulkanBuffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        let Some(result) = buffer.write(offset, data) else {
            return Err(BuildError::Backend(format!(
                "cannot write {} bytes at offset {offset} into {buffer:?}",
                data.len()
            )));
        };
        Ok(result?)
    }

    fn copy_buffer(
        &mut self,
        src: &VulkanBuffer,
        dst: &mut VulkanBuffer,
        size: vk::DeviceSize,
    ) -> Result<()> {
        let device = &self.device;
        self.encoder.submit_and_wait(|cb| unsafe {
            device.cmd_copy_buffer(
                cb,
                src.raw(),
                dst.raw(),
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }],
            );
        })?;
        Ok(())
    }

    fn build_sizes(&self, input: &BuildInput) -> Result<BuildSizes> {
        let geometries = [geometry_data(input)];
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(input.ty)
            .flags(input.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.accel_struct_loader
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &info,
                    &[input.primitive_count()],
                    &mut size_info,
                );
        }
        Ok(BuildSizes {
            accel_struct_size: size_info.acceleration_structure_size,
            build_scratch_size: size_info.build_scratch_size,
        })
    }

    fn min_scratch_alignment(&self) -> vk::DeviceSize {
        self.min_scratch_alignment
    }

    fn create_accel_struct(
        &mut self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> Result<VulkanAccelStruct> {
        Ok(VulkanAccelStruct::new(
            self.accel_struct_loader.clone(),
            self.allocator.clone(),
            size,
            ty,
        )?)
    }

    fn build_accel_structs(
        &mut self,
        requests: &[BuildRequest<'_, VulkanAccelStruct>],
    ) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let geometries: Vec<_> = requests
            .iter()
            .map(|request| [geometry_data(&request.input)])
            .collect();
        let infos: Vec<_> = requests
            .iter()
            .zip(geometries.iter())
            .map(|(request, geometry)| {
                vk::AccelerationStructureBuildGeometryInfoKHR::default()
                    .ty(request.input.ty)
                    .flags(request.input.flags)
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .geometries(geometry)
                    .dst_acceleration_structure(request.dst.raw())
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: request.scratch_data,
                    })
            })
            .collect();
        let ranges: Vec<_> = requests.iter().map(|request| [request.input.range]).collect();
        let range_refs: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
            ranges.iter().map(|range| range.as_slice()).collect();

        let device = &self.device;
        let loader = &self.accel_struct_loader;
        self.encoder.submit_and_wait(|cb| unsafe {
            memory_barrier(
                device,
                cb,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_WRITE,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::SHADER_READ,
            );
            loader.cmd_build_acceleration_structures(cb, &infos, &range_refs);
        })?;
        Ok(())
    }

    fn query_compacted_sizes(
        &mut self,
        accel_structs: &[&VulkanAccelStruct],
    ) -> Result<Vec<vk::DeviceSize>> {
        if accel_structs.is_empty() {
            return Ok(Vec::new());
        }
        let count = accel_structs.len() as u32;
        let query_pool = unsafe {
            self.device.create_query_pool(
                &vk::QueryPoolCreateInfo {
                    query_type: vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    query_count: count,
                    ..Default::default()
                },
                None,
            )?
        };
        let handles: Vec<_> = accel_structs.iter().map(|a| a.raw()).collect();
        let device = &self.device;
        let loader = &self.accel_struct_loader;
        let submitted = self.encoder.submit_and_wait(|cb| unsafe {
            device.cmd_reset_query_pool(cb, query_pool, 0, count);
            memory_barrier(
                device,
                cb,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
            );
            loader.cmd_write_acceleration_structures_properties(
                cb,
                &handles,
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                query_pool,
                0,
            );
        });
        let mut sizes = vec![0u64; accel_structs.len()];
        let result = submitted.and_then(|()| unsafe {
            self.device.get_query_pool_results(
                query_pool,
                0,
                &mut sizes,
                vk::QueryResultFlags::WAIT | vk::QueryResultFlags::TYPE_64,
            )
        });
        unsafe {
            self.device.destroy_query_pool(query_pool, None);
        }
        result?;
        Ok(sizes)
    }

    fn compact_accel_struct(
        &mut self,
        src: &VulkanAccelStruct,
        dst: &VulkanAccelStruct,
    ) -> Result<()> {
        let device = &self.device;
        let loader = &self.accel_struct_loader;
        self.encoder.submit_and_wait(|cb| unsafe {
            memory_barrier(
                device,
                cb,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
            );
            loader.cmd_copy_acceleration_structure(
                cb,
                &vk::CopyAccelerationStructureInfoKHR {
                    src: src.raw(),
                    dst: dst.raw(),
                    mode: vk::CopyAccelerationStructureModeKHR::COMPACT,
                    ..Default::default()
                },
            );
        })?;
        Ok(())
    }

    fn shader_group_properties(&self) -> ShaderGroupProperties {
        self.shader_group_properties
    }

    fn shader_group_handles(&self, pipeline: &vk::Pipeline, group_count: u32) -> Result<Vec<u8>> {
        let data_size = group_count as usize * self.shader_group_properties.handle_size as usize;
        let handles = unsafe {
            self.rt_pipeline_loader
                .get_ray_tracing_shader_group_handles(*pipeline, 0, group_count, data_size)?
        };
        Ok(handles)
    }
}
