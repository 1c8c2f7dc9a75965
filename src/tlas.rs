//! The scene-wide top-level acceleration structure.

use ash::vk;
use glam::Mat4;

use crate::{
    backend::{
        BackendAccelStruct, BackendBuffer, BuildGeometry, BuildInput, BuildRequest,
        RayTracingBackend, Residency, upload_buffer,
    },
    blas::{BlasArena, BlasId},
    config::TlasConfig,
    error::{BuildError, Result},
    utils::{align_up, mat4_to_vk_transform},
};

/// Largest value representable in the 24-bit custom index and SBT offset fields.
pub const MAX_INSTANCE_INDEX: u32 = (1 << 24) - 1;

/// One placement of a BLAS in the TLAS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TlasInstance {
    pub blas: BlasId,
    pub transform: Mat4,
    /// Readable in shaders as `gl_InstanceCustomIndexEXT`. Holds the material index.
    pub custom_index: u32,
    /// Hit group of this instance, relative to the first hit group in the SBT.
    pub hit_group: u32,
    pub mask: u8,
    pub cull_backface: bool,
}

impl TlasInstance {
    pub fn new(blas: BlasId, transform: Mat4) -> Self {
        Self {
            blas,
            transform,
            custom_index: 0,
            hit_group: 0,
            mask: u8::MAX,
            cull_backface: false,
        }
    }
}

/// Converts `instances` into the records consumed by the TLAS build.
pub fn pack_instances<B: RayTracingBackend>(
    instances: &[TlasInstance],
    blases: &BlasArena<B>,
) -> Result<Vec<vk::AccelerationStructureInstanceKHR>> {
    instances
        .iter()
        .enumerate()
        .map(|(i, instance)| {
            let blas = blases.get(instance.blas).ok_or(BuildError::UnknownMesh {
                instance: i,
                mesh: instance.blas.index() as u32,
            })?;
            for value in [instance.custom_index, instance.hit_group] {
                if value > MAX_INSTANCE_INDEX {
                    return Err(BuildError::CustomIndexOverflow { instance: i, value });
                }
            }
            let flags = if instance.cull_backface {
                vk::GeometryInstanceFlagsKHR::empty()
            } else {
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
            };
            Ok(vk::AccelerationStructureInstanceKHR {
                transform: mat4_to_vk_transform(&instance.transform),
                instance_custom_index_and_mask: vk::Packed24_8::new(
                    instance.custom_index,
                    instance.mask,
                ),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                    instance.hit_group,
                    flags.as_raw() as u8,
                ),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: blas.device_address(),
                },
            })
        })
        .collect()
}

fn instance_bytes(records: &[vk::AccelerationStructureInstanceKHR]) -> &[u8] {
    // AccelerationStructureInstanceKHR is repr(C) without padding.
    unsafe { std::slice::from_raw_parts(records.as_ptr() as *const u8, size_of_val(records)) }
}

pub struct Tlas<B: RayTracingBackend> {
    accel_struct: B::AccelStruct,
    instance_count: u32,
}

impl<B: RayTracingBackend> Tlas<B> {
    pub fn accel_struct(&self) -> &B::AccelStruct {
        &self.accel_struct
    }
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.accel_struct.device_address()
    }
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }
    pub fn size(&self) -> vk::DeviceSize {
        self.accel_struct.size()
    }
}

/// Builds the TLAS over `instances`. The instance and scratch buffers are released once the
/// build has retired.
pub fn build_tlas<B: RayTracingBackend>(
    backend: &mut B,
    instances: &[TlasInstance],
    blases: &BlasArena<B>,
    config: &TlasConfig,
) -> Result<Tlas<B>> {
    let _span = tracing::info_span!("tlas_build").entered();
    let records = pack_instances(instances, blases)?;
    let instance_buffer = upload_buffer(
        backend,
        instance_bytes(&records),
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        Residency::HostVisible,
    )?;

    let input = BuildInput {
        ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        flags: config.build_flags(),
        geometry: BuildGeometry::Instances {
            data: instance_buffer.device_address(),
        },
        range: vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: records.len() as u32,
            ..Default::default()
        },
    };
    let sizes = backend.build_sizes(&input)?;
    let accel_struct = backend.create_accel_struct(input.ty, sizes.accel_struct_size)?;

    let alignment = backend.min_scratch_alignment().max(1);
    let scratch = backend.allocate_buffer(
        sizes.build_scratch_size.max(1) + alignment,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        Residency::DeviceLocal,
    )?;
    backend.build_accel_structs(&[BuildRequest {
        input,
        dst: &accel_struct,
        scratch_data: align_up(scratch.device_address(), alignment),
    }])?;
    drop(scratch);
    drop(instance_buffer);

    tracing::info!(
        instances = records.len(),
        bytes = accel_struct.size(),
        "TLAS build completed"
    );
    Ok(Tlas {
        accel_struct,
        instance_count: records.len() as u32,
    })
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::{
        backend::SoftwareBackend,
        blas::build_blases,
        config::BlasConfig,
        geometry::{GeometryStore, GeometryStoreBuilder, tests::unit_quad},
    };

    fn scene(
        backend: &mut SoftwareBackend,
    ) -> (GeometryStore<SoftwareBackend>, BlasArena<SoftwareBackend>, BlasId) {
        let mut builder = GeometryStoreBuilder::new();
        let quad = builder.add_mesh(unit_quad()).unwrap();
        let geometry = builder.build_buffers(backend).unwrap();
        let blases = build_blases(backend, &geometry, &BlasConfig::default()).unwrap();
        (geometry, blases, quad.into())
    }

    #[test]
    fn test_instance_record_fields() {
        let mut backend = SoftwareBackend::new();
        let (_geometry, blases, quad) = scene(&mut backend);
        let mut instance = TlasInstance::new(quad, Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        instance.custom_index = 42;
        instance.hit_group = 3;
        let records = pack_instances(&[instance], &blases).unwrap();
        let record = &records[0];
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 42);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(
            record.instance_shader_binding_table_record_offset_and_flags.low_24(),
            3
        );
        assert_eq!(
            record.instance_shader_binding_table_record_offset_and_flags.high_8() as u32,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(record.transform.matrix[3], 1.0);
        assert_eq!(record.transform.matrix[7], 2.0);
        assert_eq!(record.transform.matrix[11], 3.0);
        assert_eq!(
            unsafe { record.acceleration_structure_reference.device_handle },
            blases.get(quad).unwrap().device_address()
        );
    }

    #[test]
    fn test_culling_flag() {
        let mut backend = SoftwareBackend::new();
        let (_geometry, blases, quad) = scene(&mut backend);
        let mut instance = TlasInstance::new(quad, Mat4::IDENTITY);
        instance.cull_backface = true;
        let records = pack_instances(&[instance], &blases).unwrap();
        assert_eq!(
            records[0]
                .instance_shader_binding_table_record_offset_and_flags
                .high_8(),
            0
        );
    }

    #[test]
    fn test_custom_index_overflow() {
        let mut backend = SoftwareBackend::new();
        let (_geometry, blases, quad) = scene(&mut backend);
        let mut instance = TlasInstance::new(quad, Mat4::IDENTITY);
        instance.custom_index = 1 << 24;
        assert!(matches!(
            pack_instances(&[instance], &blases),
            Err(BuildError::CustomIndexOverflow {
                instance: 0,
                value: 0x100_0000
            })
        ));
    }

    #[test]
    fn test_build_releases_transient_buffers() {
        let mut backend = SoftwareBackend::new();
        let (_geometry, blases, quad) = scene(&mut backend);
        let before = backend.live_buffers();
        let instances: Vec<_> = (0..4)
            .map(|i| TlasInstance::new(quad, Mat4::from_translation(Vec3::X * i as f32)))
            .collect();
        let tlas = build_tlas(&mut backend, &instances, &blases, &TlasConfig::default()).unwrap();
        assert_eq!(tlas.instance_count(), 4);
        assert!(tlas.accel_struct().is_built());
        assert_eq!(backend.live_buffers(), before + 1);
    }
}
