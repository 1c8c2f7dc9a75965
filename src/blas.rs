//! Bottom-level acceleration structures, one per mesh.
//!
//! Every build is sized by the backend before anything is allocated. With
//! [`BlasConfig::batch_builds`] all meshes are built in one submission that shares a single
//! scratch buffer; each build gets its own aligned, non-overlapping slice of it. Scratch memory is
//! released as soon as the builds retire.
//!
//! Compaction needs the true compacted size, which only exists after a build. It therefore runs
//! as a second pass: query every compacted size in one submission, then copy-compact each
//! structure into a new, smaller one and drop the original once the copy has retired.

use ash::vk;

use crate::{
    backend::{
        BackendAccelStruct, BackendBuffer, BuildGeometry, BuildInput, BuildRequest, BuildSizes,
        RayTracingBackend, Residency,
    },
    config::BlasConfig,
    error::{BuildError, Result},
    geometry::{GeometryStore, MeshId},
    utils::align_up,
};

/// Byte stride of the consolidated vertex buffer.
pub const VERTEX_STRIDE: vk::DeviceSize = 16;

/// Index of a BLAS in a [`BlasArena`]. The BLAS of mesh `n` always has id `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlasId(u32);
impl BlasId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
impl From<MeshId> for BlasId {
    fn from(mesh: MeshId) -> Self {
        Self(mesh.0)
    }
}

/// Sizes before and after compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub original: vk::DeviceSize,
    pub compacted: vk::DeviceSize,
}

pub struct Blas<B: RayTracingBackend> {
    accel_struct: B::AccelStruct,
    primitive_count: u32,
    build_size: vk::DeviceSize,
    compaction: Option<CompactionStats>,
}

impl<B: RayTracingBackend> Blas<B> {
    pub fn accel_struct(&self) -> &B::AccelStruct {
        &self.accel_struct
    }
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.accel_struct.device_address()
    }
    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }
    /// Size reported by the backend for the initial build.
    pub fn build_size(&self) -> vk::DeviceSize {
        self.build_size
    }
    /// Current size of the backing buffer.
    pub fn size(&self) -> vk::DeviceSize {
        self.accel_struct.size()
    }
    /// `None` if compaction was disabled or did not shrink the structure.
    pub fn compaction(&self) -> Option<CompactionStats> {
        self.compaction
    }
}

/// Owns every BLAS of a scene. TLAS instances refer into it by [`BlasId`].
pub struct BlasArena<B: RayTracingBackend> {
    blases: Vec<Blas<B>>,
}

impl<B: RayTracingBackend> BlasArena<B> {
    pub fn len(&self) -> usize {
        self.blases.len()
    }
    pub fn is_empty(&self) -> bool {
        self.blases.is_empty()
    }
    pub fn get(&self, id: BlasId) -> Option<&Blas<B>> {
        self.blases.get(id.index())
    }
    pub fn iter(&self) -> impl Iterator<Item = (BlasId, &Blas<B>)> {
        self.blases
            .iter()
            .enumerate()
            .map(|(i, blas)| (BlasId(i as u32), blas))
    }
    /// Total bytes held by BLAS backing buffers.
    pub fn total_size(&self) -> vk::DeviceSize {
        self.blases.iter().map(Blas::size).sum()
    }
}

/// Describes the triangles of one mesh inside the consolidated buffers.
pub fn build_input<B: RayTracingBackend>(
    geometry: &GeometryStore<B>,
    mesh: MeshId,
    config: &BlasConfig,
) -> Option<BuildInput> {
    let range = geometry.range(mesh)?;
    let vertex_count = geometry.mesh(mesh)?.positions.len() as u32;
    Some(BuildInput {
        ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        flags: config.build_flags(),
        geometry: BuildGeometry::Triangles {
            vertex_data: geometry.vertex_buffer().device_address(),
            vertex_stride: VERTEX_STRIDE,
            max_vertex: range.first_vertex + vertex_count - 1,
            index_data: geometry.local_index_buffer().device_address(),
            opaque: config.opaque,
        },
        range: vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: range.index_count,
            primitive_offset: range.index_offset * std::mem::size_of::<u32>() as u32,
            first_vertex: range.first_vertex,
            transform_offset: 0,
        },
    })
}

/// Builds one BLAS per mesh of `geometry`, compacting them if configured.
pub fn build_blases<B: RayTracingBackend>(
    backend: &mut B,
    geometry: &GeometryStore<B>,
    config: &BlasConfig,
) -> Result<BlasArena<B>> {
    let _span = tracing::info_span!("blas_build").entered();
    let inputs = sized_inputs(backend, geometry, geometry.mesh_ids(), config)?;
    if inputs.is_empty() {
        return Ok(BlasArena { blases: Vec::new() });
    }
    tracing::info!("Building {} BLAS", inputs.len());

    let accel_structs = inputs
        .iter()
        .map(|(input, sizes)| backend.create_accel_struct(input.ty, sizes.accel_struct_size))
        .collect::<Result<Vec<_>>>()?;

    if config.batch_builds {
        build_batched(backend, &inputs, &accel_structs)?;
    } else {
        for ((input, sizes), accel_struct) in inputs.iter().zip(accel_structs.iter()) {
            build_batched(
                backend,
                std::slice::from_ref(&(*input, *sizes)),
                std::slice::from_ref(accel_struct),
            )?;
        }
    }

    let mut blases: Vec<Blas<B>> = inputs
        .iter()
        .zip(accel_structs)
        .map(|((input, sizes), accel_struct)| Blas {
            accel_struct,
            primitive_count: input.primitive_count(),
            build_size: sizes.accel_struct_size,
            compaction: None,
        })
        .collect();

    if config.compact {
        compact(backend, &mut blases)?;
    }
    let arena = BlasArena { blases };
    tracing::info!(
        count = arena.len(),
        bytes = arena.total_size(),
        "BLAS build completed"
    );
    Ok(arena)
}

/// Sizes the build of each mesh in `meshes`, in order. Every mesh must have a range in
/// `geometry`: a skipped mesh would shift every later [`BlasId`].
fn sized_inputs<B: RayTracingBackend>(
    backend: &B,
    geometry: &GeometryStore<B>,
    meshes: impl Iterator<Item = MeshId>,
    config: &BlasConfig,
) -> Result<Vec<(BuildInput, BuildSizes)>> {
    meshes
        .map(|mesh| {
            let input =
                build_input(geometry, mesh, config).ok_or_else(|| BuildError::InvalidMesh {
                    mesh: mesh.index(),
                    reason: "mesh has no consolidated range".to_string(),
                })?;
            let sizes = backend.build_sizes(&input)?;
            Ok((input, sizes))
        })
        .collect()
}

/// Records every build into one submission, giving each build its own slice of a shared
/// scratch buffer.
fn build_batched<B: RayTracingBackend>(
    backend: &mut B,
    inputs: &[(BuildInput, BuildSizes)],
    accel_structs: &[B::AccelStruct],
) -> Result<()> {
    let alignment = backend.min_scratch_alignment().max(1);
    let mut total_scratch_size: vk::DeviceSize = 0;
    let mut offsets = Vec::with_capacity(inputs.len());
    for (_, sizes) in inputs {
        total_scratch_size = align_up(total_scratch_size, alignment);
        offsets.push(total_scratch_size);
        total_scratch_size += sizes.build_scratch_size;
    }

    // Padding so the base address can be aligned up.
    let scratch = backend.allocate_buffer(
        total_scratch_size.max(1) + alignment,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        Residency::DeviceLocal,
    )?;
    let base = align_up(scratch.device_address(), alignment);

    let requests: Vec<_> = inputs
        .iter()
        .zip(accel_structs)
        .zip(offsets)
        .map(|(((input, _), dst), offset)| BuildRequest {
            input: *input,
            dst,
            scratch_data: base + offset,
        })
        .collect();
    backend.build_accel_structs(&requests)?;
    drop(scratch);
    Ok(())
}

fn compact<B: RayTracingBackend>(backend: &mut B, blases: &mut [Blas<B>]) -> Result<()> {
    let compacted_sizes = {
        let accel_structs: Vec<_> = blases.iter().map(|blas| &blas.accel_struct).collect();
        backend.query_compacted_sizes(&accel_structs)?
    };
    let mut saved: vk::DeviceSize = 0;
    for (blas, compacted_size) in blases.iter_mut().zip(compacted_sizes) {
        let original = blas.accel_struct.size();
        if compacted_size == 0 || compacted_size >= original {
            continue;
        }
        let compacted = backend.create_accel_struct(blas.accel_struct.ty(), compacted_size)?;
        backend.compact_accel_struct(&blas.accel_struct, &compacted)?;
        tracing::debug!(original, compacted = compacted_size, "BLAS compacted");
        saved += original - compacted_size;
        // The copy has retired, so the original can go.
        blas.accel_struct = compacted;
        blas.compaction = Some(CompactionStats {
            original,
            compacted: compacted_size,
        });
    }
    tracing::info!(saved_bytes = saved, "BLAS compaction completed");
    Ok(())
}
