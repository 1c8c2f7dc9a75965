//! Geometry consolidation.
//!
//! Meshes are added one at a time to a [`GeometryStoreBuilder`], which validates them and keeps
//! them on the host. [`GeometryStoreBuilder::build_buffers`] consumes the builder, concatenates
//! every mesh into shared buffers and uploads them, producing a frozen [`GeometryStore`].
//!
//! # Buffer layouts
//!
//! | Buffer | Element | Notes |
//! |---|---|---|
//! | vertices | `vec4` | `w` is always 1 |
//! | tangent frames | `mat3` as three `vec4` columns | 48 bytes per frame |
//! | texture coordinates | `vec2` | |
//! | local indices | `uvec3` | relative to the mesh's `first_vertex`, consumed by BLAS builds |
//! | global indices | `uvec3` | `first_vertex` already applied, consumed by shaders |
//! | tangent frame indices | `uvec3` | `first_normal` applied |
//! | texture coordinate indices | `uvec3` | `first_tex_coord` applied, [`NO_TEX_COORD`] where a mesh has no UVs |

use ash::vk;
use glam::{Mat3, Vec2, Vec3, Vec4};

use crate::{
    backend::{RayTracingBackend, Residency, upload_buffer},
    error::{BuildError, Result},
};

/// Texture coordinate index stored for triangles of meshes without UVs.
pub const NO_TEX_COORD: u32 = u32::MAX;

/// Identifies a mesh added to a [`GeometryStoreBuilder`]. Ids are dense and start at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeshId(pub(crate) u32);
impl MeshId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Raw arrays of one imported mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelData {
    /// Object-space positions. `w` is forced to 1 when the mesh is added.
    pub positions: Vec<Vec4>,
    /// Tangent, bitangent and normal as the columns of each frame.
    pub tangent_frames: Vec<Mat3>,
    pub uvs: Vec<Vec2>,
    /// Triangles as indices into `positions`.
    pub indices: Vec<[u32; 3]>,
    /// Per-triangle indices into `tangent_frames`. Empty if the mesh has no frames.
    pub tbn_indices: Vec<[u32; 3]>,
    /// Per-triangle indices into `uvs`, or `None` if the mesh has no texture coordinates.
    pub uv_indices: Option<Vec<[u32; 3]>>,
}

impl ModelData {
    /// Creates a mesh with positions and triangles only.
    pub fn new(positions: impl IntoIterator<Item = Vec3>, indices: Vec<[u32; 3]>) -> Self {
        Self {
            positions: positions.into_iter().map(|p| p.extend(1.0)).collect(),
            indices,
            ..Default::default()
        }
    }

    pub fn with_tangent_frames(mut self, frames: Vec<Mat3>, tbn_indices: Vec<[u32; 3]>) -> Self {
        self.tangent_frames = frames;
        self.tbn_indices = tbn_indices;
        self
    }

    pub fn with_uvs(mut self, uvs: Vec<Vec2>, uv_indices: Vec<[u32; 3]>) -> Self {
        self.uvs = uvs;
        self.uv_indices = Some(uv_indices);
        self
    }

    /// Takes the only mesh out of an import result.
    ///
    /// Contexts that expect a single mesh use this to reject files that split into several
    /// disjoint meshes.
    pub fn single(meshes: Vec<ModelData>) -> Result<ModelData> {
        let count = meshes.len();
        let mut meshes = meshes.into_iter();
        match (meshes.next(), count) {
            (Some(mesh), 1) => Ok(mesh),
            _ => Err(BuildError::MultipleMeshes(count)),
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    /// Object-space corners of triangle `i`.
    pub fn triangle(&self, i: usize) -> [Vec3; 3] {
        self.indices[i].map(|index| self.positions[index as usize].truncate())
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.positions.is_empty() || self.indices.is_empty() {
            return Err("mesh has no triangles".to_string());
        }
        if let Some(i) = self.positions.iter().position(|p| !p.truncate().is_finite()) {
            return Err(format!("position {i} is not finite"));
        }
        check_indices("vertex", &self.indices, self.positions.len())?;

        if self.tangent_frames.is_empty() {
            if !self.tbn_indices.is_empty() {
                return Err("tangent frame indices given without tangent frames".to_string());
            }
        } else {
            if self.tbn_indices.len() != self.indices.len() {
                return Err(format!(
                    "{} tangent frame index triples for {} triangles",
                    self.tbn_indices.len(),
                    self.indices.len()
                ));
            }
            check_indices("tangent frame", &self.tbn_indices, self.tangent_frames.len())?;
        }

        if let Some(uv_indices) = &self.uv_indices {
            if uv_indices.len() != self.indices.len() {
                return Err(format!(
                    "{} texture coordinate index triples for {} triangles",
                    uv_indices.len(),
                    self.indices.len()
                ));
            }
            check_indices("texture coordinate", uv_indices, self.uvs.len())?;
        }
        Ok(())
    }
}

fn check_indices(what: &str, triangles: &[[u32; 3]], len: usize) -> std::result::Result<(), String> {
    for (triangle, indices) in triangles.iter().enumerate() {
        if let Some(index) = indices.iter().find(|&&index| index as usize >= len) {
            return Err(format!(
                "triangle {triangle} references {what} {index}, but only {len} exist"
            ));
        }
    }
    Ok(())
}

/// Where one mesh lives inside the consolidated buffers.
///
/// `first_*` and `*_offset` fields are element offsets: vertices, frames and texture coordinates
/// for the former, `u32` index entries for the latter. `*_count` fields count triangles, so a
/// range covers `index_count * 3` index entries.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ModelRange {
    pub first_vertex: u32,
    pub first_normal: u32,
    pub first_tex_coord: u32,
    pub index_offset: u32,
    pub tbn_index_offset: u32,
    pub tex_index_offset: u32,
    pub index_count: u32,
    pub tbn_index_count: u32,
    pub tex_index_count: u32,
}

/// Host-side result of concatenating every mesh, in the exact layout uploaded to the GPU.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidatedGeometry {
    pub vertices: Vec<Vec4>,
    pub tangent_frames: Vec<[Vec4; 3]>,
    pub tex_coords: Vec<Vec2>,
    pub local_indices: Vec<u32>,
    pub global_indices: Vec<u32>,
    pub tbn_indices: Vec<u32>,
    pub tex_indices: Vec<u32>,
    pub ranges: Vec<ModelRange>,
}

impl ConsolidatedGeometry {
    pub fn triangle_count(&self) -> usize {
        self.local_indices.len() / 3
    }
}

/// Collects meshes before they are consolidated into device buffers.
#[derive(Debug, Default)]
pub struct GeometryStoreBuilder {
    meshes: Vec<ModelData>,
}

impl GeometryStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `mesh` and appends it. Ids are handed out in insertion order.
    pub fn add_mesh(&mut self, mut mesh: ModelData) -> Result<MeshId> {
        let id = self.meshes.len();
        mesh.validate()
            .map_err(|reason| BuildError::InvalidMesh { mesh: id, reason })?;
        for position in mesh.positions.iter_mut() {
            position.w = 1.0;
        }
        self.meshes.push(mesh);
        Ok(MeshId(id as u32))
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn mesh(&self, id: MeshId) -> Option<&ModelData> {
        self.meshes.get(id.index())
    }

    /// Concatenates every mesh added so far. Deterministic in the insertion order.
    pub fn consolidate(&self) -> ConsolidatedGeometry {
        let mut out = ConsolidatedGeometry::default();
        for mesh in &self.meshes {
            let range = ModelRange {
                first_vertex: out.vertices.len() as u32,
                first_normal: out.tangent_frames.len() as u32,
                first_tex_coord: out.tex_coords.len() as u32,
                index_offset: out.local_indices.len() as u32,
                tbn_index_offset: out.tbn_indices.len() as u32,
                tex_index_offset: out.tex_indices.len() as u32,
                index_count: mesh.indices.len() as u32,
                tbn_index_count: mesh.tbn_indices.len() as u32,
                tex_index_count: mesh.indices.len() as u32,
            };

            out.vertices.extend_from_slice(&mesh.positions);
            out.tangent_frames.extend(
                mesh.tangent_frames
                    .iter()
                    .map(|frame| [frame.x_axis, frame.y_axis, frame.z_axis].map(|c| c.extend(0.0))),
            );
            out.tex_coords.extend_from_slice(&mesh.uvs);

            out.local_indices.extend(mesh.indices.iter().flatten());
            out.global_indices.extend(
                mesh.indices
                    .iter()
                    .flatten()
                    .map(|index| index + range.first_vertex),
            );
            out.tbn_indices.extend(
                mesh.tbn_indices
                    .iter()
                    .flatten()
                    .map(|index| index + range.first_normal),
            );
            match &mesh.uv_indices {
                Some(uv_indices) => out.tex_indices.extend(
                    uv_indices
                        .iter()
                        .flatten()
                        .map(|index| index + range.first_tex_coord),
                ),
                None => out
                    .tex_indices
                    .extend(std::iter::repeat_n(NO_TEX_COORD, mesh.indices.len() * 3)),
            }
            out.ranges.push(range);
        }
        out
    }

    /// Consolidates and uploads every mesh, freezing the store.
    pub fn build_buffers<B: RayTracingBackend>(self, backend: &mut B) -> Result<GeometryStore<B>> {
        let consolidated = self.consolidate();
        self.upload(consolidated, backend)
    }

    /// Uploads `consolidated`, which must come from [`Self::consolidate`] on this builder.
    pub(crate) fn upload<B: RayTracingBackend>(
        self,
        consolidated: ConsolidatedGeometry,
        backend: &mut B,
    ) -> Result<GeometryStore<B>> {
        let _span = tracing::info_span!("geometry_upload").entered();
        debug_assert_eq!(consolidated.ranges.len(), self.meshes.len());

        let build_input = vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::STORAGE_BUFFER;
        let shader_read =
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS | vk::BufferUsageFlags::STORAGE_BUFFER;
        let mut upload = |bytes: &[u8], usage| {
            upload_buffer(backend, bytes, usage, Residency::DeviceLocal)
        };
        let vertex_buffer = upload(bytemuck::cast_slice(&consolidated.vertices), build_input)?;
        let local_index_buffer =
            upload(bytemuck::cast_slice(&consolidated.local_indices), build_input)?;
        let global_index_buffer =
            upload(bytemuck::cast_slice(&consolidated.global_indices), shader_read)?;
        let tangent_frame_buffer =
            upload(bytemuck::cast_slice(&consolidated.tangent_frames), shader_read)?;
        let tex_coord_buffer = upload(bytemuck::cast_slice(&consolidated.tex_coords), shader_read)?;
        let tbn_index_buffer = upload(bytemuck::cast_slice(&consolidated.tbn_indices), shader_read)?;
        let tex_index_buffer = upload(bytemuck::cast_slice(&consolidated.tex_indices), shader_read)?;

        tracing::info!(
            meshes = self.meshes.len(),
            vertices = consolidated.vertices.len(),
            triangles = consolidated.triangle_count(),
            "Geometry consolidated"
        );
        Ok(GeometryStore {
            meshes: self.meshes,
            ranges: consolidated.ranges,
            triangle_count: consolidated.local_indices.len() / 3,
            vertex_buffer,
            tangent_frame_buffer,
            tex_coord_buffer,
            local_index_buffer,
            global_index_buffer,
            tbn_index_buffer,
            tex_index_buffer,
        })
    }
}

/// Consolidated geometry resident on the device.
///
/// The host copies of every mesh are retained for emissive table construction.
pub struct GeometryStore<B: RayTracingBackend> {
    meshes: Vec<ModelData>,
    ranges: Vec<ModelRange>,
    triangle_count: usize,
    vertex_buffer: B::Buffer,
    tangent_frame_buffer: B::Buffer,
    tex_coord_buffer: B::Buffer,
    local_index_buffer: B::Buffer,
    global_index_buffer: B::Buffer,
    tbn_index_buffer: B::Buffer,
    tex_index_buffer: B::Buffer,
}

impl<B: RayTracingBackend> GeometryStore<B> {
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }
    pub fn triangle_count(&self) -> usize {
        self.triangle_count
    }
    pub fn mesh(&self, id: MeshId) -> Option<&ModelData> {
        self.meshes.get(id.index())
    }
    pub fn range(&self, id: MeshId) -> Option<&ModelRange> {
        self.ranges.get(id.index())
    }
    pub fn ranges(&self) -> &[ModelRange] {
        &self.ranges
    }
    pub fn mesh_ids(&self) -> impl Iterator<Item = MeshId> + use<B> {
        (0..self.meshes.len() as u32).map(MeshId)
    }
    pub fn vertex_buffer(&self) -> &B::Buffer {
        &self.vertex_buffer
    }
    pub fn tangent_frame_buffer(&self) -> &B::Buffer {
        &self.tangent_frame_buffer
    }
    pub fn tex_coord_buffer(&self) -> &B::Buffer {
        &self.tex_coord_buffer
    }
    /// Indices relative to each mesh's first vertex.
    pub fn local_index_buffer(&self) -> &B::Buffer {
        &self.local_index_buffer
    }
    /// Indices into the shared vertex buffer.
    pub fn global_index_buffer(&self) -> &B::Buffer {
        &self.global_index_buffer
    }
    pub fn tbn_index_buffer(&self) -> &B::Buffer {
        &self.tbn_index_buffer
    }
    pub fn tex_index_buffer(&self) -> &B::Buffer {
        &self.tex_index_buffer
    }
}
