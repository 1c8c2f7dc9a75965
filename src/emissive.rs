//! Light importance sampling tables for next-event estimation.
//!
//! Sampling a light is a two-level search. The shader draws `u0` and binary-searches the
//! instance CDF to pick an emissive instance, then draws `u1` and binary-searches that
//! instance's slice of the triangle CDF buffer to pick a triangle. Both distributions are
//! proportional to emitted power: world-space area times the luminance of the emission color.
//!
//! Emitters whose normalized triangle CDFs are identical (within
//! [`LightConfig::dedup_tolerance`]) share one slice of the triangle CDF buffer. This is the
//! common case for repeated fixtures: the same mesh, the same emission and a rigid or
//! uniformly scaled transform.
//!
//! # GPU layouts
//!
//! * instance data: `InstanceData[n]`, 112 bytes each, see [`InstanceData`].
//! * triangle CDF: `float[]`, sliced by `[cdf_range_start, cdf_range_end)`.
//! * instance CDF: `{ uint count; float total_weight; float cdf[count]; }`, tightly packed.

use std::collections::HashMap;

use ash::vk;
use glam::{Mat4, Vec3};

use crate::{
    backend::{RayTracingBackend, Residency, upload_buffer},
    config::LightConfig,
    error::{BuildError, Result},
    geometry::ModelData,
    utils::luminance,
};

/// An instance whose material emits light.
#[derive(Debug, Clone, Copy)]
pub struct Emitter<'a> {
    /// Index of the scene instance. Only used in error reports.
    pub instance: usize,
    pub mesh: &'a ModelData,
    pub transform: Mat4,
    pub emission: Vec3,
    pub material_offset: u32,
    /// Offset of the mesh's first entry in the global index buffer.
    pub index_offset: u32,
    pub cull_backface: bool,
}

/// Per-emitter record read by the light sampling shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceData {
    pub transform: Mat4,
    pub emission: Vec3,
    pub material_offset: u32,
    /// First triangle CDF entry of this emitter.
    pub cdf_range_start: u32,
    /// One past the last triangle CDF entry of this emitter.
    pub cdf_range_end: u32,
    pub index_offset: u32,
    /// 1 if back faces do not emit.
    pub cull_backface: u32,
    /// Emitted power, the unnormalized total of the triangle CDF.
    pub weight: f32,
    /// World-space surface area.
    pub area: f32,
    pub _pad: [f32; 2],
}
const _: () = assert!(std::mem::size_of::<InstanceData>() == 112);

impl InstanceData {
    pub fn cdf_range(&self) -> std::ops::Range<usize> {
        self.cdf_range_start as usize..self.cdf_range_end as usize
    }
}

/// Triangle CDF of one emitter with its unnormalized totals.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleCdf {
    /// Normalized, non-decreasing, ending at 1.
    pub cdf: Vec<f32>,
    pub weight: f32,
    pub area: f32,
}

/// Computes the power-weighted triangle CDF of `emitter` in world space.
///
/// Fails if the emitter emits nothing, either because its emission is black or because its
/// world-space area is zero.
pub fn triangle_cdf(emitter: &Emitter) -> Result<TriangleCdf> {
    let brightness = luminance(emitter.emission);
    if !brightness.is_finite() {
        return Err(BuildError::NonFiniteEmissiveWeight {
            instance: emitter.instance,
        });
    }
    let mesh = emitter.mesh;
    let mut cdf = Vec::with_capacity(mesh.triangle_count());
    let mut cumulative_weight = 0.0f32;
    let mut area = 0.0f32;
    let mut degenerate = 0usize;
    for i in 0..mesh.triangle_count() {
        let [v0, v1, v2] = mesh
            .triangle(i)
            .map(|v| emitter.transform.transform_point3(v));
        let triangle_area = (v1 - v0).cross(v2 - v0).length() * 0.5;
        if triangle_area == 0.0 {
            degenerate += 1;
        }
        cumulative_weight += triangle_area * brightness;
        area += triangle_area;
        cdf.push(cumulative_weight);
    }

    if !cumulative_weight.is_finite() {
        return Err(BuildError::NonFiniteEmissiveWeight {
            instance: emitter.instance,
        });
    }
    if cumulative_weight <= 0.0 {
        return Err(BuildError::ZeroEmissiveWeight {
            instance: emitter.instance,
        });
    }
    if degenerate > 0 {
        tracing::warn!(
            instance = emitter.instance,
            degenerate,
            "Emissive mesh contains zero-area triangles"
        );
    }
    for value in cdf.iter_mut() {
        *value /= cumulative_weight;
    }
    Ok(TriangleCdf {
        cdf,
        weight: cumulative_weight,
        area,
    })
}

/// Element-wise comparison within `tolerance`, the only test for shared CDF storage.
fn cdfs_match(a: &[f32], b: &[f32], tolerance: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tolerance)
}

/// A light chosen by [`EmissiveSamplingTable::sample`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightSample {
    /// Position in the emitter list.
    pub emitter: usize,
    /// Triangle of the emitter's mesh.
    pub triangle: u32,
    /// Probability of choosing this emitter and triangle.
    pub probability: f32,
}

/// The packed light sampling data of a scene.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmissiveSamplingTable {
    instances: Vec<InstanceData>,
    triangle_cdf: Vec<f32>,
    instance_cdf: Vec<f32>,
    total_weight: f32,
    /// For each emitter, the emitter whose triangle CDF slice it shares. Itself if canonical.
    canonical: Vec<usize>,
}

impl EmissiveSamplingTable {
    /// Builds the table. Emitters keep their order, which fixes the instance CDF order.
    ///
    /// Every error is raised before anything is handed to the GPU.
    pub fn build(emitters: &[Emitter], config: &LightConfig) -> Result<Self> {
        let _span = tracing::info_span!("emissive_table").entered();
        let mut table = Self::default();
        // Canonical emitters grouped by CDF length. Only equal-length CDFs can match.
        let mut by_len: HashMap<usize, Vec<usize>> = HashMap::new();

        for (i, emitter) in emitters.iter().enumerate() {
            let TriangleCdf { cdf, weight, area } = triangle_cdf(emitter)?;

            let mut shared = None;
            if config.dedup
                && let Some(candidates) = by_len.get(&cdf.len())
            {
                shared = candidates.iter().copied().find(|&candidate| {
                    let range = table.instances[candidate].cdf_range();
                    cdfs_match(&table.triangle_cdf[range], &cdf, config.dedup_tolerance)
                });
            }

            let (cdf_range_start, cdf_range_end, canonical) = match shared {
                Some(canonical) => {
                    let data = &table.instances[canonical];
                    (data.cdf_range_start, data.cdf_range_end, canonical)
                }
                None => {
                    let start = table.triangle_cdf.len() as u32;
                    table.triangle_cdf.extend_from_slice(&cdf);
                    if config.dedup {
                        by_len.entry(cdf.len()).or_default().push(i);
                    }
                    (start, table.triangle_cdf.len() as u32, i)
                }
            };
            table.canonical.push(canonical);
            table.instances.push(InstanceData {
                transform: emitter.transform,
                emission: emitter.emission,
                material_offset: emitter.material_offset,
                cdf_range_start,
                cdf_range_end,
                index_offset: emitter.index_offset,
                cull_backface: emitter.cull_backface as u32,
                weight,
                area,
                _pad: [0.0; 2],
            });
        }

        let mut cumulative = 0.0f32;
        for (data, emitter) in table.instances.iter().zip(emitters) {
            cumulative += data.weight;
            if !cumulative.is_finite() {
                return Err(BuildError::NonFiniteEmissiveWeight {
                    instance: emitter.instance,
                });
            }
            table.instance_cdf.push(cumulative);
        }
        for value in table.instance_cdf.iter_mut() {
            *value /= cumulative;
        }
        table.total_weight = cumulative;

        tracing::info!(
            emitters = table.len(),
            shared = table.duplicate_count(),
            triangle_cdf_entries = table.triangle_cdf.len(),
            total_weight = table.total_weight,
            "Emissive sampling table built"
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
    pub fn instances(&self) -> &[InstanceData] {
        &self.instances
    }
    /// Concatenation of every distinct triangle CDF.
    pub fn triangle_cdf(&self) -> &[f32] {
        &self.triangle_cdf
    }
    pub fn instance_cdf(&self) -> &[f32] {
        &self.instance_cdf
    }
    pub fn total_weight(&self) -> f32 {
        self.total_weight
    }
    /// The earlier emitter whose triangle CDF slice emitter `i` reuses, if any.
    pub fn duplicate_of(&self, i: usize) -> Option<usize> {
        self.canonical.get(i).copied().filter(|&canonical| canonical != i)
    }
    pub fn duplicate_count(&self) -> usize {
        (0..self.len()).filter(|&i| self.duplicate_of(i).is_some()).count()
    }

    /// Packs the instance CDF as `{ u32 count, f32 total_weight, f32 cdf[count] }`.
    pub fn instance_cdf_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 4 * self.instance_cdf.len());
        bytes.extend_from_slice(&(self.instance_cdf.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.total_weight.to_le_bytes());
        bytes.extend_from_slice(bytemuck::cast_slice(&self.instance_cdf));
        bytes
    }

    /// Picks an emitter with `u0` and one of its triangles with `u1`, the same way the light
    /// sampling shader does. Returns `None` if the table is empty.
    pub fn sample(&self, u0: f32, u1: f32) -> Option<LightSample> {
        let emitter = search(&self.instance_cdf, u0)?;
        let data = &self.instances[emitter];
        let slice = &self.triangle_cdf[data.cdf_range()];
        let triangle = search(slice, u1)?;
        Some(LightSample {
            emitter,
            triangle: triangle as u32,
            probability: probability(&self.instance_cdf, emitter)
                * probability(slice, triangle),
        })
    }

    /// Uploads the three sampling buffers to device-local memory.
    pub fn upload<B: RayTracingBackend>(&self, backend: &mut B) -> Result<EmissiveBuffers<B>> {
        let usage =
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        Ok(EmissiveBuffers {
            instance_data: upload_buffer(
                backend,
                bytemuck::cast_slice(&self.instances),
                usage,
                Residency::DeviceLocal,
            )?,
            triangle_cdf: upload_buffer(
                backend,
                bytemuck::cast_slice(&self.triangle_cdf),
                usage,
                Residency::DeviceLocal,
            )?,
            instance_cdf: upload_buffer(
                backend,
                &self.instance_cdf_bytes(),
                usage,
                Residency::DeviceLocal,
            )?,
        })
    }
}

/// Index of the first entry greater than `u`, clamped to the last entry.
fn search(cdf: &[f32], u: f32) -> Option<usize> {
    let last = cdf.len().checked_sub(1)?;
    Some(cdf.partition_point(|&value| value <= u).min(last))
}

fn probability(cdf: &[f32], i: usize) -> f32 {
    let previous = if i == 0 { 0.0 } else { cdf[i - 1] };
    cdf[i] - previous
}

/// Device copies of an [`EmissiveSamplingTable`].
pub struct EmissiveBuffers<B: RayTracingBackend> {
    pub instance_data: B::Buffer,
    pub triangle_cdf: B::Buffer,
    pub instance_cdf: B::Buffer,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{BackendBuffer, SoftwareBackend},
        geometry::tests::unit_quad,
    };

    fn emitter(mesh: &ModelData, instance: usize, transform: Mat4, emission: Vec3) -> Emitter<'_> {
        Emitter {
            instance,
            mesh,
            transform,
            emission,
            material_offset: 0,
            index_offset: 0,
            cull_backface: false,
        }
    }

    /// A fan of triangles with areas 1, 2 and 3.
    fn uneven_fan() -> ModelData {
        ModelData::new(
            [
                Vec3::ZERO,
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(-4.0, 0.0, 0.0),
                Vec3::new(0.0, -1.5, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3], [0, 3, 4]],
        )
    }

    /// Two unit right triangles in perpendicular planes.
    fn bent_pair() -> ModelData {
        ModelData::new(
            [Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z],
            vec![[0, 1, 2], [0, 1, 3]],
        )
    }

    fn assert_valid_cdf(cdf: &[f32]) {
        assert!(!cdf.is_empty());
        assert!(cdf[0] >= 0.0);
        assert!(cdf.windows(2).all(|w| w[1] - w[0] >= 0.0));
        assert!((cdf[cdf.len() - 1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_triangle_cdf_is_area_weighted() {
        let mesh = uneven_fan();
        let cdf = triangle_cdf(&emitter(&mesh, 0, Mat4::IDENTITY, Vec3::ONE)).unwrap();
        assert_valid_cdf(&cdf.cdf);
        assert!((cdf.area - 6.0).abs() < 1e-5);
        assert!((cdf.weight - 6.0).abs() < 1e-4);
        assert!((cdf.cdf[0] - 1.0 / 6.0).abs() < 1e-6);
        assert!((cdf.cdf[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_weight_uses_world_space_and_luminance() {
        let mesh = unit_quad();
        let transform = Mat4::from_scale(Vec3::splat(2.0));
        let red = Vec3::new(1.0, 0.0, 0.0);
        let cdf = triangle_cdf(&emitter(&mesh, 0, transform, red)).unwrap();
        assert!((cdf.area - 4.0).abs() < 1e-5);
        assert!((cdf.weight - 4.0 * 0.2126).abs() < 1e-5);
    }

    #[test]
    fn test_black_emitter_is_rejected() {
        let mesh = unit_quad();
        let result = EmissiveSamplingTable::build(
            &[emitter(&mesh, 7, Mat4::IDENTITY, Vec3::ZERO)],
            &LightConfig::default(),
        );
        assert!(matches!(
            result,
            Err(BuildError::ZeroEmissiveWeight { instance: 7 })
        ));
    }

    #[test]
    fn test_degenerate_emitter_is_rejected() {
        let mesh = ModelData::new([Vec3::ZERO, Vec3::X, Vec3::X * 2.0], vec![[0, 1, 2]]);
        let result = triangle_cdf(&emitter(&mesh, 3, Mat4::IDENTITY, Vec3::ONE));
        assert!(matches!(
            result,
            Err(BuildError::ZeroEmissiveWeight { instance: 3 })
        ));
        let flattened = unit_quad();
        let result = triangle_cdf(&emitter(
            &flattened,
            4,
            Mat4::from_scale(Vec3::new(1.0, 0.0, 1.0)),
            Vec3::ONE,
        ));
        assert!(matches!(
            result,
            Err(BuildError::ZeroEmissiveWeight { instance: 4 })
        ));
    }

    #[test]
    fn test_non_finite_emission_is_rejected() {
        let mesh = unit_quad();
        let result = triangle_cdf(&emitter(
            &mesh,
            0,
            Mat4::IDENTITY,
            Vec3::new(f32::NAN, 1.0, 1.0),
        ));
        assert!(matches!(
            result,
            Err(BuildError::NonFiniteEmissiveWeight { instance: 0 })
        ));
    }

    #[test]
    fn test_identical_quads_share_storage() {
        let mesh = unit_quad();
        let emitters = [
            emitter(&mesh, 0, Mat4::IDENTITY, Vec3::ONE),
            emitter(&mesh, 1, Mat4::IDENTITY, Vec3::ONE),
        ];
        let table = EmissiveSamplingTable::build(&emitters, &LightConfig::default()).unwrap();
        assert_eq!(table.triangle_cdf().len(), 2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.instances()[0].cdf_range(), table.instances()[1].cdf_range());
        assert_eq!(table.duplicate_of(1), Some(0));
        assert_eq!(table.duplicate_of(0), None);
    }

    /// An 8x8 grid of 128 triangles with jittered vertices, so CDF entries are not exactly
    /// representable.
    fn jittered_grid() -> ModelData {
        const N: u32 = 8;
        let positions = (0..=N).flat_map(|j| {
            (0..=N).map(move |i| {
                let (x, y) = (i as f32, j as f32);
                Vec3::new(
                    x + 0.2 * (x * 1.3 + y * 0.7).sin(),
                    y + 0.2 * (x * 0.9 + y * 1.7).cos(),
                    0.1 * (x + y).sin(),
                )
            })
        });
        let indices = (0..N)
            .flat_map(|j| {
                (0..N).flat_map(move |i| {
                    let a = j * (N + 1) + i;
                    let (b, c, d) = (a + 1, a + N + 1, a + N + 2);
                    [[a, b, d], [a, d, c]]
                })
            })
            .collect();
        ModelData::new(positions, indices)
    }

    #[test]
    fn test_translated_copies_share_storage() {
        let mesh = jittered_grid();
        assert_eq!(mesh.triangle_count(), 128);
        let emitters: Vec<_> = (0..10)
            .map(|k| {
                let k = k as f32;
                let offset = Vec3::new(k * 3.7 + 0.13, 4.1, -2.3 * k);
                emitter(&mesh, k as usize, Mat4::from_translation(offset), Vec3::ONE)
            })
            .collect();
        let table = EmissiveSamplingTable::build(&emitters, &LightConfig::default()).unwrap();
        assert_eq!(table.duplicate_count(), 9);
        assert_eq!(table.triangle_cdf().len(), 128);
        for (i, data) in table.instances().iter().enumerate().skip(1) {
            assert_eq!(table.duplicate_of(i), Some(0));
            assert_eq!(data.cdf_range(), 0..128);
        }
        // Weights stay per instance even though the slice is shared.
        let weights: Vec<f32> = table.instances().iter().map(|d| d.weight).collect();
        assert!(weights.iter().all(|w| (w - weights[0]).abs() < 1e-3));
    }

    #[test]
    fn test_rotated_copy_shares_storage() {
        let mesh = jittered_grid();
        let rotated = Mat4::from_translation(Vec3::new(-5.0, 2.0, 1.0))
            * Mat4::from_rotation_y(0.7)
            * Mat4::from_rotation_x(-1.1);
        let emitters = [
            emitter(&mesh, 0, Mat4::IDENTITY, Vec3::ONE),
            emitter(&mesh, 1, rotated, Vec3::ONE),
        ];
        let config = LightConfig {
            dedup_tolerance: 1e-5,
            ..Default::default()
        };
        let table = EmissiveSamplingTable::build(&emitters, &config).unwrap();
        assert_eq!(table.duplicate_of(1), Some(0));
        assert_eq!(table.triangle_cdf().len(), 128);
    }

    #[test]
    fn test_dedup_can_be_disabled() {
        let mesh = unit_quad();
        let emitters = [
            emitter(&mesh, 0, Mat4::IDENTITY, Vec3::ONE),
            emitter(&mesh, 1, Mat4::IDENTITY, Vec3::ONE),
        ];
        let config = LightConfig {
            dedup: false,
            ..Default::default()
        };
        let table = EmissiveSamplingTable::build(&emitters, &config).unwrap();
        assert_eq!(table.triangle_cdf().len(), 4);
        assert_eq!(table.instances()[1].cdf_range(), 2..4);
    }

    #[test]
    fn test_uniform_scale_is_duplicate_but_stretch_is_not() {
        let mesh = bent_pair();
        let emitters = [
            emitter(&mesh, 0, Mat4::IDENTITY, Vec3::ONE),
            emitter(&mesh, 1, Mat4::from_scale(Vec3::splat(3.0)), Vec3::splat(5.0)),
            emitter(&mesh, 2, Mat4::from_scale(Vec3::new(1.0, 4.0, 1.0)), Vec3::ONE),
        ];
        let table = EmissiveSamplingTable::build(&emitters, &LightConfig::default()).unwrap();
        assert_eq!(table.duplicate_of(1), Some(0));
        assert_eq!(table.duplicate_of(2), None);
        assert_eq!(table.triangle_cdf().len(), 4);
        assert_eq!(table.instances()[2].cdf_range(), 2..4);
        assert!((table.triangle_cdf()[2] - 0.8).abs() < 1e-6);
        // Sharing a CDF slice does not share power.
        assert!(table.instances()[1].weight > table.instances()[0].weight * 40.0);
        for data in table.instances() {
            assert_valid_cdf(&table.triangle_cdf()[data.cdf_range()]);
        }
    }

    #[test]
    fn test_instance_cdf() {
        let quad = unit_quad();
        let fan = uneven_fan();
        let emitters = [
            emitter(&quad, 0, Mat4::IDENTITY, Vec3::ONE),
            emitter(&fan, 1, Mat4::IDENTITY, Vec3::ONE),
            emitter(&quad, 2, Mat4::IDENTITY, Vec3::splat(3.0)),
        ];
        let table = EmissiveSamplingTable::build(&emitters, &LightConfig::default()).unwrap();
        let cdf = table.instance_cdf();
        assert_eq!(cdf.len(), emitters.len());
        assert_valid_cdf(cdf);
        assert!((table.total_weight() - 10.0).abs() < 1e-4);
        assert!((cdf[0] - 0.1).abs() < 1e-6);
        assert!((cdf[1] - 0.7).abs() < 1e-6);

        let bytes = table.instance_cdf_bytes();
        assert_eq!(bytes.len(), 8 + 4 * 3);
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &table.total_weight().to_le_bytes());
        assert_eq!(&bytes[8..12], &cdf[0].to_le_bytes());
    }

    #[test]
    fn test_sampling_follows_power() {
        let quad = unit_quad();
        let fan = uneven_fan();
        let emitters = [
            emitter(&quad, 0, Mat4::IDENTITY, Vec3::splat(2.0)),
            emitter(&fan, 1, Mat4::IDENTITY, Vec3::ONE),
        ];
        let table = EmissiveSamplingTable::build(&emitters, &LightConfig::default()).unwrap();
        let first = table.sample(0.0, 0.0).unwrap();
        assert_eq!((first.emitter, first.triangle), (0, 0));
        assert!((first.probability - 0.25 * 0.5).abs() < 1e-6);

        let last = table.sample(0.999, 0.999).unwrap();
        assert_eq!((last.emitter, last.triangle), (1, 2));
        assert!((last.probability - 0.75 * 0.5).abs() < 1e-6);

        let middle = table.sample(0.5, 0.2).unwrap();
        assert_eq!((middle.emitter, middle.triangle), (1, 1));

        assert!(EmissiveSamplingTable::default().sample(0.5, 0.5).is_none());
    }

    #[test]
    fn test_upload_layout() {
        let mesh = unit_quad();
        let emitters = [
            emitter(&mesh, 0, Mat4::IDENTITY, Vec3::ONE),
            emitter(&mesh, 1, Mat4::from_translation(Vec3::Z), Vec3::ONE),
        ];
        let table = EmissiveSamplingTable::build(&emitters, &LightConfig::default()).unwrap();
        let mut backend = SoftwareBackend::new();
        let buffers = table.upload(&mut backend).unwrap();
        assert_eq!(buffers.instance_data.size(), 2 * 112);
        let bytes = buffers.instance_data.as_slice().unwrap();
        let second: InstanceData = bytemuck::pod_read_unaligned(&bytes[112..224]);
        assert_eq!(second.cdf_range_start, 0);
        assert_eq!(second.cdf_range_end, 2);
        assert_eq!(second.transform, Mat4::from_translation(Vec3::Z));
        assert_eq!(buffers.instance_cdf.size(), 16);
    }
}
