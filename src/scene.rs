//! Scene build orchestration.
//!
//! [`SceneBuilder::build`] runs the whole pipeline in order:
//!
//! 1. instance validation (mesh ids, hit groups, 24-bit custom indices) and binding validation,
//! 2. the emissive sampling table, computed on the host,
//! 3. geometry upload,
//! 4. BLAS builds and compaction,
//! 5. the TLAS build,
//! 6. upload of the light sampling buffers.
//!
//! Every check that can fail on host data runs before the first GPU submission. Any error aborts
//! the build; resources created by earlier stages are released as the partial results drop.

use ash::vk;
use glam::{Mat4, Vec3};

use crate::{
    backend::RayTracingBackend,
    blas::{BlasArena, build_blases},
    config::SceneConfig,
    emissive::{EmissiveBuffers, EmissiveSamplingTable, Emitter},
    error::{BuildError, Result},
    geometry::{GeometryStore, GeometryStoreBuilder, MeshId, ModelData},
    sbt::ShaderBindingTable,
    tlas::{MAX_INSTANCE_INDEX, Tlas, TlasInstance, build_tlas},
};

/// One placement of a mesh in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceDesc {
    pub mesh: MeshId,
    pub transform: Mat4,
    /// Material index, stored as the instance custom index.
    pub material: u32,
    /// Emitted radiance. Instances with `None` are not light sources.
    pub emission: Option<Vec3>,
    pub cull_backface: bool,
    /// Hit group relative to the first hit group of the shader binding table.
    pub hit_group: u32,
}

impl InstanceDesc {
    pub fn new(mesh: MeshId, transform: Mat4) -> Self {
        Self {
            mesh,
            transform,
            material: 0,
            emission: None,
            cull_backface: false,
            hit_group: 0,
        }
    }
    pub fn with_material(mut self, material: u32) -> Self {
        self.material = material;
        self
    }
    pub fn with_emission(mut self, emission: Vec3) -> Self {
        self.emission = Some(emission);
        self
    }
    pub fn with_hit_group(mut self, hit_group: u32) -> Self {
        self.hit_group = hit_group;
        self
    }
    pub fn with_backface_culling(mut self) -> Self {
        self.cull_backface = true;
        self
    }
}

/// Collects meshes and instances on the host.
#[derive(Debug, Default)]
pub struct SceneBuilder {
    geometry: GeometryStoreBuilder,
    instances: Vec<InstanceDesc>,
    config: SceneConfig,
}

impl SceneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: SceneConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn add_mesh(&mut self, mesh: ModelData) -> Result<MeshId> {
        self.geometry.add_mesh(mesh)
    }

    /// Instances are validated by [`Self::build`].
    pub fn add_instance(&mut self, instance: InstanceDesc) -> &mut Self {
        self.instances.push(instance);
        self
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn validate(&self) -> Result<()> {
        self.config.bindings.validate()?;
        let hit_groups = self.config.shader_groups.hit;
        for (i, instance) in self.instances.iter().enumerate() {
            if self.geometry.mesh(instance.mesh).is_none() {
                return Err(BuildError::UnknownMesh {
                    instance: i,
                    mesh: instance.mesh.0,
                });
            }
            if instance.hit_group >= hit_groups {
                return Err(BuildError::HitGroupOutOfRange {
                    instance: i,
                    hit_group: instance.hit_group,
                    count: hit_groups,
                });
            }
            if instance.material > MAX_INSTANCE_INDEX {
                return Err(BuildError::CustomIndexOverflow {
                    instance: i,
                    value: instance.material,
                });
            }
        }
        Ok(())
    }

    pub fn build<B: RayTracingBackend>(self, backend: &mut B) -> Result<Scene<B>> {
        let _span = tracing::info_span!("scene_build").entered();
        self.validate()?;

        let consolidated = self.geometry.consolidate();
        let lights = {
            let emitters: Vec<Emitter> = self
                .instances
                .iter()
                .enumerate()
                .filter_map(|(i, instance)| {
                    let emission = instance.emission?;
                    let mesh = self.geometry.mesh(instance.mesh)?;
                    let range = consolidated.ranges.get(instance.mesh.index())?;
                    Some(Emitter {
                        instance: i,
                        mesh,
                        transform: instance.transform,
                        emission,
                        material_offset: instance.material,
                        index_offset: range.index_offset,
                        cull_backface: instance.cull_backface,
                    })
                })
                .collect();
            EmissiveSamplingTable::build(&emitters, &self.config.lights)?
        };

        let Self {
            geometry,
            instances,
            config,
        } = self;
        let geometry = geometry.upload(consolidated, backend)?;
        let blases = build_blases(backend, &geometry, &config.blas)?;
        let tlas_instances: Vec<TlasInstance> = instances
            .iter()
            .map(|instance| TlasInstance {
                blas: instance.mesh.into(),
                transform: instance.transform,
                custom_index: instance.material,
                hit_group: instance.hit_group,
                mask: u8::MAX,
                cull_backface: instance.cull_backface,
            })
            .collect();
        let tlas = build_tlas(backend, &tlas_instances, &blases, &config.tlas)?;
        let light_buffers = lights.upload(backend)?;

        tracing::info!(
            meshes = geometry.mesh_count(),
            instances = instances.len(),
            emitters = lights.len(),
            triangles = geometry.triangle_count(),
            "Scene build completed"
        );
        Ok(Scene {
            tlas,
            blases,
            geometry,
            lights,
            light_buffers,
            instances,
            config,
        })
    }
}

/// A fully built scene, ready to be bound for ray dispatch.
///
/// Fields drop in declaration order: the TLAS goes before the BLASes it references.
pub struct Scene<B: RayTracingBackend> {
    tlas: Tlas<B>,
    blases: BlasArena<B>,
    geometry: GeometryStore<B>,
    lights: EmissiveSamplingTable,
    light_buffers: EmissiveBuffers<B>,
    instances: Vec<InstanceDesc>,
    config: SceneConfig,
}

impl<B: RayTracingBackend> Scene<B> {
    pub fn tlas(&self) -> &Tlas<B> {
        &self.tlas
    }
    pub fn tlas_address(&self) -> vk::DeviceAddress {
        self.tlas.device_address()
    }
    pub fn blases(&self) -> &BlasArena<B> {
        &self.blases
    }
    pub fn geometry(&self) -> &GeometryStore<B> {
        &self.geometry
    }
    pub fn lights(&self) -> &EmissiveSamplingTable {
        &self.lights
    }
    pub fn light_buffers(&self) -> &EmissiveBuffers<B> {
        &self.light_buffers
    }
    pub fn instances(&self) -> &[InstanceDesc] {
        &self.instances
    }
    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Checks that `sbt` has a hit group for every instance.
    pub fn check_binding_table(&self, sbt: &ShaderBindingTable<B>) -> Result<()> {
        let count = sbt.hit_group_count();
        match self
            .instances
            .iter()
            .enumerate()
            .find(|(_, instance)| instance.hit_group >= count)
        {
            Some((i, instance)) => Err(BuildError::HitGroupOutOfRange {
                instance: i,
                hit_group: instance.hit_group,
                count,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{BackendBuffer, SoftwareBackend},
        config::ShaderGroupConfig,
        geometry::tests::unit_quad,
    };

    #[test]
    fn test_unknown_mesh_fails_before_gpu_work() {
        let mut backend = SoftwareBackend::new();
        let mut builder = SceneBuilder::new();
        builder.add_mesh(unit_quad()).unwrap();
        builder.add_instance(InstanceDesc::new(MeshId(5), Mat4::IDENTITY));
        assert!(matches!(
            builder.build(&mut backend),
            Err(BuildError::UnknownMesh { instance: 0, mesh: 5 })
        ));
        assert_eq!(backend.submissions(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_hit_group_out_of_range() {
        let mut backend = SoftwareBackend::new();
        let mut builder = SceneBuilder::new();
        let quad = builder.add_mesh(unit_quad()).unwrap();
        builder
            .add_instance(InstanceDesc::new(quad, Mat4::IDENTITY))
            .add_instance(InstanceDesc::new(quad, Mat4::IDENTITY).with_hit_group(1));
        assert!(matches!(
            builder.build(&mut backend),
            Err(BuildError::HitGroupOutOfRange {
                instance: 1,
                hit_group: 1,
                count: 1
            })
        ));
        assert_eq!(backend.submissions(), 0);
    }

    #[test]
    fn test_black_emitter_fails_before_gpu_work() {
        let mut backend = SoftwareBackend::new();
        let mut builder = SceneBuilder::new();
        let quad = builder.add_mesh(unit_quad()).unwrap();
        builder.add_instance(InstanceDesc::new(quad, Mat4::IDENTITY).with_emission(Vec3::ZERO));
        assert!(matches!(
            builder.build(&mut backend),
            Err(BuildError::ZeroEmissiveWeight { instance: 0 })
        ));
        assert_eq!(backend.submissions(), 0);
        assert_eq!(backend.live_bytes(), 0);
    }

    #[test]
    fn test_material_index_overflow() {
        let mut backend = SoftwareBackend::new();
        let mut builder = SceneBuilder::new();
        let quad = builder.add_mesh(unit_quad()).unwrap();
        builder.add_instance(InstanceDesc::new(quad, Mat4::IDENTITY).with_material(1 << 24));
        assert!(matches!(
            builder.build(&mut backend),
            Err(BuildError::CustomIndexOverflow { instance: 0, .. })
        ));
    }

    #[test]
    fn test_build_and_release() {
        let mut backend = SoftwareBackend::new();
        let mut builder = SceneBuilder::new();
        let quad = builder.add_mesh(unit_quad()).unwrap();
        builder
            .add_instance(InstanceDesc::new(quad, Mat4::IDENTITY).with_material(4))
            .add_instance(
                InstanceDesc::new(quad, Mat4::from_translation(Vec3::Y)).with_emission(Vec3::ONE),
            );
        let scene = builder.build(&mut backend).unwrap();
        assert_eq!(scene.blases().len(), 1);
        assert_eq!(scene.tlas().instance_count(), 2);
        assert_eq!(scene.lights().len(), 1);
        assert_eq!(scene.lights().instances()[0].material_offset, 0);
        assert_ne!(scene.tlas_address(), 0);
        assert!(scene.light_buffers().instance_data.size() >= 112);

        drop(scene);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_bytes(), 0);
    }

    #[test]
    fn test_check_binding_table() {
        let mut backend = SoftwareBackend::new();
        let groups = ShaderGroupConfig {
            hit: 2,
            ..Default::default()
        };
        let mut builder = SceneBuilder::new().with_config(SceneConfig {
            shader_groups: groups,
            ..Default::default()
        });
        let quad = builder.add_mesh(unit_quad()).unwrap();
        builder.add_instance(InstanceDesc::new(quad, Mat4::IDENTITY).with_hit_group(1));
        let scene = builder.build(&mut backend).unwrap();

        let pipeline = crate::backend::software::SoftwarePipeline::new(groups.group_count());
        let sbt = ShaderBindingTable::new(&mut backend, &pipeline, groups).unwrap();
        scene.check_binding_table(&sbt).unwrap();

        let small = ShaderBindingTable::new(&mut backend, &pipeline, ShaderGroupConfig::default())
            .unwrap();
        assert!(matches!(
            scene.check_binding_table(&small),
            Err(BuildError::HitGroupOutOfRange { instance: 0, .. })
        ));
    }
}
