//! Descriptor bindings through which shaders read the scene.
//!
//! A path tracer binds the TLAS together with the geometry and light sampling buffers. The binding
//! numbers are chosen by the shader author, so [`SceneBindings`] only checks that no two resources
//! claim the same number before turning the description into
//! [`vk::DescriptorSetLayoutBinding`]s.
//!
//! ```
//! # use scoria::{ash::vk, bindings::SceneBindings};
//! let bindings = SceneBindings::default();
//! let layout = bindings.layout_bindings(vk::ShaderStageFlags::RAYGEN_KHR).unwrap();
//! assert_eq!(layout.len(), 6);
//! ```

use ash::vk;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{BuildError, Result};

/// A scene resource visible to shaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneResource {
    Tlas,
    Vertices,
    Indices,
    InstanceData,
    TriangleCdf,
    InstanceCdf,
}

impl SceneResource {
    pub const ALL: [SceneResource; 6] = [
        Self::Tlas,
        Self::Vertices,
        Self::Indices,
        Self::InstanceData,
        Self::TriangleCdf,
        Self::InstanceCdf,
    ];

    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::Tlas => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            _ => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// Binding numbers for each scene resource within one descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneBindings {
    pub tlas: u32,
    pub vertices: u32,
    /// Global (scene-wide) triangle indices.
    pub indices: u32,
    pub instance_data: u32,
    pub triangle_cdf: u32,
    pub instance_cdf: u32,
}

impl Default for SceneBindings {
    fn default() -> Self {
        Self {
            tlas: 0,
            vertices: 1,
            indices: 2,
            instance_data: 3,
            triangle_cdf: 4,
            instance_cdf: 5,
        }
    }
}

impl SceneBindings {
    pub fn binding(&self, resource: SceneResource) -> u32 {
        match resource {
            SceneResource::Tlas => self.tlas,
            SceneResource::Vertices => self.vertices,
            SceneResource::Indices => self.indices,
            SceneResource::InstanceData => self.instance_data,
            SceneResource::TriangleCdf => self.triangle_cdf,
            SceneResource::InstanceCdf => self.instance_cdf,
        }
    }

    /// Returns [`BuildError::DuplicateBinding`] for the first binding number used twice.
    pub fn validate(&self) -> Result<()> {
        let mut seen: SmallVec<[u32; 6]> = SmallVec::new();
        for resource in SceneResource::ALL {
            let binding = self.binding(resource);
            if seen.contains(&binding) {
                return Err(BuildError::DuplicateBinding(binding));
            }
            seen.push(binding);
        }
        Ok(())
    }

    pub fn layout_bindings(
        &self,
        stage_flags: vk::ShaderStageFlags,
    ) -> Result<SmallVec<[vk::DescriptorSetLayoutBinding<'static>; 6]>> {
        self.validate()?;
        Ok(SceneResource::ALL
            .into_iter()
            .map(|resource| vk::DescriptorSetLayoutBinding {
                binding: self.binding(resource),
                descriptor_type: resource.descriptor_type(),
                descriptor_count: 1,
                stage_flags,
                ..Default::default()
            })
            .collect())
    }

    /// Pool sizes for allocating `sets` descriptor sets with this layout.
    pub fn pool_sizes(&self, sets: u32) -> [vk::DescriptorPoolSize; 2] {
        [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: sets * (SceneResource::ALL.len() as u32 - 1),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bindings_are_distinct() {
        let bindings = SceneBindings::default();
        bindings.validate().unwrap();
        let layout = bindings
            .layout_bindings(vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR)
            .unwrap();
        assert_eq!(layout.len(), 6);
        assert_eq!(
            layout[0].descriptor_type,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
        assert!(
            layout[1..]
                .iter()
                .all(|b| b.descriptor_type == vk::DescriptorType::STORAGE_BUFFER)
        );
        assert_eq!(layout[4].binding, 4);
    }

    #[test]
    fn test_duplicate_binding() {
        let bindings = SceneBindings {
            triangle_cdf: 7,
            instance_cdf: 7,
            ..Default::default()
        };
        assert!(matches!(
            bindings.layout_bindings(vk::ShaderStageFlags::RAYGEN_KHR),
            Err(BuildError::DuplicateBinding(7))
        ));
    }

    #[test]
    fn test_from_ron() {
        let bindings: SceneBindings = ron::from_str("(tlas: 10, vertices: 11)").unwrap();
        assert_eq!(bindings.tlas, 10);
        assert_eq!(bindings.indices, 2);
        bindings.validate().unwrap();
    }

    #[test]
    fn test_pool_sizes() {
        let sizes = SceneBindings::default().pool_sizes(2);
        assert_eq!(sizes[0].descriptor_count, 2);
        assert_eq!(sizes[1].descriptor_count, 10);
    }
}
