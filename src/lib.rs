//! # Scoria
//!
//! Scene acceleration and light sampling for Vulkan path tracers.
//!
//! Scoria turns a set of triangle meshes and their placements into everything a ray tracing
//! dispatch needs besides the shaders themselves:
//!
//! - consolidated geometry buffers shared by every mesh ([`geometry`]),
//! - one compacted bottom-level acceleration structure per mesh ([`blas`]),
//! - a scene-wide top-level acceleration structure ([`tlas`]),
//! - power-proportional light sampling tables for next-event estimation ([`emissive`]),
//! - the shader binding table and its dispatch regions ([`sbt`]).
//!
//! ## Quick Start
//!
//! ```
//! use scoria::prelude::*;
//!
//! let mut backend = SoftwareBackend::new();
//! let mut builder = SceneBuilder::new();
//! let quad = builder
//!     .add_mesh(ModelData::new(
//!         [Vec3::ZERO, Vec3::X, Vec3::new(1.0, 1.0, 0.0), Vec3::Y],
//!         vec![[0, 1, 2], [0, 2, 3]],
//!     ))
//!     .unwrap();
//! builder
//!     .add_instance(InstanceDesc::new(quad, Mat4::IDENTITY))
//!     .add_instance(
//!         InstanceDesc::new(quad, Mat4::from_translation(Vec3::Z)).with_emission(Vec3::splat(4.0)),
//!     );
//! let scene = builder.build(&mut backend).unwrap();
//! assert_eq!(scene.tlas().instance_count(), 2);
//! assert_eq!(scene.lights().len(), 1);
//! ```
//!
//! ## Backends
//!
//! All device work goes through [`RayTracingBackend`](backend::RayTracingBackend). The
//! [`vulkan`] module (feature `vulkan`, enabled by default) implements it over `ash` and
//! `vk-mem`. [`SoftwareBackend`](backend::SoftwareBackend) implements it on the CPU for tests and
//! tooling.
//!
//! ## Errors
//!
//! Every fallible operation returns [`BuildError`]. Errors are fatal to the scene build: there is
//! no partial scene. Checks on host data run before anything is submitted to the device.
//!
//! ## Logging
//!
//! Each build stage runs inside a `tracing` span and reports its results at `info` level.
//! Install a subscriber to see them.

pub mod backend;
pub mod bindings;
pub mod blas;
pub mod config;
pub mod emissive;
mod error;
pub mod geometry;
pub mod sbt;
pub mod scene;
pub mod tlas;
pub mod utils;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use config::{ConfigError, SceneConfig};
pub use error::{BuildError, Result};
pub use scene::{InstanceDesc, Scene, SceneBuilder};

pub use ash;

pub mod prelude {
    pub use crate::{
        BuildError, InstanceDesc, Scene, SceneBuilder, SceneConfig, ash,
        ash::vk,
        backend::{BackendAccelStruct, BackendBuffer, RayTracingBackend, SoftwareBackend},
        bindings::SceneBindings,
        emissive::{EmissiveSamplingTable, LightSample},
        geometry::{MeshId, ModelData},
        sbt::ShaderBindingTable,
    };
    pub use glam::{Mat3, Mat4, Vec2, Vec3};
}
