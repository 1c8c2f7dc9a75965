//! Errors raised while building a scene.
//!
//! Every failure in this crate is fatal for the build that raised it: errors propagate up to
//! [`SceneBuilder::build`](crate::scene::SceneBuilder::build), which abandons the whole scene.
//! Variants fall into three groups:
//!
//! - **Backend capability**: the device or driver could not do what was asked.
//! - **Data integrity**: the inputs are well-formed but would produce data the shaders cannot
//!   consume (zero-power emitters, SBT strides the device rejects). These are always raised
//!   before anything is submitted to the GPU.
//! - **Input shape**: the inputs themselves are malformed.

use std::ffi::CStr;

use ash::vk;

use crate::config::ConfigError;

/// The error type for every fallible operation in this crate.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// The Vulkan driver returned an error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
    /// A device extension required for ray tracing is not available.
    #[error("Required device extension {0:?} is not supported")]
    MissingExtension(&'static CStr),
    /// The backend refused an operation.
    #[error("Backend failure: {0}")]
    Backend(String),

    /// An instance flagged as emissive emits no light.
    #[error("Emissive instance {instance} has zero emitted power (black emission or zero area)")]
    ZeroEmissiveWeight { instance: usize },
    /// An emissive instance produced a NaN or infinite weight.
    #[error("Emissive instance {instance} has a non-finite weight")]
    NonFiniteEmissiveWeight { instance: usize },
    /// The SBT stride is larger than the device allows.
    #[error("SBT stride {stride} exceeds the device limit of {max}")]
    StrideExceedsLimit { stride: u32, max: u32 },
    /// The SBT stride is not a multiple of the base alignment.
    #[error("SBT stride {stride} is not a multiple of the base alignment {alignment}")]
    MisalignedStride { stride: u32, alignment: u32 },
    /// The device reported an alignment that is zero or not a power of two.
    #[error("Invalid shader group alignment {0}")]
    InvalidAlignment(u32),
    /// The device reported a zero shader group handle size.
    #[error("Shader group handle size is zero")]
    ZeroHandleSize,
    /// The pipeline returned a different amount of handle data than requested.
    #[error("Expected {expected} bytes of shader group handles, got {actual}")]
    ShaderGroupHandleMismatch { expected: usize, actual: usize },
    /// A shader group index is past the end of the shader binding table.
    #[error("Shader group {group} does not exist, the table has {count} groups")]
    UnknownShaderGroup { group: u32, count: u32 },
    /// Inline record data does not fit in the space reserved after a group handle.
    #[error("Record of {size} bytes for shader group {group} exceeds the {capacity} reserved bytes")]
    RecordTooLarge {
        group: u32,
        size: usize,
        capacity: u32,
    },
    /// An instance selects a hit group the shader binding table does not contain.
    #[error("Instance {instance} uses hit group {hit_group}, but only {count} hit groups exist")]
    HitGroupOutOfRange {
        instance: usize,
        hit_group: u32,
        count: u32,
    },
    /// Instance custom indices and SBT offsets are 24-bit fields.
    #[error("Instance {instance} has index {value}, which does not fit in 24 bits")]
    CustomIndexOverflow { instance: usize, value: u32 },

    /// A mesh failed validation when it was added.
    #[error("Mesh {mesh} is malformed: {reason}")]
    InvalidMesh { mesh: usize, reason: String },
    /// A single-mesh import produced more than one disjoint mesh.
    #[error("Expected exactly one mesh, found {0}")]
    MultipleMeshes(usize),
    /// An instance refers to a mesh that was never added.
    #[error("Instance {instance} references unknown mesh {mesh}")]
    UnknownMesh { instance: usize, mesh: u32 },
    /// Two resources were assigned the same binding number.
    #[error("Binding {0} is assigned more than once")]
    DuplicateBinding(u32),

    /// The scene configuration could not be loaded.
    #[error("Scene configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;
