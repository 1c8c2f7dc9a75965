//! Scene build configuration.
//!
//! Configuration is plain data with sensible defaults. It can be constructed in code or
//! loaded from a RON file, where every field may be omitted:
//!
//! ```ron
//! SceneConfig(
//!     blas: (compact: true, batch_builds: true),
//!     lights: (dedup_tolerance: 1e-6),
//!     shader_groups: (miss: 2, hit: 3),
//!     bindings: (tlas: 0, vertices: 1),
//! )
//! ```

use std::path::Path;

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::bindings::SceneBindings;

/// Error type for configuration loading failures.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read scene config: {0}")]
    Io(#[from] std::io::Error),
    /// The RON configuration file has syntax errors.
    #[error("Scene config deserialization error:\n{0}")]
    Ron(#[from] ron::de::SpannedError),
}

/// Top-level configuration for [`SceneBuilder`](crate::scene::SceneBuilder).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SceneConfig {
    pub blas: BlasConfig,
    pub tlas: TlasConfig,
    pub lights: LightConfig,
    pub shader_groups: ShaderGroupConfig,
    pub bindings: SceneBindings,
}

impl SceneConfig {
    pub fn from_ron_str(source: &str) -> Result<Self, ConfigError> {
        Ok(ron::de::from_str(source)?)
    }

    /// Reads and parses a `.ron` configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_ron_str(&source)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BlasConfig {
    /// Run the query-and-copy compaction pass after the initial build.
    pub compact: bool,
    pub prefer_fast_trace: bool,
    /// Mark all triangle geometry opaque, skipping any-hit shaders.
    pub opaque: bool,
    /// Record every BLAS build into a single submission sharing one scratch buffer.
    /// When disabled, each BLAS is built and waited on individually.
    pub batch_builds: bool,
}
impl Default for BlasConfig {
    fn default() -> Self {
        Self {
            compact: true,
            prefer_fast_trace: true,
            opaque: true,
            batch_builds: true,
        }
    }
}
impl BlasConfig {
    pub fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        let mut flags = if self.prefer_fast_trace {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        } else {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
        };
        if self.compact {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
        }
        flags
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TlasConfig {
    pub prefer_fast_trace: bool,
}
impl Default for TlasConfig {
    fn default() -> Self {
        Self {
            prefer_fast_trace: true,
        }
    }
}
impl TlasConfig {
    pub fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        if self.prefer_fast_trace {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        } else {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LightConfig {
    /// Share triangle CDF storage between emitters with identical distributions.
    pub dedup: bool,
    /// Maximum per-entry difference for two triangle CDFs to be considered identical.
    pub dedup_tolerance: f32,
}
impl Default for LightConfig {
    fn default() -> Self {
        Self {
            dedup: true,
            dedup_tolerance: 1e-6,
        }
    }
}

/// Shader group counts of the ray tracing pipeline.
///
/// There is always exactly one raygen group at index 0, followed by `miss` miss groups,
/// `hit` hit groups and `callable` callable groups, in pipeline declaration order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct ShaderGroupConfig {
    pub miss: u32,
    pub hit: u32,
    pub callable: u32,
    /// Bytes of inline record data reserved after each group handle.
    pub record_size: u32,
}
impl Default for ShaderGroupConfig {
    fn default() -> Self {
        Self {
            miss: 1,
            hit: 1,
            callable: 0,
            record_size: 0,
        }
    }
}
impl ShaderGroupConfig {
    pub fn group_count(&self) -> u32 {
        1 + self.miss + self.hit + self.callable
    }
    pub fn first_miss(&self) -> u32 {
        1
    }
    pub fn first_hit(&self) -> u32 {
        1 + self.miss
    }
    pub fn first_callable(&self) -> u32 {
        1 + self.miss + self.hit
    }
}
