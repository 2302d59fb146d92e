//! Load-time patch engine for JVM class files.
//!
//! A [`TransformerPipeline`] receives a class by name and raw bytes, runs every
//! enabled catalog transformer targeting that class in priority order, and
//! returns either a validly patched class or the input bytes unchanged.

mod catalog;
mod cfg;
mod classfile;
mod config;
mod constant_pool;
mod decode;
mod descriptor;
mod encode;
mod error;
mod frames;
mod inject;
mod ir;
mod opcodes;
mod patterns;
mod pipeline;
mod report;
mod rewriter;
#[cfg(test)]
mod testing;

pub use catalog::{
    BEACON_SPAWN_CONTROLLER, BLOCK_COMPONENT_CHUNK, INTERACTION_CHAIN, INTERACTION_TIMEOUT,
    PLAYER_SYSTEMS, SPAWN_MARKER_ENTITY, SPAWN_MARKER_SYSTEMS, SPAWN_REFERENCE_SYSTEMS,
    TICKING_THREAD, TRACKED_PLACEMENT, TRANSFORMER_NAMES, UNIVERSE, UUID_SYSTEM, WORLD,
};
pub use config::{
    ConfigSnapshot, EarlyConfig, EarlyLoggingConfig, EarlyPluginConfig,
    InteractionTimeoutConfig, WorldConfig, load_config, parse_config,
};
pub use error::{FailureKind, PatchError};
pub use pipeline::{
    Diagnostic, Outcome, Registry, StatsSnapshot, TransformResult, Transformer,
    TransformerPipeline, is_valid_class_name,
};
pub use report::{build_invocation, build_sarif, diagnostic_result, transformer_rules};
pub use rewriter::{
    MethodOutcome, TargetDescriptor, declared_class_name, dotted_name, verify_frames,
};
