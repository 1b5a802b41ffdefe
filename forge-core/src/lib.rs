//! forge-core
//!
//! Core library of forge: converts Forgefile targets (Dockerfile-like
//! recipes with first-class targets, cross-target artifact references,
//! recursive sub-builds and scoped build arguments) into a directed
//! acyclic build graph for a lower-level executor.

pub mod cleanup;
pub mod convert;
pub mod domain;
pub mod error;
pub mod resolve;
pub mod state;

// Re-export commonly used items
pub use cleanup::CleanupCollection;
pub use convert::{
    cache_key, convert_target, Collection, ConvertOpt, Converter, MultiTargetStates, RunOpts,
    SingleTargetStates, SolveCache, TargetInput, VisitedStates,
};
pub use domain::{Artifact, Target};
pub use error::{ForgeError, Result};
pub use state::{BuildState, ImageResolveMode, Platform};
