//! Deduplication identities.
//!
//! A [`TargetInput`] is the canonical identity of a target occurrence: the
//! canonical target string plus every argument binding that can affect the
//! build output. Two occurrences with equal `TargetInput` produce identical
//! outputs and may share cached results.

use crate::domain::Target;
use sha2::{Digest, Sha256};

/// Canonical dedup key of one target occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInput {
    pub target_canonical: String,
    pub build_args: Vec<BuildArgInput>,
}

impl TargetInput {
    pub fn new(target_canonical: impl Into<String>) -> Self {
        Self { target_canonical: target_canonical.into(), build_args: Vec::new() }
    }

    /// Extends the identity with one more argument binding.
    pub fn with_build_arg_input(mut self, input: BuildArgInput) -> Self {
        self.build_args.push(input);
        self
    }

    /// Stable hash of the full identity.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        self.feed(&mut hasher);
        format!("{:x}", hasher.finalize())
    }

    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.target_canonical.as_bytes());
        hasher.update([0]);
        for arg in &self.build_args {
            arg.feed(hasher);
        }
    }
}

/// One argument binding participating in a target's dedup identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArgInput {
    pub name: String,
    pub default_value: String,
    pub kind: BuildArgInputKind,
}

/// The value side of a binding: a constant, or the product of a sub-build
/// identified by its source identity and stable argument index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildArgInputKind {
    Constant(String),
    Derived { source: Box<TargetInput>, index: i32 },
}

impl BuildArgInput {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.name.as_bytes());
        hasher.update([1]);
        hasher.update(self.default_value.as_bytes());
        hasher.update([1]);
        match &self.kind {
            BuildArgInputKind::Constant(value) => {
                hasher.update([b'c']);
                hasher.update(value.as_bytes());
            }
            BuildArgInputKind::Derived { source, index } => {
                hasher.update([b'd']);
                hasher.update(index.to_be_bytes());
                source.feed(hasher);
            }
        }
        hasher.update([0]);
    }
}

/// Session identity of a target's cache context. The tag is stripped so
/// that re-invocations differing only in tag reuse the same cache.
pub fn cache_key(target: &Target) -> String {
    let mut stripped = target.clone();
    stripped.tag = String::new();
    let digest = Sha256::digest(stripped.string_canonical().as_bytes());
    format!("{:x}", digest)
}
