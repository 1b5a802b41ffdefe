//! Collaborator contracts of the converter.
//!
//! The converter core stays independent of the recipe parser, the build
//! executor, registries and the Dockerfile frontend; it talks to them
//! through the traits below. Every blocking call accepts a cancellation
//! token and returns [`ForgeError::Cancelled`] once it fires.

use crate::convert::{Converter, MultiTargetStates};
use crate::domain::{Artifact, Target};
use crate::error::Result;
use crate::state::{BuildState, ImageResolveMode, Platform};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Name of the synthetic target used to resolve a host-side Dockerfile
/// build context.
pub const DOCKERFILE_META_TARGET: &str = "dockerfile";

/// Git metadata of a source checkout, probed by the resolver.
#[derive(Debug, Clone, Default)]
pub struct GitMetadata {
    pub remote_url: String,
    pub hash: String,
    pub branch: Vec<String>,
    pub tags: Vec<String>,
}

impl GitMetadata {
    pub fn short_hash(&self) -> String {
        self.hash.chars().take(8).collect()
    }
}

/// Resolved build-context data for one target.
#[derive(Debug, Clone)]
pub struct BuildContextData {
    /// State exposing the project directory contents.
    pub build_context: BuildState,
    /// Path of the recipe (or Dockerfile) within the resolved context.
    pub build_file_path: PathBuf,
    /// Local-context name to host-path mapping the executor must expose.
    pub local_dirs: BTreeMap<String, String>,
    pub git_metadata: Option<GitMetadata>,
}

/// Resolves a target reference to its build context.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        cancel: &CancellationToken,
        target: &Target,
    ) -> Result<BuildContextData>;
}

/// Options for image-config resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveImageOpt {
    pub platform: Platform,
    pub resolve_mode: ImageResolveMode,
    pub log_name: String,
}

/// Resolves a normalized image reference to its digest and raw
/// image-config JSON.
#[async_trait]
pub trait ImageMetaResolver: Send + Sync {
    async fn resolve_image_config(
        &self,
        cancel: &CancellationToken,
        reference: &str,
        opt: ResolveImageOpt,
    ) -> Result<(String, Vec<u8>)>;
}

/// Options for the external Dockerfile frontend.
#[derive(Debug, Clone)]
pub struct DockerfileConvertOpt {
    pub build_context: BuildState,
    pub context_local_name: String,
    /// Dockerfile stage to build; empty means the final stage.
    pub target: String,
    pub build_args: BTreeMap<String, String>,
    pub platform: Platform,
    pub resolve_mode: ImageResolveMode,
}

/// Translates Dockerfile bytes into a build state plus image metadata.
/// The metadata crosses the boundary as JSON because the frontend's image
/// type differs structurally from ours.
#[async_trait]
pub trait DockerfileConverter: Send + Sync {
    async fn convert(
        &self,
        cancel: &CancellationToken,
        dockerfile: &[u8],
        opt: DockerfileConvertOpt,
    ) -> Result<(BuildState, serde_json::Value)>;
}

/// Builds a target's saved image into a docker-save tarball at `out_file`
/// and returns the image ID recorded in the tarball.
#[async_trait]
pub trait DockerTarBuilder: Send + Sync {
    async fn build_docker_tar(
        &self,
        cancel: &CancellationToken,
        mts: &MultiTargetStates,
        tag: &str,
        out_file: &Path,
    ) -> Result<String>;
}

/// Materializes a target's artifact into `out_dir` on the host.
#[async_trait]
pub trait ArtifactExporter: Send + Sync {
    async fn export_artifact(
        &self,
        cancel: &CancellationToken,
        mts: &MultiTargetStates,
        artifact: &Artifact,
        out_dir: &Path,
    ) -> Result<()>;
}

/// Applies the commands of the converter's target, in source order. This
/// is the seam to the recipe parser: the parser driver walks the parsed
/// recipe and invokes converter operations.
#[async_trait]
pub trait RecipeDriver: Send + Sync {
    async fn drive(&self, converter: &mut Converter) -> Result<()>;
}
