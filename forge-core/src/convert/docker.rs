//! Docker-in-build support.
//!
//! `WITH DOCKER ... RUN ... END` pre-loads pulled and locally-built images
//! into `/var/lib/docker` and then executes the wrapped RUN under the
//! dockerd wrapper. An image is loaded by building it into a docker-save
//! tarball, exposing the tarball as a local context, and running
//! `docker load` with `/var/lib/docker` carried forward as a mount so the
//! loaded image persists in the side-effects state.

use crate::convert::converter::{str_if, Converter};
use crate::convert::mount::parse_mounts;
use crate::convert::shell::with_dockerd_wrap;
use crate::convert::states::{MultiTargetStates, SingleTargetStates};
use crate::domain::Target;
use crate::error::{ForgeError, Result};
use crate::state::{BuildState, ExecOpts, Mount, SecurityMode};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One image to build and load before a WITH DOCKER RUN.
#[derive(Debug, Clone)]
pub struct DockerLoadOpt {
    pub target: String,
    pub image_name: String,
    pub build_args: Vec<String>,
}

/// Options of a WITH DOCKER ... RUN ... END clause.
#[derive(Debug, Clone, Default)]
pub struct WithDockerOpt {
    pub mounts: Vec<String>,
    pub secrets: Vec<String>,
    pub with_ssh: bool,
    pub loads: Vec<DockerLoadOpt>,
    pub pulls: Vec<String>,
}

impl Converter {
    /// Applies an entire WITH DOCKER ... RUN ... END clause.
    pub async fn with_docker_run(&mut self, args: &[String], opt: WithDockerOpt) -> Result<()> {
        debug!(args = ?args, loads = opt.loads.len(), pulls = opt.pulls.len(), "applying WITH DOCKER RUN");
        for pull in &opt.pulls {
            self.docker_pull_into(pull).await?;
        }
        for load in &opt.loads {
            self.docker_load_into(&load.target, &load.image_name, &load.build_args).await?;
        }
        let target_input = self.sts().target_input.clone();
        let mounts = parse_mounts(&opt.mounts, &target_input, &self.cache_context)?;
        let run_str = format!(
            "WITH DOCKER RUN {}{}",
            str_if(opt.with_ssh, "--ssh "),
            args.join(" ")
        );
        let label = format!("{}{}", self.vertex_prefix(), run_str);
        self.internal_run(
            args,
            &opt.secrets,
            true,
            with_dockerd_wrap,
            false,
            opt.with_ssh,
            &run_str,
            mounts,
            SecurityMode::Insecure,
            None,
            label,
        )
    }

    /// Applies the deprecated DOCKER LOAD command (outside WITH DOCKER).
    pub async fn docker_load_old(
        &mut self,
        target_name: &str,
        docker_tag: &str,
        build_args: &[String],
    ) -> Result<()> {
        warn!("DOCKER LOAD outside of WITH DOCKER is deprecated");
        debug!(target = target_name, docker_tag, "applying DOCKER LOAD");
        self.docker_load_into(target_name, docker_tag, build_args).await
    }

    /// Applies the deprecated DOCKER PULL command (outside WITH DOCKER).
    pub async fn docker_pull_old(&mut self, docker_tag: &str) -> Result<()> {
        warn!("DOCKER PULL outside of WITH DOCKER is deprecated");
        debug!(docker_tag, "applying DOCKER PULL");
        self.docker_pull_into(docker_tag).await
    }

    async fn docker_load_into(
        &mut self,
        target_name: &str,
        docker_tag: &str,
        build_args: &[String],
    ) -> Result<()> {
        let dep_target = Target::parse(target_name)?;
        let mts = self.build(target_name, build_args).await?;
        let label = format!("{}DOCKER LOAD {} {}", self.vertex_prefix(), dep_target, docker_tag);
        self.solve_and_load(&mts, &dep_target.to_string(), docker_tag, label).await
    }

    async fn docker_pull_into(&mut self, docker_tag: &str) -> Result<()> {
        let label = format!("{}DOCKER PULL {}", self.vertex_prefix(), docker_tag);
        let (state, image, _) = self.internal_from_classical(docker_tag, label).await?;
        let synthetic = SingleTargetStates::for_loaded_image(
            self.sts().target.clone(),
            state,
            image,
            docker_tag,
            &self.platform,
        );
        let mts = MultiTargetStates {
            final_states: Arc::new(Mutex::new(synthetic)),
            visited: self.visited.clone(),
        };
        let label = format!("{}DOCKER LOAD (PULL {})", self.vertex_prefix(), docker_tag);
        self.solve_and_load(&mts, docker_tag, docker_tag, label).await
    }

    /// Builds the docker-save tarball for `mts`, exposes it as a local
    /// context keyed by tag and image ID, and loads it into the
    /// side-effects state's `/var/lib/docker`.
    async fn solve_and_load(
        &mut self,
        mts: &MultiTargetStates,
        op_name: &str,
        docker_tag: &str,
        label: String,
    ) -> Result<()> {
        let out_dir = tempfile::Builder::new()
            .prefix("forge-docker-load")
            .tempdir()
            .map_err(|e| ForgeError::io(std::env::temp_dir(), e))?
            .into_path();
        let cleanup_dir = out_dir.clone();
        self.clean_collection.add(move || std::fs::remove_dir_all(&cleanup_dir));
        let out_file = out_dir.join("image.tar");
        let image_id = self
            .docker_builder
            .build_docker_tar(&self.cancel, mts, docker_tag, &out_file)
            .await?;
        // Tag plus image ID identify the tar context; identical inputs
        // reuse the executor's cache across invocations.
        let session_id = {
            let digest = Sha256::digest(format!("{}-{}", docker_tag, image_id).as_bytes());
            format!("{:x}", digest)
        };
        let tar_context = self.solve_cache.get_or_insert_with(&session_id, || {
            BuildState::local(
                op_name,
                op_name,
                &session_id,
                &self.platform,
                format!("[internal] docker tar context {} {}", op_name, session_id),
            )
        });
        let mut sts = self.sts();
        sts.local_dirs.insert(op_name.to_string(), out_dir.to_string_lossy().to_string());
        sts.side_effects_state = sts.side_effects_state.mkdir(
            "/var/lib/docker",
            0o755,
            true,
            None,
            "[internal] mkdir /var/lib/docker".to_string(),
        );
        let exec = sts.side_effects_state.run(ExecOpts {
            args: with_dockerd_wrap(
                &["docker".to_string(), "load".to_string(), "</src/image.tar".to_string()],
                &[],
                true,
                false,
            ),
            mounts: vec![
                Mount::State {
                    target: "/src".to_string(),
                    source: tar_context,
                    source_path: "/".to_string(),
                    readonly: true,
                },
                Mount::State {
                    target: "/var/lib/docker".to_string(),
                    source: sts.side_effects_state.clone(),
                    source_path: "/var/lib/docker".to_string(),
                    readonly: false,
                },
            ],
            security: SecurityMode::Insecure,
            ignore_cache: false,
            working_dir: Some("/src".to_string()),
            label,
        });
        sts.side_effects_state = exec.mount_output("/var/lib/docker");
        Ok(())
    }
}
