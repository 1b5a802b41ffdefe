//! The target converter state machine.
//!
//! A [`Converter`] walks one target's commands and accumulates build
//! states into its [`SingleTargetStates`]: side effects, exported
//! artifacts, deferred image/local saves and the push-time RUN chain.
//! References to other targets (`FROM +t`, `COPY +t/art`, `BUILD +t`)
//! recurse through [`convert_target`], which memoizes occurrences in
//! [`VisitedStates`] and detects cycles through the `ongoing` flag.

use crate::cleanup::CleanupCollection;
use crate::convert::dedup::{cache_key, BuildArgInput, TargetInput};
use crate::convert::image::{HealthConfig, Image};
use crate::convert::mount::parse_mounts;
use crate::convert::shell::{
    with_dockerd_wrap, with_shell_and_env_vars, ShellWrapFn, DEBUGGER_PATH,
    DEBUGGER_SETTINGS_SECRET_ID, RUN_HELPER_DIR,
};
use crate::convert::states::{
    MultiTargetStates, RunPush, SaveImage, SaveLocal, SharedStates, SingleTargetStates,
    SolveCache, VisitedStates,
};
use crate::convert::variables::{
    add_env, parse_key_value, Collection, ProcessNonConstantVariable, Variable,
};
use crate::domain::{Artifact, Target};
use crate::error::{ForgeError, Result};
use crate::resolve::{
    ArtifactExporter, BuildContextData, DockerTarBuilder, DockerfileConvertOpt,
    DockerfileConverter, ImageMetaResolver, RecipeDriver, ResolveImageOpt, Resolver,
    DOCKERFILE_META_TARGET,
};
use crate::state::{
    copy_op, BuildState, ExecOpts, ImageResolveMode, Mount, Platform, SecurityMode,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Name of the local context backing `--mount type=cache`.
const CACHE_CONTEXT_NAME: &str = "forge-cache";

/// Options of one top-level or recursive conversion.
#[derive(Clone)]
pub struct ConvertOpt {
    pub resolver: Arc<dyn Resolver>,
    pub meta_resolver: Arc<dyn ImageMetaResolver>,
    pub dockerfile_converter: Arc<dyn DockerfileConverter>,
    pub docker_builder: Arc<dyn DockerTarBuilder>,
    pub artifact_exporter: Arc<dyn ArtifactExporter>,
    pub driver: Arc<dyn RecipeDriver>,
    pub clean_collection: Arc<CleanupCollection>,
    pub visited: Arc<VisitedStates>,
    pub solve_cache: Arc<SolveCache>,
    pub var_collection: Collection,
    pub image_resolve_mode: ImageResolveMode,
    pub platform: Platform,
    pub cancel: CancellationToken,
}

/// Converts one target: memoization check, build-context resolution,
/// Converter construction, command application through the recipe driver,
/// finalize. The returned states are read-only.
#[instrument(skip_all, fields(target = %target))]
pub async fn convert_target(target: Target, opt: ConvertOpt) -> Result<MultiTargetStates> {
    let target_str = target.to_string();
    let overriding = overriding_inputs(&opt.var_collection);
    if let Some(states) = opt.visited.find_match(&target_str, &overriding)? {
        debug!(target = %target_str, "reusing previously converted target");
        return Ok(MultiTargetStates { final_states: states, visited: opt.visited.clone() });
    }
    if opt.cancel.is_cancelled() {
        return Err(ForgeError::Cancelled);
    }
    let bc = opt.resolver.resolve(&opt.cancel, &target).await?;
    let driver = opt.driver.clone();
    let mut converter = Converter::new(target, bc, opt)?;
    driver.drive(&mut converter).await?;
    Ok(converter.finalize())
}

fn overriding_inputs(collection: &Collection) -> Vec<BuildArgInput> {
    collection
        .sorted_overriding()
        .iter()
        .filter_map(|name| collection.get(name).map(|v| v.build_arg_input(name, "")))
        .collect()
}

/// Options of one RUN command.
#[derive(Debug, Clone)]
pub struct RunOpts {
    pub args: Vec<String>,
    pub mounts: Vec<String>,
    pub secrets: Vec<String>,
    pub privileged: bool,
    pub with_entrypoint: bool,
    pub with_docker: bool,
    pub with_shell: bool,
    pub push: bool,
    pub with_ssh: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            mounts: Vec::new(),
            secrets: Vec::new(),
            privileged: false,
            with_entrypoint: false,
            with_docker: false,
            with_shell: true,
            push: false,
            with_ssh: false,
        }
    }
}

/// Turns recipe commands into build-graph states for a single target.
pub struct Converter {
    pub(crate) sts: SharedStates,
    pub(crate) visited: Arc<VisitedStates>,
    pub(crate) direct_deps: Vec<SharedStates>,
    pub(crate) build_context: BuildState,
    pub(crate) cache_context: BuildState,
    pub(crate) var_collection: Collection,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) meta_resolver: Arc<dyn ImageMetaResolver>,
    pub(crate) dockerfile_converter: Arc<dyn DockerfileConverter>,
    pub(crate) docker_builder: Arc<dyn DockerTarBuilder>,
    pub(crate) artifact_exporter: Arc<dyn ArtifactExporter>,
    pub(crate) driver: Arc<dyn RecipeDriver>,
    pub(crate) clean_collection: Arc<CleanupCollection>,
    pub(crate) solve_cache: Arc<SolveCache>,
    pub(crate) image_resolve_mode: ImageResolveMode,
    pub(crate) platform: Platform,
    pub(crate) cancel: CancellationToken,
    pub(crate) next_arg_index: i32,
}

impl Converter {
    /// Constructs a converter for `target`, registering its states in the
    /// visited registry with `ongoing` set.
    pub(crate) fn new(target: Target, bc: BuildContextData, opt: ConvertOpt) -> Result<Self> {
        let mut target_input = TargetInput::new(target.string_canonical());
        let mut captured_overrides = Vec::new();
        for name in opt.var_collection.sorted_overriding() {
            if let Some(variable) = opt.var_collection.get(&name) {
                let input = variable.build_arg_input(&name, "");
                captured_overrides.push(input.clone());
                target_input = target_input.with_build_arg_input(input);
            }
        }
        let sts = SingleTargetStates {
            target: target.clone(),
            target_input,
            side_effects_state: BuildState::scratch(&opt.platform),
            side_effects_image: Image::new(),
            artifacts_state: BuildState::scratch(&opt.platform),
            separate_artifacts_states: Vec::new(),
            save_locals: Vec::new(),
            save_images: Vec::new(),
            run_push: RunPush::default(),
            local_dirs: bc.local_dirs,
            salt: Uuid::new_v4().simple().to_string(),
            ongoing: true,
            overriding_inputs: captured_overrides,
        };
        let sts = Arc::new(Mutex::new(sts));
        opt.visited.register(&target.to_string(), sts.clone());
        let cache_context = make_cache_context(&target, &opt.platform);
        let var_collection = opt.var_collection.with_builtin_build_args(
            &target,
            bc.git_metadata.as_ref(),
            &opt.platform,
        );
        Ok(Self {
            sts,
            visited: opt.visited,
            direct_deps: Vec::new(),
            build_context: bc.build_context,
            cache_context,
            var_collection,
            resolver: opt.resolver,
            meta_resolver: opt.meta_resolver,
            dockerfile_converter: opt.dockerfile_converter,
            docker_builder: opt.docker_builder,
            artifact_exporter: opt.artifact_exporter,
            driver: opt.driver,
            clean_collection: opt.clean_collection,
            solve_cache: opt.solve_cache,
            image_resolve_mode: opt.image_resolve_mode,
            platform: opt.platform,
            cancel: opt.cancel,
            next_arg_index: 0,
        })
    }

    /// The target this converter is building.
    pub fn target(&self) -> Target {
        self.sts().target.clone()
    }

    /// Applies FROM. A reference containing `+` is a target-based FROM;
    /// anything else is a classical image reference.
    pub async fn from(&mut self, image_name: &str, build_args: &[String]) -> Result<()> {
        if image_name.contains('+') {
            return self.from_target(image_name, build_args).await;
        }
        if !build_args.is_empty() {
            return Err(ForgeError::InvalidArgs {
                command: "FROM".to_string(),
                reason: "--build-arg is not supported with a classical FROM".to_string(),
            });
        }
        self.from_classical(image_name).await
    }

    async fn from_classical(&mut self, image_name: &str) -> Result<()> {
        debug!(image = image_name, "applying FROM");
        let label = format!("{}FROM {}", self.vertex_prefix(), image_name);
        let (state, img, new_collection) = self.internal_from_classical(image_name, label).await?;
        {
            let mut sts = self.sts();
            sts.side_effects_state = state;
            sts.side_effects_image = img;
        }
        self.var_collection = new_collection;
        Ok(())
    }

    async fn from_target(&mut self, target_name: &str, build_args: &[String]) -> Result<()> {
        info!(from_target = target_name, build_args = ?build_args, "applying FROM target");
        let mut dep_target = Target::parse(target_name)?;
        let mts = self.build(target_name, build_args).await?;
        if dep_target.is_local_internal() {
            dep_target.local_path = self.sts().target.local_path.clone();
        }
        let (save_image, dep_local_dirs) = {
            let dep = mts.final_states.lock().expect("states mutex poisoned");
            let save_image = dep
                .last_save_image()
                .cloned()
                .ok_or_else(|| ForgeError::MissingSaveImage { target: dep_target.to_string() })?;
            (save_image, dep.local_dirs.clone())
        };
        {
            let mut sts = self.sts();
            sts.side_effects_state = save_image.state.clone();
            for (name, dir) in dep_local_dirs {
                sts.local_dirs.insert(name, dir);
            }
            sts.side_effects_image = save_image.image.clone();
        }
        for kv in &save_image.image.config.env {
            let (key, value) = parse_key_value(kv);
            self.var_collection.add_active(&key, Variable::ConstantEnv(value), true);
        }
        Ok(())
    }

    /// Applies FROM DOCKERFILE: bases the target on a Dockerfile build,
    /// sourced either from another target's artifact or from the host.
    pub async fn from_dockerfile(
        &mut self,
        context_path: &str,
        df_path: &str,
        df_target: &str,
        build_args: &[String],
    ) -> Result<()> {
        debug!(context = context_path, df_target, "applying FROM DOCKERFILE");
        if !df_path.is_empty() {
            return Err(ForgeError::Unsupported { feature: "FROM DOCKERFILE -f".to_string() });
        }
        let (df_file, build_context) = if context_path.contains('+') {
            // Dockerfile and build context come from a target's artifact.
            let context_artifact = Artifact::parse(context_path)?;
            let mts = self.build(&context_artifact.target.to_string(), build_args).await?;
            let artifact_dir = self.solve_artifact(&mts, &context_artifact).await?;
            let df_file = artifact_dir.join("Dockerfile");
            let artifacts_state =
                mts.final_states.lock().expect("states mutex poisoned").artifacts_state.clone();
            let scratch = BuildState::scratch(&self.platform);
            let build_context = copy_op(
                &artifacts_state,
                &[context_artifact.artifact.clone()],
                &scratch,
                "/",
                true,
                true,
                None,
                format!(
                    "[internal] FROM DOCKERFILE (copy build context from) {}{}",
                    join_wrap(build_args, "(", " ", ") "),
                    context_artifact
                ),
            );
            (df_file, build_context)
        } else {
            // Dockerfile and build context come from the host.
            let mut context_path = context_path.to_string();
            if context_path != "."
                && !context_path.starts_with("./")
                && !context_path.starts_with("../")
                && !context_path.starts_with('/')
            {
                context_path = format!("./{}", context_path);
            }
            let meta_target = Target {
                project_path: String::new(),
                tag: String::new(),
                local_path: context_path,
                name: DOCKERFILE_META_TARGET.to_string(),
            };
            let current = self.sts().target.clone();
            let meta_target = Target::join(&current, &meta_target)?;
            let data = self.resolver.resolve(&self.cancel, &meta_target).await?;
            {
                let mut sts = self.sts();
                for (name, dir) in &data.local_dirs {
                    sts.local_dirs.insert(name.clone(), dir.clone());
                }
            }
            (data.build_file_path.clone(), data.build_context)
        };
        let df_data = std::fs::read(&df_file).map_err(|e| ForgeError::io(&df_file, e))?;
        let base_collection = self.var_collection.clone();
        let new_collection = {
            let mut process = |name: &str, expr: &str| self.process_non_constant_build_arg(name, expr);
            let process: ProcessNonConstantVariable<'_> = &mut process;
            base_collection.with_parse_build_args(build_args, Some(process))?
        };
        let current_str = self.sts().target.to_string();
        let (state, image_value) = self
            .dockerfile_converter
            .convert(
                &self.cancel,
                &df_data,
                DockerfileConvertOpt {
                    build_context,
                    context_local_name: current_str.clone(),
                    target: df_target.to_string(),
                    build_args: new_collection.as_map(),
                    platform: self.platform.clone(),
                    resolve_mode: self.image_resolve_mode,
                },
            )
            .await?;
        // The frontend's image type differs structurally; mapping through
        // JSON also normalizes absent maps.
        let img: Image = serde_json::from_value(image_value).map_err(|e| {
            ForgeError::BuildFailed {
                target: current_str,
                reason: format!("invalid dockerfile image metadata: {}", e),
            }
        })?;
        let (state, img, new_collection) = self.apply_from_image(state, img);
        {
            let mut sts = self.sts();
            sts.side_effects_state = state;
            sts.side_effects_image = img;
        }
        self.var_collection = new_collection;
        Ok(())
    }

    /// Applies COPY of another target's artifact.
    pub async fn copy_artifact(
        &mut self,
        artifact_name: &str,
        dest: &str,
        build_args: &[String],
        is_dir: bool,
        chown: Option<&str>,
    ) -> Result<()> {
        debug!(src_artifact = artifact_name, dest, build_args = ?build_args, dir = is_dir, "applying COPY (artifact)");
        let mut artifact = Artifact::parse(artifact_name)?;
        let mts = self.build(&artifact.target.to_string(), build_args).await?;
        if artifact.target.is_local_internal() {
            artifact.target.local_path = self.sts().target.local_path.clone();
        }
        let artifacts_state =
            mts.final_states.lock().expect("states mutex poisoned").artifacts_state.clone();
        let prefix = self.vertex_prefix();
        let mut sts = self.sts();
        sts.side_effects_state = copy_op(
            &artifacts_state,
            &[artifact.artifact.clone()],
            &sts.side_effects_state,
            dest,
            true,
            is_dir,
            chown.map(str::to_string),
            format!(
                "{}COPY {}{}{} {}",
                prefix,
                str_if(is_dir, "--dir "),
                join_wrap(build_args, "(", " ", ") "),
                artifact,
                dest
            ),
        );
        Ok(())
    }

    /// Applies COPY from the target's build context.
    pub fn copy_classical(&mut self, srcs: &[String], dest: &str, is_dir: bool, chown: Option<&str>) {
        debug!(srcs = ?srcs, dest, dir = is_dir, "applying COPY (classical)");
        let prefix = self.vertex_prefix();
        let mut sts = self.sts();
        sts.side_effects_state = copy_op(
            &self.build_context,
            srcs,
            &sts.side_effects_state,
            dest,
            true,
            is_dir,
            chown.map(str::to_string),
            format!("{}COPY {}{} {}", prefix, str_if(is_dir, "--dir "), srcs.join(" "), dest),
        );
    }

    /// Applies RUN.
    pub fn run(&mut self, opts: RunOpts) -> Result<()> {
        if opts.with_docker {
            warn!("RUN --with-docker is deprecated, use WITH DOCKER ... RUN ... END instead");
        }
        debug!(
            args = ?opts.args,
            mounts = ?opts.mounts,
            secrets = ?opts.secrets,
            privileged = opts.privileged,
            push = opts.push,
            "applying RUN"
        );
        let target_input = self.sts().target_input.clone();
        let mounts = parse_mounts(&opts.mounts, &target_input, &self.cache_context)?;
        let mut final_args = opts.args.clone();
        let mut with_shell = opts.with_shell;
        if opts.with_entrypoint {
            let sts = self.sts();
            let mut args = opts.args.clone();
            if args.is_empty() {
                // No args provided; use the image's CMD.
                args = sts.side_effects_image.config.cmd.clone();
            }
            final_args =
                sts.side_effects_image.config.entrypoint.iter().cloned().chain(args).collect();
            // Don't use the shell when --entrypoint is passed.
            with_shell = false;
        }
        let security =
            if opts.privileged { SecurityMode::Insecure } else { SecurityMode::Sandbox };
        let run_str = format!(
            "RUN {}{}{}{}{}",
            str_if(opts.privileged, "--privileged "),
            str_if(opts.with_docker, "--with-docker "),
            str_if(opts.with_entrypoint, "--entrypoint "),
            str_if(opts.push, "--push "),
            final_args.join(" ")
        );
        let shell_wrap: ShellWrapFn =
            if opts.with_docker { with_dockerd_wrap } else { with_shell_and_env_vars };
        let label = format!("{}{}", self.vertex_prefix(), run_str);
        self.internal_run(
            &final_args,
            &opts.secrets,
            with_shell,
            shell_wrap,
            opts.push,
            opts.with_ssh,
            &run_str,
            mounts,
            security,
            None,
            label,
        )
    }

    /// Applies SAVE ARTIFACT.
    pub fn save_artifact(
        &mut self,
        save_from: &str,
        save_to: &str,
        save_as_local_to: Option<&str>,
    ) -> Result<()> {
        debug!(save_from, save_to, save_as_local_to = ?save_as_local_to, "applying SAVE ARTIFACT");
        let prefix = self.vertex_prefix();
        let platform = self.platform.clone();
        let mut sts = self.sts();
        let mut save_to_adjusted = save_to.to_string();
        if save_to.is_empty() || save_to == "." || save_to.ends_with('/') {
            let abs_from = sts.side_effects_state.abs(save_from);
            save_to_adjusted = pjoin(save_to, &base_name(&abs_from));
        }
        let (save_to_dir, save_to_file) = split_wildcards(&save_to_adjusted);
        let artifact_path = if save_to_file.is_empty() {
            save_to_adjusted.clone()
        } else {
            save_to_adjusted = format!("{}/", save_to_dir);
            pjoin(&save_to_adjusted, &save_to_file)
        };
        let artifact =
            Artifact { target: sts.target.clone(), artifact: artifact_path.clone() };
        sts.artifacts_state = copy_op(
            &sts.side_effects_state,
            &[save_from.to_string()],
            &sts.artifacts_state,
            &save_to_adjusted,
            true,
            true,
            None,
            format!("{}SAVE ARTIFACT {} {}", prefix, save_from, artifact),
        );
        if let Some(local_to) = save_as_local_to {
            let separate = copy_op(
                &sts.side_effects_state,
                &[save_from.to_string()],
                &BuildState::scratch(&platform),
                &save_to_adjusted,
                true,
                false,
                None,
                format!(
                    "{}SAVE ARTIFACT {} {} AS LOCAL {}",
                    prefix, save_from, artifact, local_to
                ),
            );
            sts.separate_artifacts_states.push(separate);
            let index = sts.separate_artifacts_states.len() - 1;
            sts.save_locals.push(SaveLocal {
                dest_path: local_to.to_string(),
                artifact_path,
                index,
            });
        }
        Ok(())
    }

    /// Applies SAVE IMAGE. An empty name list yields an unexported save
    /// that remains referenceable from other targets.
    pub fn save_image(&mut self, image_names: &[String], push: bool) {
        debug!(images = ?image_names, push, "applying SAVE IMAGE");
        let names: Vec<String> =
            if image_names.is_empty() { vec![String::new()] } else { image_names.to_vec() };
        let mut sts = self.sts();
        for name in names {
            let entry = SaveImage {
                state: sts.side_effects_state.clone(),
                image: sts.side_effects_image.clone(),
                docker_tag: name,
                push,
            };
            sts.save_images.push(entry);
        }
    }

    /// Applies BUILD: converts the referenced target (recursively, with
    /// memoization) under the given overriding build args and records it
    /// as a direct dependency.
    pub async fn build(
        &mut self,
        full_target_name: &str,
        build_args: &[String],
    ) -> Result<MultiTargetStates> {
        info!(target = full_target_name, build_args = ?build_args, "applying BUILD");
        if self.cancel.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }
        let rel_target = Target::parse(full_target_name)?;
        let current = self.sts().target.clone();
        let target = Target::join(&current, &rel_target)?;
        // Overriding variables never cross project boundaries.
        let base_collection =
            if rel_target.is_external() { Collection::new() } else { self.var_collection.clone() };
        let new_collection = {
            let mut process = |name: &str, expr: &str| self.process_non_constant_build_arg(name, expr);
            let process: ProcessNonConstantVariable<'_> = &mut process;
            base_collection.with_parse_build_args(build_args, Some(process))?
        };
        let opt = ConvertOpt {
            resolver: self.resolver.clone(),
            meta_resolver: self.meta_resolver.clone(),
            dockerfile_converter: self.dockerfile_converter.clone(),
            docker_builder: self.docker_builder.clone(),
            artifact_exporter: self.artifact_exporter.clone(),
            driver: self.driver.clone(),
            clean_collection: self.clean_collection.clone(),
            visited: self.visited.clone(),
            solve_cache: self.solve_cache.clone(),
            var_collection: new_collection,
            image_resolve_mode: self.image_resolve_mode,
            platform: self.platform.clone(),
            cancel: self.cancel.clone(),
        };
        let mts = convert_target(target, opt).await?;
        {
            let mut sts = self.sts();
            let dep = mts.final_states.lock().expect("states mutex poisoned");
            for (name, dir) in &dep.local_dirs {
                sts.local_dirs.insert(name.clone(), dir.clone());
            }
        }
        self.direct_deps.push(mts.final_states.clone());
        Ok(mts)
    }

    /// Applies WORKDIR.
    pub fn workdir(&mut self, workdir_path: &str) {
        debug!(workdir = workdir_path, "applying WORKDIR");
        let prefix = self.vertex_prefix();
        let mut sts = self.sts();
        sts.side_effects_state = sts.side_effects_state.clone().with_dir(workdir_path);
        let workdir_abs = if workdir_path.starts_with('/') {
            crate::domain::clean_path(workdir_path)
        } else {
            let current_dir = &sts.side_effects_image.config.working_dir;
            let base = if current_dir.is_empty() {
                "/".to_string()
            } else if current_dir.starts_with('/') {
                current_dir.clone()
            } else {
                format!("/{}", current_dir)
            };
            crate::state::abs_path(&base, workdir_path)
        };
        sts.side_effects_image.config.working_dir = workdir_abs.clone();
        if workdir_abs != "/" {
            let user = &sts.side_effects_image.config.user;
            let user = if user.is_empty() { None } else { Some(user.clone()) };
            sts.side_effects_state = sts.side_effects_state.mkdir(
                &workdir_abs,
                0o755,
                true,
                user,
                format!("{}WORKDIR {}", prefix, workdir_path),
            );
        }
    }

    /// Applies USER.
    pub fn user(&mut self, user: &str) {
        debug!(user, "applying USER");
        let mut sts = self.sts();
        sts.side_effects_state = sts.side_effects_state.clone().with_user(user);
        sts.side_effects_image.config.user = user.to_string();
    }

    /// Applies CMD.
    pub fn cmd(&mut self, cmd_args: &[String], with_shell: bool) {
        debug!(cmd = ?cmd_args, "applying CMD");
        self.sts().side_effects_image.config.cmd = shell_form(cmd_args, with_shell);
    }

    /// Applies ENTRYPOINT.
    pub fn entrypoint(&mut self, entrypoint_args: &[String], with_shell: bool) {
        debug!(entrypoint = ?entrypoint_args, "applying ENTRYPOINT");
        self.sts().side_effects_image.config.entrypoint = shell_form(entrypoint_args, with_shell);
    }

    /// Applies EXPOSE.
    pub fn expose(&mut self, ports: &[String]) {
        debug!(ports = ?ports, "applying EXPOSE");
        let mut sts = self.sts();
        for port in ports {
            sts.side_effects_image.config.exposed_ports.insert(port.clone(), Default::default());
        }
    }

    /// Applies VOLUME.
    pub fn volume(&mut self, volumes: &[String]) {
        debug!(volumes = ?volumes, "applying VOLUME");
        let mut sts = self.sts();
        for volume in volumes {
            sts.side_effects_image.config.volumes.insert(volume.clone(), Default::default());
        }
    }

    /// Applies ENV: the binding becomes active, lands in the state
    /// metadata and in the image config.
    pub fn env(&mut self, key: &str, value: &str) {
        debug!(env_key = key, env_value = value, "applying ENV");
        self.var_collection.add_active(key, Variable::ConstantEnv(value.to_string()), true);
        let mut sts = self.sts();
        sts.side_effects_state = sts.side_effects_state.clone().with_env(key, value);
        add_env(&mut sts.side_effects_image.config.env, key, value);
    }

    /// Applies ARG. The declaration is a no-op when the caller already
    /// overrides the name; either way the effective binding extends the
    /// target's dedup input.
    pub fn arg(&mut self, key: &str, default_value: &str) {
        debug!(arg_key = key, arg_default = default_value, "applying ARG");
        let effective =
            self.var_collection.add_active(key, Variable::Constant(default_value.to_string()), false);
        let mut sts = self.sts();
        sts.target_input = std::mem::take(&mut sts.target_input)
            .with_build_arg_input(effective.build_arg_input(key, default_value));
    }

    /// Applies LABEL.
    pub fn label(&mut self, labels: HashMap<String, String>) {
        debug!(labels = ?labels, "applying LABEL");
        let mut sts = self.sts();
        for (key, value) in labels {
            sts.side_effects_image.config.labels.insert(key, value);
        }
    }

    /// Applies HEALTHCHECK.
    pub fn healthcheck(
        &mut self,
        is_none: bool,
        cmd_args: &[String],
        interval: Duration,
        timeout: Duration,
        start_period: Duration,
        retries: i32,
    ) {
        debug!(is_none, cmd = ?cmd_args, "applying HEALTHCHECK");
        let mut hc = HealthConfig::default();
        if is_none {
            hc.test = vec!["NONE".to_string()];
        } else {
            hc.test = vec!["CMD-SHELL".to_string(), cmd_args.join(" ")];
            hc.interval = interval.as_nanos() as i64;
            hc.timeout = timeout.as_nanos() as i64;
            hc.start_period = start_period.as_nanos() as i64;
            hc.retries = retries;
        }
        self.sts().side_effects_image.config.healthcheck = Some(hc);
    }

    /// Applies GIT CLONE: materializes a checkout (`.git` preserved) and
    /// copies it into the side-effects state.
    pub fn git_clone(&mut self, git_url: &str, branch: &str, dest: &str) {
        debug!(git_url, branch, dest, "applying GIT CLONE");
        let git_state = BuildState::git(
            git_url,
            branch,
            true,
            format!(
                "{}GIT CLONE (--branch {}) {}",
                self.vertex_prefix_with_url(git_url),
                branch,
                git_url
            ),
        );
        let prefix = self.vertex_prefix();
        let mut sts = self.sts();
        sts.side_effects_state = copy_op(
            &git_state,
            &[".".to_string()],
            &sts.side_effects_state,
            dest,
            false,
            false,
            None,
            format!("{}COPY GIT CLONE (--branch {}) {} TO {}", prefix, branch, git_url, dest),
        );
    }

    /// Expands build args in the provided word.
    pub fn expand_args(&self, word: &str) -> String {
        self.var_collection.expand(word)
    }

    /// Finalizes the conversion: installs artificial dependencies on all
    /// direct deps (their side effects build even if nothing was copied)
    /// and drops the `ongoing` flag. The states are read-only afterwards.
    pub fn finalize(self) -> MultiTargetStates {
        {
            let mut sts = self.sts.lock().expect("states mutex poisoned");
            for dep in &self.direct_deps {
                let dep_sts = dep.lock().expect("states mutex poisoned");
                let label = format!(
                    "[internal] create artificial dependency: {} depends on {}",
                    sts.target, dep_sts.target
                );
                sts.side_effects_state =
                    sts.side_effects_state.with_dependency(&dep_sts.side_effects_state, label);
            }
            sts.ongoing = false;
        }
        MultiTargetStates { final_states: self.sts, visited: self.visited }
    }

    pub(crate) fn sts(&self) -> MutexGuard<'_, SingleTargetStates> {
        self.sts.lock().expect("states mutex poisoned")
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn internal_run(
        &mut self,
        args: &[String],
        secret_key_values: &[String],
        with_shell: bool,
        shell_wrap: ShellWrapFn,
        push: bool,
        with_ssh: bool,
        command_str: &str,
        mut mounts: Vec<Mount>,
        security: SecurityMode,
        working_dir: Option<String>,
        label: String,
    ) -> Result<()> {
        let mut extra_env: Vec<String> = Vec::new();
        // Secrets.
        for secret_kv in secret_key_values {
            let (env_var, secret_ref) = secret_kv.split_once('=').ok_or_else(|| {
                ForgeError::InvalidSecret {
                    definition: secret_kv.clone(),
                    reason: "expected ENV=+secrets/NAME".to_string(),
                }
            })?;
            let secret_id = secret_ref.strip_prefix("+secrets/").ok_or_else(|| {
                ForgeError::InvalidSecret {
                    definition: secret_kv.clone(),
                    reason: "secret reference must start with +secrets/".to_string(),
                }
            })?;
            let secret_path = format!("/run/secrets/{}", secret_id);
            mounts.push(Mount::Secret {
                target: secret_path.clone(),
                id: secret_id.to_string(),
                mode: 0o444,
            });
            extra_env.push(format!("{}=\"$(cat {})\"", env_var, secret_path));
        }
        // Build args.
        for name in self.var_collection.sorted_active() {
            let Some(variable) = self.var_collection.get(&name) else { continue };
            if variable.is_env_var() {
                continue;
            }
            match variable {
                Variable::Derived { state, .. } => {
                    let build_arg_path = format!("/run/buildargs/{}", name);
                    mounts.push(Mount::State {
                        target: build_arg_path.clone(),
                        source: state.clone(),
                        source_path: build_arg_path.clone(),
                        readonly: true,
                    });
                    extra_env.push(format!("{}=\"$(cat {})\"", name, build_arg_path));
                }
                _ => {
                    let value = variable.constant_value().unwrap_or_default();
                    extra_env.push(format!("{}=\"{}\"", name, value));
                }
            }
        }
        // Debugger and run-helper plumbing.
        mounts.push(Mount::Secret {
            target: format!("/run/secrets/{}", DEBUGGER_SETTINGS_SECRET_ID),
            id: DEBUGGER_SETTINGS_SECRET_ID.to_string(),
            mode: 0o444,
        });
        mounts.push(Mount::HostBind {
            target: DEBUGGER_PATH.to_string(),
            source_path: DEBUGGER_PATH.to_string(),
        });
        mounts.push(Mount::HostBind {
            target: RUN_HELPER_DIR.to_string(),
            source_path: RUN_HELPER_DIR.to_string(),
        });
        if with_ssh {
            mounts.push(Mount::SshSocket);
        }
        let final_args = shell_wrap(args, &extra_env, with_shell, true);
        let mut sts = self.sts();
        if push {
            // Push-flagged commands run only after the main build and are
            // never cached. The chain forks from the side-effects state at
            // the first push command.
            let base = match sts.run_push.state.take() {
                Some(state) => state,
                None => sts.side_effects_state.clone(),
            };
            let exec = base.run(ExecOpts {
                args: final_args,
                mounts,
                security,
                ignore_cache: true,
                working_dir,
                label,
            });
            sts.run_push.state = Some(exec.root());
            sts.run_push.command_strs.push(command_str.to_string());
        } else {
            let exec = sts.side_effects_state.run(ExecOpts {
                args: final_args,
                mounts,
                security,
                ignore_cache: false,
                working_dir,
                label,
            });
            sts.side_effects_state = exec.root();
        }
        Ok(())
    }

    pub(crate) async fn internal_from_classical(
        &self,
        image_name: &str,
        label: String,
    ) -> Result<(BuildState, Image, Collection)> {
        if image_name == "scratch" {
            return Ok((
                BuildState::scratch(&self.platform),
                Image::new(),
                self.var_collection.with_reset_env_vars(),
            ));
        }
        let normalized = normalize_image_ref(image_name)?;
        let log_name = format!("{}load metadata", self.image_vertex_prefix(image_name));
        let (digest, config_json) = self
            .meta_resolver
            .resolve_image_config(
                &self.cancel,
                &normalized,
                ResolveImageOpt {
                    platform: self.platform.clone(),
                    resolve_mode: self.image_resolve_mode,
                    log_name,
                },
            )
            .await?;
        let img: Image = serde_json::from_slice(&config_json).map_err(|e| {
            ForgeError::ResolveFailed {
                target: image_name.to_string(),
                reason: format!("invalid image config: {}", e),
            }
        })?;
        let reference =
            if digest.is_empty() { normalized } else { format!("{}@{}", normalized, digest) };
        let state = BuildState::image(&reference, self.image_resolve_mode, label);
        let (state, img, new_collection) = self.apply_from_image(state, img);
        Ok((state, img, new_collection))
    }

    /// Replays an image's config into the state and variable collection:
    /// env vars reset and re-seeded from the image, working dir and user
    /// applied. Entry point, cmd and the rest live on in the config alone.
    pub(crate) fn apply_from_image(
        &self,
        mut state: BuildState,
        img: Image,
    ) -> (BuildState, Image, Collection) {
        let mut new_collection = self.var_collection.with_reset_env_vars();
        for env_var in &img.config.env {
            let (key, value) = parse_key_value(env_var);
            new_collection.add_active(&key, Variable::ConstantEnv(value.clone()), true);
            state = state.with_env(&key, &value);
        }
        if !img.config.working_dir.is_empty() {
            state = state.with_dir(&img.config.working_dir);
        }
        if !img.config.user.is_empty() {
            state = state.with_user(&img.config.user);
        }
        (state, img, new_collection)
    }

    /// Evaluates a non-constant build-arg expression with an in-target RUN
    /// and isolates the result into its own state.
    pub(crate) fn process_non_constant_build_arg(
        &mut self,
        name: &str,
        expression: &str,
    ) -> Result<(BuildState, TargetInput, i32)> {
        let src_build_arg_dir = "/run/buildargs-src";
        let src_build_arg_path = format!("{}/{}", src_build_arg_dir, name);
        {
            let mut sts = self.sts();
            sts.side_effects_state = sts.side_effects_state.mkdir(
                src_build_arg_dir,
                0o755,
                true,
                None,
                format!("[internal] mkdir {}", src_build_arg_dir),
            );
        }
        let build_arg_path = format!("/run/buildargs/{}", name);
        let args: Vec<String> = format!("echo \"{}\" >{}", expression, src_build_arg_path)
            .split(' ')
            .map(str::to_string)
            .collect();
        let label = format!("{}RUN {}", self.vertex_prefix(), expression);
        self.internal_run(
            &args,
            &[],
            true,
            with_shell_and_env_vars,
            false,
            false,
            expression,
            Vec::new(),
            SecurityMode::Sandbox,
            None,
            label,
        )?;
        let arg_index = self.next_arg_index;
        self.next_arg_index += 1;
        let scratch = BuildState::scratch(&self.platform);
        let mut sts = self.sts();
        let build_arg_state = copy_op(
            &sts.side_effects_state,
            &[src_build_arg_path.clone()],
            &scratch,
            &build_arg_path,
            false,
            false,
            None,
            format!("[internal] copy buildarg {}", name),
        );
        // Remove the intermediary file from the side-effects state.
        sts.side_effects_state = sts.side_effects_state.rm(
            &src_build_arg_path,
            true,
            format!("[internal] rm {}", src_build_arg_path),
        );
        let target_input = sts.target_input.clone();
        Ok((build_arg_state, target_input, arg_index))
    }

    pub(crate) async fn solve_artifact(
        &self,
        mts: &MultiTargetStates,
        artifact: &Artifact,
    ) -> Result<PathBuf> {
        let out_dir = tempfile::Builder::new()
            .prefix("forge-solve-artifact")
            .tempdir()
            .map_err(|e| ForgeError::io(std::env::temp_dir(), e))?
            .into_path();
        let cleanup_dir = out_dir.clone();
        self.clean_collection.add(move || std::fs::remove_dir_all(&cleanup_dir));
        self.artifact_exporter.export_artifact(&self.cancel, mts, artifact, &out_dir).await?;
        Ok(out_dir)
    }

    pub(crate) fn vertex_prefix(&self) -> String {
        let sts = self.sts();
        format!("[{} {}] ", sts.target, sts.salt)
    }

    pub(crate) fn image_vertex_prefix(&self, id: &str) -> String {
        format!("[{} {}] ", id, short_hash(id))
    }

    pub(crate) fn vertex_prefix_with_url(&self, url: &str) -> String {
        format!("[{}({}) {}] ", self.sts().target, url, url)
    }
}

fn make_cache_context(target: &Target, platform: &Platform) -> BuildState {
    let session_id = cache_key(target);
    BuildState::local(
        CACHE_CONTEXT_NAME,
        &target.project_canonical(),
        &session_id,
        platform,
        format!("[internal] cache context {}", target.project_canonical()),
    )
}

fn shell_form(args: &[String], with_shell: bool) -> Vec<String> {
    if with_shell && !args.is_empty() {
        vec!["/bin/sh".to_string(), "-c".to_string(), args.join(" ")]
    } else {
        args.to_vec()
    }
}

/// Normalizes a docker-style image reference: bare names gain
/// `docker.io/library/`, single-org names gain `docker.io/`, and a
/// missing tag defaults to `latest` unless a digest pins the image.
pub(crate) fn normalize_image_ref(name: &str) -> Result<String> {
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(ForgeError::InvalidReference {
            reference: name.to_string(),
            reason: "malformed image reference".to_string(),
        });
    }
    let (rest, digest) = match name.split_once('@') {
        Some((rest, digest)) => (rest, Some(digest)),
        None => (name, None),
    };
    let last_slash = rest.rfind('/');
    let (repo, tag) = match rest.rfind(':') {
        Some(idx) if last_slash.map_or(true, |slash| idx > slash) => {
            (&rest[..idx], Some(&rest[idx + 1..]))
        }
        _ => (rest, None),
    };
    if repo.is_empty() || tag.is_some_and(str::is_empty) {
        return Err(ForgeError::InvalidReference {
            reference: name.to_string(),
            reason: "malformed image reference".to_string(),
        });
    }
    let first = repo.split('/').next().unwrap_or(repo);
    let mut out = if !repo.contains('/') {
        format!("docker.io/library/{}", repo)
    } else if first == "localhost" || first.contains('.') || first.contains(':') {
        repo.to_string()
    } else {
        format!("docker.io/{}", repo)
    };
    match (tag, digest) {
        (Some(tag), _) => {
            out.push(':');
            out.push_str(tag);
        }
        (None, None) => out.push_str(":latest"),
        (None, Some(_)) => {}
    }
    if let Some(digest) = digest {
        out.push('@');
        out.push_str(digest);
    }
    Ok(out)
}

fn short_hash(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    format!("{:x}", digest)[..8].to_string()
}

/// Joins POSIX path segments without preserving a relative marker
/// (`pjoin(".", "x")` is `x`).
pub(crate) fn pjoin(a: &str, b: &str) -> String {
    let joined = if a.is_empty() { b.to_string() } else { format!("{}/{}", a, b) };
    let cleaned = crate::domain::clean_path(&joined);
    cleaned.strip_prefix("./").map(str::to_string).unwrap_or(cleaned)
}

pub(crate) fn base_name(path: &str) -> String {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path).to_string()
}

/// Splits a path at the first wildcard-bearing component. Without
/// wildcards the whole path is the directory part.
pub(crate) fn split_wildcards(name: &str) -> (String, String) {
    let Some(idx) = name.find(['*', '?', '[']) else {
        return (name.to_string(), String::new());
    };
    match name[..idx].rfind('/') {
        Some(slash) => (name[..slash].to_string(), name[slash + 1..].to_string()),
        None => (String::new(), name.to_string()),
    }
}

pub(crate) fn str_if(condition: bool, s: &str) -> &str {
    if condition {
        s
    } else {
        ""
    }
}

pub(crate) fn join_wrap(items: &[String], before: &str, sep: &str, after: &str) -> String {
    if items.is_empty() {
        String::new()
    } else {
        format!("{}{}{}", before, items.join(sep), after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_image_ref() {
        assert_eq!(normalize_image_ref("alpine").unwrap(), "docker.io/library/alpine:latest");
        assert_eq!(normalize_image_ref("alpine:3.13").unwrap(), "docker.io/library/alpine:3.13");
        assert_eq!(normalize_image_ref("org/app:v1").unwrap(), "docker.io/org/app:v1");
        assert_eq!(
            normalize_image_ref("localhost:5000/app").unwrap(),
            "localhost:5000/app:latest"
        );
        assert_eq!(
            normalize_image_ref("ghcr.io/org/app").unwrap(),
            "ghcr.io/org/app:latest"
        );
        assert_eq!(
            normalize_image_ref("alpine@sha256:abcd").unwrap(),
            "docker.io/library/alpine@sha256:abcd"
        );
        assert!(normalize_image_ref("").is_err());
        assert!(normalize_image_ref("bad ref").is_err());
    }

    #[test]
    fn test_split_wildcards() {
        assert_eq!(split_wildcards("out/app"), ("out/app".to_string(), String::new()));
        assert_eq!(split_wildcards("out/*.txt"), ("out".to_string(), "*.txt".to_string()));
        assert_eq!(split_wildcards("*.txt"), (String::new(), "*.txt".to_string()));
        assert_eq!(split_wildcards("a/b?/c"), ("a".to_string(), "b?/c".to_string()));
    }

    #[test]
    fn test_pjoin() {
        assert_eq!(pjoin("", "x"), "x");
        assert_eq!(pjoin(".", "x"), "x");
        assert_eq!(pjoin("out/", "x"), "out/x");
        assert_eq!(pjoin("out", "x"), "out/x");
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/out/app"), "app");
        assert_eq!(base_name("/out/dir/"), "dir");
        assert_eq!(base_name("app"), "app");
    }

    #[test]
    fn test_shell_form() {
        let args = vec!["echo".to_string(), "hi".to_string()];
        assert_eq!(
            shell_form(&args, true),
            vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()]
        );
        assert_eq!(shell_form(&args, false), args);
    }

    #[test]
    fn test_join_wrap() {
        assert_eq!(join_wrap(&[], "(", " ", ") "), "");
        assert_eq!(
            join_wrap(&["a=1".to_string(), "b=2".to_string()], "(", " ", ") "),
            "(a=1 b=2) "
        );
    }
}
