//! End-to-end conversion scenarios, driven through a table-based recipe
//! driver and stub collaborators.

use async_trait::async_trait;
use forge_core::cleanup::CleanupCollection;
use forge_core::convert::{
    convert_target, BuildArgInput, BuildArgInputKind, Collection, ConvertOpt, Converter,
    MultiTargetStates, RunOpts, SolveCache, TargetInput, VisitedStates,
};
use forge_core::domain::{Artifact, Target};
use forge_core::resolve::{
    ArtifactExporter, BuildContextData, DockerTarBuilder, DockerfileConvertOpt,
    DockerfileConverter, ImageMetaResolver, RecipeDriver, ResolveImageOpt, Resolver,
};
use forge_core::state::{BuildState, ImageResolveMode, Mount, OpKind, Platform};
use forge_core::{ForgeError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const ALPINE_CONFIG: &[u8] = br#"{
    "architecture": "amd64",
    "os": "linux",
    "config": {"Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"]}
}"#;

#[derive(Clone)]
enum Cmd {
    From(String, Vec<String>),
    Run(Vec<String>),
    RunPush(Vec<String>),
    RunSecret(Vec<String>, Vec<String>),
    SaveImage(Vec<String>, bool),
    SaveArtifact(String, String, Option<String>),
    CopyArt(String, String),
    Build(String, Vec<String>),
    Arg(String, String),
    Env(String, String),
    AssertExpand(String, String),
}

struct RecipeBook {
    targets: HashMap<String, Vec<Cmd>>,
}

#[async_trait]
impl RecipeDriver for RecipeBook {
    async fn drive(&self, conv: &mut Converter) -> Result<()> {
        let name = conv.target().name;
        let cmds = self.targets.get(&name).cloned().unwrap_or_default();
        for cmd in cmds {
            match cmd {
                Cmd::From(image, args) => conv.from(&image, &args).await?,
                Cmd::Run(args) => conv.run(RunOpts { args, ..RunOpts::default() })?,
                Cmd::RunPush(args) => {
                    conv.run(RunOpts { args, push: true, ..RunOpts::default() })?
                }
                Cmd::RunSecret(args, secrets) => {
                    conv.run(RunOpts { args, secrets, ..RunOpts::default() })?
                }
                Cmd::SaveImage(names, push) => conv.save_image(&names, push),
                Cmd::SaveArtifact(from, to, local) => {
                    conv.save_artifact(&from, &to, local.as_deref())?
                }
                Cmd::CopyArt(artifact, dest) => {
                    conv.copy_artifact(&artifact, &dest, &[], false, None).await?
                }
                Cmd::Build(target, args) => {
                    conv.build(&target, &args).await?;
                }
                Cmd::Arg(key, default) => conv.arg(&key, &default),
                Cmd::Env(key, value) => conv.env(&key, &value),
                Cmd::AssertExpand(word, expected) => {
                    assert_eq!(conv.expand_args(&word), expected, "expanding {}", word)
                }
            }
        }
        Ok(())
    }
}

struct StubResolver {
    /// Local dirs handed out per target name.
    local_dirs: HashMap<String, BTreeMap<String, String>>,
    calls: Mutex<Vec<String>>,
}

impl StubResolver {
    fn new() -> Self {
        Self { local_dirs: HashMap::new(), calls: Mutex::new(Vec::new()) }
    }

    fn with_local_dirs(mut self, target_name: &str, dirs: &[(&str, &str)]) -> Self {
        self.local_dirs.insert(
            target_name.to_string(),
            dirs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        );
        self
    }

    fn resolve_count(&self, target_str: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| t.as_str() == target_str).count()
    }
}

#[async_trait]
impl Resolver for StubResolver {
    async fn resolve(
        &self,
        _cancel: &CancellationToken,
        target: &Target,
    ) -> Result<BuildContextData> {
        self.calls.lock().unwrap().push(target.to_string());
        Ok(BuildContextData {
            build_context: BuildState::local(
                &format!("context:{}", target),
                &target.project_canonical(),
                "context-session",
                &Platform::host(),
                format!("[context] {}", target),
            ),
            build_file_path: PathBuf::from("Forgefile"),
            local_dirs: self.local_dirs.get(&target.name).cloned().unwrap_or_default(),
            git_metadata: None,
        })
    }
}

struct StubMetaResolver;

#[async_trait]
impl ImageMetaResolver for StubMetaResolver {
    async fn resolve_image_config(
        &self,
        _cancel: &CancellationToken,
        _reference: &str,
        _opt: ResolveImageOpt,
    ) -> Result<(String, Vec<u8>)> {
        Ok((String::new(), ALPINE_CONFIG.to_vec()))
    }
}

struct StubDockerfileConverter;

#[async_trait]
impl DockerfileConverter for StubDockerfileConverter {
    async fn convert(
        &self,
        _cancel: &CancellationToken,
        _dockerfile: &[u8],
        opt: DockerfileConvertOpt,
    ) -> Result<(BuildState, serde_json::Value)> {
        Ok((opt.build_context, serde_json::json!({ "config": {} })))
    }
}

struct StubDockerBuilder;

#[async_trait]
impl DockerTarBuilder for StubDockerBuilder {
    async fn build_docker_tar(
        &self,
        _cancel: &CancellationToken,
        _mts: &MultiTargetStates,
        _tag: &str,
        _out_file: &Path,
    ) -> Result<String> {
        Ok("deadbeef".to_string())
    }
}

struct StubArtifactExporter;

#[async_trait]
impl ArtifactExporter for StubArtifactExporter {
    async fn export_artifact(
        &self,
        _cancel: &CancellationToken,
        _mts: &MultiTargetStates,
        _artifact: &Artifact,
        _out_dir: &Path,
    ) -> Result<()> {
        Ok(())
    }
}

fn book(entries: Vec<(&str, Vec<Cmd>)>) -> RecipeBook {
    RecipeBook {
        targets: entries.into_iter().map(|(name, cmds)| (name.to_string(), cmds)).collect(),
    }
}

fn s(items: &[&str]) -> Vec<String> {
    items.iter().map(|i| i.to_string()).collect()
}

fn make_opt(book: RecipeBook, resolver: Arc<StubResolver>, vars: Collection) -> ConvertOpt {
    ConvertOpt {
        resolver,
        meta_resolver: Arc::new(StubMetaResolver),
        dockerfile_converter: Arc::new(StubDockerfileConverter),
        docker_builder: Arc::new(StubDockerBuilder),
        artifact_exporter: Arc::new(StubArtifactExporter),
        driver: Arc::new(book),
        clean_collection: Arc::new(CleanupCollection::new()),
        visited: Arc::new(VisitedStates::new()),
        solve_cache: Arc::new(SolveCache::new()),
        var_collection: vars,
        image_resolve_mode: ImageResolveMode::Default,
        platform: Platform::host(),
        cancel: CancellationToken::new(),
    }
}

/// The image reference at the root of a state chain.
fn root_image_ref(state: &BuildState) -> Option<String> {
    match &state.op().kind {
        OpKind::Image { reference, .. } => Some(reference.clone()),
        OpKind::Exec { base, .. }
        | OpKind::Mkdir { base, .. }
        | OpKind::Rm { base, .. }
        | OpKind::Copy { base, .. }
        | OpKind::Dependency { base, .. } => root_image_ref(base),
        OpKind::MountOutput { exec, .. } => root_image_ref(exec),
        _ => None,
    }
}

/// Exec labels and their ignore-cache flags, root-first.
fn exec_entries(state: &BuildState, out: &mut Vec<(String, bool)>) {
    match &state.op().kind {
        OpKind::Exec { base, ignore_cache, .. } => {
            exec_entries(base, out);
            out.push((state.op().label.clone(), *ignore_cache));
        }
        OpKind::Mkdir { base, .. }
        | OpKind::Rm { base, .. }
        | OpKind::Copy { base, .. }
        | OpKind::Dependency { base, .. } => exec_entries(base, out),
        OpKind::MountOutput { exec, .. } => exec_entries(exec, out),
        _ => {}
    }
}

fn exec_labels(state: &BuildState) -> Vec<String> {
    let mut entries = Vec::new();
    exec_entries(state, &mut entries);
    entries.into_iter().map(|(label, _)| label).collect()
}

/// Artificial-dependency targets of a state chain, root-first.
fn dependency_edges(state: &BuildState, out: &mut Vec<BuildState>) {
    match &state.op().kind {
        OpKind::Dependency { base, dep } => {
            dependency_edges(base, out);
            out.push(dep.clone());
        }
        OpKind::Exec { base, .. }
        | OpKind::Mkdir { base, .. }
        | OpKind::Rm { base, .. }
        | OpKind::Copy { base, .. } => dependency_edges(base, out),
        OpKind::MountOutput { exec, .. } => dependency_edges(exec, out),
        _ => {}
    }
}

/// Base state of the exec op whose label contains `needle`.
fn exec_base(state: &BuildState, needle: &str) -> Option<BuildState> {
    match &state.op().kind {
        OpKind::Exec { base, .. } => {
            if state.op().label.contains(needle) {
                Some(base.clone())
            } else {
                exec_base(base, needle)
            }
        }
        OpKind::Mkdir { base, .. }
        | OpKind::Rm { base, .. }
        | OpKind::Copy { base, .. }
        | OpKind::Dependency { base, .. } => exec_base(base, needle),
        OpKind::MountOutput { exec, .. } => exec_base(exec, needle),
        _ => None,
    }
}

#[tokio::test]
async fn test_hello_world() {
    let recipes = book(vec![(
        "hello",
        vec![
            Cmd::From("alpine:3.13".to_string(), Vec::new()),
            Cmd::Run(s(&["echo", "hi"])),
            Cmd::SaveImage(s(&["myapp:latest"]), false),
        ],
    )]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    let mts = convert_target(Target::parse("+hello").unwrap(), opt).await.unwrap();

    let sts = mts.final_states.lock().unwrap();
    assert!(!sts.ongoing);
    assert_eq!(sts.save_images.len(), 1);
    assert_eq!(sts.save_images[0].docker_tag, "myapp:latest");
    assert!(!sts.save_images[0].push);
    assert_eq!(
        root_image_ref(&sts.side_effects_state).as_deref(),
        Some("docker.io/library/alpine:3.13")
    );
    let labels = exec_labels(&sts.side_effects_state);
    assert_eq!(labels.len(), 1);
    assert!(labels[0].contains("RUN echo hi"));
    assert_eq!(sts.target_input, TargetInput::new("+hello"));
    assert!(sts.local_dirs.is_empty());
    assert!(!sts.run_push.initialized());
}

#[tokio::test]
async fn test_cross_target_artifact_memoized() {
    let recipes = book(vec![
        (
            "lib",
            vec![
                Cmd::From("alpine".to_string(), Vec::new()),
                Cmd::Run(s(&["touch", "/out/x"])),
                Cmd::SaveArtifact("/out/x".to_string(), String::new(), None),
            ],
        ),
        (
            "app",
            vec![
                Cmd::From("alpine".to_string(), Vec::new()),
                Cmd::CopyArt("+lib/x".to_string(), "/x".to_string()),
                Cmd::CopyArt("+lib/x".to_string(), "/x2".to_string()),
            ],
        ),
    ]);
    let resolver =
        Arc::new(StubResolver::new().with_local_dirs("lib", &[("src-lib", "/host/lib")]));
    let opt = make_opt(recipes, resolver.clone(), Collection::new());
    let mts = convert_target(Target::parse("+app").unwrap(), opt).await.unwrap();

    // The second COPY reuses the memoized states: one conversion of +lib.
    assert_eq!(resolver.resolve_count("+lib"), 1);
    assert_eq!(mts.visited.states_for("+lib").len(), 1);

    let sts = mts.final_states.lock().unwrap();
    // Both direct deps appear as artificial-dependency parents.
    let mut deps = Vec::new();
    dependency_edges(&sts.side_effects_state, &mut deps);
    assert_eq!(deps.len(), 2);
    assert!(deps[0].same_node(&deps[1]));
    // Local dirs of the dep propagate into the caller.
    assert_eq!(sts.local_dirs.get("src-lib").map(String::as_str), Some("/host/lib"));
}

#[tokio::test]
async fn test_build_arg_override_separates_occurrences() {
    let recipes = book(vec![
        (
            "parent",
            vec![
                Cmd::Build("+child".to_string(), s(&["VER=2"])),
                Cmd::Build("+child".to_string(), Vec::new()),
            ],
        ),
        (
            "child",
            vec![Cmd::Arg("VER".to_string(), "1".to_string()), Cmd::Run(s(&["echo", "$VER"]))],
        ),
    ]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    let mts = convert_target(Target::parse("+parent").unwrap(), opt).await.unwrap();

    let children = mts.visited.states_for("+child");
    assert_eq!(children.len(), 2);

    let overridden = BuildArgInput {
        name: "VER".to_string(),
        default_value: String::new(),
        kind: BuildArgInputKind::Constant("2".to_string()),
    };
    let inputs: Vec<TargetInput> = children
        .iter()
        .map(|sts| sts.lock().unwrap().target_input.clone())
        .collect();
    let with_override = inputs
        .iter()
        .find(|ti| ti.build_args.first() == Some(&overridden))
        .expect("overridden occurrence recorded");
    // The ARG declaration resolves to the overriding value.
    assert_eq!(
        with_override.build_args[1].kind,
        BuildArgInputKind::Constant("2".to_string())
    );
    let without_override = inputs
        .iter()
        .find(|ti| ti.build_args.first() != Some(&overridden))
        .expect("default occurrence recorded");
    assert_eq!(
        without_override.build_args,
        vec![BuildArgInput {
            name: "VER".to_string(),
            default_value: "1".to_string(),
            kind: BuildArgInputKind::Constant("1".to_string()),
        }]
    );
    assert_ne!(with_override.hash(), without_override.hash());
}

#[tokio::test]
async fn test_external_target_does_not_inherit_overrides() {
    let recipes = book(vec![
        ("main", vec![Cmd::Build("./other+ext".to_string(), Vec::new())]),
        ("ext", vec![Cmd::Run(s(&["echo", "hi"]))]),
    ]);
    let resolver = Arc::new(StubResolver::new());
    let vars = Collection::new().with_parse_build_args(&s(&["GLOBAL=x"]), None).unwrap();
    let opt = make_opt(recipes, resolver, vars);
    let mts = convert_target(Target::parse("+main").unwrap(), opt).await.unwrap();

    // The caller's own identity records the override...
    let main_sts = mts.final_states.lock().unwrap();
    assert!(main_sts.target_input.build_args.iter().any(|a| a.name == "GLOBAL"));
    drop(main_sts);

    // ...but it never crosses the project boundary.
    let ext_states = mts.visited.states_for("./other+ext");
    assert_eq!(ext_states.len(), 1);
    let ext = ext_states[0].lock().unwrap();
    assert!(ext.target_input.build_args.is_empty());
}

#[tokio::test]
async fn test_push_commands_reorder_after_build() {
    let recipes = book(vec![(
        "pusher",
        vec![
            Cmd::From("alpine".to_string(), Vec::new()),
            Cmd::Run(s(&["a"])),
            Cmd::RunPush(s(&["b"])),
            Cmd::Run(s(&["c"])),
            Cmd::RunPush(s(&["d"])),
        ],
    )]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    let mts = convert_target(Target::parse("+pusher").unwrap(), opt).await.unwrap();

    let sts = mts.final_states.lock().unwrap();
    // The main chain holds only the non-push commands.
    let side_labels = exec_labels(&sts.side_effects_state);
    assert_eq!(side_labels.len(), 2);
    assert!(side_labels[0].contains("RUN a"));
    assert!(side_labels[1].contains("RUN c"));

    // The push chain holds the push commands, cache disabled.
    let push_state = sts.run_push.state.as_ref().expect("push chain initialized");
    let mut push_entries = Vec::new();
    exec_entries(push_state, &mut push_entries);
    assert_eq!(push_entries.len(), 2);
    assert!(push_entries[0].0.contains("RUN --push b"));
    assert!(push_entries[1].0.contains("RUN --push d"));
    assert!(push_entries.iter().all(|(_, ignore_cache)| *ignore_cache));
    assert_eq!(sts.run_push.command_strs, vec!["RUN --push b", "RUN --push d"]);

    // The push chain forked from the side-effects state at the first push
    // command: right after `a`, not after `c`.
    let after_a = exec_base(&sts.side_effects_state, "RUN c").unwrap();
    let push_fork = exec_base(push_state, "RUN --push b").unwrap();
    assert!(push_fork.same_node(&after_a));
}

#[tokio::test]
async fn test_cycle_is_detected() {
    let recipes = book(vec![
        ("x", vec![Cmd::From("+y".to_string(), Vec::new())]),
        ("y", vec![Cmd::From("+x".to_string(), Vec::new())]),
    ]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    let err = convert_target(Target::parse("+x").unwrap(), opt).await.unwrap_err();
    assert!(matches!(err, ForgeError::Cycle { target } if target == "+x"));
}

#[tokio::test]
async fn test_from_target_requires_save_image() {
    let recipes = book(vec![
        ("nosave", vec![Cmd::Run(s(&["echo", "hi"]))]),
        ("consumer", vec![Cmd::From("+nosave".to_string(), Vec::new())]),
    ]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    let err = convert_target(Target::parse("+consumer").unwrap(), opt).await.unwrap_err();
    assert!(matches!(err, ForgeError::MissingSaveImage { target } if target == "+nosave"));
}

#[tokio::test]
async fn test_from_target_merges_image_env() {
    let recipes = book(vec![
        (
            "base",
            vec![
                Cmd::From("alpine".to_string(), Vec::new()),
                Cmd::Env("LIB_VERSION".to_string(), "7".to_string()),
                // An unnamed save: not exported, but referenceable.
                Cmd::SaveImage(Vec::new(), false),
            ],
        ),
        (
            "consumer",
            vec![
                Cmd::From("+base".to_string(), Vec::new()),
                Cmd::AssertExpand("$LIB_VERSION".to_string(), "7".to_string()),
            ],
        ),
    ]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    let mts = convert_target(Target::parse("+consumer").unwrap(), opt).await.unwrap();
    let base_states = mts.visited.states_for("+base");
    assert_eq!(base_states.len(), 1);
    let base = base_states[0].lock().unwrap();
    assert_eq!(base.save_images.len(), 1);
    assert_eq!(base.save_images[0].docker_tag, "");
}

#[tokio::test]
async fn test_from_scratch_resets_env_but_keeps_args() {
    let recipes = book(vec![(
        "resetter",
        vec![
            Cmd::From("alpine".to_string(), Vec::new()),
            Cmd::Arg("FOO".to_string(), "1".to_string()),
            Cmd::Env("BAR".to_string(), "2".to_string()),
            Cmd::AssertExpand("$BAR".to_string(), "2".to_string()),
            Cmd::From("scratch".to_string(), Vec::new()),
            Cmd::AssertExpand("$FOO".to_string(), "1".to_string()),
            Cmd::AssertExpand("$BAR".to_string(), String::new()),
        ],
    )]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    convert_target(Target::parse("+resetter").unwrap(), opt).await.unwrap();
}

#[tokio::test]
async fn test_save_local_indexes_separate_states() {
    let recipes = book(vec![(
        "lib",
        vec![
            Cmd::From("alpine".to_string(), Vec::new()),
            Cmd::Run(s(&["touch", "/out/x"])),
            Cmd::SaveArtifact("/out/x".to_string(), String::new(), Some("./out-x".to_string())),
        ],
    )]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    let mts = convert_target(Target::parse("+lib").unwrap(), opt).await.unwrap();

    let sts = mts.final_states.lock().unwrap();
    assert_eq!(sts.separate_artifacts_states.len(), 1);
    assert_eq!(sts.save_locals.len(), 1);
    let save_local = &sts.save_locals[0];
    assert_eq!(save_local.dest_path, "./out-x");
    assert_eq!(save_local.artifact_path, "x");
    assert!(save_local.index < sts.separate_artifacts_states.len());
}

#[tokio::test]
async fn test_secret_injection() {
    let recipes = book(vec![(
        "secretive",
        vec![
            Cmd::From("alpine".to_string(), Vec::new()),
            Cmd::RunSecret(s(&["deploy"]), s(&["TOKEN=+secrets/tok"])),
        ],
    )]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    let mts = convert_target(Target::parse("+secretive").unwrap(), opt).await.unwrap();

    let sts = mts.final_states.lock().unwrap();
    let OpKind::Exec { args, mounts, .. } = &sts.side_effects_state.op().kind else {
        panic!("expected exec at the head of the chain");
    };
    assert!(mounts.iter().any(
        |m| matches!(m, Mount::Secret { target, id, .. } if target == "/run/secrets/tok" && id == "tok")
    ));
    let script = args.last().unwrap();
    assert!(script.contains("TOKEN=\"$(cat /run/secrets/tok)\""));
}

#[tokio::test]
async fn test_malformed_secret_is_rejected() {
    let recipes = book(vec![(
        "bad",
        vec![
            Cmd::From("alpine".to_string(), Vec::new()),
            Cmd::RunSecret(s(&["deploy"]), s(&["TOKEN=oops"])),
        ],
    )]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    let err = convert_target(Target::parse("+bad").unwrap(), opt).await.unwrap_err();
    assert!(matches!(err, ForgeError::InvalidSecret { .. }));
}

#[tokio::test]
async fn test_classical_from_rejects_build_args() {
    let recipes = book(vec![(
        "bad",
        vec![Cmd::From("alpine".to_string(), s(&["VER=2"]))],
    )]);
    let resolver = Arc::new(StubResolver::new());
    let opt = make_opt(recipes, resolver, Collection::new());
    let err = convert_target(Target::parse("+bad").unwrap(), opt).await.unwrap_err();
    assert!(matches!(err, ForgeError::InvalidArgs { .. }));
}

#[tokio::test]
async fn test_cancellation_propagates() {
    let recipes = book(vec![("main", vec![Cmd::Build("+dep".to_string(), Vec::new())])]);
    let resolver = Arc::new(StubResolver::new());
    let mut opt = make_opt(recipes, resolver, Collection::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    opt.cancel = cancel;
    let err = convert_target(Target::parse("+main").unwrap(), opt).await.unwrap_err();
    assert!(matches!(err, ForgeError::Cancelled));
}
