//! Build-state primitives.
//!
//! A [`BuildState`] is a cheap-to-clone handle to an immutable node in a
//! directed acyclic graph of build operations. Converter commands extend
//! states by creating new nodes that reference their inputs; the lower-level
//! executor walks the graph and materializes filesystems. Alongside the op
//! graph each state carries metadata (env, working dir, user, platform)
//! that flows forward into subsequent operations.

use std::sync::Arc;

/// Platform a state is built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// The platform of the running build host.
    pub fn host() -> Self {
        Self { os: std::env::consts::OS.to_string(), arch: std::env::consts::ARCH.to_string() }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

/// How classical image references are resolved against registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageResolveMode {
    #[default]
    Default,
    ForcePull,
    PreferLocal,
}

/// Security mode of an exec operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    #[default]
    Sandbox,
    Insecure,
}

/// A mount attached to an exec operation.
#[derive(Debug, Clone)]
pub enum Mount {
    /// Mount the contents of another state.
    State { target: String, source: BuildState, source_path: String, readonly: bool },
    /// Scratch tmpfs.
    Tmpfs { target: String },
    /// Secret file delivered by the executor session.
    Secret { target: String, id: String, mode: u32 },
    /// Bind-mount from the build host.
    HostBind { target: String, source_path: String },
    /// Forwarded SSH agent socket.
    SshSocket,
}

impl Mount {
    pub fn target(&self) -> &str {
        match self {
            Mount::State { target, .. }
            | Mount::Tmpfs { target }
            | Mount::Secret { target, .. }
            | Mount::HostBind { target, .. } => target,
            Mount::SshSocket => "",
        }
    }
}

/// Options for [`BuildState::run`].
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub args: Vec<String>,
    pub mounts: Vec<Mount>,
    pub security: SecurityMode,
    /// Never reuse a cached result for this op.
    pub ignore_cache: bool,
    /// Overrides the state's working directory for this exec only.
    pub working_dir: Option<String>,
    pub label: String,
}

/// One node in the build graph.
#[derive(Debug)]
pub struct StateNode {
    pub kind: OpKind,
    /// Human-readable vertex label for progress output.
    pub label: String,
}

/// The operation a node performs. Child states are the node's graph inputs.
#[derive(Debug)]
pub enum OpKind {
    /// Empty filesystem.
    Scratch,
    /// Pull of a registry image.
    Image { reference: String, resolve_mode: ImageResolveMode },
    /// Git checkout.
    Git { url: String, branch: String, keep_dir: bool },
    /// Local directory exposed by the executor session.
    Local { name: String, shared_key: String, session_id: String },
    /// Copy from one state into another.
    Copy {
        base: BuildState,
        from: BuildState,
        src_paths: Vec<String>,
        dest_path: String,
        allow_wildcard: bool,
        is_dir: bool,
        chown: Option<String>,
    },
    /// Command execution.
    Exec {
        base: BuildState,
        args: Vec<String>,
        mounts: Vec<Mount>,
        security: SecurityMode,
        ignore_cache: bool,
        working_dir: String,
        env: Vec<(String, String)>,
        user: Option<String>,
    },
    /// The post-exec contents of one mount of an exec op.
    MountOutput { exec: BuildState, target: String },
    /// Directory creation.
    Mkdir { base: BuildState, path: String, mode: u32, parents: bool, user: Option<String> },
    /// File removal.
    Rm { base: BuildState, path: String, allow_missing: bool },
    /// Artificial dependency edge: contents of `base` unchanged, but `dep`
    /// must be built first.
    Dependency { base: BuildState, dep: BuildState },
}

/// Handle to a build-graph node plus forward-flowing metadata.
#[derive(Debug, Clone)]
pub struct BuildState {
    node: Arc<StateNode>,
    env: Vec<(String, String)>,
    cwd: String,
    user: Option<String>,
    platform: Platform,
}

impl BuildState {
    fn new(kind: OpKind, label: String, platform: Platform) -> Self {
        Self {
            node: Arc::new(StateNode { kind, label }),
            env: Vec::new(),
            cwd: "/".to_string(),
            user: None,
            platform,
        }
    }

    /// Derives a new node from this state, keeping metadata.
    fn derive(&self, kind: OpKind, label: String) -> Self {
        Self {
            node: Arc::new(StateNode { kind, label }),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            user: self.user.clone(),
            platform: self.platform.clone(),
        }
    }

    pub fn scratch(platform: &Platform) -> Self {
        Self::new(OpKind::Scratch, String::new(), platform.clone())
    }

    pub fn image(reference: &str, resolve_mode: ImageResolveMode, label: String) -> Self {
        Self::new(
            OpKind::Image { reference: reference.to_string(), resolve_mode },
            label,
            Platform::host(),
        )
    }

    pub fn git(url: &str, branch: &str, keep_dir: bool, label: String) -> Self {
        Self::new(
            OpKind::Git { url: url.to_string(), branch: branch.to_string(), keep_dir },
            label,
            Platform::host(),
        )
    }

    pub fn local(
        name: &str,
        shared_key: &str,
        session_id: &str,
        platform: &Platform,
        label: String,
    ) -> Self {
        Self::new(
            OpKind::Local {
                name: name.to_string(),
                shared_key: shared_key.to_string(),
                session_id: session_id.to_string(),
            },
            label,
            platform.clone(),
        )
    }

    /// Runs a command on top of this state. The returned [`ExecState`]
    /// exposes the root result and per-mount outputs.
    pub fn run(&self, opts: ExecOpts) -> ExecState {
        let working_dir = opts.working_dir.unwrap_or_else(|| self.cwd.clone());
        let node = Arc::new(StateNode {
            kind: OpKind::Exec {
                base: self.clone(),
                args: opts.args,
                mounts: opts.mounts,
                security: opts.security,
                ignore_cache: opts.ignore_cache,
                working_dir,
                env: self.env.clone(),
                user: self.user.clone(),
            },
            label: opts.label,
        });
        ExecState { node, template: self.clone() }
    }

    pub fn mkdir(
        &self,
        path: &str,
        mode: u32,
        parents: bool,
        user: Option<String>,
        label: String,
    ) -> Self {
        self.derive(
            OpKind::Mkdir { base: self.clone(), path: path.to_string(), mode, parents, user },
            label,
        )
    }

    pub fn rm(&self, path: &str, allow_missing: bool, label: String) -> Self {
        self.derive(OpKind::Rm { base: self.clone(), path: path.to_string(), allow_missing }, label)
    }

    /// Adds an environment variable to the state metadata. No graph node is
    /// created; the value flows into subsequent exec ops.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.retain(|(k, _)| k != key);
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.cwd = abs_path(&self.cwd, path);
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn with_platform(mut self, platform: &Platform) -> Self {
        self.platform = platform.clone();
        self
    }

    /// Installs an artificial dependency on `dep`: the contents of the
    /// result are identical to `self`, but building it forces `dep`.
    pub fn with_dependency(&self, dep: &BuildState, label: String) -> Self {
        self.derive(OpKind::Dependency { base: self.clone(), dep: dep.clone() }, label)
    }

    /// Resolves `path` against the state's working directory.
    pub fn abs(&self, path: &str) -> String {
        abs_path(&self.cwd, path)
    }

    pub fn op(&self) -> &StateNode {
        &self.node
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// True if both handles point at the same graph node.
    pub fn same_node(&self, other: &BuildState) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

/// Handle to an exec op before choosing which of its outputs to keep.
#[derive(Debug, Clone)]
pub struct ExecState {
    node: Arc<StateNode>,
    template: BuildState,
}

impl ExecState {
    /// The root filesystem after the exec.
    pub fn root(self) -> BuildState {
        BuildState {
            node: self.node,
            env: self.template.env.clone(),
            cwd: self.template.cwd.clone(),
            user: self.template.user.clone(),
            platform: self.template.platform.clone(),
        }
    }

    /// The post-exec contents of the mount at `target`.
    pub fn mount_output(&self, target: &str) -> BuildState {
        let exec = BuildState {
            node: self.node.clone(),
            env: self.template.env.clone(),
            cwd: self.template.cwd.clone(),
            user: self.template.user.clone(),
            platform: self.template.platform.clone(),
        };
        self.template.derive(
            OpKind::MountOutput { exec, target: target.to_string() },
            format!("[internal] mount output {}", target),
        )
    }
}

/// Copies `src_paths` from `from` into `to` at `dest_path`.
#[allow(clippy::too_many_arguments)]
pub fn copy_op(
    from: &BuildState,
    src_paths: &[String],
    to: &BuildState,
    dest_path: &str,
    allow_wildcard: bool,
    is_dir: bool,
    chown: Option<String>,
    label: String,
) -> BuildState {
    let kind = OpKind::Copy {
        base: to.clone(),
        from: from.clone(),
        src_paths: src_paths.to_vec(),
        dest_path: dest_path.to_string(),
        allow_wildcard,
        is_dir,
        chown,
    };
    to.derive(kind, label)
}

/// Resolves `path` against `cwd`, POSIX-style.
pub(crate) fn abs_path(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        crate::domain::clean_path(path)
    } else {
        crate::domain::clean_path(&format!("{}/{}", cwd, path))
    }
}
