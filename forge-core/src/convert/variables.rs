//! Scoped build-argument and environment-variable collection.
//!
//! A collection holds two visibility tiers: *active* bindings are visible
//! to command expansion; *overriding* bindings were supplied by the caller
//! for this target only and participate in its dedup identity. A binding
//! is a constant, a constant that is also exported to the image env, or a
//! derived value produced by a sub-build at execution time.

use crate::convert::dedup::{BuildArgInput, BuildArgInputKind, TargetInput};
use crate::domain::Target;
use crate::error::{ForgeError, Result};
use crate::resolve::GitMetadata;
use crate::state::{BuildState, Platform};
use std::collections::{BTreeMap, HashMap};

/// One variable binding.
#[derive(Debug, Clone)]
pub enum Variable {
    /// Literal value.
    Constant(String),
    /// Literal value, also exported to the image env.
    ConstantEnv(String),
    /// Value produced by a build state at execution time; the state holds
    /// the value at a known path.
    Derived { state: BuildState, source: Box<TargetInput>, index: i32 },
}

impl Variable {
    pub fn is_env_var(&self) -> bool {
        matches!(self, Variable::ConstantEnv(_))
    }

    pub fn is_constant(&self) -> bool {
        !matches!(self, Variable::Derived { .. })
    }

    pub fn constant_value(&self) -> Option<&str> {
        match self {
            Variable::Constant(v) | Variable::ConstantEnv(v) => Some(v),
            Variable::Derived { .. } => None,
        }
    }

    /// The dedup representation of this binding.
    pub fn build_arg_input(&self, name: &str, default_value: &str) -> BuildArgInput {
        let kind = match self {
            Variable::Constant(v) | Variable::ConstantEnv(v) => {
                BuildArgInputKind::Constant(v.clone())
            }
            Variable::Derived { source, index, .. } => {
                BuildArgInputKind::Derived { source: source.clone(), index: *index }
            }
        };
        BuildArgInput {
            name: name.to_string(),
            default_value: default_value.to_string(),
            kind,
        }
    }
}

/// Processor invoked for build-arg values that cannot be resolved to a
/// constant; returns the state holding the value, the identity of its
/// source, and a stable argument index.
pub type ProcessNonConstantVariable<'a> =
    &'a mut dyn FnMut(&str, &str) -> Result<(BuildState, TargetInput, i32)>;

/// Ordered store of variable bindings with active/overriding tiers.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    active: HashMap<String, Variable>,
    overriding: HashMap<String, Variable>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an active binding. With `override_ok` false, an existing
    /// overriding binding of the same name wins. Returns the effective
    /// binding.
    pub fn add_active(&mut self, name: &str, variable: Variable, override_ok: bool) -> Variable {
        let effective = if override_ok {
            variable
        } else {
            match self.overriding.get(name) {
                Some(overriding) => overriding.clone(),
                None => variable,
            }
        };
        self.active.insert(name.to_string(), effective.clone());
        effective
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.active.get(name)
    }

    /// Active binding names, lexicographic.
    pub fn sorted_active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.keys().cloned().collect();
        names.sort();
        names
    }

    /// Overriding binding names, lexicographic.
    pub fn sorted_overriding(&self) -> Vec<String> {
        let mut names: Vec<String> = self.overriding.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns a collection extended with the given `K=V` / `K` arguments
    /// as overriding bindings. A `K=V` becomes a constant. A bare `K`
    /// carries through the current active binding; without one, the
    /// non-constant processor is consulted, and failing that the argument
    /// is unresolved.
    pub fn with_parse_build_args(
        &self,
        args: &[String],
        mut process_non_constant: Option<ProcessNonConstantVariable<'_>>,
    ) -> Result<Collection> {
        let mut ret = self.clone();
        for arg in args {
            let (name, variable) = match arg.split_once('=') {
                Some((name, value)) => (name, Variable::Constant(value.to_string())),
                None => {
                    let name = arg.as_str();
                    match ret.active.get(name) {
                        Some(existing) => (name, existing.clone()),
                        None => match process_non_constant.as_mut() {
                            Some(process) => {
                                let (state, source, index) = process(name, name)?;
                                let variable = Variable::Derived {
                                    state,
                                    source: Box::new(source),
                                    index,
                                };
                                (name, variable)
                            }
                            None => {
                                return Err(ForgeError::UnresolvedArg { name: name.to_string() })
                            }
                        },
                    }
                }
            };
            ret.overriding.insert(name.to_string(), variable.clone());
            ret.active.insert(name.to_string(), variable);
        }
        Ok(ret)
    }

    /// Returns a collection with env-var bindings dropped; non-env active
    /// bindings and the overriding tier are preserved. Applied on FROM.
    pub fn with_reset_env_vars(&self) -> Collection {
        let mut ret = self.clone();
        ret.active.retain(|_, v| !v.is_env_var());
        ret
    }

    /// Returns a collection seeded with the builtin build args for the
    /// given target. Builtins are active but never overriding.
    pub fn with_builtin_build_args(
        &self,
        target: &Target,
        git_meta: Option<&GitMetadata>,
        platform: &Platform,
    ) -> Collection {
        let mut ret = self.clone();
        let mut builtin = |name: &str, value: String| {
            ret.add_active(name, Variable::Constant(value), true);
        };
        builtin("FORGE_TARGET", target.string_canonical());
        builtin("FORGE_TARGET_PROJECT", target.project_canonical());
        builtin("FORGE_TARGET_NAME", target.name.clone());
        builtin("FORGE_TARGET_TAG", target.tag.clone());
        builtin("FORGE_OS", platform.os.clone());
        builtin("FORGE_ARCH", platform.arch.clone());
        if let Some(git) = git_meta {
            builtin("FORGE_GIT_HASH", git.hash.clone());
            builtin("FORGE_GIT_SHORT_HASH", git.short_hash());
            builtin("FORGE_GIT_BRANCH", git.branch.first().cloned().unwrap_or_default());
            builtin("FORGE_GIT_ORIGIN_URL", git.remote_url.clone());
        }
        ret
    }

    /// Expands `$NAME` and `${NAME}` in `word` from active constant
    /// bindings. Unknown names expand to empty. No shell execution, no
    /// nested expansion.
    pub fn expand(&self, word: &str) -> String {
        let mut out = String::with_capacity(word.len());
        let mut chars = word.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    for c in chars.by_ref() {
                        if c == '}' {
                            break;
                        }
                        name.push(c);
                    }
                    out.push_str(&self.lookup(&name));
                }
                Some(&c0) if c0.is_ascii_alphabetic() || c0 == '_' => {
                    let mut name = String::new();
                    while let Some(&c1) = chars.peek() {
                        if c1.is_ascii_alphanumeric() || c1 == '_' {
                            name.push(c1);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push_str(&self.lookup(&name));
                }
                _ => out.push('$'),
            }
        }
        out
    }

    fn lookup(&self, name: &str) -> String {
        self.active
            .get(name)
            .and_then(|v| v.constant_value())
            .unwrap_or_default()
            .to_string()
    }

    /// Active constant bindings as a plain map (for the external
    /// Dockerfile converter).
    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.active
            .iter()
            .filter_map(|(k, v)| v.constant_value().map(|value| (k.clone(), value.to_string())))
            .collect()
    }
}

/// Splits a `K=V` string. A missing `=` yields an empty value.
pub fn parse_key_value(kv: &str) -> (String, String) {
    match kv.split_once('=') {
        Some((k, v)) => (k.to_string(), v.to_string()),
        None => (kv.to_string(), String::new()),
    }
}

/// Sets `key` in a `K=V` env list, replacing an existing entry.
pub fn add_env(env: &mut Vec<String>, key: &str, value: &str) {
    let entry = format!("{}={}", key, value);
    for existing in env.iter_mut() {
        let (k, _) = parse_key_value(existing);
        if k == key {
            *existing = entry;
            return;
        }
    }
    env.push(entry);
}
