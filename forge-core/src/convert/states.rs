//! Per-target and multi-target state records.
//!
//! A [`SingleTargetStates`] exists per (target × overriding-arg-set)
//! occurrence. It is created at Converter construction, mutated only by
//! that Converter, finalized once, then read-only. [`VisitedStates`]
//! memoizes them by target string across one top-level invocation.

use crate::convert::dedup::{BuildArgInput, TargetInput};
use crate::convert::image::Image;
use crate::domain::Target;
use crate::error::{ForgeError, Result};
use crate::state::{BuildState, Platform};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A pinned image save: the side-effects state and image config at the
/// moment of the SAVE IMAGE, plus the tag and push flag.
#[derive(Debug, Clone)]
pub struct SaveImage {
    pub state: BuildState,
    pub image: Image,
    /// Empty means the image is referenceable but not exported.
    pub docker_tag: String,
    pub push: bool,
}

/// A "save as local" export. `index` selects the matching entry of
/// `SingleTargetStates::separate_artifacts_states`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveLocal {
    pub dest_path: String,
    pub artifact_path: String,
    pub index: usize,
}

/// Deferred chain of push-flagged RUN commands. The state forks from the
/// side-effects state at the first push command and is defined iff at
/// least one push-flagged RUN was applied. It executes only after the
/// main build, and is never cached.
#[derive(Debug, Clone, Default)]
pub struct RunPush {
    pub state: Option<BuildState>,
    pub command_strs: Vec<String>,
}

impl RunPush {
    pub fn initialized(&self) -> bool {
        self.state.is_some()
    }
}

/// States of a single target occurrence.
#[derive(Debug)]
pub struct SingleTargetStates {
    pub target: Target,
    /// Dedup identity: canonical target plus argument bindings.
    pub target_input: TargetInput,
    pub side_effects_state: BuildState,
    pub side_effects_image: Image,
    pub artifacts_state: BuildState,
    pub separate_artifacts_states: Vec<BuildState>,
    pub save_locals: Vec<SaveLocal>,
    pub save_images: Vec<SaveImage>,
    pub run_push: RunPush,
    /// Local-context name to host path; union over this target and its
    /// recursive dependencies.
    pub local_dirs: BTreeMap<String, String>,
    /// Random per-instance tag disambiguating vertex labels of coexisting
    /// occurrences of the same target.
    pub salt: String,
    /// True until finalize. Memoization treats ongoing states as
    /// in-progress; encountering one is a dependency cycle.
    pub ongoing: bool,
    /// Overriding-arg bindings captured at construction; memoization
    /// matches occurrences on these.
    pub(crate) overriding_inputs: Vec<BuildArgInput>,
}

impl SingleTargetStates {
    pub fn last_save_image(&self) -> Option<&SaveImage> {
        self.save_images.last()
    }

    /// A synthetic, already-final occurrence wrapping a pulled image so it
    /// can be fed through docker-load.
    pub(crate) fn for_loaded_image(
        target: Target,
        state: BuildState,
        image: Image,
        docker_tag: &str,
        platform: &Platform,
    ) -> Self {
        Self {
            target_input: TargetInput::new(String::new()),
            side_effects_state: state.clone(),
            side_effects_image: image.clone(),
            artifacts_state: BuildState::scratch(platform),
            separate_artifacts_states: Vec::new(),
            save_locals: Vec::new(),
            save_images: vec![SaveImage {
                state,
                image,
                docker_tag: docker_tag.to_string(),
                push: false,
            }],
            run_push: RunPush::default(),
            local_dirs: BTreeMap::new(),
            salt: Uuid::new_v4().simple().to_string(),
            ongoing: false,
            overriding_inputs: Vec::new(),
            target,
        }
    }
}

/// Shared handle to a target occurrence. Mutated only by its Converter;
/// read-only once `ongoing` drops.
pub type SharedStates = Arc<Mutex<SingleTargetStates>>;

/// The outcome of converting a target, handed to the build executor.
#[derive(Debug, Clone)]
pub struct MultiTargetStates {
    pub final_states: SharedStates,
    pub visited: Arc<VisitedStates>,
}

impl MultiTargetStates {
    /// Target of the final states.
    pub fn final_target(&self) -> Target {
        self.final_states.lock().expect("states mutex poisoned").target.clone()
    }
}

/// Memoization registry of target occurrences, shared by all Converters
/// descending from one top-level invocation.
#[derive(Debug, Default)]
pub struct VisitedStates {
    inner: Mutex<HashMap<String, Vec<SharedStates>>>,
}

impl VisitedStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, target_str: &str, states: SharedStates) {
        self.inner
            .lock()
            .expect("visited mutex poisoned")
            .entry(target_str.to_string())
            .or_default()
            .push(states);
    }

    /// Finds a previous occurrence of `target_str` with the same
    /// overriding-arg bindings. An ongoing match is a dependency cycle.
    pub(crate) fn find_match(
        &self,
        target_str: &str,
        overriding_inputs: &[BuildArgInput],
    ) -> Result<Option<SharedStates>> {
        let inner = self.inner.lock().expect("visited mutex poisoned");
        let Some(candidates) = inner.get(target_str) else { return Ok(None) };
        for candidate in candidates {
            let sts = candidate.lock().expect("states mutex poisoned");
            if sts.overriding_inputs == overriding_inputs {
                if sts.ongoing {
                    return Err(ForgeError::Cycle { target: target_str.to_string() });
                }
                drop(sts);
                return Ok(Some(candidate.clone()));
            }
        }
        Ok(None)
    }

    /// All occurrences recorded for a target string.
    pub fn states_for(&self, target_str: &str) -> Vec<SharedStates> {
        self.inner
            .lock()
            .expect("visited mutex poisoned")
            .get(target_str)
            .cloned()
            .unwrap_or_default()
    }
}

/// Opaque, thread-safe map from a solve identity to a precomputed state.
#[derive(Default)]
pub struct SolveCache {
    inner: Mutex<HashMap<String, BuildState>>,
}

impl SolveCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with(
        &self,
        key: &str,
        make: impl FnOnce() -> BuildState,
    ) -> BuildState {
        self.inner
            .lock()
            .expect("solve cache mutex poisoned")
            .entry(key.to_string())
            .or_insert_with(make)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::dedup::BuildArgInputKind;

    fn sample_sts(ongoing: bool, overriding: Vec<BuildArgInput>) -> SharedStates {
        let platform = Platform::host();
        Arc::new(Mutex::new(SingleTargetStates {
            target: Target::parse("+t").unwrap(),
            target_input: TargetInput::new("+t"),
            side_effects_state: BuildState::scratch(&platform),
            side_effects_image: Image::new(),
            artifacts_state: BuildState::scratch(&platform),
            separate_artifacts_states: Vec::new(),
            save_locals: Vec::new(),
            save_images: Vec::new(),
            run_push: RunPush::default(),
            local_dirs: BTreeMap::new(),
            salt: "s".to_string(),
            ongoing,
            overriding_inputs: overriding,
        }))
    }

    fn ver_input(value: &str) -> BuildArgInput {
        BuildArgInput {
            name: "VER".to_string(),
            default_value: String::new(),
            kind: BuildArgInputKind::Constant(value.to_string()),
        }
    }

    #[test]
    fn test_find_match_requires_same_overrides() {
        let visited = VisitedStates::new();
        visited.register("+t", sample_sts(false, vec![ver_input("1")]));
        assert!(visited.find_match("+t", &[ver_input("2")]).unwrap().is_none());
        assert!(visited.find_match("+t", &[ver_input("1")]).unwrap().is_some());
    }

    #[test]
    fn test_find_match_ongoing_is_cycle() {
        let visited = VisitedStates::new();
        visited.register("+t", sample_sts(true, Vec::new()));
        let err = visited.find_match("+t", &[]).unwrap_err();
        assert!(matches!(err, ForgeError::Cycle { target } if target == "+t"));
    }

    #[test]
    fn test_solve_cache_memoizes() {
        let cache = SolveCache::new();
        let platform = Platform::host();
        let a = cache.get_or_insert_with("k", || BuildState::scratch(&platform));
        let b = cache.get_or_insert_with("k", || BuildState::scratch(&platform));
        assert!(a.same_node(&b));
    }
}
