//! Parsing of `RUN --mount` specifications.
//!
//! Supported types: `cache` (backed by the per-project cache context,
//! keyed under the target's dedup hash), `tmpfs`, and `secret`.

use crate::convert::dedup::TargetInput;
use crate::error::{ForgeError, Result};
use crate::state::{BuildState, Mount};

pub fn parse_mounts(
    mounts: &[String],
    target_input: &TargetInput,
    cache_context: &BuildState,
) -> Result<Vec<Mount>> {
    mounts
        .iter()
        .map(|spec| parse_mount(spec, target_input, cache_context))
        .collect()
}

fn parse_mount(
    spec: &str,
    target_input: &TargetInput,
    cache_context: &BuildState,
) -> Result<Mount> {
    let mut mount_type = None;
    let mut target = None;
    let mut id = None;
    let mut mode = 0o444;
    for part in spec.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| invalid(spec, &format!("option {} has no value", part)))?;
        match key {
            "type" => mount_type = Some(value),
            "target" | "dst" | "destination" => target = Some(value),
            "id" => id = Some(value),
            "mode" => {
                mode = u32::from_str_radix(value.trim_start_matches("0o"), 8)
                    .map_err(|_| invalid(spec, &format!("invalid mode {}", value)))?;
            }
            _ => return Err(invalid(spec, &format!("unknown option {}", key))),
        }
    }
    let mount_type = mount_type.ok_or_else(|| invalid(spec, "missing type"))?;
    let target = target.ok_or_else(|| invalid(spec, "missing target"))?;
    match mount_type {
        "cache" => Ok(Mount::State {
            target: target.to_string(),
            source: cache_context.clone(),
            // Distinct targets sharing one project cache context get
            // disjoint subtrees, keyed by dedup hash.
            source_path: format!("/{}/{}", target_input.hash(), target.trim_start_matches('/')),
            readonly: false,
        }),
        "tmpfs" => Ok(Mount::Tmpfs { target: target.to_string() }),
        "secret" => {
            let id = id.map(str::to_string).unwrap_or_else(|| base_name(target));
            Ok(Mount::Secret { target: target.to_string(), id, mode })
        }
        _ => Err(invalid(spec, &format!("unknown mount type {}", mount_type))),
    }
}

fn base_name(path: &str) -> String {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path).to_string()
}

fn invalid(spec: &str, reason: &str) -> ForgeError {
    ForgeError::InvalidArgs {
        command: format!("RUN --mount={}", spec),
        reason: reason.to_string(),
    }
}
