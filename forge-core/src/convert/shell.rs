//! Shell wrapping for RUN commands.
//!
//! By default a RUN's argv is joined and handed to `/bin/sh -c`, with the
//! env-var prelude (constant build args, secret and derived-arg `$(cat …)`
//! reads) prepended. Exec form (`with_shell == false`) is never wrapped.
//! The dockerd variant additionally boots a docker daemon around the
//! command so `docker …` invocations work inside the build.

pub const DEBUGGER_PATH: &str = "/usr/bin/forge_debugger";
pub const DEBUGGER_SETTINGS_SECRET_ID: &str = "forge_debugger_settings";
pub const RUN_HELPER_DIR: &str = "/run/forge";

/// Signature shared by the shell wrappers.
pub type ShellWrapFn = fn(&[String], &[String], bool, bool) -> Vec<String>;

/// Default wrapper: env-var prelude plus `sh -c`, optionally under the
/// interactive debugger.
pub fn with_shell_and_env_vars(
    args: &[String],
    extra_env: &[String],
    with_shell: bool,
    with_debugger: bool,
) -> Vec<String> {
    if !with_shell {
        return args.to_vec();
    }
    let script = prelude_and_command(args, extra_env);
    if with_debugger {
        vec![
            DEBUGGER_PATH.to_string(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            script,
        ]
    } else {
        vec!["/bin/sh".to_string(), "-c".to_string(), script]
    }
}

/// Dockerd wrapper: boots dockerd, waits for it, runs the command, stops
/// dockerd and preserves the command's exit code.
pub fn with_dockerd_wrap(
    args: &[String],
    extra_env: &[String],
    with_shell: bool,
    _with_debugger: bool,
) -> Vec<String> {
    let command = if with_shell {
        prelude_and_command(args, extra_env)
    } else {
        shell_quote_join(args)
    };
    let script = [
        "dockerd >/var/log/dockerd.log 2>&1 &",
        "i=0",
        "while ! docker version >/dev/null 2>&1; do",
        "  i=$((i+1))",
        "  if [ \"$i\" -gt 30 ]; then echo dockerd did not start >&2; exit 1; fi",
        "  sleep 1",
        "done",
        &command,
        "exit_code=$?",
        "kill \"$(cat /var/run/docker.pid)\" >/dev/null 2>&1 || true",
        "exit \"$exit_code\"",
    ]
    .join("\n");
    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}

fn prelude_and_command(args: &[String], extra_env: &[String]) -> String {
    let mut parts: Vec<String> = extra_env.to_vec();
    parts.push(args.join(" "));
    parts.join(" ")
}

fn shell_quote_join(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("'{}'", a.replace('\'', "'\\''")))
        .collect::<Vec<_>>()
        .join(" ")
}
