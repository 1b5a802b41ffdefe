//! Domain names for forge targets and artifacts.
//!
//! A target reference addresses a named build unit within a project:
//! `+name` (same project), `./sub/dir+name` (another local project) or
//! `example.com/org/proj:tag+name` (remote project). An artifact reference
//! addresses a file or tree exported by a target: `+name/path/to/out`.

use crate::error::{ForgeError, Result};
use std::fmt;

/// A reference to a build target.
///
/// Exactly one of `project_path` (remote) or `local_path` (local) is
/// non-empty for a parsed reference. The implicit "same local directory"
/// marker is `local_path == "."`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Remote project path, e.g. `example.com/org/proj`. Empty for local.
    pub project_path: String,
    /// Tag of the remote project. Empty means the default branch.
    pub tag: String,
    /// Local project directory. `"."` marks the current project.
    pub local_path: String,
    /// Target name within the project.
    pub name: String,
}

impl Target {
    /// Parses a target reference string.
    pub fn parse(s: &str) -> Result<Self> {
        let plus = s.find('+').ok_or_else(|| invalid_ref(s, "missing +target separator"))?;
        if s[plus + 1..].contains('+') {
            return Err(invalid_ref(s, "multiple + separators"));
        }
        let (prefix, name) = (&s[..plus], &s[plus + 1..]);
        if name.is_empty() {
            return Err(invalid_ref(s, "empty target name"));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            return Err(invalid_ref(s, "target name contains invalid characters"));
        }
        if prefix.is_empty() {
            return Ok(Target {
                project_path: String::new(),
                tag: String::new(),
                local_path: ".".to_string(),
                name: name.to_string(),
            });
        }
        if is_local_prefix(prefix) {
            return Ok(Target {
                project_path: String::new(),
                tag: String::new(),
                local_path: clean_path(prefix),
                name: name.to_string(),
            });
        }
        // Remote reference: project[:tag].
        let (project, tag) = match prefix.rfind(':') {
            Some(idx) => (&prefix[..idx], &prefix[idx + 1..]),
            None => (prefix, ""),
        };
        if project.is_empty() {
            return Err(invalid_ref(s, "empty project path"));
        }
        Ok(Target {
            project_path: project.to_string(),
            tag: tag.to_string(),
            local_path: String::new(),
            name: name.to_string(),
        })
    }

    /// True if the target lives in a remote project.
    pub fn is_remote(&self) -> bool {
        !self.project_path.is_empty()
    }

    /// True if the target uses the implicit "same local directory" marker.
    pub fn is_local_internal(&self) -> bool {
        self.local_path == "."
    }

    /// True if the target addresses a different local project directory.
    pub fn is_local_external(&self) -> bool {
        !self.local_path.is_empty() && self.local_path != "."
    }

    /// True if the target crosses a project boundary from the caller's
    /// point of view. External targets must not inherit the caller's
    /// overriding variables.
    pub fn is_external(&self) -> bool {
        self.is_remote() || self.is_local_external()
    }

    /// Stable canonical form; omits implicit defaults (empty tag, the
    /// implicit local marker).
    pub fn string_canonical(&self) -> String {
        if self.is_remote() {
            if self.tag.is_empty() {
                format!("{}+{}", self.project_path, self.name)
            } else {
                format!("{}:{}+{}", self.project_path, self.tag, self.name)
            }
        } else if self.is_local_internal() {
            format!("+{}", self.name)
        } else {
            format!("{}+{}", self.local_path, self.name)
        }
    }

    /// Canonical identity of the enclosing project (no target name).
    /// Used as the shared key of the per-project cache context.
    pub fn project_canonical(&self) -> String {
        if self.is_remote() {
            self.project_path.clone()
        } else {
            self.local_path.clone()
        }
    }

    /// Resolves `rel` against `base`: a bare `+name` inherits the base
    /// project, a `./sub+name` composes directory paths, and remote
    /// references stand on their own.
    pub fn join(base: &Target, rel: &Target) -> Result<Target> {
        if rel.is_remote() {
            return Ok(rel.clone());
        }
        if rel.is_local_internal() {
            let mut joined = base.clone();
            joined.name = rel.name.clone();
            return Ok(joined);
        }
        // Local external relative to the base project.
        if base.is_remote() {
            let mut joined = base.clone();
            joined.project_path =
                clean_path(&format!("{}/{}", base.project_path, rel.local_path));
            joined.name = rel.name.clone();
            Ok(joined)
        } else {
            let mut joined = rel.clone();
            joined.local_path = join_paths(&base.local_path, &rel.local_path);
            Ok(joined)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_remote() {
            if self.tag.is_empty() {
                write!(f, "{}+{}", self.project_path, self.name)
            } else {
                write!(f, "{}:{}+{}", self.project_path, self.tag, self.name)
            }
        } else if self.is_local_internal() {
            write!(f, "+{}", self.name)
        } else {
            write!(f, "{}+{}", self.local_path, self.name)
        }
    }
}

/// A reference to an artifact exported by a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub target: Target,
    /// Shell glob, relative to the target's artifact root.
    pub artifact: String,
}

impl Artifact {
    /// Parses an artifact reference string, e.g. `+build/out/app` or
    /// `./sub+build/out/*`.
    pub fn parse(s: &str) -> Result<Self> {
        let plus = s.find('+').ok_or_else(|| invalid_ref(s, "missing +target separator"))?;
        let slash = s[plus..]
            .find('/')
            .map(|i| plus + i)
            .ok_or_else(|| invalid_ref(s, "missing artifact path"))?;
        let target = Target::parse(&s[..slash])?;
        let artifact = &s[slash + 1..];
        if artifact.is_empty() {
            return Err(invalid_ref(s, "empty artifact path"));
        }
        Ok(Artifact { target, artifact: artifact.to_string() })
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target, self.artifact)
    }
}

fn invalid_ref(reference: &str, reason: &str) -> ForgeError {
    ForgeError::InvalidReference { reference: reference.to_string(), reason: reason.to_string() }
}

fn is_local_prefix(s: &str) -> bool {
    s == "." || s == ".." || s.starts_with("./") || s.starts_with("../") || s.starts_with('/')
}

/// Joins two local project paths, preserving a leading `./`.
fn join_paths(base: &str, rel: &str) -> String {
    if rel.starts_with('/') {
        return clean_path(rel);
    }
    clean_path(&format!("{}/{}", base, rel))
}

/// Lexically cleans a path: collapses `.` and `..` segments and duplicate
/// slashes, preserving a leading `./`, `/` or `..`.
pub(crate) fn clean_path(p: &str) -> String {
    let rooted = p.starts_with('/');
    let relative_marker = p == "." || p.starts_with("./");
    let mut out: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if matches!(out.last(), Some(&s) if s != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            _ => out.push(seg),
        }
    }
    let joined = out.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else if relative_marker {
        format!("./{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_internal() {
        let t = Target::parse("+build").unwrap();
        assert!(t.is_local_internal());
        assert!(!t.is_external());
        assert_eq!(t.name, "build");
        assert_eq!(t.to_string(), "+build");
    }

    #[test]
    fn test_parse_local_external() {
        let t = Target::parse("./services/api+build").unwrap();
        assert!(t.is_local_external());
        assert!(t.is_external());
        assert_eq!(t.local_path, "./services/api");
        assert_eq!(t.to_string(), "./services/api+build");
    }

    #[test]
    fn test_parse_remote() {
        let t = Target::parse("example.com/org/proj:v2+test").unwrap();
        assert!(t.is_remote());
        assert!(t.is_external());
        assert_eq!(t.project_path, "example.com/org/proj");
        assert_eq!(t.tag, "v2");
        assert_eq!(t.name, "test");
        assert_eq!(t.string_canonical(), "example.com/org/proj:v2+test");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Target::parse("build").is_err());
        assert!(Target::parse("+").is_err());
        assert!(Target::parse("+a+b").is_err());
        assert!(Target::parse("+has space").is_err());
    }

    #[test]
    fn test_canonical_omits_empty_tag() {
        let t = Target::parse("example.com/org/proj+x").unwrap();
        assert_eq!(t.string_canonical(), "example.com/org/proj+x");
    }

    #[test]
    fn test_join_inherits_project() {
        let base = Target::parse("./services/api+build").unwrap();
        let rel = Target::parse("+test").unwrap();
        let joined = Target::join(&base, &rel).unwrap();
        assert_eq!(joined.to_string(), "./services/api+test");
    }

    #[test]
    fn test_join_composes_paths() {
        let base = Target::parse("./services+api").unwrap();
        let rel = Target::parse("./db+migrate").unwrap();
        let joined = Target::join(&base, &rel).unwrap();
        assert_eq!(joined.to_string(), "./services/db+migrate");

        let top = Target::parse("+all").unwrap();
        let sub = Target::parse("./sub+x").unwrap();
        assert_eq!(Target::join(&top, &sub).unwrap().to_string(), "./sub+x");
    }

    #[test]
    fn test_join_remote_stands_alone() {
        let base = Target::parse("+build").unwrap();
        let rel = Target::parse("example.com/org/proj+x").unwrap();
        let joined = Target::join(&base, &rel).unwrap();
        assert_eq!(joined.to_string(), "example.com/org/proj+x");
    }

    #[test]
    fn test_join_remote_base_with_subdir() {
        let base = Target::parse("example.com/org/proj:v1+build").unwrap();
        let rel = Target::parse("./sub+x").unwrap();
        let joined = Target::join(&base, &rel).unwrap();
        assert_eq!(joined.to_string(), "example.com/org/proj/sub:v1+x");
    }

    #[test]
    fn test_parse_artifact() {
        let a = Artifact::parse("+build/out/app").unwrap();
        assert_eq!(a.target.name, "build");
        assert_eq!(a.artifact, "out/app");
        assert_eq!(a.to_string(), "+build/out/app");

        let b = Artifact::parse("./sub+build/out/*").unwrap();
        assert_eq!(b.target.local_path, "./sub");
        assert_eq!(b.artifact, "out/*");
    }

    #[test]
    fn test_parse_artifact_invalid() {
        assert!(Artifact::parse("+build").is_err());
        assert!(Artifact::parse("no-target/path").is_err());
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("./a/./b"), "./a/b");
        assert_eq!(clean_path("./a/../b"), "./b");
        assert_eq!(clean_path("a//b"), "a/b");
        assert_eq!(clean_path("/a/../b"), "/b");
        assert_eq!(clean_path("./a/.."), ".");
        assert_eq!(clean_path("../x"), "../x");
    }
}
