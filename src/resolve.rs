//! Command resolution — turning a manifest `command` vector into something
//! spawnable, and deriving the child identity that keys the session pool.
//!
//! Resolution order per element: environment variable expansion, promotion
//! of router-root-relative paths to absolute, and a PATH search for the
//! executable slot. The composed environment is a sorted map so the
//! identity hash is deterministic.

use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};

/// A command vector ready to spawn, plus the exact environment the child
/// will receive.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    /// Executable at index 0, arguments after.
    pub argv: Vec<String>,
    /// Full child environment: inherited, overlaid, unbuffered.
    pub env: BTreeMap<String, String>,
}

/// Resolve a manifest command against the router root and compose the
/// child environment from the process environment plus the tool overlay.
///
/// Overlay values are literal; expansion applies only to command parts.
/// `PYTHONUNBUFFERED=1` is always injected so line-framed children do not
/// sit on buffered stdout.
pub fn resolve_command(
    command: &[String],
    overlay: &BTreeMap<String, String>,
    root: &Path,
) -> ResolvedCommand {
    let mut argv = Vec::with_capacity(command.len());
    for (i, part) in command.iter().enumerate() {
        let expanded = expand_vars(part);

        // A root-joined path that exists wins, so manifests can reference
        // bundled scripts relative to the router root regardless of the
        // caller's working directory.
        let joined = root.join(&expanded);
        if joined.exists() {
            argv.push(joined.to_string_lossy().into_owned());
            continue;
        }

        if i == 0 && !Path::new(&expanded).is_absolute() {
            match which::which(&expanded) {
                Ok(found) => argv.push(found.to_string_lossy().into_owned()),
                // Pass the literal through and let spawn fail naturally.
                Err(_) => argv.push(expanded),
            }
            continue;
        }

        argv.push(expanded);
    }

    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.insert("PYTHONUNBUFFERED".to_owned(), "1".to_owned());

    ResolvedCommand { argv, env }
}

/// Expand `${NAME}` and `$NAME` against the process environment.
///
/// Unresolved variables are left literal, including their braces.
pub fn expand_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    // Unterminated brace: keep the remainder literal.
                    out.push_str("${");
                    out.push_str(&name);
                    break;
                }
                match lookup(&name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("${");
                        out.push_str(&name);
                        out.push('}');
                    }
                }
            }
            Some(first) if first.is_ascii_alphanumeric() || first == '_' => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match lookup(&name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

fn lookup(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    std::env::var(name).ok()
}

/// The stable fingerprint under which a live child is pooled.
///
/// SHA-256 over the canonical JSON of the resolved command vector and the
/// effective environment; the environment map is sorted, so identical
/// spawn parameters always hash identically.
pub fn child_identity(argv: &[String], env: &BTreeMap<String, String>) -> String {
    let canonical = serde_json::json!({ "cmd": argv, "env": env });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    hex::encode(digest)
}
