//! Absolute path handling. Paths name the root first (`/root/a/b` or
//! `root/a/b`); the canonical form always has the leading slash.

use alloc::{string::String, vec::Vec};

use crate::{
    common::{AlphaError, AlphaResult},
    layout::validate_name,
    ROOT_NAME,
};

/// Non-empty slash-separated segments of `path`.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Canonical `/root/...` form of `path`. `.` is dropped, `..` removes the
/// previous segment but never climbs above the root.
pub fn normalize(path: &str) -> AlphaResult<String> {
    let mut parts = segments(path);
    if parts.next() != Some(ROOT_NAME) {
        return Err(AlphaError::InvalidPath(path.into()));
    }
    let mut stack: Vec<&str> = Vec::new();
    for part in parts {
        match part {
            "." => {}
            ".." => {
                stack.pop();
            }
            name => {
                validate_name(name).map_err(|_| AlphaError::InvalidPath(path.into()))?;
                stack.push(name);
            }
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    out.push_str(ROOT_NAME);
    for part in stack {
        out.push('/');
        out.push_str(part);
    }
    Ok(out)
}

/// Splits a path into its parent path and final name. The root has no parent.
pub fn split(path: &str) -> AlphaResult<(String, String)> {
    let path = normalize(path)?;
    match path.rfind('/') {
        Some(idx) if idx > 0 => Ok((path[..idx].into(), path[idx + 1..].into())),
        _ => Err(AlphaError::InvalidPath(path)),
    }
}

/// Path of the directory containing `path`.
pub fn parent_path(path: &str) -> AlphaResult<String> {
    split(path).map(|(parent, _)| parent)
}

/// `parent` + `/` + `name`.
pub fn join(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let mut out = String::with_capacity(parent.len() + name.len() + 1);
    out.push_str(parent);
    out.push('/');
    out.push_str(name);
    out
}

/// True when `path` is `ancestor` or lies somewhere below it.
pub fn is_within(path: &str, ancestor: &str) -> AlphaResult<bool> {
    let path = normalize(path)?;
    let ancestor = normalize(ancestor)?;
    Ok(path == ancestor
        || (path.starts_with(ancestor.as_str()) && path.as_bytes()[ancestor.len()] == b'/'))
}

/// Turns a shell argument into an absolute path. Arguments starting with `/`
/// or with the root name are absolute; anything else is taken relative to `cwd`.
pub fn absolute(cwd: &str, arg: &str) -> AlphaResult<String> {
    if arg.starts_with('/') || segments(arg).next() == Some(ROOT_NAME) {
        normalize(arg)
    } else {
        normalize(&join(cwd, arg))
    }
}
