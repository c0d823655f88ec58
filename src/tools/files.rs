//! FileTool (C4.4.3): materialises file content (inline or downloaded)
//! atomically, applies `context` template substitution, then owner/group/
//! mode. Reports only paths that actually changed.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use crate::error::ToolError;
use crate::model::{FileBody, FileSpec};
use crate::tools::ToolContext;

/// `absolutePath -> fileSpec`, applied sorted by path.
pub fn apply(spec: &BTreeMap<String, FileSpec>, ctx: &ToolContext<'_>) -> Result<Vec<String>, ToolError> {
    let mut changed = Vec::new();

    for (path, file_spec) in spec {
        if apply_one(path, file_spec, ctx)? {
            changed.push(path.clone());
        }
    }

    changed.sort();
    Ok(changed)
}

fn apply_one(path: &str, spec: &FileSpec, ctx: &ToolContext<'_>) -> Result<bool, ToolError> {
    let dest = Path::new(path);
    let mut content_changed = false;

    if let Some(body) = &spec.body {
        let bytes = materialise(body, spec, ctx)?;
        let rendered = substitute_context(&bytes, &spec.context);

        if !matches!(current_content(dest), Some(existing) if existing == rendered) {
            write_atomically(dest, &rendered)?;
            content_changed = true;
        }
    }

    let mode_changed = match spec.mode {
        Some(mode) => apply_mode(dest, mode)?,
        None => false,
    };

    let owner_changed = if spec.owner.is_some() || spec.group.is_some() {
        apply_ownership(dest, spec.owner.as_deref(), spec.group.as_deref())?
    } else {
        false
    };

    Ok(content_changed || mode_changed || owner_changed)
}

fn materialise(body: &FileBody, spec: &FileSpec, ctx: &ToolContext<'_>) -> Result<Vec<u8>, ToolError> {
    match body {
        FileBody::Inline(bytes) => Ok(bytes.clone()),
        FileBody::Source(url) => {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| ToolError::new("FileTool", format!("invalid source URL {url:?}: {e}")))?;
            let signer = ctx.auth.resolve(spec.authentication.as_deref(), &parsed);
            let (bytes, _) = ctx
                .http
                .get(url, signer.as_deref())
                .map_err(|e| ToolError::new("FileTool", format!("fetching {url}: {e}")))?;
            Ok(bytes)
        }
        FileBody::None => Ok(Vec::new()),
    }
}

/// Replaces `${key}` with `context[key]`'s value, left untouched if the
/// key is unknown.
fn substitute_context(bytes: &[u8], context: &std::collections::HashMap<String, String>) -> Vec<u8> {
    if context.is_empty() {
        return bytes.to_vec();
    }
    let Ok(text) = std::str::from_utf8(bytes) else {
        return bytes.to_vec();
    };

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match context.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out.into_bytes()
}

fn current_content(path: &Path) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}

fn write_atomically(dest: &Path, content: &[u8]) -> Result<(), ToolError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .map_err(|e| ToolError::new("FileTool", format!("creating {}: {e}", dir.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ToolError::new("FileTool", format!("creating temp file in {}: {e}", dir.display())))?;
    tmp.write_all(content)
        .map_err(|e| ToolError::new("FileTool", format!("writing {}: {e}", dest.display())))?;
    tmp.flush()
        .map_err(|e| ToolError::new("FileTool", format!("flushing {}: {e}", dest.display())))?;
    tmp.persist(dest)
        .map_err(|e| ToolError::new("FileTool", format!("renaming into {}: {e}", dest.display())))?;
    Ok(())
}

fn apply_mode(dest: &Path, mode: u32) -> Result<bool, ToolError> {
    let metadata = std::fs::metadata(dest)
        .map_err(|e| ToolError::new("FileTool", format!("stat {}: {e}", dest.display())))?;
    if metadata.permissions().mode() & 0o7777 == mode {
        return Ok(false);
    }
    std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))
        .map_err(|e| ToolError::new("FileTool", format!("chmod {}: {e}", dest.display())))?;
    Ok(true)
}

fn apply_ownership(dest: &Path, owner: Option<&str>, group: Option<&str>) -> Result<bool, ToolError> {
    let metadata = std::fs::metadata(dest)
        .map_err(|e| ToolError::new("FileTool", format!("stat {}: {e}", dest.display())))?;

    let uid = match owner {
        Some(name) => Some(resolve_uid(name)?),
        None => None,
    };
    let gid = match group {
        Some(name) => Some(resolve_gid(name)?),
        None => None,
    };

    if uid.map(|u| u == metadata.uid()).unwrap_or(true) && gid.map(|g| g == metadata.gid()).unwrap_or(true) {
        return Ok(false);
    }

    nix::unistd::chown(
        dest,
        uid.map(nix::unistd::Uid::from_raw),
        gid.map(nix::unistd::Gid::from_raw),
    )
    .map_err(|e| ToolError::new("FileTool", format!("chown {}: {e}", dest.display())))?;
    Ok(true)
}

fn resolve_uid(name: &str) -> Result<u32, ToolError> {
    nix::unistd::User::from_name(name)
        .map_err(|e| ToolError::new("FileTool", format!("looking up user {name:?}: {e}")))?
        .map(|u| u.uid.as_raw())
        .ok_or_else(|| ToolError::new("FileTool", format!("unknown user {name:?}")))
}

fn resolve_gid(name: &str) -> Result<u32, ToolError> {
    nix::unistd::Group::from_name(name)
        .map_err(|e| ToolError::new("FileTool", format!("looking up group {name:?}: {e}")))?
        .map(|g| g.gid.as_raw())
        .ok_or_else(|| ToolError::new("FileTool", format!("unknown group {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_context_replaces_known_keys() {
        let mut ctx = std::collections::HashMap::new();
        ctx.insert("name".to_string(), "world".to_string());
        let out = substitute_context(b"hello ${name}!", &ctx);
        assert_eq!(out, b"hello world!");
    }

    #[test]
    fn substitute_context_leaves_unknown_keys() {
        let ctx = std::collections::HashMap::new();
        let out = substitute_context(b"hello ${name}!", &ctx);
        assert_eq!(out, b"hello ${name}!");
    }

    #[test]
    fn substitute_context_noop_when_empty() {
        let ctx = std::collections::HashMap::new();
        let out = substitute_context(b"raw bytes \xff", &ctx);
        assert_eq!(out, b"raw bytes \xff");
    }

    #[test]
    fn write_atomically_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("sub/out.txt");
        write_atomically(&dest, b"hello").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
    }

    #[test]
    fn apply_mode_reports_no_change_when_already_set() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f");
        std::fs::write(&dest, b"x").unwrap();
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!apply_mode(&dest, 0o644).unwrap());
        assert!(apply_mode(&dest, 0o600).unwrap());
    }
}
