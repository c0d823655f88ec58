//! SourcesTool (C4.4.2): downloads or opens an archive, sniffs tar (any
//! compression) or zip, rejects any member that would escape `destDir`,
//! re-wraps single-top-level GitHub tarballs/zipballs, and extracts.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::ToolError;
use crate::tools::ToolContext;

static GITHUB_ARCHIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^https?://github\.com/.*/(zipball|tarball)/.*$").unwrap());

const DIGEST_MARKER: &str = ".stack-init-source-digest";

enum Archive {
    Tar(Vec<u8>),
    Zip(Vec<u8>),
}

/// `destDir -> archiveLocation`, applied sorted by `destDir`.
pub fn apply(spec: &BTreeMap<String, String>, ctx: &ToolContext<'_>) -> Result<Vec<String>, ToolError> {
    let mut changed = Vec::new();

    for (dest_dir, location) in spec {
        let dest = Path::new(dest_dir);
        let bytes = fetch(location, ctx)?;

        let digest = hex::encode(Sha256::digest(&bytes));
        if already_applied(dest, &digest) {
            continue;
        }

        let archive = sniff(&bytes)?;
        let archive = if GITHUB_ARCHIVE.is_match(location) {
            rewrap_github_archive(archive)?
        } else {
            archive
        };

        extract(&archive, dest)?;
        write_digest_marker(dest, &digest)
            .map_err(|e| ToolError::new("SourcesTool", format!("writing digest marker: {e}")))?;
        changed.push(dest_dir.clone());
    }

    changed.sort();
    Ok(changed)
}

fn fetch(location: &str, ctx: &ToolContext<'_>) -> Result<Vec<u8>, ToolError> {
    if location.starts_with("http") || location.starts_with("ftp") {
        let signer = reqwest::Url::parse(location)
            .ok()
            .and_then(|url| ctx.auth.resolve(None, &url));
        let tmp = std::env::temp_dir().join(format!(
            "stack-init-source-{}.bin",
            hex::encode(Sha256::digest(location.as_bytes()))
        ));
        ctx.http
            .get_to_file(location, &tmp, signer.as_deref())
            .map_err(|e| ToolError::new("SourcesTool", format!("download {location}: {e}")))?;
        std::fs::read(&tmp).map_err(|e| ToolError::new("SourcesTool", format!("read {location}: {e}")))
    } else {
        std::fs::read(location).map_err(|e| ToolError::new("SourcesTool", format!("read {location}: {e}")))
    }
}

fn already_applied(dest: &Path, digest: &str) -> bool {
    std::fs::read_to_string(dest.join(DIGEST_MARKER))
        .map(|existing| existing.trim() == digest)
        .unwrap_or(false)
}

fn write_digest_marker(dest: &Path, digest: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    std::fs::write(dest.join(DIGEST_MARKER), digest)
}

fn sniff(bytes: &[u8]) -> Result<Archive, ToolError> {
    if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06") {
        return Ok(Archive::Zip(bytes.to_vec()));
    }

    let decompressed = if bytes.starts_with(&[0x1f, 0x8b]) {
        decompress_gzip(bytes)?
    } else if bytes.starts_with(b"BZh") {
        decompress_bzip2(bytes)?
    } else {
        bytes.to_vec()
    };

    if is_valid_tar(&decompressed) {
        return Ok(Archive::Tar(decompressed));
    }

    Err(ToolError::new("SourcesTool", "unsupported archive format (not tar or zip)"))
}

fn decompress_gzip(bytes: &[u8]) -> Result<Vec<u8>, ToolError> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| ToolError::new("SourcesTool", format!("gzip decode: {e}")))?;
    Ok(out)
}

fn decompress_bzip2(bytes: &[u8]) -> Result<Vec<u8>, ToolError> {
    let mut out = Vec::new();
    bzip2::read::BzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| ToolError::new("SourcesTool", format!("bzip2 decode: {e}")))?;
    Ok(out)
}

fn is_valid_tar(bytes: &[u8]) -> bool {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    match archive.entries() {
        Ok(entries) => entries.count() > 0 && entries_ok(bytes),
        Err(_) => false,
    }
}

fn entries_ok(bytes: &[u8]) -> bool {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let entries = match archive.entries() {
        Ok(e) => e,
        Err(_) => return false,
    };
    for entry in entries {
        if entry.is_err() {
            return false;
        }
    }
    true
}

fn member_names(archive: &Archive) -> Result<Vec<String>, ToolError> {
    match archive {
        Archive::Tar(bytes) => {
            let mut out = Vec::new();
            let mut ar = tar::Archive::new(Cursor::new(bytes));
            for entry in ar
                .entries()
                .map_err(|e| ToolError::new("SourcesTool", format!("reading tar entries: {e}")))?
            {
                let entry = entry.map_err(|e| ToolError::new("SourcesTool", format!("reading tar entry: {e}")))?;
                let path = entry
                    .path()
                    .map_err(|e| ToolError::new("SourcesTool", format!("tar entry path: {e}")))?;
                out.push(path.to_string_lossy().to_string());
            }
            Ok(out)
        }
        Archive::Zip(bytes) => {
            let mut zip = zip::ZipArchive::new(Cursor::new(bytes))
                .map_err(|e| ToolError::new("SourcesTool", format!("opening zip: {e}")))?;
            let mut out = Vec::with_capacity(zip.len());
            for i in 0..zip.len() {
                let entry = zip
                    .by_index(i)
                    .map_err(|e| ToolError::new("SourcesTool", format!("zip entry {i}: {e}")))?;
                out.push(entry.name().to_string());
            }
            Ok(out)
        }
    }
}

/// True if `member`, joined onto a destination root, would resolve to a
/// path outside that root: absolute members, and any amount of `..` that
/// nets below the root, both escape.
fn member_escapes(member: &str) -> bool {
    if member.starts_with('/') || member.starts_with('\\') {
        return true;
    }
    let mut depth: i64 = 0;
    for part in member.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    false
}

fn extract(archive: &Archive, dest: &Path) -> Result<(), ToolError> {
    let names = member_names(archive)?;
    for name in &names {
        if member_escapes(name) {
            return Err(ToolError::new(
                "SourcesTool",
                format!("archive member {name:?} escapes destination {}", dest.display()),
            ));
        }
    }

    std::fs::create_dir_all(dest)
        .map_err(|e| ToolError::new("SourcesTool", format!("creating {}: {e}", dest.display())))?;

    match archive {
        Archive::Tar(bytes) => {
            let mut ar = tar::Archive::new(Cursor::new(bytes));
            ar.unpack(dest)
                .map_err(|e| ToolError::new("SourcesTool", format!("extracting tar into {}: {e}", dest.display())))?;
        }
        Archive::Zip(bytes) => {
            let mut zip = zip::ZipArchive::new(Cursor::new(bytes))
                .map_err(|e| ToolError::new("SourcesTool", format!("opening zip: {e}")))?;
            zip.extract(dest)
                .map_err(|e| ToolError::new("SourcesTool", format!("extracting zip into {}: {e}", dest.display())))?;
        }
    }
    Ok(())
}

/// GitHub `/zipball/` and `/tarball/` endpoints wrap the repository in one
/// extra top-level directory (`owner-repo-sha/...`). Extract fully to a
/// scratch directory, and if there is exactly one top-level entry, re-tar
/// its contents with that prefix stripped.
fn rewrap_github_archive(archive: Archive) -> Result<Archive, ToolError> {
    let scratch = tempfile_dir()?;
    extract(&archive, &scratch)?;
    // Extraction wrote our own digest marker too; strip it before re-tarring.
    let _ = std::fs::remove_file(scratch.join(DIGEST_MARKER));

    let mut top_entries: Vec<PathBuf> = std::fs::read_dir(&scratch)
        .map_err(|e| ToolError::new("SourcesTool", format!("reading scratch dir: {e}")))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    top_entries.sort();

    let root = if top_entries.len() == 1 && top_entries[0].is_dir() {
        top_entries.into_iter().next().unwrap()
    } else {
        scratch.clone()
    };

    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        builder
            .append_dir_all(".", &root)
            .map_err(|e| ToolError::new("SourcesTool", format!("re-tarring GitHub archive: {e}")))?;
        builder
            .finish()
            .map_err(|e| ToolError::new("SourcesTool", format!("finishing re-tar: {e}")))?;
    }

    let _ = std::fs::remove_dir_all(&scratch);
    Ok(Archive::Tar(buf))
}

fn tempfile_dir() -> Result<PathBuf, ToolError> {
    let dir = std::env::temp_dir().join(format!("stack-init-github-{}", std::process::id()));
    std::fs::create_dir_all(&dir).map_err(|e| ToolError::new("SourcesTool", format!("scratch dir: {e}")))?;
    Ok(dir)
}
