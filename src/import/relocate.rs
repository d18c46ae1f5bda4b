//! Install-prefix rewriting for relocatable payloads.
//!
//! Text files carry the literal token `_DEPOT_` where the depot path goes.
//! Binaries cannot change size, so they carry a same-length placeholder: the
//! depot path with its final component replaced by `_^DEPOT_`.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::error::GridwareError;

pub const DEPOT_TOKEN: &str = "_DEPOT_";
pub const BINARY_TOKEN: &str = "_^DEPOT_";

/// `<parent of depot_path>/_^DEPOT_`
pub fn binary_placeholder(depot_path: &Path) -> String {
    match depot_path.parent() {
        Some(parent) => parent.join(BINARY_TOKEN).to_string_lossy().to_string(),
        None => BINARY_TOKEN.to_string(),
    }
}

/// Content is treated as text when it is valid UTF-8 without NUL bytes.
pub fn is_text(bytes: &[u8]) -> bool {
    !bytes.contains(&0) && std::str::from_utf8(bytes).is_ok()
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

/// Replace every `from` with `to` in a text file. Returns whether the file
/// changed.
pub fn rewrite_text(path: &Path, from: &str, to: &str) -> Result<bool> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    if !text.contains(from) {
        return Ok(false);
    }
    fs::write(path, text.replace(from, to))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

/// Replace every occurrence of `from` with `to` in place. The two must have
/// the same byte length; the file size never changes. Returns the number of
/// replacements.
pub fn patch_binary(path: &Path, from: &str, to: &str) -> Result<usize> {
    let mut bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let (from, to) = (from.as_bytes(), to.as_bytes());
    let occurrences = count(&bytes, from);
    if occurrences == 0 {
        return Ok(0);
    }
    if from.len() != to.len() {
        return Err(GridwareError::Relocation {
            path: path.display().to_string(),
            reason: format!(
                "replacement is {} bytes but the embedded placeholder is {} bytes",
                to.len(),
                from.len()
            ),
        }
        .into());
    }

    let mut i = 0;
    while i + from.len() <= bytes.len() {
        if &bytes[i..i + from.len()] == from {
            bytes[i..i + to.len()].copy_from_slice(to);
            i += from.len();
        } else {
            i += 1;
        }
    }
    fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(occurrences)
}

/// Point a payload file at `depot_path`.
pub fn relocate_file(path: &Path, depot_path: &Path) -> Result<()> {
    let depot = depot_path.to_string_lossy();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if is_text(&bytes) {
        rewrite_text(path, DEPOT_TOKEN, &depot)?;
        return Ok(());
    }
    let placeholder = binary_placeholder(depot_path);
    let stray = count(&bytes, BINARY_TOKEN.as_bytes()) - count(&bytes, placeholder.as_bytes());
    if stray > 0 {
        return Err(GridwareError::Relocation {
            path: path.display().to_string(),
            reason: format!(
                "{stray} embedded placeholder(s) were not built for {}",
                placeholder.trim_end_matches(BINARY_TOKEN)
            ),
        }
        .into());
    }
    patch_binary(path, &placeholder, &depot)?;
    Ok(())
}

/// Inverse of [`relocate_file`]: turn references to `depot_path` back into
/// placeholders. Returns whether the file referenced the depot at all.
pub fn unrelocate_file(path: &Path, depot_path: &Path) -> Result<bool> {
    let depot = depot_path.to_string_lossy();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if is_text(&bytes) {
        rewrite_text(path, &depot, DEPOT_TOKEN)
    } else {
        Ok(patch_binary(path, &depot, &binary_placeholder(depot_path))? > 0)
    }
}
