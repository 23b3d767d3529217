//! Script file loading.

use std::path::{Path, PathBuf};

use crate::error::BridgeError;

/// Blank out lines starting with `@`.
///
/// This lets a script double as a batch file (`@echo off` on its first
/// line). Elided lines become empty so the guest's line numbers still match
/// the file.
pub fn elide_marker_lines(source: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(source.len());
    for line in source.split_inclusive(|&b| b == b'\n') {
        if line.first() == Some(&b'@') {
            if line.last() == Some(&b'\n') {
                out.push(b'\n');
            }
        } else {
            out.extend_from_slice(line);
        }
    }
    out
}

/// Read a script file with marker lines elided.
pub fn read_script(path: &Path) -> Result<Vec<u8>, BridgeError> {
    let source = std::fs::read(path)?;
    Ok(elide_marker_lines(&source))
}

/// Chunk name for a script file, as the guest shows it in tracebacks.
pub fn chunk_name(path: &Path) -> String {
    format!("@{}", path.display())
}

/// All `*.lua` files directly inside `dir`, in lexical order.
///
/// A missing directory yields no scripts.
pub fn discover_scripts(dir: &Path) -> Result<Vec<PathBuf>, BridgeError> {
    let base = dir
        .to_str()
        .ok_or_else(|| BridgeError::Config(format!("{} is not valid UTF-8", dir.display())))?;
    let pattern = format!("{}/*.lua", glob::Pattern::escape(base));

    let entries = glob::glob(&pattern).map_err(|e| BridgeError::Config(e.to_string()))?;
    let mut scripts = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| BridgeError::Io(e.into()))?;
        if path.is_file() {
            scripts.push(path);
        }
    }
    scripts.sort();
    Ok(scripts)
}
