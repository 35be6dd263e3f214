use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

/// Rebuilds the checksum manifest for every file under `root`, one
/// `<relative/path> <sha256>` line per file, sorted by path. The manifest
/// itself is excluded when it lives inside the tree it describes.
/// Returns the number of entries written.
pub fn write_registry(root: &Path, registry_path: &Path) -> Result<usize> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)
        .with_context(|| format!("Failed to walk output tree '{}'", root.display()))?;

    if let Ok(own) = registry_path.strip_prefix(root) {
        let own = slash_path(own);
        files.retain(|rel| *rel != own);
    }
    files.sort();

    let mut manifest = String::new();
    for rel in &files {
        let digest = sha256_hex(&root.join(rel))
            .with_context(|| format!("Failed to hash '{}'", rel))?;
        writeln!(manifest, "{} {}", rel, digest)?;
    }
    fs::write(registry_path, manifest)
        .with_context(|| format!("Failed to write registry '{}'", registry_path.display()))?;
    Ok(files.len())
}

/// Recursively lists files below `dir` as slash-separated paths relative
/// to `root`. Dotfiles are included; Zarr metadata lives in them.
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            out.push(slash_path(rel));
        }
    }
    Ok(())
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn sha256_hex(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open '{}'", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        let n = file
            .read(&mut buffer)
            .with_context(|| format!("Failed to read '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    let mut hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        write!(hex, "{:02x}", byte)?;
    }
    Ok(hex)
}
