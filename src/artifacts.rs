// src/artifacts.rs
//
// =============================================================================
// TDLC: ARTIFACT SET (v 0.1 )
// =============================================================================
//
// Generated output, held in memory until everything has rendered.
//
// Responsibilities:
// 1. Collect files (relative path, contents, executable bit).
// 2. Fingerprint them: SHA256 manifest in `sha256sum` format.
// 3. Write the tree, or describe it in dry-run mode.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Result, TdlError};

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub contents: String,
    pub executable: bool,
}

/// Files to create under `root`. For the flat script `root` is the script
/// itself and the set holds a single entry with an empty relative path.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub root: PathBuf,
    files: BTreeMap<PathBuf, Artifact>,
}

impl Artifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, relative: impl Into<PathBuf>, contents: String, executable: bool) {
        self.files.insert(
            relative.into(),
            Artifact {
                contents,
                executable,
            },
        );
    }

    pub fn get(&self, relative: impl AsRef<Path>) -> Option<&Artifact> {
        self.files.get(relative.as_ref())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// `<sha256>  <path>` per file, sorted by path.
    pub fn manifest(&self) -> String {
        self.files
            .iter()
            .map(|(path, a)| {
                format!("{}  {}\n", sha256_bytes(a.contents.as_bytes()), path.display())
            })
            .collect()
    }

    fn target(&self, relative: &Path) -> PathBuf {
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Refuses to overwrite: the output path must not exist yet.
    pub fn write(&self) -> Result<()> {
        if self.root.exists() {
            return Err(TdlError::io(
                self.root.display().to_string(),
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "output already exists"),
            ));
        }
        for (relative, artifact) in &self.files {
            let path = self.target(relative);
            let io = |e| TdlError::io(path.display().to_string(), e);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(io)?;
            }
            fs::write(&path, &artifact.contents).map_err(io)?;
            if artifact.executable {
                make_executable(&path).map_err(io)?;
            }
            log::debug!("wrote {}", path.display());
        }
        log::info!("Wrote {} file(s) to {}", self.files.len(), self.root.display());
        Ok(())
    }

    /// Logs what `write` would do.
    pub fn describe(&self) {
        for (relative, artifact) in &self.files {
            log::info!(
                "[dry-run] would write {} ({} bytes{})",
                self.target(relative).display(),
                artifact.contents.len(),
                if artifact.executable { ", executable" } else { "" }
            );
        }
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn writes_tree_and_refuses_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out");
        let mut set = Artifacts::new(&root);
        set.add("jobs/JTEST", "#!/bin/bash\n".into(), true);
        set.add("plan.json", "{}".into(), false);
        let manifest = set.manifest();
        assert_eq!(manifest.lines().count(), 2);
        assert!(manifest.lines().next().unwrap().ends_with("  jobs/JTEST"));

        set.write().unwrap();
        assert_eq!(fs::read_to_string(root.join("plan.json")).unwrap(), "{}");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(root.join("jobs/JTEST")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        let err = set.write().unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn single_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        let mut set = Artifacts::new(&script);
        set.add("", "echo hi\n".into(), true);
        set.write().unwrap();
        assert_eq!(fs::read_to_string(&script).unwrap(), "echo hi\n");
    }
}
