//! Deployable artifact references.
//!
//! Artifacts belong to the operator, not to any stack. A stack only records
//! which artifact a runtime binds, identified by content digest so that an
//! unchanged build context produces no diff.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Where the artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ArtifactSource {
    /// Local build context directory (or single file) built into an image at deploy time.
    Asset { path: PathBuf },
    /// Prebuilt container image.
    Image { uri: String },
}

/// Content-addressed reference to a deployable package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub source: ArtifactSource,
    /// `sha256:<hex>` digest, when known.
    pub digest: Option<String>,
}

impl Artifact {
    /// Reference a local build context and compute its content digest.
    pub fn from_asset(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let digest = hash_path(path)?;
        Ok(Self {
            source: ArtifactSource::Asset {
                path: path.to_path_buf(),
            },
            digest: Some(digest),
        })
    }

    /// Reference a prebuilt image. A `@sha256:` suffix pins the digest.
    pub fn from_image(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let digest = uri
            .split_once('@')
            .map(|(_, d)| d.to_string())
            .filter(|d| d.starts_with("sha256:"));
        Self {
            source: ArtifactSource::Image { uri },
            digest,
        }
    }

    /// Human-readable location.
    pub fn location(&self) -> String {
        match &self.source {
            ArtifactSource::Asset { path } => path.display().to_string(),
            ArtifactSource::Image { uri } => uri.clone(),
        }
    }
}

fn hash_path(root: &Path) -> Result<String> {
    let read_err = |p: &Path, e: std::io::Error| {
        Error::InvalidInput(format!("cannot read artifact at {}: {}", p.display(), e))
    };

    let metadata = std::fs::metadata(root).map_err(|e| read_err(root, e))?;
    let mut files = Vec::new();
    if metadata.is_dir() {
        collect_files(root, root, &mut files).map_err(|e| read_err(root, e))?;
    } else {
        files.push((String::new(), root.to_path_buf()));
    }
    files.sort();

    let mut hasher = Sha256::new();
    for (relative, full) in &files {
        let contents = std::fs::read(full).map_err(|e| read_err(full, e))?;
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update((contents.len() as u64).to_be_bytes());
        hasher.update(&contents);
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn collect_files(
    root: &Path,
    dir: &Path,
    files: &mut Vec<(String, PathBuf)>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push((relative, path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_asset_digest_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Dockerfile", "FROM python:3.12");
        write(dir.path(), "src/agent.py", "print('hi')");

        let a = Artifact::from_asset(dir.path()).unwrap();
        let b = Artifact::from_asset(dir.path()).unwrap();
        assert_eq!(a, b);
        assert!(a.digest.as_ref().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn test_asset_digest_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "agent.py", "v1");
        let before = Artifact::from_asset(dir.path()).unwrap();

        write(dir.path(), "agent.py", "v2");
        let after = Artifact::from_asset(dir.path()).unwrap();
        assert_ne!(before.digest, after.digest);
    }

    #[test]
    fn test_missing_asset_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Artifact::from_asset(dir.path().join("missing"));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_image_digest_pinning() {
        let pinned = Artifact::from_image("repo/agent@sha256:abcd");
        assert_eq!(pinned.digest.as_deref(), Some("sha256:abcd"));

        let tagged = Artifact::from_image("repo/agent:latest");
        assert!(tagged.digest.is_none());
        assert_eq!(tagged.location(), "repo/agent:latest");
    }
}
