//! Artifact packager: writes a passing artifact plus its manifest.
//!
//! Files are staged in a sibling directory and renamed onto the destination
//! in one step, so the destination is either fully populated or left the
//! way it was found (absent or empty).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::artifact_path::normalize_relative;
use crate::core::types::{ArtifactSet, MANIFEST_FILE};
use crate::error::PackagingError;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Filesystem operations used by the packager. Swappable to simulate write failures.
pub trait ArtifactWriter: Send + Sync {
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsWriter;

impl ArtifactWriter for FsWriter {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::write(path, contents)
    }
}

/// Session facts recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub session_id: String,
    pub description: String,
    pub test_scenario: String,
    pub attempts: u32,
    pub entry_point: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Contents of `svcgen.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub session_id: String,
    pub description: String,
    pub test_scenario: String,
    pub entry_point: Option<String>,
    pub attempts: u32,
    pub generated_at: String,
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    pub fn build(artifact: &ArtifactSet, info: &PackageInfo) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            session_id: info.session_id.clone(),
            description: info.description.clone(),
            test_scenario: info.test_scenario.clone(),
            entry_point: info.entry_point.clone(),
            attempts: info.attempts,
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            files: artifact
                .files()
                .map(|(path, content)| ManifestFile {
                    path: path.to_string(),
                    bytes: content.len() as u64,
                    sha256: sha256_hex(content.as_bytes()),
                })
                .collect(),
        }
    }
}

pub trait Packager {
    /// Materialize `artifact` and its manifest at `destination`.
    fn package(
        &self,
        artifact: &ArtifactSet,
        info: &PackageInfo,
        destination: &Path,
    ) -> Result<(), PackagingError>;
}

/// Packager that writes to a directory through an [`ArtifactWriter`].
#[derive(Debug, Clone, Default)]
pub struct DirPackager<W = FsWriter> {
    writer: W,
}

impl DirPackager<FsWriter> {
    pub fn new() -> Self {
        Self { writer: FsWriter }
    }
}

impl<W: ArtifactWriter> DirPackager<W> {
    pub fn with_writer(writer: W) -> Self {
        Self { writer }
    }

    fn stage(
        &self,
        staging: &Path,
        artifact: &ArtifactSet,
        info: &PackageInfo,
    ) -> Result<(), PackagingError> {
        for (rel, content) in artifact.files() {
            let path = staging.join(rel);
            if let Some(parent) = path.parent() {
                self.writer
                    .create_dir_all(parent)
                    .map_err(|source| write_failure(parent, source))?;
            }
            self.writer
                .write_file(&path, content.as_bytes())
                .map_err(|source| write_failure(&path, source))?;
        }

        let manifest = Manifest::build(artifact, info);
        let manifest_path = staging.join(MANIFEST_FILE);
        let mut json = serde_json::to_string_pretty(&manifest).map_err(|err| {
            write_failure(&manifest_path, io::Error::new(io::ErrorKind::InvalidData, err))
        })?;
        json.push('\n');
        self.writer
            .write_file(&manifest_path, json.as_bytes())
            .map_err(|source| write_failure(&manifest_path, source))
    }
}

impl<W: ArtifactWriter> Packager for DirPackager<W> {
    #[instrument(skip_all, fields(destination = %destination.display(), files = artifact.len()))]
    fn package(
        &self,
        artifact: &ArtifactSet,
        info: &PackageInfo,
        destination: &Path,
    ) -> Result<(), PackagingError> {
        let existed = match fs::read_dir(destination) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Err(PackagingError::DestinationNotEmpty {
                        path: destination.to_path_buf(),
                    });
                }
                true
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(source) => return Err(write_failure(destination, source)),
        };

        let parent = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|source| write_failure(&parent, source))?;
        let staging = tempfile::Builder::new()
            .prefix(".svcgen-staging-")
            .tempdir_in(&parent)
            .map_err(|source| write_failure(&parent, source))?;

        // Dropping `staging` on error removes everything written so far.
        self.stage(staging.path(), artifact, info)?;
        debug!(staging = %staging.path().display(), "artifact staged");

        set_published_mode(staging.path())
            .map_err(|source| write_failure(staging.path(), source))?;
        if existed {
            fs::remove_dir(destination).map_err(|source| write_failure(destination, source))?;
        }
        if let Err(source) = fs::rename(staging.path(), destination) {
            if existed {
                if let Err(err) = fs::create_dir(destination) {
                    warn!(err = %err, "failed to restore empty destination");
                }
            }
            return Err(write_failure(destination, source));
        }

        info!(files = artifact.len(), "artifact packaged");
        Ok(())
    }
}

fn write_failure(path: &Path, source: io::Error) -> PackagingError {
    PackagingError::WriteFailure {
        path: path.to_path_buf(),
        source,
    }
}

/// Staging dirs are created 0700; the published directory is 0755.
#[cfg(unix)]
fn set_published_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_published_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Load a packaged directory, verifying every file against the manifest.
pub fn load_packaged(dir: &Path) -> Result<(Manifest, ArtifactSet)> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("read manifest {}", manifest_path.display()))?;
    let manifest: Manifest = serde_json::from_str(&raw)
        .with_context(|| format!("parse manifest {}", manifest_path.display()))?;
    if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
        bail!(
            "unsupported manifest schema_version {} (expected {MANIFEST_SCHEMA_VERSION})",
            manifest.schema_version
        );
    }

    let mut on_disk = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("relativize {}", entry.path().display()))?
            .to_string_lossy()
            .replace('\\', "/");
        if rel != MANIFEST_FILE {
            on_disk.push(rel);
        }
    }

    let mut files = Vec::with_capacity(manifest.files.len());
    for listed in &manifest.files {
        let path = packaged_file(dir, &listed.path)?;
        let content = fs::read_to_string(&path)
            .with_context(|| format!("read packaged file {}", path.display()))?;
        let digest = sha256_hex(content.as_bytes());
        if digest != listed.sha256 {
            bail!("checksum mismatch for {}", listed.path);
        }
        files.push((listed.path.clone(), content));
    }

    let listed: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    if let Some(extra) = on_disk.iter().find(|rel| !listed.contains(&rel.as_str())) {
        bail!("file {extra} is not listed in the manifest");
    }

    let artifact = ArtifactSet::new(files).map_err(|err| anyhow!("invalid packaged artifact: {err}"))?;
    Ok((manifest, artifact))
}

/// Resolve a manifest path inside `dir`. The path must already be in
/// normalized form and may not pass through a symlink.
fn packaged_file(dir: &Path, listed: &str) -> Result<PathBuf> {
    let normalized = normalize_relative(listed)
        .map_err(|reason| anyhow!("manifest path {listed:?} rejected: {reason}"))?;
    if normalized != listed {
        bail!("manifest path {listed:?} is not normalized (expected {normalized:?})");
    }
    let mut path = dir.to_path_buf();
    for part in normalized.split('/') {
        path.push(part);
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("read packaged file {}", path.display()))?;
        if meta.file_type().is_symlink() {
            bail!("manifest path {listed:?} goes through a symlink");
        }
    }
    Ok(path)
}
