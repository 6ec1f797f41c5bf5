//! Installs a pinned prebuilt `llama-server` into the data directory.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zip::ZipArchive;

use super::download::{DownloadProgress, download_file};
use super::error::InferenceError;
use crate::util::{now_utc_string, read_json_optional, sha256_file, write_json_pretty};

pub const ENGINE_RELEASE: &str = "b4967";
const RELEASE_BASE_URL: &str = "https://github.com/ggml-org/llama.cpp/releases/download";
const VERSION_MARKER: &str = "VERSION";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineAsset {
    pub release: String,
    pub name: String,
}

impl EngineAsset {
    pub fn url(&self) -> String {
        format!("{RELEASE_BASE_URL}/{}/{}", self.release, self.name)
    }
}

/// Picks the prebuilt archive for an OS/architecture pair as reported by
/// `std::env::consts`.
pub fn asset_for(os: &str, arch: &str) -> Result<EngineAsset, InferenceError> {
    let platform = match (os, arch) {
        ("macos", "aarch64") => "macos-arm64",
        ("macos", "x86_64") => "macos-x64",
        ("linux", "x86_64") => "ubuntu-x64",
        ("windows", "x86_64") => "win-cpu-x64",
        _ => {
            return Err(InferenceError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            });
        }
    };
    Ok(EngineAsset {
        release: ENGINE_RELEASE.to_string(),
        name: format!("llama-{ENGINE_RELEASE}-bin-{platform}.zip"),
    })
}

pub fn executable_name() -> &'static str {
    if cfg!(windows) {
        "llama-server.exe"
    } else {
        "llama-server"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMarker {
    pub version: String,
    pub asset: String,
    pub archive_sha256: String,
    pub installed_at: String,
    pub executable: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EngineInstaller {
    dir: PathBuf,
}

impl EngineInstaller {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(VERSION_MARKER)
    }

    /// Path of the installed executable when the pinned release is present.
    pub fn installed(&self) -> Option<PathBuf> {
        let marker = read_json_optional::<VersionMarker>(&self.marker_path()).ok()??;
        if marker.version != ENGINE_RELEASE || !marker.executable.is_file() {
            return None;
        }
        Some(marker.executable)
    }

    /// Downloads and unpacks the pinned release unless it is already
    /// installed. Returns the executable path.
    pub fn ensure(
        &self,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<PathBuf, InferenceError> {
        if let Some(executable) = self.installed() {
            return Ok(executable);
        }

        let asset = asset_for(std::env::consts::OS, std::env::consts::ARCH)?;
        let archive_path = self.dir.join(&asset.name);
        download_file(&asset.url(), &archive_path, on_progress)?;
        let marker = self.install_archive(&asset, &archive_path)?;
        if let Err(err) = fs::remove_file(&archive_path) {
            warn!(path = %archive_path.display(), error = %err, "failed to remove engine archive");
        }
        Ok(marker.executable)
    }

    /// Extracts `archive_path` into a per-release directory, makes the nested
    /// server executable runnable and writes the version marker.
    pub fn install_archive(
        &self,
        asset: &EngineAsset,
        archive_path: &Path,
    ) -> Result<VersionMarker, InferenceError> {
        let archive_sha256 =
            sha256_file(archive_path).map_err(|err| InferenceError::Archive(format!("{err:#}")))?;

        let target = self.dir.join(&asset.release);
        if target.exists() {
            fs::remove_dir_all(&target)
                .map_err(|err| InferenceError::io(format!("clear {}", target.display()), err))?;
        }
        fs::create_dir_all(&target)
            .map_err(|err| InferenceError::io(format!("create {}", target.display()), err))?;

        let file = File::open(archive_path)
            .map_err(|err| InferenceError::io(format!("open {}", archive_path.display()), err))?;
        let mut archive =
            ZipArchive::new(file).map_err(|err| InferenceError::Archive(err.to_string()))?;
        archive
            .extract(&target)
            .map_err(|err| InferenceError::Archive(err.to_string()))?;

        let executable = find_executable(&target, executable_name())?.ok_or_else(|| {
            InferenceError::Archive(format!(
                "{} not found inside {}",
                executable_name(),
                asset.name
            ))
        })?;
        mark_executable(&executable)?;

        let marker = VersionMarker {
            version: asset.release.clone(),
            asset: asset.name.clone(),
            archive_sha256,
            installed_at: now_utc_string(),
            executable,
        };
        write_json_pretty(&self.marker_path(), &marker)
            .map_err(|err| InferenceError::Archive(format!("{err:#}")))?;
        info!(
            version = %marker.version,
            executable = %marker.executable.display(),
            "inference engine installed"
        );
        Ok(marker)
    }
}

/// Breadth-first search, so the shallowest match wins.
pub fn find_executable(root: &Path, name: &str) -> Result<Option<PathBuf>, InferenceError> {
    let mut pending = vec![root.to_path_buf()];
    while !pending.is_empty() {
        let mut next = Vec::new();
        for dir in pending {
            let mut entries = fs::read_dir(&dir)
                .map_err(|err| InferenceError::io(format!("list {}", dir.display()), err))?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect::<Vec<PathBuf>>();
            entries.sort();

            for path in entries {
                if path.is_dir() {
                    next.push(path);
                } else if path.file_name().and_then(|value| value.to_str()) == Some(name) {
                    return Ok(Some(path));
                }
            }
        }
        pending = next;
    }
    Ok(None)
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<(), InferenceError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|err| InferenceError::io(format!("chmod {}", path.display()), err))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<(), InferenceError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    #[test]
    fn assets_cover_supported_platforms() {
        let linux = asset_for("linux", "x86_64").unwrap();
        assert_eq!(linux.name, format!("llama-{ENGINE_RELEASE}-bin-ubuntu-x64.zip"));
        assert!(linux.url().ends_with(&linux.name));
        assert!(asset_for("macos", "aarch64").is_ok());
        assert!(matches!(
            asset_for("freebsd", "riscv64"),
            Err(InferenceError::UnsupportedPlatform { .. })
        ));
    }

    #[test]
    fn install_finds_nested_executable_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("engine.zip");
        {
            let file = File::create(&archive_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = SimpleFileOptions::default();
            writer.add_directory("build/bin/", options).unwrap();
            writer
                .start_file(format!("build/bin/{}", executable_name()), options)
                .unwrap();
            writer.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
            writer.start_file("build/bin/libggml.so", options).unwrap();
            writer.write_all(b"lib").unwrap();
            writer.finish().unwrap();
        }

        let installer = EngineInstaller::new(dir.path().join("engine"));
        assert_eq!(installer.installed(), None);

        let asset = EngineAsset {
            release: ENGINE_RELEASE.to_string(),
            name: "engine.zip".to_string(),
        };
        let marker = installer.install_archive(&asset, &archive_path).unwrap();
        assert!(marker.executable.ends_with(format!("build/bin/{}", executable_name())));
        assert_eq!(marker.archive_sha256.len(), 64);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&marker.executable).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        assert_eq!(installer.installed(), Some(marker.executable.clone()));
        let mut never_called = |_: DownloadProgress| panic!("no download expected");
        assert_eq!(installer.ensure(&mut never_called).unwrap(), marker.executable);
    }
}
