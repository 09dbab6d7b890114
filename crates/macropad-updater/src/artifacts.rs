// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of the FluxION Macropad Updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Firmware artifact download with staging and SHA256 verification
//!
//! Artifacts are streamed into `<file>.part` staging files. Only when all four
//! are staged are they renamed to their final names, so the flasher never sees
//! a partial image.

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use crate::session::CancelSignal;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub(crate) const USER_AGENT: &str = concat!("macropad-updater/", env!("CARGO_PKG_VERSION"));
const STAGING_SUFFIX: &str = "part";
const PREVIOUS_SUFFIX: &str = "prev";

/// The four components of an ESP32-S3 Arduino image, in flashing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Bootloader,
    PartitionTable,
    BootSelector,
    Application,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        Self::Bootloader,
        Self::PartitionTable,
        Self::BootSelector,
        Self::Application,
    ];

    /// Fixed load address in flash
    pub const fn offset(self) -> u32 {
        match self {
            Self::Bootloader => 0x0000,
            Self::PartitionTable => 0x8000,
            Self::BootSelector => 0xE000,
            Self::Application => 0x10000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bootloader => "bootloader",
            Self::PartitionTable => "partitions",
            Self::BootSelector => "boot_app0",
            Self::Application => "app",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Offset formatted the way the flashing tool expects it
pub fn format_offset(offset: u32) -> String {
    format!("0x{offset:X}")
}

/// One remote artifact of a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub url: String,
    /// File name used for both the checksum manifest lookup and the remote path
    pub remote_file: String,
    pub local_file: String,
}

impl Artifact {
    pub fn offset(&self) -> u32 {
        self.kind.offset()
    }
}

/// The complete remote image, always in [`ArtifactKind::ALL`] order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    artifacts: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        config.validate()?;
        let base = config.firmware_base_url.trim_end_matches('/');

        let artifacts = ArtifactKind::ALL
            .iter()
            .filter_map(|kind| config.artifacts.iter().find(|spec| spec.kind == *kind))
            .map(|spec| Artifact {
                kind: spec.kind,
                url: format!("{base}/{}", spec.remote_file),
                remote_file: spec.remote_file.clone(),
                local_file: spec.local_file.clone(),
            })
            .collect();

        Ok(Self { artifacts })
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub(crate) fn len(&self) -> usize {
        self.artifacts.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub size: u64,
    /// Lowercase hex SHA256 of the file content
    pub sha256: String,
}

/// Downloaded, committed artifacts of one release. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifactSet {
    artifacts: BTreeMap<ArtifactKind, LocalArtifact>,
}

impl LocalArtifactSet {
    pub fn get(&self, kind: ArtifactKind) -> Option<&LocalArtifact> {
        self.artifacts.get(&kind)
    }

    /// `(offset, path)` pairs in flashing order
    pub fn flash_plan(&self) -> Vec<(u32, PathBuf)> {
        self.artifacts
            .values()
            .map(|a| (a.kind.offset(), a.path.clone()))
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.artifacts.values().map(|a| a.size).sum()
    }
}

/// Download progress across the whole set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub artifact: ArtifactKind,
    pub index: usize,
    pub count: usize,
    pub bytes: u64,
    pub total: Option<u64>,
    /// 0.0..=1.0 over the whole set; each artifact owns an equal share
    pub fraction: f32,
}

#[derive(Debug)]
struct StagedArtifact {
    kind: ArtifactKind,
    part_path: PathBuf,
    final_path: PathBuf,
    size: u64,
    sha256: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    client: reqwest::Client,
    dir: PathBuf,
    checksums_url: Option<String>,
}

impl ArtifactStore {
    pub fn new(config: &UpdaterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.http_timeout())
            .timeout(config.download_timeout())
            .build()
            .map_err(|e| UpdaterError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            dir: config.firmware_dir.clone(),
            checksums_url: config.checksums_url.clone(),
        })
    }

    /// Download every artifact of `set`. On any failure nothing is committed and
    /// all staging files are removed.
    pub async fn download<F>(
        &self,
        set: &ArtifactSet,
        cancel: &CancelSignal,
        mut on_progress: F,
    ) -> Result<LocalArtifactSet>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut parts: Vec<PathBuf> = Vec::new();
        let staged = self
            .stage_all(set, cancel, &mut on_progress, &mut parts)
            .await;

        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                tracing::warn!("Firmware download aborted: {e}");
                discard(&parts).await;
                return Err(e);
            }
        };

        commit(staged).await
    }

    async fn stage_all<F>(
        &self,
        set: &ArtifactSet,
        cancel: &CancelSignal,
        on_progress: &mut F,
        parts: &mut Vec<PathBuf>,
    ) -> Result<Vec<StagedArtifact>>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let expected = match &self.checksums_url {
            Some(url) => Some(self.fetch_checksums(url, cancel).await?),
            None => None,
        };

        let mut staged = Vec::with_capacity(set.len());
        for (index, artifact) in set.artifacts().iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(UpdaterError::Cancelled);
            }

            let item = self
                .stage_one(artifact, index, set.len(), cancel, on_progress, parts)
                .await?;

            if let Some(expected) = &expected {
                let want = expected.get(&artifact.remote_file).ok_or_else(|| {
                    UpdaterError::DownloadIntegrity {
                        artifact: artifact.kind.to_string(),
                        reason: format!("SHA256SUMS has no entry for {}", artifact.remote_file),
                    }
                })?;
                if *want != item.sha256 {
                    return Err(UpdaterError::ChecksumMismatch {
                        artifact: artifact.kind.to_string(),
                        expected: want.clone(),
                        actual: item.sha256,
                    });
                }
            }

            staged.push(item);
        }
        Ok(staged)
    }

    async fn stage_one<F>(
        &self,
        artifact: &Artifact,
        index: usize,
        count: usize,
        cancel: &CancelSignal,
        on_progress: &mut F,
        parts: &mut Vec<PathBuf>,
    ) -> Result<StagedArtifact>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        tracing::info!("Downloading {} from {}", artifact.kind, artifact.url);

        let response = tokio::select! {
            response = self.client.get(&artifact.url).send() => response
                .map_err(|e| UpdaterError::Network(format!("{}: {e}", artifact.url)))?,
            () = cancel.cancelled() => return Err(UpdaterError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(UpdaterError::DownloadIntegrity {
                artifact: artifact.kind.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let total = response.content_length();
        let final_path = self.dir.join(&artifact.local_file);
        let part_path = suffixed(&final_path, STAGING_SUFFIX);
        parts.push(part_path.clone());

        let mut file = tokio::fs::File::create(&part_path).await?;
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                () = cancel.cancelled() => return Err(UpdaterError::Cancelled),
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| UpdaterError::DownloadIntegrity {
                artifact: artifact.kind.to_string(),
                reason: format!("transfer interrupted: {e}"),
            })?;

            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            received += chunk.len() as u64;

            if let Some(total) = total.filter(|t| *t > 0) {
                let within = (received as f32 / total as f32).min(1.0);
                on_progress(progress(artifact.kind, index, count, received, Some(total), within));
            }
        }
        file.flush().await?;
        drop(file);

        if let Some(total) = total
            && received != total
        {
            return Err(UpdaterError::DownloadIntegrity {
                artifact: artifact.kind.to_string(),
                reason: format!("short read: {received} of {total} bytes"),
            });
        }
        if received == 0 {
            return Err(UpdaterError::DownloadIntegrity {
                artifact: artifact.kind.to_string(),
                reason: "empty artifact".to_owned(),
            });
        }

        on_progress(progress(artifact.kind, index, count, received, total, 1.0));
        tracing::debug!("Staged {} ({received} bytes)", artifact.kind);

        Ok(StagedArtifact {
            kind: artifact.kind,
            part_path,
            final_path,
            size: received,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }

    async fn fetch_checksums(
        &self,
        url: &str,
        cancel: &CancelSignal,
    ) -> Result<HashMap<String, String>> {
        let response = tokio::select! {
            response = self.client.get(url).send() => response
                .map_err(|e| UpdaterError::Network(format!("{url}: {e}")))?,
            () = cancel.cancelled() => return Err(UpdaterError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(UpdaterError::DownloadIntegrity {
                artifact: "SHA256SUMS".to_owned(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let content = response
            .text()
            .await
            .map_err(|e| UpdaterError::Network(format!("Failed to read SHA256SUMS: {e}")))?;
        Ok(parse_sha256sums(&content))
    }
}

fn progress(
    artifact: ArtifactKind,
    index: usize,
    count: usize,
    bytes: u64,
    total: Option<u64>,
    within: f32,
) -> DownloadProgress {
    let share = 1.0 / count.max(1) as f32;
    DownloadProgress {
        artifact,
        index,
        count,
        bytes,
        total,
        fraction: ((index as f32 + within) * share).min(1.0),
    }
}

fn suffixed(final_path: &Path, suffix: &str) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

async fn discard(parts: &[PathBuf]) {
    for part in parts {
        match tokio::fs::remove_file(part).await {
            Ok(()) => tracing::debug!("Removed {}", part.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {e}", part.display()),
        }
    }
}

/// Files moved out of the way by a commit, as `(final, set aside)` pairs
type SetAside = Vec<(PathBuf, PathBuf)>;

/// Rename every staged file to its final name.
///
/// Files of the previous release are set aside first and put back if any rename
/// fails, so the directory holds either the old release or the new one.
async fn commit(staged: Vec<StagedArtifact>) -> Result<LocalArtifactSet> {
    let mut set_aside: SetAside = Vec::new();
    let mut committed: Vec<PathBuf> = Vec::with_capacity(staged.len());

    if let Err(e) = swap_in(&staged, &mut set_aside, &mut committed).await {
        tracing::error!("Failed to commit firmware artifacts: {e}");
        discard(&committed).await;
        restore(&set_aside).await;
        let parts: Vec<PathBuf> = staged.iter().map(|s| s.part_path.clone()).collect();
        discard(&parts).await;
        return Err(e.into());
    }

    let previous: Vec<PathBuf> = set_aside.into_iter().map(|(_, prev)| prev).collect();
    discard(&previous).await;

    let artifacts: BTreeMap<ArtifactKind, LocalArtifact> = staged
        .into_iter()
        .map(|item| {
            (
                item.kind,
                LocalArtifact {
                    kind: item.kind,
                    path: item.final_path,
                    size: item.size,
                    sha256: item.sha256,
                },
            )
        })
        .collect();

    tracing::info!("Committed {} firmware artifacts", artifacts.len());
    Ok(LocalArtifactSet { artifacts })
}

async fn swap_in(
    staged: &[StagedArtifact],
    set_aside: &mut SetAside,
    committed: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    for item in staged {
        if tokio::fs::try_exists(&item.final_path).await? {
            let previous = suffixed(&item.final_path, PREVIOUS_SUFFIX);
            tokio::fs::rename(&item.final_path, &previous).await?;
            set_aside.push((item.final_path.clone(), previous));
        }
    }
    for item in staged {
        tokio::fs::rename(&item.part_path, &item.final_path).await?;
        committed.push(item.final_path.clone());
    }
    Ok(())
}

async fn restore(set_aside: &SetAside) {
    for (final_path, previous) in set_aside {
        if let Err(e) = tokio::fs::rename(previous, final_path).await {
            tracing::warn!(
                "Failed to restore {} from {}: {e}",
                final_path.display(),
                previous.display()
            );
        }
    }
}

/// Parse a `SHA256SUMS` manifest into file name -> lowercase digest
pub fn parse_sha256sums(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let hash = parts.next()?;
            // `sha256sum -b` prefixes binary-mode names with '*'
            let name = parts.next()?.trim_start_matches('*');
            Some((name.to_owned(), hash.to_lowercase()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::cancel_pair;
    use mockito::Server;
    use tempfile::TempDir;

    fn sha256_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn config_for(server_url: &str, dir: &Path) -> UpdaterConfig {
        UpdaterConfig {
            firmware_base_url: format!("{server_url}/build"),
            firmware_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_fixed_offsets() {
        assert_eq!(ArtifactKind::Bootloader.offset(), 0x0000);
        assert_eq!(ArtifactKind::PartitionTable.offset(), 0x8000);
        assert_eq!(ArtifactKind::BootSelector.offset(), 0xE000);
        assert_eq!(ArtifactKind::Application.offset(), 0x10000);
        assert_eq!(format_offset(0x10000), "0x10000");
        assert_eq!(format_offset(0), "0x0");
    }

    #[test]
    fn test_artifact_set_is_ordered_by_offset() {
        let mut config = UpdaterConfig::default();
        config.artifacts.reverse();
        let set = ArtifactSet::from_config(&config).unwrap();

        let kinds: Vec<ArtifactKind> = set.artifacts().iter().map(|a| a.kind).collect();
        assert_eq!(kinds, ArtifactKind::ALL.to_vec());
        assert!(set.artifacts()[3].url.ends_with("/main.ino.bin"));
    }

    #[test]
    fn test_parse_sha256sums() {
        let content = "abc123  bootloader.bin\nDEF456 *main.ino.bin\n\nbroken";
        let sums = parse_sha256sums(content);
        assert_eq!(sums.get("bootloader.bin").map(String::as_str), Some("abc123"));
        assert_eq!(sums.get("main.ino.bin").map(String::as_str), Some("def456"));
        assert_eq!(sums.len(), 2);
    }

    #[test]
    fn test_suffixed_paths() {
        assert_eq!(
            suffixed(Path::new("/fw/firmware.bin"), STAGING_SUFFIX),
            PathBuf::from("/fw/firmware.bin.part")
        );
        assert_eq!(
            suffixed(Path::new("/fw/firmware.bin"), PREVIOUS_SUFFIX),
            PathBuf::from("/fw/firmware.bin.prev")
        );
    }

    fn staged_in(
        dir: &Path,
        kind: ArtifactKind,
        local: &str,
        content: Option<&str>,
    ) -> StagedArtifact {
        let final_path = dir.join(local);
        let part_path = suffixed(&final_path, STAGING_SUFFIX);
        if let Some(content) = content {
            std::fs::write(&part_path, content).unwrap();
        }
        StagedArtifact {
            kind,
            part_path,
            final_path,
            size: content.map_or(0, |c| c.len() as u64),
            sha256: sha256_hex(content.unwrap_or_default().as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_previous_release() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bootloader.bin"), "old boot").unwrap();
        std::fs::write(dir.path().join("firmware.bin"), "old app").unwrap();

        // The boot selector never made it to staging, so its rename fails
        let dir_path = dir.path();
        let staged = vec![
            staged_in(dir_path, ArtifactKind::Bootloader, "bootloader.bin", Some("new boot")),
            staged_in(dir_path, ArtifactKind::PartitionTable, "partitions.bin", Some("parts")),
            staged_in(dir_path, ArtifactKind::BootSelector, "boot_app0.bin", None),
            staged_in(dir_path, ArtifactKind::Application, "firmware.bin", Some("new app")),
        ];

        assert!(commit(staged).await.is_err());
        assert_eq!(files_in(dir.path()), vec!["bootloader.bin", "firmware.bin"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("bootloader.bin")).unwrap(),
            "old boot"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("firmware.bin")).unwrap(),
            "old app"
        );
    }

    #[tokio::test]
    async fn test_commit_replaces_previous_release() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("firmware.bin"), "old app").unwrap();

        let staged = vec![
            staged_in(dir.path(), ArtifactKind::Bootloader, "bootloader.bin", Some("boot")),
            staged_in(dir.path(), ArtifactKind::Application, "firmware.bin", Some("new app")),
        ];

        let local = commit(staged).await.unwrap();
        assert_eq!(files_in(dir.path()), vec!["bootloader.bin", "firmware.bin"]);
        let app = local.get(ArtifactKind::Application).unwrap();
        assert_eq!(std::fs::read_to_string(&app.path).unwrap(), "new app");
    }

    #[tokio::test]
    async fn test_download_all_artifacts() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = config_for(&server.url(), dir.path());

        let mut mocks = Vec::new();
        for spec in &config.artifacts {
            mocks.push(
                server
                    .mock("GET", format!("/build/{}", spec.remote_file).as_str())
                    .with_status(200)
                    .with_body(format!("{}-image", spec.kind))
                    .create_async()
                    .await,
            );
        }

        let store = ArtifactStore::new(&config).unwrap();
        let set = ArtifactSet::from_config(&config).unwrap();
        let mut fractions = Vec::new();
        let local = store
            .download(&set, &CancelSignal::never(), |p| fractions.push(p.fraction))
            .await
            .unwrap();

        for mock in mocks {
            mock.assert_async().await;
        }

        let plan = local.flash_plan();
        assert_eq!(
            plan.iter().map(|(o, _)| *o).collect::<Vec<_>>(),
            vec![0x0000, 0x8000, 0xE000, 0x10000]
        );
        assert_eq!(
            files_in(dir.path()),
            vec!["boot_app0.bin", "bootloader.bin", "firmware.bin", "partitions.bin"]
        );

        let app = local.get(ArtifactKind::Application).unwrap();
        assert_eq!(std::fs::read(&app.path).unwrap(), b"app-image");
        assert_eq!(app.sha256, sha256_hex(b"app-image"));

        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert!((fractions.last().copied().unwrap() - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_failed_artifact_leaves_no_files() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = config_for(&server.url(), dir.path());

        let _boot = server
            .mock("GET", "/build/bootloader.bin")
            .with_status(200)
            .with_body("boot")
            .create_async()
            .await;
        let _parts = server
            .mock("GET", "/build/partitions.bin")
            .with_status(200)
            .with_body("parts")
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/build/boot_app0.bin")
            .with_status(404)
            .create_async()
            .await;

        let store = ArtifactStore::new(&config).unwrap();
        let set = ArtifactSet::from_config(&config).unwrap();
        let err = store
            .download(&set, &CancelSignal::never(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, UpdaterError::DownloadIntegrity { .. }));
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_aborts() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&server.url(), dir.path());
        config.checksums_url = Some(format!("{}/SHA256SUMS", server.url()));

        let sums = format!(
            "{}  bootloader.bin\n{}  partitions.bin\n",
            sha256_hex(b"boot"),
            sha256_hex(b"something else")
        );
        let _sums = server
            .mock("GET", "/SHA256SUMS")
            .with_status(200)
            .with_body(sums)
            .create_async()
            .await;
        let _boot = server
            .mock("GET", "/build/bootloader.bin")
            .with_status(200)
            .with_body("boot")
            .create_async()
            .await;
        let _parts = server
            .mock("GET", "/build/partitions.bin")
            .with_status(200)
            .with_body("parts")
            .create_async()
            .await;

        let store = ArtifactStore::new(&config).unwrap();
        let set = ArtifactSet::from_config(&config).unwrap();
        let err = store
            .download(&set, &CancelSignal::never(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, UpdaterError::ChecksumMismatch { .. }));
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_download_stops_early() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = config_for(&server.url(), dir.path());

        let boot = server
            .mock("GET", "/build/bootloader.bin")
            .with_status(200)
            .with_body("boot")
            .expect(0)
            .create_async()
            .await;

        let (handle, signal) = cancel_pair();
        handle.cancel();

        let store = ArtifactStore::new(&config).unwrap();
        let set = ArtifactSet::from_config(&config).unwrap();
        let err = store.download(&set, &signal, |_| {}).await.unwrap_err();

        assert!(matches!(err, UpdaterError::Cancelled));
        boot.assert_async().await;
        assert!(files_in(dir.path()).is_empty());
    }
}
