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

//! Updater state remembered between runs

use crate::error::{Result, UpdaterError};
use crate::session::{SessionOutcome, UpdateMode, UpdateSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUpdate {
    /// Version that was applied, if it was known
    pub version: Option<String>,
    pub mode: UpdateMode,
    pub outcome: SessionOutcome,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterState {
    /// Last time a session resolved the published version
    pub last_check_at: Option<DateTime<Utc>>,

    /// Latest published version seen
    pub last_remote_version: Option<String>,

    /// Serial port of the last device updated over USB
    pub last_port: Option<String>,

    /// Address of the last device reached over the network
    pub last_address: Option<String>,

    /// Last session that put firmware on a device
    pub last_update: Option<LastUpdate>,

    /// Consecutive sessions that ended in failure
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl UpdaterState {
    /// Fold a finished session into the state
    pub fn record(&mut self, session: &UpdateSession, now: DateTime<Utc>) {
        if let Some(remote) = &session.remote_version {
            self.last_check_at = Some(now);
            self.last_remote_version = Some(remote.to_string());
        }

        if let Some(device) = &session.device {
            if let Some(port) = device.serial_port() {
                self.last_port = Some(port.to_owned());
            }
            if let Some(host) = device.host() {
                self.last_address = Some(host.to_owned());
            }
        }

        if session.failure().is_some() {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            return;
        }
        self.consecutive_failures = 0;

        if let Some(outcome) = session.outcome()
            && outcome != SessionOutcome::UpToDate
        {
            self.last_update = Some(LastUpdate {
                version: session.remote_version.as_ref().map(ToString::to_string),
                mode: session.request_mode,
                outcome,
                at: now,
            });
        }
    }
}

/// Read the state file; a missing file is an empty state
pub fn load_state(path: &Path) -> Result<UpdaterState> {
    if !path.exists() {
        return Ok(UpdaterState::default());
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        UpdaterError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to parse state {}: {e}", path.display()),
        ))
    })
}

pub fn save_state(path: &Path, state: &UpdaterState) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(state)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::error::ErrorKind;
    use crate::session::{SessionRequest, SessionState};
    use crate::version::Version;

    fn finished(request: &SessionRequest, state: SessionState) -> UpdateSession {
        UpdateSession::new(1, request)
            .with_remote_version(Some(Version::parse("3.2.0")))
            .with_device(Some(Device::serial("COM5")))
            .transition(state)
    }

    #[test]
    fn test_flash_is_recorded() {
        let session = finished(
            &SessionRequest::usb(),
            SessionState::Completed {
                outcome: SessionOutcome::Flashed,
            },
        );
        let now = Utc::now();
        let mut state = UpdaterState::default();
        state.record(&session, now);

        assert_eq!(state.last_remote_version.as_deref(), Some("3.2.0"));
        assert_eq!(state.last_port.as_deref(), Some("COM5"));
        let last = state.last_update.unwrap();
        assert_eq!(last.version.as_deref(), Some("3.2.0"));
        assert_eq!(last.outcome, SessionOutcome::Flashed);
        assert_eq!(last.at, now);
    }

    #[test]
    fn test_up_to_date_does_not_count_as_update() {
        let session = finished(
            &SessionRequest::usb(),
            SessionState::Completed {
                outcome: SessionOutcome::UpToDate,
            },
        );
        let mut state = UpdaterState::default();
        state.record(&session, Utc::now());
        assert!(state.last_update.is_none());
        assert!(state.last_check_at.is_some());
    }

    #[test]
    fn test_failures_accumulate_and_reset() {
        let failed = finished(
            &SessionRequest::usb(),
            SessionState::Failed {
                kind: ErrorKind::FlashTool,
                message: "Flash tool failed".to_owned(),
                detail: None,
            },
        );
        let mut state = UpdaterState::default();
        state.record(&failed, Utc::now());
        state.record(&failed, Utc::now());
        assert_eq!(state.consecutive_failures, 2);

        let ok = finished(
            &SessionRequest::usb(),
            SessionState::Completed {
                outcome: SessionOutcome::Flashed,
            },
        );
        state.record(&ok, Utc::now());
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("updater_state.json");

        let state = UpdaterState {
            last_remote_version: Some("3.2.0".to_owned()),
            last_address: Some("macropad.local".to_owned()),
            consecutive_failures: 1,
            ..Default::default()
        };
        save_state(&path, &state).unwrap();

        assert!(!path.with_extension("tmp").exists());
        assert_eq!(load_state(&path).unwrap(), state);
    }

    #[test]
    fn test_missing_state_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = load_state(&dir.path().join("absent.json")).unwrap();
        assert_eq!(state, UpdaterState::default());
    }

    #[test]
    fn test_corrupt_state_is_io_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{ not json").unwrap();
        assert!(matches!(load_state(file.path()), Err(UpdaterError::Io(_))));
    }
}
