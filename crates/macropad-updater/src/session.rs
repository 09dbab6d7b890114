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

//! Update session value and its state machine vocabulary
//!
//! An [`UpdateSession`] is never shared mutably: each orchestrator phase takes
//! the session by value and returns the next one.

use crate::device::Device;
use crate::error::ErrorKind;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Wired: serial discovery + flashing tool
    #[default]
    Usb,
    /// Network: address scan + OTA arm endpoint
    Ota,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => f.write_str("usb"),
            Self::Ota => f.write_str("ota"),
        }
    }
}

/// What the operator asked for when starting a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    pub mode: UpdateMode,
    /// Apply the release even when the device already runs it
    pub force: bool,
    /// Manually chosen serial port, skips serial discovery
    pub port: Option<String>,
    /// Manually chosen device address, skips the network scan
    pub address: Option<String>,
}

impl SessionRequest {
    pub fn usb() -> Self {
        Self {
            mode: UpdateMode::Usb,
            ..Default::default()
        }
    }

    pub fn ota() -> Self {
        Self {
            mode: UpdateMode::Ota,
            ..Default::default()
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    UpToDate,
    UpdateAvailable,
}

/// How a successful session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Device already runs the latest release, nothing applied
    UpToDate,
    /// Erased and written over the wire
    Flashed,
    /// Device accepted the arm request; transfer completion is not observed
    OtaArmed,
    /// Image pushed and the device reported the new version afterwards
    OtaConfirmed,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::UpToDate => "up to date",
            Self::Flashed => "flashed",
            Self::OtaArmed => "OTA armed",
            Self::OtaConfirmed => "OTA confirmed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    ResolvingVersions,
    LocatingDevice,
    Gated { gate: Gate },
    Downloading,
    Flashing,
    ArmingOta,
    Completed { outcome: SessionOutcome },
    /// Discovery found nothing; the operator may retry or pick a port
    DeviceNotFound,
    Failed {
        kind: ErrorKind,
        message: String,
        /// Captured tool output or other diagnostic text
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::DeviceNotFound | Self::Failed { .. }
        )
    }

    /// Position in the phase order, used to reject out-of-order transitions
    fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::ResolvingVersions => 1,
            Self::LocatingDevice => 2,
            Self::Gated { .. } => 3,
            Self::Downloading => 4,
            Self::Flashing | Self::ArmingOta => 5,
            Self::Completed { .. } | Self::DeviceNotFound | Self::Failed { .. } => 6,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::ResolvingVersions => Phase::ResolvingVersions,
            Self::LocatingDevice => Phase::LocatingDevice,
            Self::Gated { .. } => Phase::Gated,
            Self::Downloading => Phase::Downloading,
            Self::Flashing => Phase::Flashing,
            Self::ArmingOta => Phase::ArmingOta,
            Self::Completed { .. } => Phase::Completed,
            Self::DeviceNotFound => Phase::DeviceNotFound,
            Self::Failed { .. } => Phase::Failed,
        }
    }
}

/// Flat phase tag carried by progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    ResolvingVersions,
    LocatingDevice,
    Gated,
    Downloading,
    Flashing,
    ArmingOta,
    Completed,
    DeviceNotFound,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSession {
    pub id: u64,
    pub request_mode: UpdateMode,
    pub force: bool,
    pub state: SessionState,
    /// 0-100, never decreases within a session
    pub progress: u8,
    /// `None` when the version resource could not be fetched
    pub remote_version: Option<Version>,
    pub device: Option<Device>,
}

impl UpdateSession {
    pub fn new(id: u64, request: &SessionRequest) -> Self {
        Self {
            id,
            request_mode: request.mode,
            force: request.force,
            state: SessionState::Idle,
            progress: 0,
            remote_version: None,
            device: None,
        }
    }

    /// Move to `state`. Terminal states accept nothing; other moves must go forward.
    pub fn transition(mut self, state: SessionState) -> Self {
        debug_assert!(
            !self.state.is_terminal(),
            "session {} already terminal ({:?})",
            self.id,
            self.state
        );
        debug_assert!(
            state.rank() > self.state.rank() || state.is_terminal(),
            "session {} cannot go from {:?} to {:?}",
            self.id,
            self.state,
            state
        );
        self.state = state;
        self
    }

    pub fn with_progress(mut self, percent: u8) -> Self {
        self.progress = self.progress.max(percent.min(100));
        self
    }

    pub fn with_remote_version(mut self, version: Option<Version>) -> Self {
        self.remote_version = version;
        self
    }

    pub fn with_device(mut self, device: Option<Device>) -> Self {
        self.device = device;
        self
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        match &self.state {
            SessionState::Completed { outcome } => Some(*outcome),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<ErrorKind> {
        match &self.state {
            SessionState::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Gate decision after discovery.
///
/// Up to date only when both versions are known and the device is not older.
/// An unknown device version never blocks an update.
pub fn decide_gate(remote: Option<&Version>, device: Option<&Version>) -> Gate {
    match (remote, device) {
        (Some(remote), Some(local)) if !crate::version::is_newer(remote, local) => Gate::UpToDate,
        _ => Gate::UpdateAvailable,
    }
}

/// Owner side of a session's cancellation signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observer side, cloned into every phase that can stop early
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the value observable after the sender is gone
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if it never is
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
