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

//! Error types for the updater crate

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("network unavailable: {0}")]
    Network(String),

    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("serial error: {0}")]
    Serial(String),

    #[error("serial connection is not open")]
    NotOpen,

    #[error("download failed for {artifact}: {reason}")]
    DownloadIntegrity { artifact: String, reason: String },

    #[error("checksum mismatch for {artifact}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("flash tool failed ({status}): {output}")]
    FlashTool { status: String, output: String },

    #[error("an update session is already active (session {active})")]
    Busy { active: u64 },

    #[error("session cancelled")]
    Cancelled,
}

impl UpdaterError {
    /// Taxonomy kind surfaced to listeners in terminal events
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
            Self::Network(_) => ErrorKind::Network,
            Self::DeviceUnreachable(_) => ErrorKind::DeviceUnreachable,
            Self::Serial(_) => ErrorKind::Serial,
            Self::NotOpen => ErrorKind::NotOpen,
            Self::DownloadIntegrity { .. } | Self::ChecksumMismatch { .. } => {
                ErrorKind::DownloadIntegrity
            }
            Self::FlashTool { .. } => ErrorKind::FlashTool,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Diagnostic text to keep alongside the operator message
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::FlashTool { output, .. } if !output.is_empty() => Some(output.clone()),
            _ => None,
        }
    }

    /// Operator-facing message for a session that ended with this error
    pub fn operator_message(&self) -> String {
        match self {
            Self::Network(detail) => format!("Network unavailable: {detail}"),
            Self::DeviceUnreachable(detail) => format!("Device did not respond: {detail}"),
            Self::Serial(detail) => format!("Serial port error: {detail}"),
            Self::NotOpen => "Serial port is not connected".to_owned(),
            Self::DownloadIntegrity { artifact, reason } => {
                format!("Firmware download failed ({artifact}): {reason}")
            }
            Self::ChecksumMismatch { artifact, .. } => {
                format!("Firmware download failed ({artifact}): checksum mismatch")
            }
            Self::FlashTool { status, .. } => format!("Flash tool failed ({status})"),
            Self::Busy { .. } => "Another update is already running".to_owned(),
            Self::Cancelled => "Update cancelled".to_owned(),
            Self::Config(detail) => format!("Configuration error: {detail}"),
            Self::Io(e) => format!("Local storage error: {e}"),
            Self::Json(e) => format!("Local state error: {e}"),
        }
    }
}

/// Error taxonomy carried by terminal progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    DeviceUnreachable,
    DeviceNotFound,
    Serial,
    NotOpen,
    DownloadIntegrity,
    FlashTool,
    Busy,
    Cancelled,
    Config,
    Io,
}

impl ErrorKind {
    /// Whether starting the session again may succeed without operator action
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Serial | Self::DownloadIntegrity | Self::Busy
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::DeviceUnreachable => "device-unreachable",
            Self::DeviceNotFound => "device-not-found",
            Self::Serial => "serial",
            Self::NotOpen => "not-open",
            Self::DownloadIntegrity => "download-integrity",
            Self::FlashTool => "flash-tool",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, UpdaterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            UpdaterError::Network("timeout".to_owned()).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            UpdaterError::ChecksumMismatch {
                artifact: "app".to_owned(),
                expected: "aa".to_owned(),
                actual: "bb".to_owned(),
            }
            .kind(),
            ErrorKind::DownloadIntegrity
        );
        assert_eq!(UpdaterError::Busy { active: 1 }.kind(), ErrorKind::Busy);
    }

    #[test]
    fn test_flash_tool_error_is_not_recoverable() {
        let err = UpdaterError::FlashTool {
            status: "exit status: 2".to_owned(),
            output: "A fatal error occurred".to_owned(),
        };
        assert!(!err.kind().is_recoverable());
        assert!(
            UpdaterError::Network("refused".to_owned())
                .kind()
                .is_recoverable()
        );
        assert!(!ErrorKind::DeviceNotFound.is_recoverable());
    }

    #[test]
    fn test_operator_messages_are_distinct() {
        let network = UpdaterError::Network("dns".to_owned()).operator_message();
        let flash = UpdaterError::FlashTool {
            status: "exit status: 1".to_owned(),
            output: String::new(),
        }
        .operator_message();
        assert!(network.starts_with("Network unavailable"));
        assert!(flash.starts_with("Flash tool failed"));
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::FlashTool).unwrap();
        assert_eq!(json, "\"flash_tool\"");
    }
}
