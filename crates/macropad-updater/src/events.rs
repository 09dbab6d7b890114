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

//! Progress event stream for UI listeners

use crate::error::ErrorKind;
use crate::session::Phase;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub session_id: u64,
    pub phase: Phase,
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Set only on terminal events of sessions that did not complete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.phase,
            Phase::Completed | Phase::Failed | Phase::DeviceNotFound
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct LastEmitted {
    percent: u8,
    timestamp: DateTime<Utc>,
}

/// Fan-out of progress events to any number of passive listeners.
///
/// Per session, emitted percents never decrease and timestamps strictly increase.
#[derive(Debug)]
pub struct EventHub {
    sender: broadcast::Sender<ProgressEvent>,
    last: Mutex<HashMap<u64, LastEmitted>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sender,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Emit an event, clamping percent and timestamp to the session's ordering guarantees
    pub fn emit(
        &self,
        session_id: u64,
        phase: Phase,
        percent: u8,
        message: impl Into<String>,
        error: Option<ErrorKind>,
    ) -> ProgressEvent {
        let event = {
            let mut last = self.last.lock();
            let mut percent = percent.min(100);
            let mut timestamp = Utc::now();

            if let Some(prev) = last.get(&session_id) {
                percent = percent.max(prev.percent);
                if timestamp <= prev.timestamp {
                    timestamp = prev.timestamp + ChronoDuration::microseconds(1);
                }
            }

            let event = ProgressEvent {
                session_id,
                phase,
                percent,
                message: message.into(),
                timestamp,
                error,
            };

            if event.is_terminal() {
                last.remove(&session_id);
            } else {
                last.insert(session_id, LastEmitted { percent, timestamp });
            }
            event
        };

        log_event(&event);
        // No listeners is fine: the UI may not have subscribed yet
        let _ = self.sender.send(event.clone());
        event
    }
}

fn log_event(event: &ProgressEvent) {
    match serde_json::to_string(event) {
        Ok(json) if event.phase == Phase::Failed => tracing::error!("Session event: {json}"),
        Ok(json) if event.phase == Phase::DeviceNotFound => {
            tracing::warn!("Session event: {json}");
        }
        Ok(json) => tracing::info!("Session event: {json}"),
        Err(e) => tracing::warn!("Failed to serialize session event: {e}"),
    }
}
