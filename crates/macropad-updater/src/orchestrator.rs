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

//! Update session orchestration.
//!
//! One session at a time runs on a background task:
//! resolve versions, locate the device, gate, download, apply. Every session
//! ends with exactly one terminal progress event.

use crate::artifacts::{ArtifactSet, ArtifactStore, LocalArtifactSet};
use crate::config::UpdaterConfig;
use crate::error::{ErrorKind, Result, UpdaterError};
use crate::events::{EventHub, ProgressEvent};
use crate::flash::{EsptoolExecutor, FlashTool};
use crate::locator::{NetworkLocator, PortEnumerator, SerialLocator, SystemPorts};
use crate::serial_bridge::{SerialBridge, SerialOpener, SystemSerialOpener};
use crate::session::{
    CancelHandle, CancelSignal, Gate, SessionOutcome, SessionRequest, SessionState, UpdateMode,
    UpdateSession, cancel_pair, decide_gate,
};
use crate::state::{load_state, save_state};
use crate::transport::{OtaTransport, UpdateTransport, UsbTransport};
use crate::version_resolver::{HttpVersionResolver, VersionSource};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const RESOLVED_PERCENT: u8 = 5;
const LOCATED_PERCENT: u8 = 10;
const DOWNLOAD_START_PERCENT: u8 = 10;
const DOWNLOAD_SPAN_PERCENT: f32 = 20.0;
const DOWNLOADED_PERCENT: u8 = 30;

/// Replaceable collaborators; defaults talk to real ports, processes and HTTP
#[derive(Default)]
pub struct Components {
    pub versions: Option<Arc<dyn VersionSource>>,
    pub ports: Option<Arc<dyn PortEnumerator>>,
    pub flash_tool: Option<Arc<dyn FlashTool>>,
    pub serial_opener: Option<Arc<dyn SerialOpener>>,
    pub network_candidates: Option<Vec<String>>,
}

impl std::fmt::Debug for Components {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Components")
            .field("versions", &self.versions.is_some())
            .field("ports", &self.ports.is_some())
            .field("flash_tool", &self.flash_tool.is_some())
            .field("serial_opener", &self.serial_opener.is_some())
            .field("network_candidates", &self.network_candidates)
            .finish()
    }
}

struct Inner {
    config: UpdaterConfig,
    versions: Arc<dyn VersionSource>,
    usb: Arc<dyn UpdateTransport>,
    ota: Arc<dyn UpdateTransport>,
    store: ArtifactStore,
    bridge: Arc<SerialBridge>,
    serial: Arc<SerialLocator>,
    events: EventHub,
    active: Mutex<Option<u64>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("active", &*self.inner.active.lock())
            .finish_non_exhaustive()
    }
}

/// Caller's view of a running session
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    cancel: CancelHandle,
    task: JoinHandle<UpdateSession>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the session to stop. Honoured between phases and during downloads
    /// and network scans; an erase or write already in progress runs to the end.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal session value
    pub async fn wait(self) -> Result<UpdateSession> {
        self.task
            .await
            .map_err(|e| UpdaterError::Io(std::io::Error::other(format!("session task: {e}"))))
    }
}

/// A phase that stopped the pipeline, with the session as it stood
struct Halt {
    session: UpdateSession,
    error: UpdaterError,
}

impl Halt {
    fn new(session: &UpdateSession, error: UpdaterError) -> Self {
        Self {
            session: session.clone(),
            error,
        }
    }
}

type Step = std::result::Result<UpdateSession, Halt>;

/// Clears the active slot even if the session task panics
struct ActiveGuard {
    inner: Arc<Inner>,
    id: u64,
    released: bool,
}

impl ActiveGuard {
    fn release(&mut self) {
        if !self.released {
            let mut active = self.inner.active.lock();
            if *active == Some(self.id) {
                *active = None;
            }
            self.released = true;
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl Orchestrator {
    pub fn new(config: UpdaterConfig) -> Result<Self> {
        Self::with_components(config, Components::default())
    }

    pub fn with_components(config: UpdaterConfig, components: Components) -> Result<Self> {
        config.validate()?;

        let opener = components
            .serial_opener
            .unwrap_or_else(|| Arc::new(SystemSerialOpener));
        let bridge = Arc::new(SerialBridge::new(opener));

        let versions: Arc<dyn VersionSource> = match components.versions {
            Some(versions) => versions,
            None => Arc::new(HttpVersionResolver::new(&config, Arc::clone(&bridge))?),
        };
        let ports = components.ports.unwrap_or_else(|| Arc::new(SystemPorts));
        let flash_tool: Arc<dyn FlashTool> = match components.flash_tool {
            Some(tool) => tool,
            None => Arc::new(EsptoolExecutor::new(&config)?),
        };

        let serial = Arc::new(SerialLocator::new(&config, ports));
        let network = match components.network_candidates {
            Some(candidates) => NetworkLocator::with_candidates(&config, candidates)?,
            None => NetworkLocator::new(&config)?,
        };

        let usb = Arc::new(UsbTransport::new(
            &config,
            Arc::clone(&serial),
            Arc::clone(&bridge),
            flash_tool,
        ));
        let ota = Arc::new(OtaTransport::new(&config, network)?);
        let store = ArtifactStore::new(&config)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                versions,
                usb,
                ota,
                store,
                bridge,
                serial,
                events: EventHub::new(),
                active: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.inner.config
    }

    /// The serial monitor shared with the USB update path
    pub fn bridge(&self) -> Arc<SerialBridge> {
        Arc::clone(&self.inner.bridge)
    }

    pub fn serial_locator(&self) -> Arc<SerialLocator> {
        Arc::clone(&self.inner.serial)
    }

    pub fn versions(&self) -> Arc<dyn VersionSource> {
        Arc::clone(&self.inner.versions)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.events.subscribe()
    }

    /// Id of the running session, if any
    pub fn active_session(&self) -> Option<u64> {
        *self.inner.active.lock()
    }

    /// Start a session on a background task and return immediately.
    ///
    /// Fails with [`UpdaterError::Busy`] while another session is running.
    pub fn start_session(&self, request: SessionRequest) -> Result<SessionHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| UpdaterError::Config(format!("no async runtime: {e}")))?;

        let id = {
            let mut active = self.inner.active.lock();
            if let Some(active) = *active {
                tracing::warn!("Rejected {} update: session {active} is running", request.mode);
                return Err(UpdaterError::Busy { active });
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            *active = Some(id);
            id
        };

        let guard = ActiveGuard {
            inner: Arc::clone(&self.inner),
            id,
            released: false,
        };
        let (cancel, signal) = cancel_pair();
        let inner = Arc::clone(&self.inner);

        tracing::info!(
            "Starting session {id}: mode={}, force={}",
            request.mode,
            request.force
        );
        let task = runtime.spawn(async move { inner.run(id, request, signal, guard).await });

        Ok(SessionHandle { id, cancel, task })
    }
}

impl Inner {
    fn transport(&self, mode: UpdateMode) -> &Arc<dyn UpdateTransport> {
        match mode {
            UpdateMode::Usb => &self.usb,
            UpdateMode::Ota => &self.ota,
        }
    }

    fn emit(&self, session: &UpdateSession, percent: u8, message: impl Into<String>) {
        self.events
            .emit(session.id, session.state.phase(), percent, message, None);
    }

    async fn run(
        &self,
        id: u64,
        request: SessionRequest,
        cancel: CancelSignal,
        mut guard: ActiveGuard,
    ) -> UpdateSession {
        let session = UpdateSession::new(id, &request);
        let finished = match self.drive(session, &request, &cancel).await {
            Ok(session) => session,
            Err(Halt { session, error }) => fail(session, &error),
        };

        self.remember(&finished).await;
        // Free the slot before announcing the end so listeners can start again
        guard.release();
        self.announce(&finished);
        finished
    }

    async fn drive(
        &self,
        session: UpdateSession,
        request: &SessionRequest,
        cancel: &CancelSignal,
    ) -> Step {
        let session = self.resolve_versions(session, cancel).await?;
        checkpoint(&session, cancel)?;

        let session = self.locate(session, request, cancel).await?;
        if session.device.is_none() {
            return Ok(session.transition(SessionState::DeviceNotFound));
        }
        checkpoint(&session, cancel)?;

        let (session, gate) = self.gate(session);
        if gate == Gate::UpToDate && !session.force {
            return Ok(session
                .transition(SessionState::Completed {
                    outcome: SessionOutcome::UpToDate,
                })
                .with_progress(100));
        }

        let (session, artifacts) = self.download(session, cancel).await?;
        checkpoint(&session, cancel)?;

        self.apply(session, &artifacts, cancel).await
    }

    async fn resolve_versions(&self, session: UpdateSession, cancel: &CancelSignal) -> Step {
        let session = session.transition(SessionState::ResolvingVersions);
        self.emit(&session, 0, "Checking latest firmware version");

        let remote = match cancellable(cancel, self.versions.remote_version()).await {
            Ok(version) => {
                self.emit(&session, RESOLVED_PERCENT, format!("Latest firmware: {version}"));
                Some(version)
            }
            Err(UpdaterError::Cancelled) => return Err(Halt::new(&session, UpdaterError::Cancelled)),
            Err(e) => {
                tracing::warn!("Latest firmware version unavailable: {e}");
                self.emit(&session, RESOLVED_PERCENT, "Latest firmware version unavailable");
                None
            }
        };

        Ok(session
            .with_remote_version(remote)
            .with_progress(RESOLVED_PERCENT))
    }

    async fn locate(
        &self,
        session: UpdateSession,
        request: &SessionRequest,
        cancel: &CancelSignal,
    ) -> Step {
        let session = session.transition(SessionState::LocatingDevice);
        let transport = self.transport(request.mode);
        self.emit(
            &session,
            RESOLVED_PERCENT,
            format!("Looking for the macropad ({})", transport.mode()),
        );

        let found = transport
            .locate(request, cancel)
            .await
            .map_err(|e| Halt::new(&session, e))?;

        let Some(mut device) = found else {
            return Ok(session);
        };

        if device.version.is_none() {
            device.version = match cancellable(cancel, self.versions.device_version(&device)).await
            {
                Ok(version) => Some(version),
                Err(UpdaterError::Cancelled) => {
                    return Err(Halt::new(&session, UpdaterError::Cancelled));
                }
                Err(e) => {
                    tracing::warn!("{} did not report its version: {e}", device.address_label());
                    None
                }
            };
        }

        self.emit(&session, LOCATED_PERCENT, format!("Found {device}"));
        Ok(session
            .with_device(Some(device))
            .with_progress(LOCATED_PERCENT))
    }

    fn gate(&self, session: UpdateSession) -> (UpdateSession, Gate) {
        let device_version = session.device.as_ref().and_then(|d| d.version.as_ref());
        let gate = decide_gate(session.remote_version.as_ref(), device_version);
        let session = session.transition(SessionState::Gated { gate });

        let message = match (gate, session.force) {
            (Gate::UpToDate, false) => "Device already runs the latest firmware".to_owned(),
            (Gate::UpToDate, true) => "Device is up to date; reinstalling on request".to_owned(),
            (Gate::UpdateAvailable, _) => match &session.remote_version {
                Some(remote) => format!("Update to {remote} available"),
                None => "Latest version unknown; updating anyway".to_owned(),
            },
        };
        self.emit(&session, LOCATED_PERCENT, message);
        (session, gate)
    }

    async fn download(
        &self,
        session: UpdateSession,
        cancel: &CancelSignal,
    ) -> std::result::Result<(UpdateSession, LocalArtifactSet), Halt> {
        let session = session.transition(SessionState::Downloading);
        self.emit(&session, DOWNLOAD_START_PERCENT, "Downloading firmware");

        let set = ArtifactSet::from_config(&self.config).map_err(|e| Halt::new(&session, e))?;

        let mut last_percent = DOWNLOAD_START_PERCENT;
        let local = self
            .store
            .download(&set, cancel, |p| {
                let percent = download_percent(p.fraction);
                if percent > last_percent {
                    last_percent = percent;
                    self.emit(&session, percent, format!("Downloading {}", p.artifact));
                }
            })
            .await
            .map_err(|e| Halt::new(&session, e))?;

        self.emit(
            &session,
            DOWNLOADED_PERCENT,
            format!("Downloaded {} images ({} bytes)", set.len(), local.total_bytes()),
        );
        Ok((session.with_progress(DOWNLOADED_PERCENT), local))
    }

    async fn apply(
        &self,
        session: UpdateSession,
        artifacts: &LocalArtifactSet,
        cancel: &CancelSignal,
    ) -> Step {
        let next = match session.request_mode {
            UpdateMode::Usb => SessionState::Flashing,
            UpdateMode::Ota => SessionState::ArmingOta,
        };
        let session = session.transition(next);
        let Some(device) = session.device.clone() else {
            return Err(Halt::new(
                &session,
                UpdaterError::Config("no device to update".to_owned()),
            ));
        };

        let progress = |percent: u8, message: String| self.emit(&session, percent, message);
        let outcome = self
            .transport(session.request_mode)
            .apply(
                &device,
                artifacts,
                session.remote_version.as_ref(),
                cancel,
                &progress,
            )
            .await
            .map_err(|e| Halt::new(&session, e))?;

        Ok(session
            .transition(SessionState::Completed { outcome })
            .with_progress(100))
    }

    fn announce(&self, session: &UpdateSession) {
        let (message, error) = match &session.state {
            SessionState::Completed { outcome } => (completion_message(session, *outcome), None),
            SessionState::DeviceNotFound => (
                match session.request_mode {
                    UpdateMode::Usb => "No macropad found. Connect it or choose a port.".to_owned(),
                    UpdateMode::Ota => {
                        "No macropad answered on the network. Enter its address.".to_owned()
                    }
                },
                Some(ErrorKind::DeviceNotFound),
            ),
            SessionState::Failed {
                kind,
                message,
                detail,
            } => {
                if let Some(detail) = detail {
                    tracing::error!("Session {} tool output:\n{detail}", session.id);
                }
                (message.clone(), Some(*kind))
            }
            other => {
                tracing::error!("Session {} ended in non-terminal state {other:?}", session.id);
                ("Session ended unexpectedly".to_owned(), Some(ErrorKind::Io))
            }
        };

        self.events.emit(
            session.id,
            session.state.phase(),
            session.progress,
            message,
            error,
        );
    }

    async fn remember(&self, session: &UpdateSession) {
        let path = self.config.state_path();
        let session = session.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut state = load_state(&path)?;
            state.record(&session, chrono::Utc::now());
            save_state(&path, &state)
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to save updater state: {e}"),
            Err(e) => tracing::warn!("State writer aborted: {e}"),
        }
    }
}

fn fail(session: UpdateSession, error: &UpdaterError) -> UpdateSession {
    tracing::error!("Session {} failed: {error}", session.id);
    session.transition(SessionState::Failed {
        kind: error.kind(),
        message: error.operator_message(),
        detail: error.detail(),
    })
}

fn checkpoint(session: &UpdateSession, cancel: &CancelSignal) -> std::result::Result<(), Halt> {
    if cancel.is_cancelled() {
        return Err(Halt::new(session, UpdaterError::Cancelled));
    }
    Ok(())
}

/// Run `work` unless the session is cancelled first
async fn cancellable<T>(
    cancel: &CancelSignal,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(UpdaterError::Cancelled),
        result = work => result,
    }
}

#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn download_percent(fraction: f32) -> u8 {
    let span = (fraction.clamp(0.0, 1.0) * DOWNLOAD_SPAN_PERCENT).round() as u8;
    DOWNLOAD_START_PERCENT + span
}

fn completion_message(session: &UpdateSession, outcome: SessionOutcome) -> String {
    let version = session
        .remote_version
        .as_ref()
        .map_or_else(|| "the latest firmware".to_owned(), ToString::to_string);
    match outcome {
        SessionOutcome::UpToDate => format!("Already up to date ({version})"),
        SessionOutcome::Flashed => format!("Flashed {version}"),
        SessionOutcome::OtaArmed => "OTA enabled on the device".to_owned(),
        SessionOutcome::OtaConfirmed => format!("Device now runs {version}"),
    }
}
