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

//! Update paths: wired flashing and network OTA.
//!
//! Both implement [`UpdateTransport`] so the orchestrator runs one pipeline
//! and only the locate and apply steps differ.

use crate::artifacts::{ArtifactKind, LocalArtifactSet};
use crate::config::UpdaterConfig;
use crate::device::Device;
use crate::error::{Result, UpdaterError};
use crate::flash::FlashTool;
use crate::locator::{NetworkLocator, SerialLocator};
use crate::ota::OtaTrigger;
use crate::serial_bridge::SerialBridge;
use crate::session::{CancelSignal, SessionOutcome, SessionRequest, UpdateMode};
use crate::version::Version;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const PORT_RELEASE_PERCENT: u8 = 35;
const ERASE_PERCENT: u8 = 40;
const ERASED_PERCENT: u8 = 50;
const MONITOR_PERCENT: u8 = 95;

const ARM_PERCENT: u8 = 50;
const UPLOAD_PERCENT: u8 = 60;
const CONFIRM_PERCENT: u8 = 80;
const CONFIRM_POLL: Duration = Duration::from_secs(2);

#[async_trait]
pub trait UpdateTransport: Send + Sync {
    fn mode(&self) -> UpdateMode;

    /// Find the target. `Ok(None)` means nothing answered.
    async fn locate(
        &self,
        request: &SessionRequest,
        cancel: &CancelSignal,
    ) -> Result<Option<Device>>;

    /// Put `artifacts` onto `device`, reporting session percent and a message
    async fn apply(
        &self,
        device: &Device,
        artifacts: &LocalArtifactSet,
        target: Option<&Version>,
        cancel: &CancelSignal,
        progress: &(dyn Fn(u8, String) + Send + Sync),
    ) -> Result<SessionOutcome>;
}

pub struct UsbTransport {
    locator: Arc<SerialLocator>,
    bridge: Arc<SerialBridge>,
    tool: Arc<dyn FlashTool>,
    flash_baud: u32,
    serial_baud: u32,
    release_delay: Duration,
    reopen_delay: Duration,
    reopen_monitor: bool,
}

impl std::fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbTransport")
            .field("flash_baud", &self.flash_baud)
            .field("reopen_monitor", &self.reopen_monitor)
            .finish_non_exhaustive()
    }
}

impl UsbTransport {
    pub fn new(
        config: &UpdaterConfig,
        locator: Arc<SerialLocator>,
        bridge: Arc<SerialBridge>,
        tool: Arc<dyn FlashTool>,
    ) -> Self {
        Self {
            locator,
            bridge,
            tool,
            flash_baud: config.flash_baud,
            serial_baud: config.serial_baud,
            release_delay: config.port_release_delay(),
            reopen_delay: config.monitor_reopen_delay(),
            reopen_monitor: config.reopen_monitor_after_flash,
        }
    }

    /// The flashing tool needs the port to itself
    fn ensure_port_released(&self, port: &str) -> Result<()> {
        if let Some(open) = self.bridge.port() {
            tracing::error!("Serial monitor still holds {open}; refusing to flash {port}");
            return Err(UpdaterError::Serial(format!(
                "serial monitor reopened {open} while flashing {port}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateTransport for UsbTransport {
    fn mode(&self) -> UpdateMode {
        UpdateMode::Usb
    }

    async fn locate(
        &self,
        request: &SessionRequest,
        _cancel: &CancelSignal,
    ) -> Result<Option<Device>> {
        if let Some(port) = &request.port {
            tracing::info!("Using manually selected port {port}");
            return Ok(Some(Device::serial(port.clone())));
        }

        let locator = Arc::clone(&self.locator);
        tokio::task::spawn_blocking(move || locator.locate())
            .await
            .map_err(|e| UpdaterError::Serial(format!("port enumeration aborted: {e}")))?
    }

    async fn apply(
        &self,
        device: &Device,
        artifacts: &LocalArtifactSet,
        _target: Option<&Version>,
        _cancel: &CancelSignal,
        progress: &(dyn Fn(u8, String) + Send + Sync),
    ) -> Result<SessionOutcome> {
        let port = device.serial_port().ok_or_else(|| {
            UpdaterError::Config(format!("{device} is not a serial device"))
        })?;

        let plan = artifacts.flash_plan();
        if plan.len() != ArtifactKind::ALL.len() {
            return Err(UpdaterError::DownloadIntegrity {
                artifact: "firmware".to_owned(),
                reason: format!("{} of {} images staged", plan.len(), ArtifactKind::ALL.len()),
            });
        }

        if self.bridge.is_open() {
            // Joins the reader thread
            let bridge = Arc::clone(&self.bridge);
            tokio::task::spawn_blocking(move || bridge.close())
                .await
                .map_err(|e| UpdaterError::Serial(format!("closing the monitor aborted: {e}")))?;
        }
        progress(PORT_RELEASE_PERCENT, format!("Releasing {port}"));
        tokio::time::sleep(self.release_delay).await;

        self.ensure_port_released(port)?;
        progress(ERASE_PERCENT, "Erasing flash".to_owned());
        self.tool.erase(port).await?;
        progress(ERASED_PERCENT, "Flash erased".to_owned());

        self.ensure_port_released(port)?;
        self.tool
            .write_all(port, self.flash_baud, &plan, &|milestone| {
                progress(milestone.percent(), milestone.message().to_owned());
            })
            .await?;

        if self.reopen_monitor {
            tokio::time::sleep(self.reopen_delay).await;
            match self.bridge.open(port, self.serial_baud) {
                Ok(()) => progress(MONITOR_PERCENT, format!("Monitoring {port}")),
                // The device may still be rebooting; the flash itself succeeded
                Err(e) => tracing::warn!("Could not reopen {port} after flashing: {e}"),
            }
        }

        Ok(SessionOutcome::Flashed)
    }
}

pub struct OtaTransport {
    locator: NetworkLocator,
    trigger: OtaTrigger,
    push: bool,
    confirm_timeout: Duration,
}

impl std::fmt::Debug for OtaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaTransport")
            .field("push", &self.push)
            .field("confirm_timeout", &self.confirm_timeout)
            .finish_non_exhaustive()
    }
}

impl OtaTransport {
    pub fn new(config: &UpdaterConfig, locator: NetworkLocator) -> Result<Self> {
        Ok(Self {
            locator,
            trigger: OtaTrigger::new(config)?,
            push: config.ota_push,
            confirm_timeout: Duration::from_secs(config.ota_confirm_timeout_secs),
        })
    }

    /// Poll the device until it reports `target` or the timeout passes
    async fn await_version(&self, host: &str, target: &Version, cancel: &CancelSignal) -> bool {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout;
        loop {
            if let Some(reported) = self.locator.probe(host).await
                && reported >= *target
            {
                return true;
            }
            if tokio::time::Instant::now() + CONFIRM_POLL > deadline {
                return false;
            }
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(CONFIRM_POLL) => {}
            }
        }
    }
}

#[async_trait]
impl UpdateTransport for OtaTransport {
    fn mode(&self) -> UpdateMode {
        UpdateMode::Ota
    }

    async fn locate(
        &self,
        request: &SessionRequest,
        cancel: &CancelSignal,
    ) -> Result<Option<Device>> {
        if let Some(address) = &request.address {
            tracing::info!("Using manually entered address {address}");
            let version = self.locator.probe(address).await;
            return Ok(Some(Device::network(address.clone()).with_version(version)));
        }
        self.locator.locate(cancel).await
    }

    async fn apply(
        &self,
        device: &Device,
        artifacts: &LocalArtifactSet,
        target: Option<&Version>,
        cancel: &CancelSignal,
        progress: &(dyn Fn(u8, String) + Send + Sync),
    ) -> Result<SessionOutcome> {
        let host = device.host().ok_or_else(|| {
            UpdaterError::Config(format!("{device} is not a network device"))
        })?;

        progress(ARM_PERCENT, format!("Arming OTA on {host}"));
        self.trigger.enable(host).await?;

        let image = artifacts.get(ArtifactKind::Application);
        let (true, Some(image)) = (self.push, image) else {
            let hint = image.map_or_else(String::new, |a| {
                format!("; upload {} through the device page", a.path.display())
            });
            progress(100, format!("OTA window open on {host}{hint}"));
            return Ok(SessionOutcome::OtaArmed);
        };

        progress(UPLOAD_PERCENT, format!("Uploading application to {host}"));
        self.trigger.upload(host, &image.path).await?;

        let Some(target) = target else {
            tracing::warn!("Latest version unknown; cannot confirm OTA on {host}");
            return Ok(SessionOutcome::OtaArmed);
        };

        progress(CONFIRM_PERCENT, format!("Waiting for {host} to report {target}"));
        if self.await_version(host, target, cancel).await {
            Ok(SessionOutcome::OtaConfirmed)
        } else {
            tracing::warn!("{host} did not report {target} in time");
            Ok(SessionOutcome::OtaArmed)
        }
    }
}
