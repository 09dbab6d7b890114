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

//! Device discovery over USB serial and the local network

use crate::artifacts::USER_AGENT;
use crate::config::UpdaterConfig;
use crate::device::{Device, device_base_url};
use crate::error::{Result, UpdaterError};
use crate::session::CancelSignal;
use crate::version::Version;
use serde::Serialize;
use std::sync::Arc;

/// A serial port as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortCandidate {
    pub name: String,
    /// USB vendor id, for USB ports only
    pub vid: Option<u16>,
    /// Product and manufacturer strings joined, when the OS reports them
    pub description: Option<String>,
}

impl PortCandidate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            description: None,
        }
    }

    pub fn with_vid(mut self, vid: u16) -> Self {
        self.vid = Some(vid);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub trait PortEnumerator: Send + Sync {
    fn ports(&self) -> Result<Vec<PortCandidate>>;
}

/// Enumerates ports through the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn ports(&self) -> Result<Vec<PortCandidate>> {
        let ports = serialport::available_ports()
            .map_err(|e| {
                UpdaterError::Io(std::io::Error::other(format!(
                    "failed to list serial ports: {e}"
                )))
            })?;

        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    let description = [info.product, info.manufacturer]
                        .into_iter()
                        .flatten()
                        .collect::<Vec<_>>()
                        .join(" ");
                    PortCandidate {
                        name: port.port_name,
                        vid: Some(info.vid),
                        description: (!description.is_empty()).then_some(description),
                    }
                }
                serialport::SerialPortType::PciPort => {
                    PortCandidate::new(port.port_name).with_description("PCI")
                }
                serialport::SerialPortType::BluetoothPort => {
                    PortCandidate::new(port.port_name).with_description("Bluetooth")
                }
                serialport::SerialPortType::Unknown => PortCandidate::new(port.port_name),
            })
            .collect())
    }
}

/// Why a port was picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    VendorId,
    Description,
    FirstAvailable,
}

/// Pick the port most likely to be the macropad.
///
/// Vendor id match wins, then a description containing any hint
/// (case-insensitive), then the first port listed.
pub fn select_port(
    ports: &[PortCandidate],
    vendor_id: u16,
    hints: &[String],
) -> Option<(PortCandidate, MatchReason)> {
    if let Some(port) = ports.iter().find(|p| p.vid == Some(vendor_id)) {
        return Some((port.clone(), MatchReason::VendorId));
    }

    let hints: Vec<String> = hints.iter().map(|h| h.to_lowercase()).collect();
    let by_description = ports.iter().find(|p| {
        p.description.as_ref().is_some_and(|d| {
            let d = d.to_lowercase();
            hints.iter().any(|h| !h.is_empty() && d.contains(h.as_str()))
        })
    });
    if let Some(port) = by_description {
        return Some((port.clone(), MatchReason::Description));
    }

    ports
        .first()
        .map(|port| (port.clone(), MatchReason::FirstAvailable))
}

pub struct SerialLocator {
    ports: Arc<dyn PortEnumerator>,
    vendor_id: u16,
    hints: Vec<String>,
}

impl std::fmt::Debug for SerialLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLocator")
            .field("vendor_id", &format_args!("{:#06X}", self.vendor_id))
            .field("hints", &self.hints)
            .finish_non_exhaustive()
    }
}

impl SerialLocator {
    pub fn new(config: &UpdaterConfig, ports: Arc<dyn PortEnumerator>) -> Self {
        Self {
            ports,
            vendor_id: config.vendor_id,
            hints: config.port_hints.clone(),
        }
    }

    pub fn list(&self) -> Result<Vec<PortCandidate>> {
        self.ports.ports()
    }

    /// `Ok(None)` when no serial port exists at all
    pub fn locate(&self) -> Result<Option<Device>> {
        let ports = self.ports.ports()?;
        tracing::debug!("Serial ports: {ports:?}");

        Ok(
            select_port(&ports, self.vendor_id, &self.hints).map(|(port, reason)| {
                tracing::info!("Selected serial port {} ({reason:?})", port.name);
                Device::serial(port.name).with_description(port.description)
            }),
        )
    }
}

/// Sequential HTTP probe of candidate addresses
#[derive(Debug)]
pub struct NetworkLocator {
    client: reqwest::Client,
    candidates: Vec<String>,
    version_path: String,
}

impl NetworkLocator {
    pub fn new(config: &UpdaterConfig) -> Result<Self> {
        Self::with_candidates(config, candidate_hosts(config))
    }

    pub fn with_candidates(config: &UpdaterConfig, candidates: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| UpdaterError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            candidates,
            version_path: config.device_version_path.clone(),
        })
    }

    /// First candidate answering the version endpoint, in candidate order
    pub async fn locate(&self, cancel: &CancelSignal) -> Result<Option<Device>> {
        tracing::info!("Probing {} network addresses", self.candidates.len());

        for host in &self.candidates {
            if cancel.is_cancelled() {
                return Err(UpdaterError::Cancelled);
            }

            let probe = tokio::select! {
                () = cancel.cancelled() => return Err(UpdaterError::Cancelled),
                probe = self.probe(host) => probe,
            };

            if let Some(version) = probe {
                tracing::info!("Device answered at {host} with version {version}");
                return Ok(Some(Device::network(host.clone()).with_version(Some(version))));
            }
        }

        Ok(None)
    }

    /// Version reported by `host`, `None` on any failure
    pub async fn probe(&self, host: &str) -> Option<Version> {
        let url = format!("{}{}", device_base_url(host), self.version_path);
        let response = self.client.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            tracing::trace!("{url} answered {}", response.status());
            return None;
        }

        let body = response.text().await.ok()?;
        let version = Version::parse_reported(&body);
        if version.is_none() {
            tracing::debug!("{url} answered without a version");
        }
        version
    }
}

/// mDNS host first, then the configured address range
pub fn candidate_hosts(config: &UpdaterConfig) -> Vec<String> {
    let mut hosts: Vec<String> = config.mdns_host.iter().cloned().collect();
    hosts.extend(
        (config.scan_start..=config.scan_end).map(|i| format!("{}.{i}", config.scan_prefix)),
    );
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> Vec<PortCandidate> {
        vec![
            PortCandidate::new("COM1").with_description("Communications Port"),
            PortCandidate::new("COM4")
                .with_vid(0x10C4)
                .with_description("USB CDC Serial"),
            PortCandidate::new("COM5").with_vid(0x303A),
        ]
    }

    fn hints() -> Vec<String> {
        vec!["esp32".to_owned(), "cdc".to_owned()]
    }

    #[test]
    fn test_vendor_id_match_wins() {
        let (port, reason) = select_port(&ports(), 0x303A, &hints()).unwrap();
        assert_eq!(port.name, "COM5");
        assert_eq!(reason, MatchReason::VendorId);
    }

    #[test]
    fn test_description_hint_is_case_insensitive() {
        let (port, reason) = select_port(&ports()[..2], 0x303A, &hints()).unwrap();
        assert_eq!(port.name, "COM4");
        assert_eq!(reason, MatchReason::Description);
    }

    #[test]
    fn test_falls_back_to_first_port() {
        let (port, reason) = select_port(&ports()[..1], 0x303A, &hints()).unwrap();
        assert_eq!(port.name, "COM1");
        assert_eq!(reason, MatchReason::FirstAvailable);
    }

    #[test]
    fn test_no_ports_is_none() {
        assert!(select_port(&[], 0x303A, &hints()).is_none());
    }

    #[test]
    fn test_serial_locator_uses_enumerator() {
        struct Fixed;
        impl PortEnumerator for Fixed {
            fn ports(&self) -> Result<Vec<PortCandidate>> {
                Ok(vec![
                    PortCandidate::new("/dev/ttyACM0")
                        .with_vid(0x303A)
                        .with_description("USB JTAG/serial debug unit"),
                ])
            }
        }

        let locator = SerialLocator::new(&UpdaterConfig::default(), Arc::new(Fixed));
        let device = locator.locate().unwrap().unwrap();
        assert_eq!(device.serial_port(), Some("/dev/ttyACM0"));
        assert_eq!(
            device.description.as_deref(),
            Some("USB JTAG/serial debug unit")
        );
    }

    #[test]
    fn test_candidate_order() {
        let config = UpdaterConfig {
            scan_prefix: "10.0.0".to_owned(),
            scan_start: 2,
            scan_end: 4,
            ..Default::default()
        };
        assert_eq!(
            candidate_hosts(&config),
            vec!["macropad.local", "10.0.0.2", "10.0.0.3", "10.0.0.4"]
        );

        let config = UpdaterConfig {
            mdns_host: None,
            scan_start: 7,
            scan_end: 7,
            ..Default::default()
        };
        assert_eq!(candidate_hosts(&config), vec!["192.168.1.7"]);
    }

    #[tokio::test]
    async fn test_network_scan_returns_first_responder() {
        let mut silent = mockito::Server::new_async().await;
        let mut device = mockito::Server::new_async().await;

        let miss = silent
            .mock("GET", "/version")
            .with_status(404)
            .create_async()
            .await;
        let hit = device
            .mock("GET", "/version")
            .with_status(200)
            .with_body("3.1.5\n")
            .create_async()
            .await;

        let locator = NetworkLocator::with_candidates(
            &UpdaterConfig::default(),
            vec![silent.host_with_port(), device.host_with_port()],
        )
        .unwrap();

        let found = locator.locate(&CancelSignal::never()).await.unwrap().unwrap();
        assert_eq!(found.host(), Some(device.host_with_port().as_str()));
        assert_eq!(found.version, Some(Version::parse("3.1.5")));
        miss.assert_async().await;
        hit.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_scan_empty_body_is_not_a_device() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/version")
            .with_status(200)
            .with_body("  ")
            .create_async()
            .await;

        let locator =
            NetworkLocator::with_candidates(&UpdaterConfig::default(), vec![server.host_with_port()])
                .unwrap();
        assert!(locator.locate(&CancelSignal::never()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_network_scan_skips_host_without_version() {
        let mut router = mockito::Server::new_async().await;
        let mut device = mockito::Server::new_async().await;

        let _welcome = router
            .mock("GET", "/version")
            .with_status(200)
            .with_body("Welcome")
            .create_async()
            .await;
        let _version = device
            .mock("GET", "/version")
            .with_status(200)
            .with_body("3.2.0")
            .create_async()
            .await;

        let locator = NetworkLocator::with_candidates(
            &UpdaterConfig::default(),
            vec![router.host_with_port(), device.host_with_port()],
        )
        .unwrap();

        assert!(locator.probe(&router.host_with_port()).await.is_none());
        let found = locator.locate(&CancelSignal::never()).await.unwrap().unwrap();
        assert_eq!(found.host(), Some(device.host_with_port().as_str()));
    }

    #[tokio::test]
    async fn test_network_scan_honors_cancellation() {
        let (handle, signal) = crate::session::cancel_pair();
        handle.cancel();

        let locator = NetworkLocator::with_candidates(
            &UpdaterConfig::default(),
            vec!["127.0.0.1:9".to_owned()],
        )
        .unwrap();
        assert!(matches!(
            locator.locate(&signal).await,
            Err(UpdaterError::Cancelled)
        ));
    }
}
