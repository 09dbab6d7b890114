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

//! Remote release version and device-reported version lookup

use crate::artifacts::USER_AGENT;
use crate::config::UpdaterConfig;
use crate::device::{Device, DeviceAddress, device_base_url};
use crate::error::{Result, UpdaterError};
use crate::serial_bridge::SerialBridge;
use crate::version::Version;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait VersionSource: Send + Sync {
    /// Version of the latest published firmware
    async fn remote_version(&self) -> Result<Version>;

    /// Version the device reports about itself
    async fn device_version(&self, device: &Device) -> Result<Version>;
}

pub struct HttpVersionResolver {
    client: reqwest::Client,
    version_url: String,
    device_version_path: String,
    serial_command: String,
    serial_baud: u32,
    timeout: Duration,
    bridge: Arc<SerialBridge>,
}

impl std::fmt::Debug for HttpVersionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVersionResolver")
            .field("version_url", &self.version_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpVersionResolver {
    pub fn new(config: &UpdaterConfig, bridge: Arc<SerialBridge>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| UpdaterError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            version_url: config.version_url.clone(),
            device_version_path: config.device_version_path.clone(),
            serial_command: config.serial_version_command.clone(),
            serial_baud: config.serial_baud,
            timeout: config.http_timeout(),
            bridge,
        })
    }

    async fn network_version(&self, host: &str) -> Result<Version> {
        let url = format!("{}{}", device_base_url(host), self.device_version_path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| UpdaterError::DeviceUnreachable(format!("{host}: {e}")))?;

        if !response.status().is_success() {
            return Err(UpdaterError::DeviceUnreachable(format!(
                "{host} answered {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| UpdaterError::DeviceUnreachable(format!("{host}: {e}")))?;
        Version::parse_reported(&body)
            .ok_or_else(|| UpdaterError::DeviceUnreachable(format!("{host} sent no version")))
    }

    async fn serial_version(&self, port: &str) -> Result<Version> {
        if self.bridge.port().as_deref() != Some(port) {
            self.bridge.open(port, self.serial_baud)?;
        }

        let reply = self
            .bridge
            .query(&self.serial_command, self.timeout, looks_like_version_reply)
            .await?;
        Version::parse_reported(&reply)
            .ok_or_else(|| UpdaterError::DeviceUnreachable(format!("{port} sent no version")))
    }
}

#[async_trait]
impl VersionSource for HttpVersionResolver {
    async fn remote_version(&self) -> Result<Version> {
        let response = self
            .client
            .get(&self.version_url)
            .send()
            .await
            .map_err(|e| UpdaterError::Network(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(UpdaterError::Network(format!(
                "{} answered {}",
                self.version_url,
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| UpdaterError::Network(format!("Failed to read response: {e}")))?;

        let version = Version::parse_reported(&body)
            .ok_or_else(|| UpdaterError::Network("version resource is empty".to_owned()))?;
        tracing::info!("Latest published firmware: {version}");
        Ok(version)
    }

    async fn device_version(&self, device: &Device) -> Result<Version> {
        let version = match &device.address {
            DeviceAddress::Network { host } => self.network_version(host).await?,
            DeviceAddress::Serial { port } => self.serial_version(port).await?,
        };
        tracing::info!("Device {} reports firmware {version}", device.address_label());
        Ok(version)
    }
}

/// Accept `3.1.5`, `v3.1.5` or `Version: 3.1.5`; skip ordinary log output
fn looks_like_version_reply(line: &str) -> bool {
    let line = line.trim();
    if !line.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }
    let bare = line.trim_start_matches(['v', 'V']);
    bare.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-')
        || line.to_lowercase().starts_with("version")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(server: &mockito::ServerGuard) -> UpdaterConfig {
        UpdaterConfig {
            version_url: format!("{}/version.txt", server.url()),
            ..Default::default()
        }
    }

    fn resolver(config: &UpdaterConfig) -> HttpVersionResolver {
        HttpVersionResolver::new(config, Arc::new(SerialBridge::default())).unwrap()
    }

    #[tokio::test]
    async fn test_remote_version_trims_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/version.txt")
            .with_status(200)
            .with_body("3.2.0\r\n")
            .create_async()
            .await;

        let version = resolver(&config_for(&server))
            .remote_version()
            .await
            .unwrap();
        assert_eq!(version, Version::parse("3.2.0"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_remote_version_server_error_is_network() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/version.txt")
            .with_status(503)
            .create_async()
            .await;

        let err = resolver(&config_for(&server))
            .remote_version()
            .await
            .unwrap_err();
        assert!(matches!(err, UpdaterError::Network(_)));
    }

    #[tokio::test]
    async fn test_remote_version_empty_body_is_network() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/version.txt")
            .with_status(200)
            .with_body("\n")
            .create_async()
            .await;

        let err = resolver(&config_for(&server))
            .remote_version()
            .await
            .unwrap_err();
        assert!(matches!(err, UpdaterError::Network(_)));
    }

    #[tokio::test]
    async fn test_network_device_version() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/version")
            .with_status(200)
            .with_body("3.1.5")
            .create_async()
            .await;

        let device = Device::network(server.host_with_port());
        let version = resolver(&config_for(&server))
            .device_version(&device)
            .await
            .unwrap();
        assert_eq!(version.to_string(), "3.1.5");
    }

    #[tokio::test]
    async fn test_unreachable_device() {
        let server = mockito::Server::new_async().await;
        let device = Device::network("127.0.0.1:9");
        let err = resolver(&config_for(&server))
            .device_version(&device)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdaterError::DeviceUnreachable(_)));
    }

    #[test]
    fn test_version_reply_filter() {
        assert!(looks_like_version_reply("3.1.5"));
        assert!(looks_like_version_reply("v3.1.5\r"));
        assert!(looks_like_version_reply("Version: 3.1.5"));
        assert!(!looks_like_version_reply("Button 1 pressed"));
        assert!(!looks_like_version_reply("heap free 12345 bytes"));
        assert!(!looks_like_version_reply("ready"));
    }
}
