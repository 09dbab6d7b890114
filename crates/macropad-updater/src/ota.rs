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

//! Network update endpoints exposed by the device

use crate::artifacts::USER_AGENT;
use crate::config::UpdaterConfig;
use crate::device::device_base_url;
use crate::error::{Result, UpdaterError};
use reqwest::multipart;
use std::path::Path;
use std::time::Duration;

/// Multipart field name the device's update handler reads
const FIRMWARE_FIELD: &str = "firmware";

#[derive(Debug, Clone)]
pub struct OtaTrigger {
    client: reqwest::Client,
    upload_client: reqwest::Client,
    arm_path: String,
    upload_path: String,
}

impl OtaTrigger {
    pub fn new(config: &UpdaterConfig) -> Result<Self> {
        let build = |timeout: Duration| {
            reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(config.http_timeout())
                .timeout(timeout)
                .build()
                .map_err(|e| UpdaterError::Network(format!("Failed to build HTTP client: {e}")))
        };

        Ok(Self {
            client: build(config.http_timeout())?,
            // The device writes the image to flash before it answers
            upload_client: build(config.download_timeout() * 3)?,
            arm_path: config.ota_arm_path.clone(),
            upload_path: config.ota_upload_path.clone(),
        })
    }

    /// Ask the device to open its OTA window. Any 2xx counts as success.
    pub async fn enable(&self, host: &str) -> Result<()> {
        let url = format!("{}{}", device_base_url(host), self.arm_path);
        tracing::info!("Arming OTA at {url}");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| UpdaterError::Network(format!("OTA request to {host} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdaterError::Network(format!(
                "{host} refused OTA arm request ({status})"
            )));
        }
        Ok(())
    }

    /// Push the application image to the device's upload handler
    pub async fn upload(&self, host: &str, image: &Path) -> Result<()> {
        let url = format!("{}{}", device_base_url(host), self.upload_path);
        let bytes = tokio::fs::read(image).await?;
        let file_name = image
            .file_name()
            .map_or_else(|| "firmware.bin".to_owned(), |n| n.to_string_lossy().into_owned());
        tracing::info!("Uploading {} ({} bytes) to {url}", file_name, bytes.len());

        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| UpdaterError::Network(format!("Invalid upload part: {e}")))?;
        let form = multipart::Form::new().part(FIRMWARE_FIELD, part);

        let response = self
            .upload_client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UpdaterError::Network(format!("Upload to {host} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpdaterError::Network(format!(
                "{host} rejected the image ({status}): {}",
                body.trim()
            )));
        }
        Ok(())
    }
}
