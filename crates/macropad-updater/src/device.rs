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

//! Discovered update targets

use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceAddress {
    /// OS serial port name ("COM5", "/dev/ttyACM0")
    Serial { port: String },
    /// Host name or IP, optionally with ":port"
    Network { host: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: DeviceAddress,
    /// Last version the device reported, `None` until queried or if it never answered
    pub version: Option<Version>,
    /// Port description or product string, when discovery had one
    pub description: Option<String>,
}

impl Device {
    pub fn serial(port: impl Into<String>) -> Self {
        Self {
            address: DeviceAddress::Serial { port: port.into() },
            version: None,
            description: None,
        }
    }

    pub fn network(host: impl Into<String>) -> Self {
        Self {
            address: DeviceAddress::Network { host: host.into() },
            version: None,
            description: None,
        }
    }

    pub fn with_version(mut self, version: Option<Version>) -> Self {
        self.version = version;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn serial_port(&self) -> Option<&str> {
        match &self.address {
            DeviceAddress::Serial { port } => Some(port),
            DeviceAddress::Network { .. } => None,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match &self.address {
            DeviceAddress::Network { host } => Some(host),
            DeviceAddress::Serial { .. } => None,
        }
    }

    /// Port name or host, whichever applies
    pub fn address_label(&self) -> &str {
        match &self.address {
            DeviceAddress::Serial { port } => port,
            DeviceAddress::Network { host } => host,
        }
    }
}

pub(crate) fn device_base_url(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_owned()
    } else {
        format!("http://{host}")
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            DeviceAddress::Serial { port } => write!(f, "serial {port}")?,
            DeviceAddress::Network { host } => write!(f, "network {host}")?,
        }
        match &self.version {
            Some(v) => write!(f, " (firmware {v})"),
            None => write!(f, " (firmware unknown)"),
        }
    }
}
