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

//! FluxION Macropad Updater - firmware updates for the ESP32-S3 macropad
//!
//! Finds the macropad over USB serial or the local network, compares its
//! firmware with the latest published release and applies the release either
//! by flashing the four images over the wire or by arming the device's OTA
//! endpoint. A serial monitor and macro assignment share the same port.

pub mod artifacts;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod flash;
pub mod locator;
pub mod macros;
pub mod ota;
pub mod orchestrator;
pub mod serial_bridge;
pub mod session;
pub mod state;
pub mod transport;
pub mod version;
pub mod version_resolver;

pub use config::{UpdaterConfig, load_config};
pub use device::Device;
pub use error::{ErrorKind, UpdaterError};
pub use events::ProgressEvent;
pub use orchestrator::{Components, Orchestrator, SessionHandle};
pub use session::{SessionOutcome, SessionRequest, SessionState, UpdateMode, UpdateSession};
pub use version::{Version, is_newer};
