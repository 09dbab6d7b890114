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

//! Version parsing and comparison module
//!
//! Firmware identifiers are free-form ("v3.2.0", "Macropad FW 3-2", "3.2.0-rc1"),
//! so a version is the ordered tuple of every digit run in the string.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Version {
    components: Vec<u64>,
}

impl Version {
    /// Extract all digit runs in order. Runs too large for `u64` saturate.
    pub fn parse(s: &str) -> Self {
        let mut components = Vec::new();
        let mut current: Option<u64> = None;

        for c in s.chars() {
            if let Some(digit) = c.to_digit(10) {
                let value = current.unwrap_or(0);
                current = Some(
                    value
                        .saturating_mul(10)
                        .saturating_add(u64::from(digit)),
                );
            } else if let Some(value) = current.take() {
                components.push(value);
            }
        }
        if let Some(value) = current {
            components.push(value);
        }

        Self { components }
    }

    /// Version a device or release resource reported; `None` when the text has no digits
    pub fn parse_reported(text: &str) -> Option<Self> {
        let version = Self::parse(text.trim());
        (!version.is_empty()).then_some(version)
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// True when the source string carried no digits at all
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equality must agree with the zero-padded ordering: "1.0" == "1.0.0".
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str("0");
        }
        let parts: Vec<String> = self.components.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// Returns true if `remote` is strictly newer than `local`. No downgrades.
pub fn is_newer(remote: &Version, local: &Version) -> bool {
    remote > local
}
