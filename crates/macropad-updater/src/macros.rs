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

//! Button macro assignment commands sent over the serial bridge

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Shortcuts offered in the macro picker
pub const PRESETS: [&str; 7] = [
    "CTRL+C",
    "CTRL+V",
    "CTRL+X",
    "ALT+TAB",
    "WIN+D",
    "WIN+L",
    "CTRL+ALT+DEL",
];

/// Wire format understood by the firmware's serial command parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MacroFormat {
    /// `/set?m1=<macro>&m2=<macro>`
    #[default]
    Query,
    /// `MACRO:{"btn1": <macro>, "btn2": <macro>}`
    Json,
}

/// Macro text for the two keys (GPIO 2 and GPIO 4)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroAssignment {
    pub button1: String,
    pub button2: String,
}

impl Default for MacroAssignment {
    fn default() -> Self {
        Self {
            button1: PRESETS[0].to_owned(),
            button2: PRESETS[1].to_owned(),
        }
    }
}

impl MacroAssignment {
    pub fn new(button1: impl Into<String>, button2: impl Into<String>) -> Self {
        Self {
            button1: button1.into(),
            button2: button2.into(),
        }
    }

    /// Single command line, without the trailing newline
    pub fn to_command(&self, format: MacroFormat) -> String {
        let b1 = macro_text(&self.button1);
        let b2 = macro_text(&self.button2);
        match format {
            MacroFormat::Query => format!("/set?m1={b1}&m2={b2}"),
            MacroFormat::Json => format!("MACRO:{}", json!({ "btn1": b1, "btn2": b2 })),
        }
    }
}

/// Preset spelled the way the firmware matches it, if `text` names one
pub fn preset(text: &str) -> Option<&'static str> {
    PRESETS
        .iter()
        .copied()
        .find(|p| p.eq_ignore_ascii_case(text.trim()))
}

fn macro_text(text: &str) -> String {
    match preset(text) {
        Some(preset) => preset.to_owned(),
        // A newline inside a macro would split the command in two
        None => text.replace(['\r', '\n'], " "),
    }
}
