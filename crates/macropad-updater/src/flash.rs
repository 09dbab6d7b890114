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

//! External flashing tool invocation (esptool)

use crate::artifacts::format_offset;
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Coarse progress markers recognised in tool output, in the order they occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlashMilestone {
    Writing,
    HashVerified,
}

impl FlashMilestone {
    /// Session percent once this milestone is seen
    pub fn percent(self) -> u8 {
        match self {
            Self::Writing => 60,
            Self::HashVerified => 90,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Writing => "Writing firmware",
            Self::HashVerified => "Flash contents verified",
        }
    }
}

pub fn milestone_for_line(line: &str) -> Option<FlashMilestone> {
    let line = line.to_lowercase();
    if line.contains("hash of data verified") || line.contains("hash verified") {
        Some(FlashMilestone::HashVerified)
    } else if line.contains("writing") {
        Some(FlashMilestone::Writing)
    } else {
        None
    }
}

#[async_trait]
pub trait FlashTool: Send + Sync {
    /// Erase the whole flash of the device on `port`
    async fn erase(&self, port: &str) -> Result<()>;

    /// Write every `(offset, image)` pair in one invocation
    async fn write_all(
        &self,
        port: &str,
        baud: u32,
        plan: &[(u32, PathBuf)],
        on_milestone: &(dyn Fn(FlashMilestone) + Send + Sync),
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct EsptoolExecutor {
    program: String,
    /// Leading arguments from the configured command, e.g. `-m esptool`
    launcher_args: Vec<String>,
    chip: String,
}

impl EsptoolExecutor {
    pub fn new(config: &UpdaterConfig) -> Result<Self> {
        let mut parts = config.esptool.split_whitespace().map(str::to_owned);
        let program = parts
            .next()
            .ok_or_else(|| UpdaterError::Config("esptool command is empty".to_owned()))?;

        Ok(Self {
            program,
            launcher_args: parts.collect(),
            chip: config.chip.clone(),
        })
    }

    pub fn erase_args(&self, port: &str) -> Vec<String> {
        let mut args = self.common_args(port, None);
        args.push("erase-flash".to_owned());
        args
    }

    pub fn write_args(&self, port: &str, baud: u32, plan: &[(u32, PathBuf)]) -> Vec<String> {
        let mut args = self.common_args(port, Some(baud));
        args.push("write-flash".to_owned());
        for (offset, path) in plan {
            args.push(format_offset(*offset));
            args.push(path.display().to_string());
        }
        args
    }

    fn common_args(&self, port: &str, baud: Option<u32>) -> Vec<String> {
        let mut args = self.launcher_args.clone();
        args.extend(["--chip".to_owned(), self.chip.clone()]);
        args.extend(["--port".to_owned(), port.to_owned()]);
        if let Some(baud) = baud {
            args.extend(["--baud".to_owned(), baud.to_string()]);
        }
        args.extend([
            "--before".to_owned(),
            "default-reset".to_owned(),
            "--after".to_owned(),
            "hard-reset".to_owned(),
        ]);
        args
    }

    async fn run(
        &self,
        args: Vec<String>,
        on_milestone: &(dyn Fn(FlashMilestone) + Send + Sync),
    ) -> Result<()> {
        tracing::info!("Running {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| UpdaterError::FlashTool {
                status: "not started".to_owned(),
                output: format!("failed to start {}: {e}", self.program),
            })?;

        let stderr = child.stderr.take().map(|stream| {
            tokio::spawn(async move {
                let mut text = String::new();
                let mut reader = BufReader::new(stream);
                let mut raw = Vec::new();
                if reader.read_to_end(&mut raw).await.is_ok() {
                    text = String::from_utf8_lossy(&raw).into_owned();
                }
                text
            })
        });

        let mut captured = match child.stdout.take() {
            Some(stdout) => scan_output(stdout, on_milestone).await,
            None => String::new(),
        };

        let status = child.wait().await?;

        if let Some(task) = stderr {
            captured.push_str(&task.await.unwrap_or_default());
        }

        if !status.success() {
            if captured.trim().is_empty() {
                captured = format!("{} exited with {status} and printed nothing", self.program);
            }
            tracing::error!("{} failed ({status}):\n{captured}", self.program);
            return Err(UpdaterError::FlashTool {
                status: status.to_string(),
                output: captured,
            });
        }

        tracing::debug!("{} finished ({status})", self.program);
        Ok(())
    }
}

/// Collect stdout line by line, reporting milestones as they appear
async fn scan_output<R>(stream: R, on_milestone: &(dyn Fn(FlashMilestone) + Send + Sync)) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut captured = String::new();
    let mut raw = Vec::new();
    let mut last: Option<FlashMilestone> = None;

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Lost flash tool output: {e}");
                break;
            }
        }

        let line = String::from_utf8_lossy(&raw);
        tracing::debug!(target: "esptool", "{}", line.trim_end());
        // esptool repeats both markers per image; report each once
        if let Some(milestone) = milestone_for_line(&line)
            && last.is_none_or(|seen| milestone > seen)
        {
            last = Some(milestone);
            on_milestone(milestone);
        }
        captured.push_str(&line);
    }
    captured
}

#[async_trait]
impl FlashTool for EsptoolExecutor {
    async fn erase(&self, port: &str) -> Result<()> {
        self.run(self.erase_args(port), &|_| {}).await
    }

    async fn write_all(
        &self,
        port: &str,
        baud: u32,
        plan: &[(u32, PathBuf)],
        on_milestone: &(dyn Fn(FlashMilestone) + Send + Sync),
    ) -> Result<()> {
        self.run(self.write_args(port, baud, plan), on_milestone)
            .await
    }
}
