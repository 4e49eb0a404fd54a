//! Output formatting for CLI commands.
//!
//! Every command produces a serializable DTO; text mode renders it with a
//! closure, JSON mode prints it as is.

use anyhow::Result;
use armature_core::{Deployment, GcStats};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write output using the configured format.
    ///
    /// `data` should carry `success` and `result_code` fields. `text_fn`
    /// is only called in text mode.
    pub fn write<T: Serialize>(
        &self,
        data: &T,
        text_fn: impl FnOnce() -> String,
    ) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{json}")?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{text}")?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr, as a JSON object in JSON mode.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{error:#}"),
                };
                if let Ok(json) = serde_json::to_string_pretty(&output) {
                    let _ = writeln!(io::stderr(), "{json}");
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {error:#}");
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `deploy`.
#[derive(Debug, Serialize)]
pub struct DeployOutput {
    pub success: bool,
    pub result_code: u8,
    pub control: String,
    pub deployments: Vec<Deployment>,
}

impl DeployOutput {
    pub fn render(&self) -> String {
        let mut text = String::new();
        for deployment in &self.deployments {
            match deployment {
                Deployment::Deployed {
                    name,
                    reference,
                    identity,
                    modules,
                    ..
                } => text.push_str(&format!(
                    "Deployed {name}: {reference} at {identity} ({modules} module{})\n",
                    if *modules == 1 { "" } else { "s" }
                )),
                Deployment::Removed { name } => {
                    text.push_str(&format!("Removed {name}: reference is gone\n"))
                }
            }
        }
        if self.deployments.is_empty() {
            text.push_str("Nothing to deploy\n");
        }
        text
    }
}

/// Output for `update`.
#[derive(Debug, Serialize)]
pub struct UpdateOutput {
    pub success: bool,
    pub result_code: u8,
    pub refs_updated: usize,
}

/// Output for `gc`.
#[derive(Debug, Serialize)]
pub struct GcOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    #[serde(flatten)]
    pub stats: GcStats,
}

impl GcOutput {
    pub fn render(&self) -> String {
        let verb = if self.dry_run { "Would remove" } else { "Removed" };
        let mut text = String::new();
        if self.dry_run {
            text.push_str("Dry run - nothing removed\n");
        }
        text.push_str(&format!("{verb} {} stale lock files\n", self.stats.locks_removed));
        text.push_str(&format!("{verb} {} stale temporary paths\n", self.stats.temps_removed));
        text.push_str(&format!("{verb} {} references\n", self.stats.refs_deleted));
        text.push_str(&format!("{verb} {} objects\n", self.stats.objects_trashed));
        text.push_str(&format!("{verb} {} repositories\n", self.stats.repos_trashed));
        text
    }
}

/// Output for `environments`.
#[derive(Debug, Serialize)]
pub struct EnvironmentsOutput {
    pub success: bool,
    pub result_code: u8,
    pub environments: Vec<String>,
}
