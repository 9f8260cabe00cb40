//! Read-only presentation of the instance collection.
//!
//! Listing never takes part in lifecycle operations and never writes the
//! state file. With `live`, each row also carries the PID the resolver
//! currently observes for the port, which may disagree with the recorded
//! status until `reconcile` runs.

use crate::core::error::VisorError;
use crate::core::output::{elide_middle, pad};
use crate::core::state::{InstanceStatus, InstanceStore};
use crate::plugins::resolver::{ProcessId, ProcessResolver};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

const DIR_COLUMN_WIDTH: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    Table,
    Json,
}

impl std::str::FromStr for ListFormat {
    type Err = VisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" | "text" => Ok(ListFormat::Table),
            "json" => Ok(ListFormat::Json),
            other => Err(VisorError::ValidationError(format!(
                "unknown list format '{}' (expected table or json)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRow {
    pub id: usize,
    pub name: String,
    pub data_directory: PathBuf,
    pub port: u16,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_pid: Option<Option<ProcessId>>,
}

impl InstanceRow {
    /// Recorded status disagrees with what the resolver saw.
    pub fn is_drifted(&self) -> bool {
        match self.live_pid {
            Some(pid) => pid.is_some() != (self.status == InstanceStatus::Running),
            None => false,
        }
    }
}

/// Snapshot the collection in order; `resolver` adds live PIDs.
pub fn rows(
    store: &InstanceStore,
    resolver: Option<&dyn ProcessResolver>,
) -> Result<Vec<InstanceRow>, VisorError> {
    let records = store.load()?;
    let mut out = Vec::with_capacity(records.len());
    for (id, rec) in records.into_iter().enumerate() {
        let live_pid = match resolver {
            Some(r) => Some(r.find_process(rec.port)?),
            None => None,
        };
        out.push(InstanceRow {
            id,
            name: rec.name,
            data_directory: rec.data_directory,
            port: rec.port,
            status: rec.status,
            live_pid,
        });
    }
    Ok(out)
}

pub fn render_json(rows: &[InstanceRow]) -> Result<String, VisorError> {
    serde_json::to_string_pretty(rows)
        .map_err(|e| VisorError::IoError(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

pub fn render_table(rows: &[InstanceRow]) -> String {
    if rows.is_empty() {
        return format!("{}", "No instances recorded.".dimmed());
    }
    let live = rows.iter().any(|r| r.live_pid.is_some());
    let name_width = rows
        .iter()
        .map(|r| r.name.chars().count())
        .max()
        .unwrap_or(4)
        .max(4);

    let mut header = format!(
        "{}  {}  {}  {}  {}",
        pad("ID", 3),
        pad("NAME", name_width),
        pad("PORT", 5),
        pad("STATUS", 7),
        "DATA DIRECTORY"
    );
    if live {
        header.push_str("  PID");
    }
    let mut lines = vec![format!("{}", header.bold())];

    for row in rows {
        let status = pad(&row.status.to_string(), 7);
        let status = match row.status {
            InstanceStatus::Running => status.bright_green(),
            InstanceStatus::Stopped => status.bright_black(),
        };
        let dir = elide_middle(&row.data_directory.display().to_string(), DIR_COLUMN_WIDTH);
        let mut line = format!(
            "{}  {}  {}  {}  {}",
            pad(&row.id.to_string(), 3),
            pad(&row.name, name_width).bright_cyan(),
            pad(&row.port.to_string(), 5),
            status,
            pad(&dir, DIR_COLUMN_WIDTH)
        );
        if let Some(pid) = row.live_pid {
            let pid = match pid {
                Some(pid) => pid.to_string(),
                None => "-".to_string(),
            };
            if row.is_drifted() {
                line.push_str(&format!("  {} {}", pid.bright_yellow(), "(drift)".bright_yellow()));
            } else {
                line.push_str(&format!("  {}", pid));
            }
        }
        lines.push(line);
    }
    lines.join("\n")
}
