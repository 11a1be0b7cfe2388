use std::{sync::Arc, time::Duration};

use serde::Deserialize;

use super::{CatalogError, IdentityKind, Scan, VolumeCatalog, VolumeDescriptor};
use crate::exec::CommandRunner;

const GET_VOLUME: &str = "Get-Volume | Where-Object { $_.DriveLetter } | \
    Select-Object @{n='DriveLetter';e={[string]$_.DriveLetter}},FileSystemLabel,FileSystem,\
    @{n='DriveType';e={[string]$_.DriveType}},UniqueId | ConvertTo-Json -Compress";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(PsVolume),
    Many(Vec<PsVolume>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsVolume {
    drive_letter: Option<String>,
    file_system_label: Option<String>,
    file_system: Option<String>,
    drive_type: Option<String>,
    unique_id: Option<String>,
}

/// Enumerates lettered volumes through PowerShell's `Get-Volume`.
pub struct PowerShellCatalog {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl PowerShellCatalog {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl VolumeCatalog for PowerShellCatalog {
    fn scan(&self) -> Scan {
        let args = ["-NoProfile", "-NonInteractive", "-Command", GET_VOLUME];
        match self.runner.run("powershell", &args, self.timeout) {
            Ok(output) => match parse_get_volume(&output.stdout) {
                Ok(volumes) => Scan::found(volumes),
                Err(e) => Scan::unavailable(e),
            },
            Err(e) => Scan::unavailable(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "Get-Volume"
    }
}

pub fn parse_get_volume(json: &str) -> Result<Vec<VolumeDescriptor>, CatalogError> {
    // no lettered volume at all renders as empty output
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: OneOrMany = serde_json::from_str(json).map_err(|e| CatalogError::Parse {
        tool: "Get-Volume",
        message: e.to_string(),
    })?;
    let entries = match parsed {
        OneOrMany::One(v) => vec![v],
        OneOrMany::Many(v) => v,
    };

    Ok(entries.into_iter().filter_map(into_descriptor).collect())
}

fn into_descriptor(volume: PsVolume) -> Option<VolumeDescriptor> {
    let letter = volume.drive_letter.filter(|l| !l.trim().is_empty())?;
    if volume.drive_type.as_deref() == Some("CD-ROM") {
        return None;
    }
    let root = format!("{}:\\", letter.trim());

    let label = volume
        .file_system_label
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string());
    let (identity, kind) = match (&label, &volume.unique_id) {
        (Some(label), _) => (label.clone(), IdentityKind::Label),
        (None, Some(id)) => (id.clone(), IdentityKind::Uuid),
        (None, None) => (root.clone(), IdentityKind::Device),
    };

    let descriptor = VolumeDescriptor::new(identity, kind, label.unwrap_or(root.clone()), root);
    Some(match volume.file_system {
        Some(fs) if !fs.is_empty() => descriptor.with_fs_type(fs),
        _ => descriptor,
    })
}
