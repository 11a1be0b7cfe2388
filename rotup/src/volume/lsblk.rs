use std::{sync::Arc, time::Duration};

use serde::Deserialize;

use super::{CatalogError, Scan, VolumeCatalog, VolumeDescriptor, is_mountable_fs, is_virtual_device};
use crate::exec::CommandRunner;

const LSBLK_ARGS: [&str; 4] = [
    "--json",
    "--paths",
    "-o",
    "NAME,UUID,LABEL,FSTYPE,TYPE,RM,MOUNTPOINT",
];

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(rename = "type", default)]
    device_type: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Enumerates block devices through `lsblk --json`.
pub struct LsblkCatalog {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl LsblkCatalog {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl VolumeCatalog for LsblkCatalog {
    fn scan(&self) -> Scan {
        let output = match self.runner.run("lsblk", &LSBLK_ARGS, self.timeout) {
            Ok(output) => output,
            Err(e) => return Scan::unavailable(e.into()),
        };
        match parse_lsblk(&output.stdout) {
            Ok(volumes) => Scan::found(volumes),
            Err(e) => Scan::unavailable(e),
        }
    }

    fn name(&self) -> &'static str {
        "lsblk"
    }
}

pub fn parse_lsblk(json: &str) -> Result<Vec<VolumeDescriptor>, CatalogError> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|e| CatalogError::Parse {
        tool: "lsblk",
        message: e.to_string(),
    })?;

    let mut volumes = Vec::new();
    for device in &output.blockdevices {
        collect(device, &mut volumes);
    }
    Ok(volumes)
}

fn collect(device: &LsblkDevice, volumes: &mut Vec<VolumeDescriptor>) {
    let device_type = device.device_type.as_deref().unwrap_or_default();
    if matches!(device_type, "rom" | "loop") || is_virtual_device(&device.name) {
        return;
    }

    // a whole disk without a filesystem is a partition table container
    if is_mountable_fs(device.fstype.as_deref()) {
        volumes.push(VolumeDescriptor::from_probe(
            &device.name,
            device.uuid.as_deref(),
            device.label.as_deref(),
            device.fstype.as_deref(),
        ));
    }

    for child in &device.children {
        collect(child, volumes);
    }
}
