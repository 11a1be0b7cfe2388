use std::{collections::HashMap, sync::Arc, time::Duration};

use super::{CatalogError, Scan, VolumeCatalog, VolumeDescriptor, is_mountable_fs, is_virtual_device};
use crate::exec::CommandRunner;

/// Enumerates volumes with plain `blkid`. Needs root to see uncached devices.
pub struct BlkidCatalog {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl BlkidCatalog {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl VolumeCatalog for BlkidCatalog {
    fn scan(&self) -> Scan {
        match self.runner.run("blkid", &[], self.timeout) {
            Ok(output) => match parse_blkid(&output.stdout) {
                Ok(volumes) => Scan::found(volumes),
                Err(e) => Scan::unavailable(e),
            },
            Err(e) => Scan::unavailable(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "blkid"
    }
}

/// Parse `blkid` output lines: `/dev/sdb1: LABEL="DISK A" UUID="1111-AAAA" TYPE="ntfs"`.
pub fn parse_blkid(output: &str) -> Result<Vec<VolumeDescriptor>, CatalogError> {
    let mut volumes = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (device, attributes) = line.split_once(": ").ok_or_else(|| CatalogError::Parse {
            tool: "blkid",
            message: format!("missing device separator in `{line}`"),
        })?;
        if is_virtual_device(device) {
            continue;
        }

        let attributes = parse_attributes(attributes).ok_or_else(|| CatalogError::Parse {
            tool: "blkid",
            message: format!("malformed attributes in `{line}`"),
        })?;
        let fs_type = attributes.get("TYPE").map(String::as_str);
        // partition-table-only entries carry no TYPE
        if !is_mountable_fs(fs_type) {
            continue;
        }

        volumes.push(VolumeDescriptor::from_probe(
            device,
            attributes.get("UUID").map(String::as_str),
            attributes.get("LABEL").map(String::as_str),
            fs_type,
        ));
    }

    Ok(volumes)
}

fn parse_attributes(input: &str) -> Option<HashMap<String, String>> {
    let mut attributes = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Some(attributes);
        }

        let key: String = std::iter::from_fn(|| chars.next_if(|&c| c != '=')).collect();
        if chars.next() != Some('=') || chars.next() != Some('"') {
            return None;
        }

        let mut value = String::new();
        loop {
            match chars.next()? {
                '\\' => value.push(chars.next()?),
                '"' => break,
                c => value.push(c),
            }
        }
        attributes.insert(key, value);
    }
}
