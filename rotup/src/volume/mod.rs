//! Enumeration of the storage volumes currently visible to the OS.
//!
//! A scan is best-effort: a missing tool or a denied query never aborts a run,
//! it yields an empty [`Scan`] that carries the reason in `unavailable`.

pub mod blkid;
pub mod lsblk;
pub mod windows;

use std::fmt::{Display, Formatter};

use serde::Serialize;
use thiserror::Error;

use crate::exec::CommandError;

pub use blkid::BlkidCatalog;
pub use lsblk::LsblkCatalog;
pub use windows::PowerShellCatalog;

/// Which platform token ended up as the identity of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IdentityKind {
    Uuid,
    Label,
    Device,
}

impl Display for IdentityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityKind::Uuid => write!(f, "uuid"),
            IdentityKind::Label => write!(f, "label"),
            IdentityKind::Device => write!(f, "device"),
        }
    }
}

/// One volume as seen by a single scan. Never cached across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeDescriptor {
    pub identity: String,
    pub kind: IdentityKind,
    pub display_name: String,
    /// Device node on Linux (`/dev/sdb1`), drive root on Windows (`E:\`).
    pub mount_hint: String,
    pub fs_type: Option<String>,
}

impl VolumeDescriptor {
    pub fn new(
        identity: impl Into<String>,
        kind: IdentityKind,
        display_name: impl Into<String>,
        mount_hint: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            kind,
            display_name: display_name.into(),
            mount_hint: mount_hint.into(),
            fs_type: None,
        }
    }

    pub fn with_fs_type(mut self, fs_type: impl Into<String>) -> Self {
        self.fs_type = Some(fs_type.into());
        self
    }

    /// Build a descriptor from probed attributes, preferring the filesystem
    /// UUID, then the label, then the device path.
    pub fn from_probe(
        device: &str,
        uuid: Option<&str>,
        label: Option<&str>,
        fs_type: Option<&str>,
    ) -> Self {
        let uuid = uuid.map(str::trim).filter(|u| !u.is_empty());
        let label = label.map(str::trim).filter(|l| !l.is_empty());

        let (identity, kind) = match (uuid, label) {
            (Some(uuid), _) => (uuid, IdentityKind::Uuid),
            (None, Some(label)) => (label, IdentityKind::Label),
            (None, None) => (device, IdentityKind::Device),
        };

        let descriptor =
            VolumeDescriptor::new(identity, kind, label.unwrap_or(device), device);
        match fs_type.map(str::trim).filter(|t| !t.is_empty()) {
            Some(fs_type) => descriptor.with_fs_type(fs_type),
            None => descriptor,
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("unexpected output from `{tool}`: {message}")]
    Parse { tool: &'static str, message: String },
}

/// Result of one enumeration pass.
#[derive(Debug, Default)]
pub struct Scan {
    pub volumes: Vec<VolumeDescriptor>,
    /// Set when enumeration could not run; `volumes` is empty in that case.
    pub unavailable: Option<CatalogError>,
}

impl Scan {
    pub fn found(volumes: Vec<VolumeDescriptor>) -> Self {
        Self {
            volumes,
            unavailable: None,
        }
    }

    pub fn unavailable(error: CatalogError) -> Self {
        Self {
            volumes: Vec::new(),
            unavailable: Some(error),
        }
    }

    pub fn is_available(&self) -> bool {
        self.unavailable.is_none()
    }
}

pub trait VolumeCatalog: Send + Sync {
    /// Enumerate attached volumes. Call again to rescan.
    fn scan(&self) -> Scan;

    fn name(&self) -> &'static str;
}

/// Tries `primary` and falls back to `fallback` when the former is unavailable.
pub struct FallbackCatalog {
    primary: Box<dyn VolumeCatalog>,
    fallback: Box<dyn VolumeCatalog>,
}

impl FallbackCatalog {
    pub fn new(primary: Box<dyn VolumeCatalog>, fallback: Box<dyn VolumeCatalog>) -> Self {
        Self { primary, fallback }
    }
}

impl VolumeCatalog for FallbackCatalog {
    fn scan(&self) -> Scan {
        let scan = self.primary.scan();
        let Some(err) = &scan.unavailable else {
            return scan;
        };
        tracing::warn!(
            "{} unavailable ({err}), falling back to {}",
            self.primary.name(),
            self.fallback.name()
        );
        self.fallback.scan()
    }

    fn name(&self) -> &'static str {
        self.primary.name()
    }
}

/// Device nodes that never hold a rotation disk: optical, loop and RAM disks.
pub(crate) fn is_virtual_device(device: &str) -> bool {
    let name = device.rsplit('/').next().unwrap_or(device);
    ["loop", "sr", "ram", "zram", "nbd"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Whether a probed filesystem type can hold an archive. Optical images,
/// swap and the members of LVM, LUKS, RAID and ZFS setups cannot be mounted
/// on their own.
pub(crate) fn is_mountable_fs(fs_type: Option<&str>) -> bool {
    match fs_type.map(str::trim) {
        None | Some("") => false,
        Some(fs_type) => !matches!(
            fs_type,
            "iso9660"
                | "udf"
                | "squashfs"
                | "swap"
                | "LVM2_member"
                | "crypto_LUKS"
                | "linux_raid_member"
                | "zfs_member"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandError;

    struct Fixed(Option<Vec<VolumeDescriptor>>, &'static str);

    impl VolumeCatalog for Fixed {
        fn scan(&self) -> Scan {
            match &self.0 {
                Some(volumes) => Scan::found(volumes.clone()),
                None => Scan::unavailable(CatalogError::Command(CommandError::NotFound {
                    program: self.1.to_string(),
                })),
            }
        }

        fn name(&self) -> &'static str {
            self.1
        }
    }

    #[test]
    fn test_identity_preference() {
        let v = VolumeDescriptor::from_probe("/dev/sdb1", Some("1111-AAAA"), Some("DISKA"), None);
        assert_eq!(v.identity, "1111-AAAA");
        assert_eq!(v.kind, IdentityKind::Uuid);
        assert_eq!(v.display_name, "DISKA");

        let v = VolumeDescriptor::from_probe("/dev/sdb1", Some(""), Some("DISKA"), Some("ntfs"));
        assert_eq!(v.identity, "DISKA");
        assert_eq!(v.kind, IdentityKind::Label);
        assert_eq!(v.fs_type.as_deref(), Some("ntfs"));

        let v = VolumeDescriptor::from_probe("/dev/sdc", None, None, None);
        assert_eq!(v.identity, "/dev/sdc");
        assert_eq!(v.kind, IdentityKind::Device);
        assert_eq!(v.mount_hint, "/dev/sdc");
    }

    #[test]
    fn test_fallback_used_only_when_primary_unavailable() {
        let disk = VolumeDescriptor::new("1111-AAAA", IdentityKind::Uuid, "A", "/dev/sdb1");

        let catalog = FallbackCatalog::new(
            Box::new(Fixed(None, "lsblk")),
            Box::new(Fixed(Some(vec![disk.clone()]), "blkid")),
        );
        assert_eq!(catalog.scan().volumes, vec![disk.clone()]);

        let catalog = FallbackCatalog::new(
            Box::new(Fixed(Some(vec![]), "lsblk")),
            Box::new(Fixed(Some(vec![disk]), "blkid")),
        );
        let scan = catalog.scan();
        assert!(scan.is_available());
        assert!(scan.volumes.is_empty());

        let catalog = FallbackCatalog::new(
            Box::new(Fixed(None, "lsblk")),
            Box::new(Fixed(None, "blkid")),
        );
        let scan = catalog.scan();
        assert!(!scan.is_available());
        assert!(scan.volumes.is_empty());
    }

    #[test]
    fn test_mountable_fs() {
        assert!(is_mountable_fs(Some("ntfs")));
        assert!(is_mountable_fs(Some("exfat")));
        assert!(!is_mountable_fs(None));
        assert!(!is_mountable_fs(Some("")));
        assert!(!is_mountable_fs(Some("iso9660")));
        assert!(!is_mountable_fs(Some("swap")));
        assert!(!is_mountable_fs(Some("LVM2_member")));
        assert!(!is_mountable_fs(Some("crypto_LUKS")));
        assert!(!is_mountable_fs(Some("linux_raid_member")));
    }

    #[test]
    fn test_virtual_devices() {
        assert!(is_virtual_device("/dev/loop3"));
        assert!(is_virtual_device("/dev/sr0"));
        assert!(is_virtual_device("/dev/zram0"));
        assert!(!is_virtual_device("/dev/sdb1"));
        assert!(!is_virtual_device("/dev/nvme0n1p2"));
    }
}
