use std::path::{Path, PathBuf};

use super::{AttachError, AttachmentManager, DetachError, MountOptions};
use crate::volume::VolumeDescriptor;

/// Windows mounts lettered volumes itself, attaching only checks the drive
/// root is reachable and detaching leaves the mount to the OS.
#[derive(Debug, Default)]
pub struct DriveRootManager;

impl AttachmentManager for DriveRootManager {
    fn attach(
        &self,
        volume: &VolumeDescriptor,
        target: &Path,
        _options: &MountOptions,
    ) -> Result<PathBuf, AttachError> {
        let root = PathBuf::from(&volume.mount_hint);
        if !root.is_dir() {
            return Err(AttachError::Unreachable { path: root });
        }
        tracing::debug!(
            "Using drive root {} for {}, ignoring target {}",
            root.display(),
            volume.identity,
            target.display()
        );
        Ok(root)
    }

    fn detach(&self, path: &Path) -> Result<(), DetachError> {
        tracing::debug!("Leaving {} mounted by the OS", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::tempdir;

    use super::DriveRootManager;
    use crate::{
        attach::{AttachError, AttachmentManager, Credentials, MountOptions},
        volume::{IdentityKind, VolumeDescriptor},
    };

    #[test]
    fn test_drive_root() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let volume = VolumeDescriptor::new("DISKB", IdentityKind::Label, "DISKB", &root);
        let options = MountOptions::for_volume(&volume, Credentials { uid: 0, gid: 0 });

        let path = DriveRootManager
            .attach(&volume, Path::new("ignored"), &options)
            .unwrap();
        assert_eq!(path, tmp.path());
        DriveRootManager.detach(&path).unwrap();

        let gone = VolumeDescriptor::new("DISKC", IdentityKind::Label, "DISKC", "/nonexistent/Z:");
        let err = DriveRootManager
            .attach(&gone, Path::new("ignored"), &options)
            .unwrap_err();
        assert!(matches!(err, AttachError::Unreachable { .. }));
    }
}
