//! Attaching the selected volume at a usable path and releasing it again.
//!
//! [`Attachment`] owns an attached volume: once [`Attachment::attach`]
//! succeeds the volume is detached exactly once, either through
//! [`Attachment::release`] or when the guard is dropped.

pub mod linux;
pub mod windows;

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{exec::CommandError, volume::VolumeDescriptor};

pub use linux::MountCommandManager;
pub use windows::DriveRootManager;

/// Owner of the files written to the attached filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Value passed to `mount -t`.
    pub driver: String,
    pub options: Vec<String>,
}

impl MountOptions {
    /// Options for mounting `volume`, keyed on its filesystem type.
    ///
    /// NTFS goes through `ntfs-3g` with `remove_hiberfile`, otherwise a disk
    /// last used by a hibernated Windows host only mounts read-only.
    pub fn for_volume(volume: &VolumeDescriptor, credentials: Credentials) -> Self {
        let fs_type = volume
            .fs_type
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "ntfs".to_string());
        let uid = format!("uid={}", credentials.uid);
        let gid = format!("gid={}", credentials.gid);

        let (driver, options) = match fs_type.as_str() {
            "ntfs" | "ntfs3" | "ntfs-3g" => (
                "ntfs-3g".to_string(),
                vec![
                    "defaults",
                    uid.as_str(),
                    gid.as_str(),
                    "remove_hiberfile",
                    "rw",
                    "exec",
                ],
            ),
            "vfat" | "exfat" | "msdos" => (
                fs_type.clone(),
                vec!["defaults", uid.as_str(), gid.as_str(), "rw"],
            ),
            // ownership of native filesystems lives in the inodes
            _ => (fs_type.clone(), vec!["defaults", "rw"]),
        };

        Self {
            driver,
            options: options.into_iter().map(String::from).collect(),
        }
    }

    pub fn option_string(&self) -> String {
        self.options.join(",")
    }
}

/// Lifecycle of an [`Attachment`]. Attaching and a failed attach never
/// produce a guard, they surface as [`AttachError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Attached,
    Detaching,
    Detached,
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("cannot prepare attach target {}: {source}", path.display())]
    Target {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("attach target {} is busy and could not be released: {source}", path.display())]
    Busy {
        path: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("failed to mount {volume} at {}: {source}", path.display())]
    Mount {
        volume: String,
        path: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("volume root {} is not reachable", path.display())]
    Unreachable { path: PathBuf },
}

#[derive(Debug, Error)]
#[error("failed to release {}: {source}", path.display())]
pub struct DetachError {
    pub path: PathBuf,
    #[source]
    pub source: CommandError,
}

/// Platform mechanism behind [`Attachment`].
pub trait AttachmentManager: Send + Sync {
    /// Make `volume` available, returning the path its filesystem is reachable at.
    ///
    /// Implementations clear any stale attachment at `target` first.
    fn attach(
        &self,
        volume: &VolumeDescriptor,
        target: &Path,
        options: &MountOptions,
    ) -> Result<PathBuf, AttachError>;

    fn detach(&self, path: &Path) -> Result<(), DetachError>;
}

/// Scoped attachment of one volume.
pub struct Attachment<'a> {
    manager: &'a dyn AttachmentManager,
    path: PathBuf,
    identity: String,
    state: AttachState,
}

impl<'a> Attachment<'a> {
    pub fn attach(
        manager: &'a dyn AttachmentManager,
        volume: &VolumeDescriptor,
        target: &Path,
        options: &MountOptions,
    ) -> Result<Self, AttachError> {
        tracing::debug!(
            "Attaching {} ({}) at {} with {} [{}]",
            volume.identity,
            volume.mount_hint,
            target.display(),
            options.driver,
            options.option_string()
        );
        let path = manager.attach(volume, target, options).inspect_err(|e| {
            tracing::error!("Attach of {} failed: {e}", volume.identity);
        })?;

        Ok(Self {
            manager,
            path,
            identity: volume.identity.clone(),
            state: AttachState::Attached,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    /// Detach now and report the outcome.
    pub fn release(mut self) -> Result<(), DetachError> {
        self.detach_once()
    }

    fn detach_once(&mut self) -> Result<(), DetachError> {
        if self.state != AttachState::Attached {
            return Ok(());
        }
        self.state = AttachState::Detaching;
        tracing::debug!("Detaching {} from {}", self.identity, self.path.display());
        let result = self.manager.detach(&self.path);
        // a failed detach is not retried, the operator has to step in
        self.state = AttachState::Detached;
        result
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.detach_once() {
            tracing::warn!("{e}, detach it manually");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::volume::IdentityKind;

    #[derive(Default)]
    struct Counting {
        attached: AtomicUsize,
        detached: AtomicUsize,
        fail_detach: bool,
    }

    impl AttachmentManager for Counting {
        fn attach(
            &self,
            _volume: &VolumeDescriptor,
            target: &Path,
            _options: &MountOptions,
        ) -> Result<PathBuf, AttachError> {
            self.attached.fetch_add(1, Ordering::SeqCst);
            Ok(target.to_path_buf())
        }

        fn detach(&self, path: &Path) -> Result<(), DetachError> {
            self.detached.fetch_add(1, Ordering::SeqCst);
            if self.fail_detach {
                return Err(DetachError {
                    path: path.to_path_buf(),
                    source: CommandError::Failed {
                        program: "umount".to_string(),
                        status: "exit status: 32".to_string(),
                        stderr: "target is busy".to_string(),
                    },
                });
            }
            Ok(())
        }
    }

    fn disk(fs_type: Option<&str>) -> VolumeDescriptor {
        let v = VolumeDescriptor::new("1111-AAAA", IdentityKind::Uuid, "DISKA", "/dev/sdb1");
        match fs_type {
            Some(fs) => v.with_fs_type(fs),
            None => v,
        }
    }

    const CREDS: Credentials = Credentials {
        uid: 1000,
        gid: 1000,
    };

    #[test]
    fn test_ntfs_options() {
        let options = MountOptions::for_volume(&disk(Some("ntfs")), CREDS);
        assert_eq!(options.driver, "ntfs-3g");
        assert_eq!(
            options.option_string(),
            "defaults,uid=1000,gid=1000,remove_hiberfile,rw,exec"
        );
        // unknown filesystem defaults to the rotation disks' NTFS
        assert_eq!(MountOptions::for_volume(&disk(None), CREDS), options);
    }

    #[test]
    fn test_other_filesystem_options() {
        let exfat = MountOptions::for_volume(&disk(Some("exfat")), CREDS);
        assert_eq!(exfat.driver, "exfat");
        assert_eq!(exfat.option_string(), "defaults,uid=1000,gid=1000,rw");

        let ext4 = MountOptions::for_volume(&disk(Some("ext4")), CREDS);
        assert_eq!(ext4.option_string(), "defaults,rw");
    }

    #[test]
    fn test_release_detaches_once() {
        let manager = Counting::default();
        let volume = disk(None);
        let options = MountOptions::for_volume(&volume, CREDS);
        let attachment =
            Attachment::attach(&manager, &volume, Path::new("/mnt/rotup"), &options).unwrap();
        assert_eq!(attachment.state(), AttachState::Attached);
        attachment.release().unwrap();

        assert_eq!(manager.attached.load(Ordering::SeqCst), 1);
        assert_eq!(manager.detached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_detaches() {
        let manager = Counting::default();
        let volume = disk(None);
        let options = MountOptions::for_volume(&volume, CREDS);
        {
            let _attachment =
                Attachment::attach(&manager, &volume, Path::new("/mnt/rotup"), &options).unwrap();
        }
        assert_eq!(manager.detached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_detach_is_reported_not_retried() {
        let manager = Counting {
            fail_detach: true,
            ..Default::default()
        };
        let volume = disk(None);
        let options = MountOptions::for_volume(&volume, CREDS);
        let attachment =
            Attachment::attach(&manager, &volume, Path::new("/mnt/rotup"), &options).unwrap();
        assert!(attachment.release().is_err());
        assert_eq!(manager.detached.load(Ordering::SeqCst), 1);
    }
}
