use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use super::{AttachError, AttachmentManager, DetachError, MountOptions};
use crate::{
    exec::CommandRunner,
    volume::{IdentityKind, VolumeDescriptor},
};

static MOUNT_TABLE: &str = "/proc/self/mounts";

/// ntfs-3g may replay the journal on mount, give it more room than a probe.
const MOUNT_TIMEOUT: Duration = Duration::from_secs(120);

/// Mounts rotation disks with `mount`/`umount`.
pub struct MountCommandManager {
    runner: Arc<dyn CommandRunner>,
    mount_table: PathBuf,
}

impl MountCommandManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            mount_table: PathBuf::from(MOUNT_TABLE),
        }
    }

    pub fn with_mount_table(mut self, mount_table: impl Into<PathBuf>) -> Self {
        self.mount_table = mount_table.into();
        self
    }

    /// Whether something is mounted at `target`, `None` if the table is unreadable.
    fn is_mounted(&self, target: &Path) -> Option<bool> {
        let table = fs::read_to_string(&self.mount_table).ok()?;
        let target = target
            .canonicalize()
            .unwrap_or_else(|_| target.to_path_buf());
        Some(table.lines().any(|line| {
            line.split_whitespace()
                .nth(1)
                .is_some_and(|mountpoint| Path::new(&unescape_mount_path(mountpoint)) == target)
        }))
    }

    /// Release whatever a previous, possibly crashed, run left at `target`.
    fn release_stale(&self, target: &Path) -> Result<(), AttachError> {
        let target_str = target.to_string_lossy();
        match self.is_mounted(target) {
            Some(false) => Ok(()),
            Some(true) => {
                tracing::warn!("{} is still mounted, unmounting it", target.display());
                self.runner
                    .run("umount", &[target_str.as_ref()], MOUNT_TIMEOUT)
                    .map(|_| ())
                    .map_err(|source| AttachError::Busy {
                        path: target.to_path_buf(),
                        source,
                    })
            }
            None => {
                let result = self
                    .runner
                    .run("umount", &[target_str.as_ref()], MOUNT_TIMEOUT);
                if let Err(e) = result {
                    tracing::debug!("Pre-attach umount of {} failed: {e}", target.display());
                }
                Ok(())
            }
        }
    }
}

impl AttachmentManager for MountCommandManager {
    fn attach(
        &self,
        volume: &VolumeDescriptor,
        target: &Path,
        options: &MountOptions,
    ) -> Result<PathBuf, AttachError> {
        fs::create_dir_all(target).map_err(|source| AttachError::Target {
            path: target.to_path_buf(),
            source,
        })?;
        self.release_stale(target)?;

        let source = source_spec(volume);
        let option_string = options.option_string();
        let target_str = target.to_string_lossy();
        let args = [
            "-t",
            options.driver.as_str(),
            "-o",
            option_string.as_str(),
            source.as_str(),
            target_str.as_ref(),
        ];
        self.runner
            .run("mount", &args, MOUNT_TIMEOUT)
            .map_err(|source| AttachError::Mount {
                volume: volume.identity.clone(),
                path: target.to_path_buf(),
                source,
            })?;

        tracing::info!("Mounted {} at {}", volume.identity, target.display());
        Ok(target.to_path_buf())
    }

    fn detach(&self, path: &Path) -> Result<(), DetachError> {
        self.runner
            .run("umount", &[path.to_string_lossy().as_ref()], MOUNT_TIMEOUT)
            .map_err(|source| DetachError {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::info!("Unmounted {}", path.display());
        Ok(())
    }
}

/// Device argument for `mount`, following how the volume was identified.
pub fn source_spec(volume: &VolumeDescriptor) -> String {
    match volume.kind {
        IdentityKind::Uuid => format!("UUID={}", volume.identity),
        IdentityKind::Label => format!("LABEL={}", volume.identity),
        IdentityKind::Device => volume.mount_hint.clone(),
    }
}

/// The mount table escapes whitespace and backslashes as octal (`\040`).
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = bytes.get(i + 1..i + 4).filter(|digits| {
            bytes[i] == b'\\' && digits.iter().all(|b| (b'0'..=b'7').contains(b))
        });
        if let Some(digits) = escape
            && let Ok(code) = u8::try_from(
                digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0')),
            )
        {
            out.push(code);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
