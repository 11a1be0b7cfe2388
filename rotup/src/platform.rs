//! Picks the OS-specific catalog and attachment manager once at startup.

use std::{
    fmt::{Display, Formatter},
    sync::Arc,
    time::Duration,
};

use crate::{
    attach::{AttachmentManager, DriveRootManager, MountCommandManager},
    exec::CommandRunner,
    volume::{BlkidCatalog, FallbackCatalog, LsblkCatalog, PowerShellCatalog, VolumeCatalog},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    /// Every non-Windows host is driven with the Linux tooling.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::Windows => write!(f, "windows"),
        }
    }
}

pub fn system_catalog(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Box<dyn VolumeCatalog> {
    match Platform::current() {
        Platform::Linux => Box::new(FallbackCatalog::new(
            Box::new(LsblkCatalog::new(runner.clone(), timeout)),
            Box::new(BlkidCatalog::new(runner, timeout)),
        )),
        Platform::Windows => Box::new(PowerShellCatalog::new(runner, timeout)),
    }
}

pub fn system_attachment_manager(runner: Arc<dyn CommandRunner>) -> Box<dyn AttachmentManager> {
    match Platform::current() {
        Platform::Linux => Box::new(MountCommandManager::new(runner)),
        Platform::Windows => Box::new(DriveRootManager),
    }
}

/// Mounting needs root on Linux.
pub fn assert_root(command: impl AsRef<str>) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        if !nix::unistd::geteuid().is_root() {
            anyhow::bail!("`rotup {}` must be run as root (sudo)", command.as_ref())
        }
    }
    #[cfg(not(unix))]
    let _ = command;
    Ok(())
}
