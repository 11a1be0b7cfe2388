#![allow(dead_code)]

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc::{Receiver, Sender},
    },
};

use chrono::NaiveDate;
use rotup::{
    Config,
    archive::{ArchiveError, ArchiveFormat, Archiver, SourceRoot, VerifyReport, ZipArchiver},
    attach::{AttachError, AttachmentManager, DetachError, MountOptions},
    exec::CommandError,
    volume::{CatalogError, IdentityKind, Scan, VolumeCatalog, VolumeDescriptor},
};
use tempfile::TempDir;

pub fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

pub fn disk(identity: &str, label: &str) -> VolumeDescriptor {
    VolumeDescriptor::new(identity, IdentityKind::Uuid, label, format!("/dev/{label}"))
        .with_fs_type("ntfs")
}

/// Returns a fixed list of volumes, or reports the tool as missing.
pub struct FakeCatalog {
    volumes: Option<Vec<VolumeDescriptor>>,
}

impl FakeCatalog {
    pub fn with(volumes: Vec<VolumeDescriptor>) -> Box<Self> {
        Box::new(Self {
            volumes: Some(volumes),
        })
    }

    pub fn unavailable() -> Box<Self> {
        Box::new(Self { volumes: None })
    }
}

impl VolumeCatalog for FakeCatalog {
    fn scan(&self) -> Scan {
        match &self.volumes {
            Some(volumes) => Scan::found(volumes.clone()),
            None => Scan::unavailable(CatalogError::Command(CommandError::NotFound {
                program: "lsblk".to_string(),
            })),
        }
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Blocks inside `scan` until released, to hold a run in flight.
pub struct GateCatalog {
    pub entered: Mutex<Sender<()>>,
    pub release: Mutex<Receiver<()>>,
}

impl VolumeCatalog for GateCatalog {
    fn scan(&self) -> Scan {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv();
        Scan::found(Vec::new())
    }

    fn name(&self) -> &'static str {
        "gate"
    }
}

#[derive(Debug, Default)]
pub struct Counts {
    pub attached: AtomicUsize,
    pub detached: AtomicUsize,
    pub identities: Mutex<Vec<String>>,
}

impl Counts {
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn detached(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }
}

/// Attaches by handing out `root`, counting every call.
pub struct CountingManager {
    pub root: PathBuf,
    pub counts: Arc<Counts>,
    pub fail_attach: bool,
    pub fail_detach: bool,
}

impl CountingManager {
    pub fn new(root: impl Into<PathBuf>) -> (Box<Self>, Arc<Counts>) {
        let counts = Arc::new(Counts::default());
        let manager = Box::new(Self {
            root: root.into(),
            counts: counts.clone(),
            fail_attach: false,
            fail_detach: false,
        });
        (manager, counts)
    }
}

impl AttachmentManager for CountingManager {
    fn attach(
        &self,
        volume: &VolumeDescriptor,
        _target: &Path,
        _options: &MountOptions,
    ) -> Result<PathBuf, AttachError> {
        if self.fail_attach {
            return Err(AttachError::Mount {
                volume: volume.identity.clone(),
                path: self.root.clone(),
                source: CommandError::Failed {
                    program: "mount".to_string(),
                    status: "exit status: 32".to_string(),
                    stderr: "wrong fs type".to_string(),
                },
            });
        }
        self.counts.attached.fetch_add(1, Ordering::SeqCst);
        self.counts
            .identities
            .lock()
            .unwrap()
            .push(volume.identity.clone());
        Ok(self.root.clone())
    }

    fn detach(&self, path: &Path) -> Result<(), DetachError> {
        self.counts.detached.fetch_add(1, Ordering::SeqCst);
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

/// Scratch layout: `data/a` with a few files, an empty `disk` standing in
/// for the mounted volume and a `logs` directory.
pub struct Fixture {
    pub tmp: TempDir,
    pub source: PathBuf,
    pub disk: PathBuf,
    pub logs: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("data/a");
        fs::create_dir_all(source.join("reports")).unwrap();
        fs::write(source.join("hello.txt"), "hello rotation").unwrap();
        fs::write(source.join("reports/q1.csv"), "month,total\njan,10\n").unwrap();
        let disk = tmp.path().join("disk");
        fs::create_dir_all(&disk).unwrap();
        let logs = tmp.path().join("logs");
        Self {
            tmp,
            source,
            disk,
            logs,
        }
    }

    pub fn config(&self) -> Config {
        let mut config = Config {
            source_directories: vec![self.source.clone()],
            target_mount_point_linux: self.tmp.path().join("mnt"),
            logging_directory: self.logs.clone(),
            ..Default::default()
        };
        config.disk_rotation.linux = vec!["DISKA_1111-AAAA".to_string()];
        config
    }

    /// Files on the fake disk, sorted.
    pub fn disk_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.disk)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// Zip archiver whose appends stop halfway, the way a full disk cuts them off.
#[derive(Default)]
pub struct TornAppendArchiver(ZipArchiver);

impl Archiver for TornAppendArchiver {
    fn format(&self) -> ArchiveFormat {
        self.0.format()
    }

    fn write(&self, sources: &[SourceRoot], destination: &Path) -> Result<usize, ArchiveError> {
        self.0.write(sources, destination)
    }

    fn verify(&self, archive: &Path) -> Result<VerifyReport, ArchiveError> {
        self.0.verify(archive)
    }

    fn supports_append(&self) -> bool {
        true
    }

    fn append_file(&self, archive: &Path, name: &str, _file: &Path) -> Result<(), ArchiveError> {
        let len = fs::metadata(archive).unwrap().len();
        fs::OpenOptions::new()
            .write(true)
            .open(archive)
            .unwrap()
            .set_len(len / 2)
            .unwrap();
        Err(ArchiveError::Append {
            path: archive.to_path_buf(),
            name: name.to_string(),
            source: io::Error::other("No space left on device"),
        })
    }
}
