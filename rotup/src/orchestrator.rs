//! One backup run: scan, match, attach, archive, detach.
//!
//! Each stage returns a typed result and only [`Orchestrator`] decides what is
//! fatal. Once a volume is attached it is released on every path out of
//! [`Orchestrator::run`], including archive failures and cancellation.

use std::{
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{Local, NaiveDate};
use thiserror::Error;

use crate::{
    archive::{
        self, ArchiveError, ArchiveReport, Archiver, ExtraFile, archive_name, create_archive_with,
        log_name,
    },
    attach::{AttachError, Attachment, AttachmentManager, MountOptions},
    config::Config,
    platform::Platform,
    progress::{Level, ProgressSink, format_line},
    rotation::{NoMatchingVolume, select_volume},
    volume::{VolumeCatalog, VolumeDescriptor},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Scanning,
    Matching,
    Attaching,
    Archiving,
    Detaching,
    Done,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Scanning => "scanning",
            Stage::Matching => "matching",
            Stage::Attaching => "attaching",
            Stage::Archiving => "archiving",
            Stage::Detaching => "detaching",
            Stage::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// Fatal outcomes of a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("another run is already in progress")]
    RunInProgress,

    #[error("run cancelled before {0}")]
    Cancelled(Stage),

    #[error(transparent)]
    NoMatchingVolume(#[from] NoMatchingVolume),

    #[error(transparent)]
    AttachFailed(#[from] AttachError),

    #[error("source directory {} does not exist or is not a directory", .0.display())]
    MissingSourceDirectory(PathBuf),

    #[error("archive creation failed: {0}")]
    ArchiveCreationFailed(#[source] ArchiveError),

    #[error("archive verification failed: {0}")]
    ArchiveVerificationFailed(#[source] ArchiveError),
}

impl From<ArchiveError> for RunError {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::MissingSourceDirectory(path) => RunError::MissingSourceDirectory(path),
            e @ ArchiveError::Verification { .. } => RunError::ArchiveVerificationFailed(e),
            e => RunError::ArchiveCreationFailed(e),
        }
    }
}

/// Non-fatal conditions, reported next to the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunWarning {
    CatalogUnavailable(String),
    DetachFailed(String),
    LogNotArchived(String),
}

impl Display for RunWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RunWarning::CatalogUnavailable(reason) => write!(f, "volume catalog unavailable: {reason}"),
            RunWarning::DetachFailed(reason) => write!(f, "detach failed: {reason}"),
            RunWarning::LogNotArchived(reason) => write!(f, "log not stored in archive: {reason}"),
        }
    }
}

/// What a matched run is going to write, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub sources: Vec<PathBuf>,
    pub volume: VolumeDescriptor,
    pub archive_name: String,
    pub archive_path: PathBuf,
}

#[derive(Debug)]
pub struct RunResult {
    pub succeeded: bool,
    /// `Done` on success, otherwise the stage the run failed in.
    pub stage: Stage,
    pub error: Option<RunError>,
    pub warnings: Vec<RunWarning>,
    pub lines: Vec<String>,
    pub volume: Option<VolumeDescriptor>,
    pub archive: Option<ArchiveReport>,
    /// SHA-256 of the final archive.
    pub digest: Option<String>,
}

/// Shared flag to stop a run between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sends every progress line to tracing, the sink and the result.
struct Reporter<'a> {
    sink: &'a mut dyn ProgressSink,
    lines: Vec<String>,
    warnings: Vec<RunWarning>,
}

impl<'a> Reporter<'a> {
    fn new(sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            sink,
            lines: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn line(&mut self, level: Level, message: &str) {
        match level {
            Level::Debug => tracing::debug!("{message}"),
            Level::Info => tracing::info!("{message}"),
            Level::Warning => tracing::warn!("{message}"),
            Level::Error | Level::Fatal => tracing::error!("{message}"),
        }
        self.sink.line(level, message);
        self.lines
            .push(format_line(Local::now().naive_local(), level, message));
    }

    fn info(&mut self, message: impl AsRef<str>) {
        self.line(Level::Info, message.as_ref());
    }

    fn warn(&mut self, warning: RunWarning) {
        self.line(Level::Warning, &warning.to_string());
        self.warnings.push(warning);
    }
}

/// Clears the in-flight flag when the run ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Completed {
    volume: VolumeDescriptor,
    archive: ArchiveReport,
    digest: Option<String>,
}

pub struct Orchestrator {
    catalog: Box<dyn VolumeCatalog>,
    attacher: Box<dyn AttachmentManager>,
    archiver: Option<Box<dyn Archiver>>,
    platform: Platform,
    in_flight: AtomicBool,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(catalog: Box<dyn VolumeCatalog>, attacher: Box<dyn AttachmentManager>) -> Self {
        Self {
            catalog,
            attacher,
            archiver: None,
            platform: Platform::current(),
            in_flight: AtomicBool::new(false),
            cancel: CancelToken::default(),
        }
    }

    /// Use `archiver` instead of the one for the configured format.
    pub fn with_archiver(mut self, archiver: Box<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Pick the rotation list of `platform` instead of the host's.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run a backup dated today.
    pub fn run(&self, config: &Config, sink: &mut dyn ProgressSink) -> RunResult {
        self.run_on(config, Local::now().date_naive(), sink)
    }

    /// Run a backup whose archive is named after `date`.
    pub fn run_on(&self, config: &Config, date: NaiveDate, sink: &mut dyn ProgressSink) -> RunResult {
        let mut report = Reporter::new(sink);

        if self.in_flight.swap(true, Ordering::SeqCst) {
            let error = RunError::RunInProgress;
            report.line(Level::Error, &error.to_string());
            return RunResult {
                succeeded: false,
                stage: Stage::Idle,
                error: Some(error),
                warnings: report.warnings,
                lines: report.lines,
                volume: None,
                archive: None,
                digest: None,
            };
        }
        let _in_flight = InFlight(&self.in_flight);

        report.info("--- rotup backup run started ---");
        let mut stage = Stage::Idle;
        let outcome = self.execute(config, date, &mut report, &mut stage);

        match outcome {
            Ok(completed) => {
                report.info("--- rotup backup run finished (success) ---");
                RunResult {
                    succeeded: true,
                    stage: Stage::Done,
                    error: None,
                    warnings: report.warnings,
                    lines: report.lines,
                    volume: Some(completed.volume),
                    archive: Some(completed.archive),
                    digest: completed.digest,
                }
            }
            Err(error) => {
                report.line(Level::Error, &format!("[{stage}] {error}"));
                report.line(Level::Fatal, "--- rotup backup run finished (failure) ---");
                RunResult {
                    succeeded: false,
                    stage,
                    error: Some(error),
                    warnings: report.warnings,
                    lines: report.lines,
                    volume: None,
                    archive: None,
                    digest: None,
                }
            }
        }
    }

    fn enter(&self, stage: &mut Stage, next: Stage) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled(next));
        }
        tracing::debug!("Stage {stage} -> {next}");
        *stage = next;
        Ok(())
    }

    fn execute(
        &self,
        config: &Config,
        date: NaiveDate,
        report: &mut Reporter<'_>,
        stage: &mut Stage,
    ) -> Result<Completed, RunError> {
        self.enter(stage, Stage::Scanning)?;
        report.info(format!("Scanning attached volumes with {}", self.catalog.name()));
        let scan = self.catalog.scan();
        if let Some(e) = &scan.unavailable {
            report.warn(RunWarning::CatalogUnavailable(e.to_string()));
        }
        for volume in &scan.volumes {
            report.line(
                Level::Debug,
                &format!(
                    "Found {} {} ({}) on {}",
                    volume.kind, volume.identity, volume.display_name, volume.mount_hint
                ),
            );
        }

        self.enter(stage, Stage::Matching)?;
        let rotation = config.rotation(self.platform);
        let volume = select_volume(&scan.volumes, &rotation.allowed)?.clone();
        report.info(format!(
            "Selected rotation disk {} ({})",
            volume.identity, volume.display_name
        ));

        self.enter(stage, Stage::Attaching)?;
        let options = MountOptions::for_volume(&volume, rotation.credentials);
        report.info(format!(
            "Attaching {} at {}",
            volume.identity,
            rotation.target.display()
        ));
        let attachment =
            Attachment::attach(self.attacher.as_ref(), &volume, &rotation.target, &options)?;
        report.info(format!("Volume available at {}", attachment.path().display()));

        let archived = self
            .enter(stage, Stage::Archiving)
            .and_then(|()| self.archive(config, date, &volume, attachment.path(), report));

        if archived.is_ok() {
            // a failed run keeps the stage it failed in
            *stage = Stage::Detaching;
        }
        report.info(format!("Releasing {}", attachment.path().display()));
        match attachment.release() {
            Ok(()) => report.info("Volume released"),
            Err(e) => report.warn(RunWarning::DetachFailed(e.to_string())),
        }

        let (archive, digest) = archived?;
        Ok(Completed {
            volume,
            archive,
            digest,
        })
    }

    fn archive(
        &self,
        config: &Config,
        date: NaiveDate,
        volume: &VolumeDescriptor,
        root: &Path,
        report: &mut Reporter<'_>,
    ) -> Result<(ArchiveReport, Option<String>), RunError> {
        let format_archiver;
        let archiver: &dyn Archiver = match &self.archiver {
            Some(archiver) => archiver.as_ref(),
            None => {
                format_archiver = config.archive_format.archiver();
                format_archiver.as_ref()
            }
        };

        let name = archive_name(&config.backup_filename_prefix, date, archiver.format());
        let job = BackupJob {
            sources: config.source_directories.clone(),
            volume: volume.clone(),
            archive_path: root.join(&name),
            archive_name: name,
        };

        report.info(format!(
            "Creating archive {} from {} source directories",
            job.archive_path.display(),
            job.sources.len()
        ));

        // the run log rides along in the archive when there is one
        let log_entry = log_name(&config.backup_filename_prefix, date);
        let log = config.logging_directory.join(&log_entry);
        let extra = if log.is_file() {
            report.info(format!("Adding log {log_entry} to the archive"));
            report.sink.flush();
            Some(ExtraFile {
                name: &log_entry,
                path: &log,
            })
        } else {
            tracing::debug!("No log file at {}, nothing to store", log.display());
            None
        };

        let created = create_archive_with(archiver, &job.sources, &job.archive_path, extra)?;
        if let Some(e) = created.extra_error {
            report.warn(RunWarning::LogNotArchived(e.to_string()));
        }
        let created = created.report;
        report.info(format!(
            "Archive {} verified: {} entries, {} bytes",
            job.archive_name, created.entries, created.size
        ));

        let digest = match archive::digest(&created.path) {
            Ok(digest) => {
                report.info(format!("sha256 {digest}"));
                Some(digest)
            }
            Err(e) => {
                report.line(
                    Level::Warning,
                    &format!("Failed to hash {}: {e}", created.path.display()),
                );
                None
            }
        };
        Ok((created, digest))
    }
}
