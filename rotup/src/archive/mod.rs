//! Dated, verified backup archives.
//!
//! [`create_archive`] writes the archive next to its final location, runs a
//! separate verification pass over it and only then renames it into place.
//! A same-day re-run therefore replaces the earlier archive with a freshly
//! verified one, and a failed run leaves the earlier archive untouched.
//!
//! The directory holding the archive is never walked, even when a source
//! contains it, so the archive cannot end up reading its own output.

pub mod tar_gz_archiver;
pub mod zip_archiver;

use std::{
    fmt::{Display, Formatter},
    fs, io,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use chrono::NaiveDate;
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use sha256::try_digest;
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

pub use tar_gz_archiver::TarGzArchiver;
pub use zip_archiver::ZipArchiver;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[default]
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz")]
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    pub fn archiver(&self) -> Box<dyn Archiver> {
        match self {
            ArchiveFormat::Zip => Box::new(ZipArchiver::default()),
            ArchiveFormat::TarGz => Box::new(TarGzArchiver),
        }
    }

    /// Guess the format from a file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

impl Display for ArchiveFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar.gz" | "tgz" => Ok(ArchiveFormat::TarGz),
            _ => Err("archive format must be `zip` or `tar.gz`".to_string()),
        }
    }
}

/// `<prefix>_<YYYY_MM_DD>.<ext>`
pub fn archive_name(prefix: &str, date: NaiveDate, format: ArchiveFormat) -> String {
    format!("{prefix}_{}.{}", date.format("%Y_%m_%d"), format.extension())
}

/// `<prefix>_<YYYY_MM_DD>.log`
pub fn log_name(prefix: &str, date: NaiveDate) -> String {
    format!("{prefix}_{}.log", date.format("%Y_%m_%d"))
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("source directory {} does not exist or is not a directory", .0.display())]
    MissingSourceDirectory(PathBuf),

    #[error("no source directories to archive")]
    NoSources,

    #[error("source directory {} lies on the destination {}", path.display(), destination.display())]
    SourceOnDestination { path: PathBuf, destination: PathBuf },

    #[error("failed to create archive {}: {source}", path.display())]
    Creation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("archive {} failed verification: {reason}", path.display())]
    Verification { path: PathBuf, reason: String },

    #[error("failed to append {name} to {}: {source}", path.display())]
    Append {
        path: PathBuf,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} archives cannot be appended to")]
    AppendUnsupported(ArchiveFormat),
}

impl ArchiveError {
    pub(crate) fn creation(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError {
        move |source| ArchiveError::Creation {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn verification(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError {
        move |e| ArchiveError::Verification {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    }
}

/// A source directory together with the name it is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRoot {
    pub path: PathBuf,
    pub entry_name: String,
    /// Subtrees left out of the walk, canonical.
    pub excluded: Vec<PathBuf>,
}

impl SourceRoot {
    pub fn new(path: impl Into<PathBuf>, entry_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entry_name: entry_name.into(),
            excluded: Vec::new(),
        }
    }

    /// Everything below the root in a stable order, without following
    /// symlinks and without the excluded subtrees.
    pub fn walk(&self) -> impl Iterator<Item = walkdir::Result<DirEntry>> {
        WalkDir::new(&self.path)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.excluded.iter().any(|skip| entry.path() == skip))
    }

    /// Join `relative` below this root, using `/` separators.
    pub fn entry_for(&self, relative: &Path) -> String {
        std::iter::once(self.entry_name.clone())
            .chain(normal_components(relative))
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub path: PathBuf,
    pub entries: usize,
    pub size: u64,
}

pub trait Archiver: Send + Sync {
    fn format(&self) -> ArchiveFormat;

    /// Write every source into a new archive at `destination`, returning the
    /// number of entries written.
    fn write(&self, sources: &[SourceRoot], destination: &Path) -> Result<usize, ArchiveError>;

    /// Read the whole archive back, checking its internal checksums.
    fn verify(&self, archive: &Path) -> Result<VerifyReport, ArchiveError>;

    fn supports_append(&self) -> bool {
        false
    }

    /// Add `file` to an existing archive under `name`.
    fn append_file(&self, _archive: &Path, _name: &str, _file: &Path) -> Result<(), ArchiveError> {
        Err(ArchiveError::AppendUnsupported(self.format()))
    }
}

/// Check that every source is a directory and work out the entry names.
///
/// Sources are stored under their absolute path without the root, the way
/// `zip -r` does (`/data/a` becomes `data/a`). Duplicates and sources nested
/// in another source are collapsed.
pub fn resolve_sources(sources: &[PathBuf]) -> Result<Vec<SourceRoot>, ArchiveError> {
    let mut canonical: Vec<PathBuf> = Vec::new();
    for source in sources {
        if !source.is_dir() {
            return Err(ArchiveError::MissingSourceDirectory(source.clone()));
        }
        let path = source
            .canonicalize()
            .map_err(|_| ArchiveError::MissingSourceDirectory(source.clone()))?;
        if !canonical.contains(&path) {
            canonical.push(path);
        }
    }

    let roots = canonical
        .iter()
        .filter(|path| {
            let nested = canonical
                .iter()
                .any(|other| other != *path && path.starts_with(other));
            if nested {
                tracing::info!("{} is inside another source, archived once", path.display());
            }
            !nested
        })
        .map(|path| {
            let name = normal_components(path).collect::<Vec<_>>().join("/");
            // a filesystem root has no normal component
            SourceRoot::new(path.clone(), if name.is_empty() { "root".to_string() } else { name })
        })
        .collect();
    Ok(roots)
}

fn normal_components(path: &Path) -> impl Iterator<Item = String> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// A file stored at the archive root once the sources are verified.
#[derive(Debug, Clone, Copy)]
pub struct ExtraFile<'a> {
    pub name: &'a str,
    pub path: &'a Path,
}

#[derive(Debug)]
pub struct Created {
    pub report: ArchiveReport,
    /// Why the extra file is missing from the archive, if it is.
    pub extra_error: Option<ArchiveError>,
}

/// Create, verify and move into place the archive at `destination`.
///
/// Every source is checked before anything is written, so a missing source
/// never leaves a file behind.
pub fn create_archive(
    archiver: &dyn Archiver,
    sources: &[PathBuf],
    destination: &Path,
) -> Result<ArchiveReport, ArchiveError> {
    create_archive_with(archiver, sources, destination, None).map(|created| created.report)
}

/// Like [`create_archive`], then add `extra` to a copy of the verified
/// archive. Failing to add it only drops it: the verified archive without it
/// is moved into place and the reason is returned in `extra_error`.
pub fn create_archive_with(
    archiver: &dyn Archiver,
    sources: &[PathBuf],
    destination: &Path,
    extra: Option<ExtraFile<'_>>,
) -> Result<Created, ArchiveError> {
    let mut roots = resolve_sources(sources)?;
    if roots.is_empty() {
        return Err(ArchiveError::NoSources);
    }
    exclude_destination(&mut roots, destination)?;

    let partial = partial_path(destination);
    tracing::info!(
        "Creating {} archive {} from {} sources",
        archiver.format(),
        destination.display(),
        roots.len()
    );
    let verified = write_verified(archiver, &roots, &partial, destination)
        .inspect_err(|_| remove_partial(&partial))?;

    let mut extra_error = None;
    let (staged, entries) = match extra {
        None => (partial, verified.entries),
        Some(extra) => match add_extra(archiver, &partial, destination, extra, verified.entries) {
            Ok((copy, entries)) => {
                remove_partial(&partial);
                (copy, entries)
            }
            Err(e) => {
                tracing::warn!("{} not stored in {}: {e}", extra.name, destination.display());
                extra_error = Some(e);
                (partial, verified.entries)
            }
        },
    };

    if destination.exists() {
        tracing::info!("Replacing existing archive {}", destination.display());
    }
    fs::rename(&staged, destination)
        .inspect_err(|_| remove_partial(&staged))
        .map_err(ArchiveError::creation(destination))?;
    let size = fs::metadata(destination)
        .map_err(ArchiveError::creation(destination))?
        .len();

    Ok(Created {
        report: ArchiveReport {
            path: destination.to_path_buf(),
            entries,
            size,
        },
        extra_error,
    })
}

/// Refuse sources on the destination and skip the destination inside sources.
fn exclude_destination(roots: &mut [SourceRoot], destination: &Path) -> Result<(), ArchiveError> {
    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());

    for root in roots {
        if root.path.starts_with(&dir) {
            return Err(ArchiveError::SourceOnDestination {
                path: root.path.clone(),
                destination: dir,
            });
        }
        if dir.starts_with(&root.path) {
            tracing::info!("Leaving {} out of {}", dir.display(), root.path.display());
            root.excluded.push(dir.clone());
        }
    }
    Ok(())
}

fn write_verified(
    archiver: &dyn Archiver,
    roots: &[SourceRoot],
    partial: &Path,
    destination: &Path,
) -> Result<VerifyReport, ArchiveError> {
    let written = archiver.write(roots, partial)?;
    tracing::info!("Verifying {}", destination.display());
    let report = archiver.verify(partial)?;
    if report.entries != written {
        return Err(ArchiveError::Verification {
            path: destination.to_path_buf(),
            reason: format!("{} entries written, {} read back", written, report.entries),
        });
    }
    Ok(report)
}

/// Append `extra` to a copy of `verified`, so a failing append never touches
/// the verified bytes. Returns the copy and its entry count.
fn add_extra(
    archiver: &dyn Archiver,
    verified: &Path,
    destination: &Path,
    extra: ExtraFile<'_>,
    entries: usize,
) -> Result<(PathBuf, usize), ArchiveError> {
    if !archiver.supports_append() {
        return Err(ArchiveError::AppendUnsupported(archiver.format()));
    }

    let copy = partial_path(destination);
    let result = fs::copy(verified, &copy)
        .map_err(|source| ArchiveError::Append {
            path: destination.to_path_buf(),
            name: extra.name.to_string(),
            source,
        })
        .and_then(|_| archiver.append_file(&copy, extra.name, extra.path))
        .and_then(|()| {
            let report = archiver.verify(&copy)?;
            if report.entries != entries + 1 {
                return Err(ArchiveError::Verification {
                    path: destination.to_path_buf(),
                    reason: format!("{} entries after append, {} expected", report.entries, entries + 1),
                });
            }
            Ok(report.entries)
        });

    match result {
        Ok(entries) => Ok((copy, entries)),
        Err(e) => {
            remove_partial(&copy);
            Err(e)
        }
    }
}

fn remove_partial(path: &Path) {
    if path.exists()
        && let Err(e) = fs::remove_file(path)
    {
        tracing::warn!("Failed to remove {}: {e}", path.display());
    }
}

/// SHA-256 of the archive file.
pub fn digest(path: &Path) -> io::Result<String> {
    try_digest(path)
}

fn partial_path(destination: &Path) -> PathBuf {
    let rng = rand::rng();
    let random_string: String = rng
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{name}.{random_string}.partial"))
}
