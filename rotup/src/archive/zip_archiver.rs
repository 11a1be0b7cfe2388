//! Zip archives.
//!
//! Zip has no entry type for FIFOs, sockets or device nodes, so those are
//! left out of the archive with a warning. Use tar.gz to keep them.

use std::{
    fs::{self, File, Metadata, OpenOptions},
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use zip::{
    CompressionMethod, ZipArchive, ZipWriter, result::ZipError, write::FileOptions,
};

use super::{ArchiveError, ArchiveFormat, Archiver, SourceRoot, VerifyReport};

const BEST_COMPRESSION: i32 = 9;

fn zip_io(e: ZipError) -> io::Error {
    match e {
        ZipError::Io(e) => e,
        other => io::Error::other(other),
    }
}

fn with_path(path: &Path) -> impl FnOnce(io::Error) -> io::Error {
    move |e| io::Error::new(e.kind(), format!("{}: {e}", path.display()))
}

/// Deflate zip archives, the format `zip -r -9` produces.
#[derive(Debug, Clone, Copy)]
pub struct ZipArchiver {
    level: i32,
}

impl Default for ZipArchiver {
    fn default() -> Self {
        Self {
            level: BEST_COMPRESSION,
        }
    }
}

impl ZipArchiver {
    fn options(&self) -> FileOptions {
        FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.level))
    }

    fn file_options(&self, metadata: &Metadata) -> FileOptions {
        let options = self
            .options()
            .large_file(metadata.len() >= u64::from(u32::MAX));
        #[cfg(unix)]
        let options = {
            use std::os::unix::fs::PermissionsExt;
            options.unix_permissions(metadata.permissions().mode())
        };
        options
    }

    /// Add the root directory entry and everything below it.
    fn append_tree<W: Write + io::Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        root: &SourceRoot,
    ) -> io::Result<usize> {
        zip.add_directory(format!("{}/", root.entry_name), self.options())
            .map_err(zip_io)?;
        let mut entries = 1;

        for entry in root.walk() {
            let entry = entry?;
            let path = entry.path();
            let relative = path.strip_prefix(&root.path).map_err(io::Error::other)?;
            let name = root.entry_for(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                zip.add_directory(format!("{name}/"), self.options())
                    .map_err(zip_io)?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(path).map_err(with_path(path))?;
                zip.add_symlink(name, target.to_string_lossy(), self.options())
                    .map_err(zip_io)?;
            } else if file_type.is_file() {
                let metadata = entry.metadata()?;
                zip.start_file(name, self.file_options(&metadata))
                    .map_err(zip_io)?;
                let mut file = BufReader::new(File::open(path).map_err(with_path(path))?);
                io::copy(&mut file, zip).map_err(with_path(path))?;
            } else {
                tracing::warn!("Skip special file {}", path.display());
                continue;
            }
            entries += 1;
        }

        Ok(entries)
    }

    fn append_entry(&self, archive: &Path, name: &str, file: &Path) -> io::Result<()> {
        let handle = OpenOptions::new().read(true).write(true).open(archive)?;
        let mut zip = ZipWriter::new_append(handle).map_err(zip_io)?;
        zip.start_file(name, self.options()).map_err(zip_io)?;
        let mut source = BufReader::new(File::open(file)?);
        io::copy(&mut source, &mut zip)?;
        zip.finish().map_err(zip_io)?.sync_all()
    }
}

impl Archiver for ZipArchiver {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    fn write(&self, sources: &[SourceRoot], destination: &Path) -> Result<usize, ArchiveError> {
        let file = File::create(destination).map_err(ArchiveError::creation(destination))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));

        let mut entries = 0;
        for root in sources {
            tracing::info!("Adding {} as {}/", root.path.display(), root.entry_name);
            entries += self
                .append_tree(&mut zip, root)
                .map_err(ArchiveError::creation(destination))?;
        }

        let mut writer = zip
            .finish()
            .map_err(zip_io)
            .map_err(ArchiveError::creation(destination))?;
        writer
            .flush()
            .and_then(|_| writer.get_ref().sync_all())
            .map_err(ArchiveError::creation(destination))?;

        Ok(entries)
    }

    fn verify(&self, archive: &Path) -> Result<VerifyReport, ArchiveError> {
        let file = File::open(archive).map_err(ArchiveError::verification(archive))?;
        let mut zip = ZipArchive::new(BufReader::new(file))
            .map_err(zip_io)
            .map_err(ArchiveError::verification(archive))?;

        let mut bytes = 0;
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(zip_io)
                .map_err(ArchiveError::verification(archive))?;
            let name = entry.name().to_string();
            // reading to the end checks the entry's CRC-32
            bytes += io::copy(&mut entry, &mut io::sink()).map_err(|e| {
                ArchiveError::Verification {
                    path: archive.to_path_buf(),
                    reason: format!("{name}: {e}"),
                }
            })?;
        }

        Ok(VerifyReport {
            entries: zip.len(),
            bytes,
        })
    }

    fn supports_append(&self) -> bool {
        true
    }

    fn append_file(&self, archive: &Path, name: &str, file: &Path) -> Result<(), ArchiveError> {
        self.append_entry(archive, name, file)
            .map_err(|source| ArchiveError::Append {
                path: archive.to_path_buf(),
                name: name.to_string(),
                source,
            })
    }
}
