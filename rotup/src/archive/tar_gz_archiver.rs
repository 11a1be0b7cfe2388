use std::{
    fs::{self, File, Metadata},
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use tar::{Archive, Builder, Header};

use super::{ArchiveError, ArchiveFormat, Archiver, SourceRoot, VerifyReport};

/// Gzip-compressed tarballs. Cannot be appended to once written.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzArchiver;

type TarWriter = Builder<GzEncoder<BufWriter<File>>>;

impl TarGzArchiver {
    /// Add the root directory entry and everything below it, paying attention
    /// to symlinks and special files.
    fn append_tree(&self, builder: &mut TarWriter, root: &SourceRoot) -> io::Result<usize> {
        let metadata = fs::metadata(&root.path)?;
        self.append_dir(builder, &root.path, &root.entry_name, &metadata)?;
        let mut entries = 1;

        for entry in root.walk() {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            let relative = path.strip_prefix(&root.path).map_err(io::Error::other)?;
            let name = root.entry_for(relative);

            if metadata.is_file() {
                self.append_file(builder, path, &name, &metadata)?;
            } else if metadata.is_dir() {
                self.append_dir(builder, path, &name, &metadata)?;
            } else if metadata.file_type().is_symlink() {
                self.append_symlink(builder, path, &name)?;
            } else if !self.append_special_file(builder, path, &name, &metadata)? {
                tracing::warn!("Skip unknown file type: {}", path.display());
                continue;
            }
            entries += 1;
        }

        Ok(entries)
    }

    /// Add regular file
    fn append_file(
        &self,
        builder: &mut TarWriter,
        path: &Path,
        name: &str,
        metadata: &Metadata,
    ) -> io::Result<()> {
        let mut file = BufReader::new(File::open(path)?);
        let mut header = Header::new_gnu();
        header.set_metadata(metadata);
        header.set_size(metadata.len());
        header.set_cksum();
        // append_data writes GNU long-name records for deep paths
        builder.append_data(&mut header, name, &mut file)
    }

    /// Add directory
    fn append_dir(
        &self,
        builder: &mut TarWriter,
        _path: &Path,
        name: &str,
        metadata: &Metadata,
    ) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_metadata(metadata);
        header.set_size(0);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_cksum();
        builder.append_data(&mut header, format!("{name}/"), io::empty())
    }

    /// Add symbolic link
    fn append_symlink(&self, builder: &mut TarWriter, path: &Path, name: &str) -> io::Result<()> {
        let target = fs::read_link(path)?;
        let metadata = fs::symlink_metadata(path)?;
        let mut header = Header::new_gnu();
        header.set_metadata(&metadata);
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, name, target)
    }

    /// Add block/char devices and fifos. Returns false for anything else.
    #[cfg(unix)]
    fn append_special_file(
        &self,
        builder: &mut TarWriter,
        _path: &Path,
        name: &str,
        metadata: &Metadata,
    ) -> io::Result<bool> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let file_type = metadata.file_type();
        let entry_type = if file_type.is_block_device() {
            tar::EntryType::Block
        } else if file_type.is_char_device() {
            tar::EntryType::Char
        } else if file_type.is_fifo() {
            tar::EntryType::Fifo
        } else {
            return Ok(false);
        };

        let mut header = Header::new_gnu();
        header.set_metadata(metadata);
        header.set_size(0);
        header.set_entry_type(entry_type);
        if file_type.is_block_device() || file_type.is_char_device() {
            let (dev_major, dev_minor) = device_numbers(metadata.rdev())?;
            header.set_device_major(dev_major)?;
            header.set_device_minor(dev_minor)?;
        }
        builder.append_data(&mut header, name, io::empty())?;
        Ok(true)
    }

    #[cfg(not(unix))]
    fn append_special_file(
        &self,
        _builder: &mut TarWriter,
        _path: &Path,
        _name: &str,
        _metadata: &Metadata,
    ) -> io::Result<bool> {
        Ok(false)
    }
}

/// Split a device id the way the kernel encodes it, large numbers included.
#[cfg(unix)]
fn device_numbers(rdev: u64) -> io::Result<(u32, u32)> {
    use nix::sys::stat::{major, minor};

    #[allow(clippy::useless_conversion)]
    let rdev = rdev.try_into().map_err(io::Error::other)?;
    let dev_major = u32::try_from(major(rdev)).map_err(io::Error::other)?;
    let dev_minor = u32::try_from(minor(rdev)).map_err(io::Error::other)?;
    Ok((dev_major, dev_minor))
}

impl Archiver for TarGzArchiver {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::TarGz
    }

    fn write(&self, sources: &[SourceRoot], destination: &Path) -> Result<usize, ArchiveError> {
        let file = File::create(destination).map_err(ArchiveError::creation(destination))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::best());
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut entries = 0;
        for root in sources {
            tracing::info!("Adding {} as {}/", root.path.display(), root.entry_name);
            entries += self
                .append_tree(&mut builder, root)
                .map_err(ArchiveError::creation(destination))?;
        }

        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .and_then(|mut writer| {
                writer.flush()?;
                writer.get_ref().sync_all()
            })
            .map_err(ArchiveError::creation(destination))?;

        Ok(entries)
    }

    fn verify(&self, archive: &Path) -> Result<VerifyReport, ArchiveError> {
        let file = File::open(archive).map_err(ArchiveError::verification(archive))?;
        let mut tarball = Archive::new(GzDecoder::new(BufReader::new(file)));

        let mut entries = 0;
        let mut bytes = 0;
        let iter = tarball
            .entries()
            .map_err(ArchiveError::verification(archive))?;
        for entry in iter {
            let mut entry = entry.map_err(ArchiveError::verification(archive))?;
            bytes += io::copy(&mut entry, &mut io::sink())
                .map_err(ArchiveError::verification(archive))?;
            entries += 1;
        }

        // the gzip trailer CRC is only checked once the stream is drained
        io::copy(&mut tarball.into_inner(), &mut io::sink())
            .map_err(ArchiveError::verification(archive))?;

        Ok(VerifyReport { entries, bytes })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::TarGzArchiver;
    use crate::archive::{ArchiveError, Archiver, create_archive};

    fn entry_names(archive: &std::path::Path) -> Vec<String> {
        let file = fs::File::open(archive).unwrap();
        let mut tarball = tar::Archive::new(flate2::read::GzDecoder::new(file));
        tarball
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_tar_gz_archive() {
        let tmp = tempdir().unwrap();
        let source = tmp.path().join("layer");
        fs::create_dir_all(source.join("etc")).unwrap();
        fs::write(source.join("file.txt"), "Hello, world!").unwrap();
        fs::write(source.join("etc/hosts"), "127.0.0.1 localhost").unwrap();
        let dest = tmp.path().join("backup_2024_01_01.tar.gz");

        let report = create_archive(&TarGzArchiver, &[source], &dest).unwrap();
        assert_eq!(report.entries, 4);

        let verified = TarGzArchiver.verify(&dest).unwrap();
        assert_eq!(verified.entries, 4);
        assert_eq!(verified.bytes, 13 + 19);
    }

    #[test]
    fn test_truncated_tar_gz_fails_verification() {
        let tmp = tempdir().unwrap();
        let source = tmp.path().join("layer");
        fs::create_dir_all(&source).unwrap();
        let payload: String = (0..5_000).map(|i| format!("row {i}\n")).collect();
        fs::write(source.join("rows.txt"), payload).unwrap();
        let dest = tmp.path().join("out.tar.gz");
        create_archive(&TarGzArchiver, &[source], &dest).unwrap();

        let bytes = fs::read(&dest).unwrap();
        fs::write(&dest, &bytes[..bytes.len() - 8]).unwrap();
        assert!(matches!(
            TarGzArchiver.verify(&dest),
            Err(ArchiveError::Verification { .. })
        ));
    }

    #[test]
    fn test_append_unsupported() {
        let tmp = tempdir().unwrap();
        let log = tmp.path().join("run.log");
        fs::write(&log, "log").unwrap();
        assert!(matches!(
            Archiver::append_file(&TarGzArchiver, &tmp.path().join("x.tar.gz"), "run.log", &log),
            Err(ArchiveError::AppendUnsupported(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_device_numbers() {
        use std::os::unix::fs::MetadataExt;

        // /dev/null is char 1:3
        let rdev = fs::metadata("/dev/null").unwrap().rdev();
        assert_eq!(super::device_numbers(rdev).unwrap(), (1, 3));
        // NVMe namespaces sit on major 259, beyond the legacy 8-bit field
        let nvme = nix::sys::stat::makedev(259, 300);
        assert_eq!(super::device_numbers(nvme).unwrap(), (259, 300));
    }

    #[cfg(unix)]
    #[test]
    fn test_fifo_is_stored() {
        use nix::{sys::stat::Mode, unistd::mkfifo};

        let tmp = tempdir().unwrap();
        let source = tmp.path().join("layer");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("file.txt"), "Hello, world!").unwrap();
        mkfifo(&source.join("pipe"), Mode::S_IRWXU).unwrap();
        let dest = tmp.path().join("out.tar.gz");

        let report = create_archive(&TarGzArchiver, &[source], &dest).unwrap();
        assert_eq!(report.entries, 3);
        assert!(entry_names(&dest).iter().any(|n| n.ends_with("/pipe")));
    }

    #[test]
    fn test_destination_inside_source_is_skipped() {
        let tmp = tempdir().unwrap();
        let source = tmp.path().join("layer");
        let disk = source.join("disk");
        fs::create_dir_all(&disk).unwrap();
        fs::write(source.join("file.txt"), "Hello, world!").unwrap();
        let dest = disk.join("out.tar.gz");

        let report = create_archive(&TarGzArchiver, &[source], &dest).unwrap();
        assert_eq!(report.entries, 2);
        assert!(!entry_names(&dest).iter().any(|n| n.contains("/disk")));
    }
}
