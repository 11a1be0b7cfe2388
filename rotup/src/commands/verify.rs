use anyhow::Context;
use rotup::archive::{self, ArchiveFormat};

use crate::args::VerifyArgs;

pub fn verify(args: VerifyArgs) -> anyhow::Result<i32> {
    let format = match args.format {
        Some(format) => format,
        None => ArchiveFormat::from_path(&args.archive).with_context(|| {
            format!(
                "cannot tell the format of {}, pass --format",
                args.archive.display()
            )
        })?,
    };

    match format.archiver().verify(&args.archive) {
        Ok(report) => {
            println!(
                "{}: OK ({} entries, {} bytes)",
                args.archive.display(),
                report.entries,
                report.bytes
            );
            let digest = archive::digest(&args.archive)
                .with_context(|| format!("Failed to hash {}", args.archive.display()))?;
            println!("SHA-256: {digest}");
            Ok(0)
        }
        Err(e) => {
            eprintln!("{e}");
            Ok(1)
        }
    }
}
