use clap::{Parser, Subcommand};
use rotup::archive::ArchiveFormat;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rotup", version, about = "Rotating backups onto a pool of removable disks")]
pub struct Cli {
    /// Turn verbose logging on
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Back up the sources onto the first attached rotation disk
    Run(RunArgs),
    /// List attached volumes and the rotation disk a run would pick
    Scan(ScanArgs),
    /// Check the integrity of an existing archive
    Verify(VerifyArgs),
    /// Create or inspect the configuration file
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Configuration file (JSON or TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Unattended mode, progress only goes to the log file
    #[arg(long)]
    pub cron: bool,
}

#[derive(Parser, Debug)]
pub struct ScanArgs {
    /// Configuration file (JSON or TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Archive to read back
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,

    /// `zip` or `tar.gz`, guessed from the file name when omitted
    #[arg(long)]
    pub format: Option<ArchiveFormat>,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Configuration file (JSON or TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub sub: ConfigSubArgs,
}

#[derive(Subcommand, Debug)]
pub enum ConfigSubArgs {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

impl Cli {
    pub fn is_run(&self) -> bool {
        matches!(self.command, Commands::Run(_))
    }
}
