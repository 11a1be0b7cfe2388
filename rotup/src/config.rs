use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{archive::ArchiveFormat, attach::Credentials, platform::Platform};

static DEFAULT_MOUNT_POINT: &str = "/mnt/rotup";
static DEFAULT_PREFIX: &str = "backup";
const DEFAULT_ID: u32 = 1000;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 10;

/// Rotation sets per platform. Entries are usually `<LABEL>_<UUID>`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DiskRotation {
    pub linux: Vec<String>,
    pub windows: Vec<String>,
}

impl DiskRotation {
    pub fn for_platform(&self, platform: Platform) -> &[String] {
        match platform {
            Platform::Linux => &self.linux,
            Platform::Windows => &self.windows,
        }
    }
}

/// Everything a run needs to know, loaded once and passed in explicitly.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    #[serde(alias = "source_directory", deserialize_with = "one_or_many")]
    pub source_directories: Vec<PathBuf>,
    pub target_mount_point_linux: PathBuf,
    pub linux_user_uid: u32,
    pub linux_user_gid: u32,
    pub logging_directory: PathBuf,
    pub backup_filename_prefix: String,
    pub archive_format: ArchiveFormat,
    pub command_timeout_secs: u64,
    pub disk_rotation: DiskRotation,
}

impl Default for Config {
    fn default() -> Self {
        let logging_directory = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rotup")
            .join("logs");
        Self {
            source_directories: Vec::new(),
            target_mount_point_linux: PathBuf::from(DEFAULT_MOUNT_POINT),
            linux_user_uid: DEFAULT_ID,
            linux_user_gid: DEFAULT_ID,
            logging_directory,
            backup_filename_prefix: DEFAULT_PREFIX.to_string(),
            archive_format: ArchiveFormat::default(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            disk_rotation: DiskRotation::default(),
        }
    }
}

/// The part of the configuration the matcher and the attachment manager see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub allowed: Vec<String>,
    pub target: PathBuf,
    pub credentials: Credentials,
}

/// Older configurations carry a single `source_directory` string.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(PathBuf),
        Many(Vec<PathBuf>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

impl Config {
    const APP_NAME: &'static str = "rotup";
    const CONFIG_NAME: &'static str = "config";

    /// `~/.config/rotup/config.toml` or the platform equivalent.
    ///
    /// Note: under sudo this resolves to root's configuration directory.
    pub fn default_path() -> Result<PathBuf> {
        confy::get_configuration_file_path(Self::APP_NAME, Self::CONFIG_NAME).with_context(|| {
            format!(
                "failed to locate config file `{}.{}`",
                Self::APP_NAME,
                Self::CONFIG_NAME
            )
        })
    }

    /// Resolve `--config`, falling back to the default location.
    pub fn path_or_default(path: Option<&Path>) -> Result<PathBuf> {
        match path {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::default_path(),
        }
    }

    /// Load the configuration at `path`. JSON files are read as such, anything
    /// else as TOML. A relative `logging_directory` is taken relative to the
    /// configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!(
                "config file {} not found, create one with `rotup config init`",
                path.display()
            );
        }

        let mut config: Config = if is_json(path) {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            confy::load_path(path)
                .with_context(|| format!("failed to load config file {}", path.display()))?
        };

        if config.logging_directory.is_relative()
            && let Some(parent) = path.parent()
        {
            config.logging_directory = parent.join(&config.logging_directory);
        }
        Ok(config)
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if is_json(path) {
            let content = serde_json::to_string_pretty(self)?;
            fs::write(path, content)
                .with_context(|| format!("failed to write config file {}", path.display()))
        } else {
            confy::store_path(path, self)
                .with_context(|| format!("failed to store config file {}", path.display()))
        }
    }

    /// Reject configurations a run could only fail on.
    pub fn validate(&self, platform: Platform) -> Result<()> {
        if self.source_directories.is_empty() {
            bail!("`source_directories` is empty, nothing to back up");
        }
        if platform == Platform::Linux
            && let Some(source) = self
                .source_directories
                .iter()
                .find(|source| source.starts_with(&self.target_mount_point_linux))
        {
            bail!(
                "source directory {} lies on `target_mount_point_linux` {}",
                source.display(),
                self.target_mount_point_linux.display()
            );
        }
        let rotation = self.disk_rotation.for_platform(platform);
        if rotation.iter().all(|entry| entry.trim().is_empty()) {
            bail!("`disk_rotation.{platform}` lists no disks");
        }
        let prefix = &self.backup_filename_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            bail!("`backup_filename_prefix` must match [A-Za-z0-9._-]+, got `{prefix}`");
        }
        if self.command_timeout_secs == 0 {
            bail!("`command_timeout_secs` must be positive");
        }
        Ok(())
    }

    pub fn rotation(&self, platform: Platform) -> RotationConfig {
        RotationConfig {
            allowed: self
                .disk_rotation
                .for_platform(platform)
                .iter()
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect(),
            target: self.target_mount_point_linux.clone(),
            credentials: self.credentials(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            uid: self.linux_user_uid,
            gid: self.linux_user_gid,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}
