use chrono::Weekday;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::backup::command::{parse_size, FAT32_MAX_FILE_SIZE};
use crate::backup::BackupError;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "USB_BACKUP_CONFIG";

/// Prefix for per-key environment overrides, e.g. `USB_BACKUP_USB_LABEL`.
pub const ENV_PREFIX: &str = "USB_BACKUP";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Volume label of the target USB drive (matched case-insensitively)
    pub usb_label: String,

    /// Folder inside the volume that receives the replica
    pub usb_folder: PathBuf,

    /// rclone source, e.g. `onedrive:` or `onedrive:Documents`
    pub remote: String,

    /// Parallel transfers for the small-file lane
    pub transfers: u32,

    /// Parallel checkers per lane
    pub checkers: u32,

    /// Seconds between volume polls
    pub check_interval: u64,

    /// Parallel transfers for the large-file lane
    pub large_transfers: u32,

    pub rclone_path: PathBuf,

    /// rclone `--exclude-from` file
    pub exclude_from: Option<PathBuf>,

    /// Day on which the destructive `sync` runs instead of `copy`
    pub sync_day: Weekday,

    /// Files at or above this size go to the large lane
    #[serde(deserialize_with = "de_size")]
    pub size_threshold: u64,

    pub retries: u32,
    pub low_level_retries: u32,

    #[serde(deserialize_with = "de_duration")]
    pub stats_interval: Duration,

    pub tpslimit: Option<u32>,
    pub tpslimit_burst: u32,

    /// Appended verbatim to every rclone invocation
    pub extra_args: Vec<String>,

    /// Zero-speed readings before the small lane may be paused
    pub zero_speed_limit: u32,

    /// Time without progress before the small lane may be paused
    #[serde(deserialize_with = "de_duration")]
    pub stall_timeout: Duration,

    #[serde(deserialize_with = "de_duration")]
    pub poll_interval: Duration,

    /// How long a terminated rclone gets before it is killed
    #[serde(deserialize_with = "de_duration")]
    pub kill_grace: Duration,

    /// Cycles are skipped while the volume has less free space than this
    #[serde(deserialize_with = "de_size")]
    pub min_free_space: u64,

    pub log_file: PathBuf,

    /// Write the log file as JSON lines
    pub log_json: bool,

    pub lock_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let lock_dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);

        Self {
            usb_label: "BACKUP".to_string(),
            usb_folder: PathBuf::from("cloud_backup"),
            remote: String::new(),
            transfers: 4,
            checkers: 8,
            check_interval: 30,
            large_transfers: 2,
            rclone_path: PathBuf::from("rclone"),
            exclude_from: None,
            sync_day: Weekday::Sun,
            size_threshold: 64 * 1024 * 1024,
            retries: 10,
            low_level_retries: 10,
            stats_interval: Duration::from_secs(15),
            tpslimit: Some(8),
            tpslimit_burst: 1,
            extra_args: [
                "--fast-list",
                "--modify-window",
                "2s",
                "--size-only",
                "--no-update-modtime",
                "--timeout",
                "1h",
                "--contimeout",
                "60s",
                "--drive-chunk-size",
                "64M",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            zero_speed_limit: 4,
            stall_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            kill_grace: Duration::from_secs(10),
            min_free_space: 1024 * 1024 * 1024,
            log_file: PathBuf::from("logs/backup.log"),
            log_json: false,
            lock_file: lock_dir.join("cloud2usb.lock"),
        }
    }
}

impl Config {
    /// Load config from the JSON file and `USB_BACKUP_*` environment variables
    pub fn load(path: &Path) -> Result<Self, BackupError> {
        Self::load_with_env(path, None)
    }

    /// Like [`Config::load`], reading overrides from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(
        path: &Path,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, BackupError> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        let invalid = |msg: String| Err(BackupError::Config(msg));

        if self.remote.trim().is_empty() {
            return invalid("`remote` must name an rclone source".into());
        }
        if self.usb_label.trim().is_empty() {
            return invalid("`usb_label` must not be empty".into());
        }
        if self.usb_folder.is_absolute()
            || self
                .usb_folder
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return invalid(format!(
                "`usb_folder` must be relative to the volume, got {}",
                self.usb_folder.display()
            ));
        }
        if self.transfers == 0 || self.large_transfers == 0 || self.checkers == 0 {
            return invalid("transfer and checker counts must be at least 1".into());
        }
        if self.zero_speed_limit == 0 {
            return invalid("`zero_speed_limit` must be at least 1".into());
        }
        if self.poll_interval.is_zero() {
            return invalid("`poll_interval` must be positive".into());
        }
        if self.check_interval == 0 {
            return invalid("`check_interval` must be at least 1 second".into());
        }
        if self.size_threshold == 0 || self.size_threshold >= FAT32_MAX_FILE_SIZE {
            return invalid(format!(
                "`size_threshold` must be between 1 byte and 4 GiB, got {}",
                self.size_threshold
            ));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }
}

pub fn load_config() -> Result<Config, BackupError> {
    let path = std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    Config::load(&path)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Number(u64),
    Text(String),
}

/// Seconds as a number, or a humantime string such as `"90s"` / `"500ms"`.
fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match Raw::deserialize(deserializer)? {
        Raw::Number(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
    }
}

/// Bytes as a number, or a size string such as `"64M"`.
fn de_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Raw::deserialize(deserializer)? {
        Raw::Number(bytes) => Ok(bytes),
        Raw::Text(text) => parse_size(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid size {text:?}"))),
    }
}
