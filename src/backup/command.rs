use chrono::Weekday;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::LaneKind;
use crate::utils::config::Config;
use crate::utils::disk::FilesystemKind;

/// Largest file a FAT32 volume can hold.
pub const FAT32_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Additive only.
    Copy,
    /// Deletes destination files missing from the remote.
    Sync,
}

impl TransferMode {
    /// `sync` on the configured day, `copy` on every other.
    pub fn for_day(today: Weekday, sync_day: Weekday) -> Self {
        if today == sync_day {
            TransferMode::Sync
        } else {
            TransferMode::Copy
        }
    }

    pub fn as_arg(&self) -> &'static str {
        match self {
            TransferMode::Copy => "copy",
            TransferMode::Sync => "sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOrder {
    Ascending,
    Descending,
}

impl SizeOrder {
    pub fn as_arg(&self) -> &'static str {
        match self {
            SizeOrder::Ascending => "size,asc",
            SizeOrder::Descending => "size,desc",
        }
    }
}

/// Inclusive file-size window in bytes, matching rclone's `--min-size` /
/// `--max-size` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBound {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl SizeBound {
    pub fn contains(&self, size: u64) -> bool {
        self.min.map_or(true, |min| size >= min) && self.max.map_or(true, |max| size <= max)
    }
}

/// One fully-resolved rclone invocation. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferCommand {
    pub lane: LaneKind,
    pub program: PathBuf,
    pub mode: TransferMode,
    pub source: String,
    pub destination: PathBuf,
    pub bounds: SizeBound,
    pub transfers: u32,
    pub checkers: u32,
    pub order: SizeOrder,
    args: Vec<OsString>,
}

impl TransferCommand {
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    #[cfg(test)]
    pub fn set_args(&mut self, args: Vec<OsString>) {
        self.args = args;
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(|a| a.as_os_str()))
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Build the large- and small-file commands for one cycle.
///
/// The two size windows never overlap and together cover every file size
/// the destination filesystem can store.
pub fn plan_lanes(
    config: &Config,
    destination: &Path,
    mode: TransferMode,
    filesystem: &FilesystemKind,
) -> (TransferCommand, TransferCommand) {
    let threshold = config.size_threshold.max(1);

    let large = build(
        config,
        LaneKind::Large,
        destination,
        mode,
        SizeBound {
            min: Some(threshold),
            max: filesystem.max_file_size(),
        },
        config.large_transfers,
        SizeOrder::Descending,
    );
    let small = build(
        config,
        LaneKind::Small,
        destination,
        mode,
        SizeBound {
            min: None,
            max: Some(threshold - 1),
        },
        config.transfers,
        SizeOrder::Ascending,
    );

    (large, small)
}

fn build(
    config: &Config,
    lane: LaneKind,
    destination: &Path,
    mode: TransferMode,
    bounds: SizeBound,
    transfers: u32,
    order: SizeOrder,
) -> TransferCommand {
    let mut args: Vec<OsString> = vec![
        mode.as_arg().into(),
        config.remote.clone().into(),
        destination.as_os_str().to_owned(),
    ];

    // rclone reads a bare number as KiB; the B suffix pins it to bytes
    if let Some(min) = bounds.min {
        args.push("--min-size".into());
        args.push(format!("{min}B").into());
    }
    if let Some(max) = bounds.max {
        args.push("--max-size".into());
        args.push(format!("{max}B").into());
    }

    let mut push = |flag: &str, value: String| {
        args.push(flag.into());
        args.push(value.into());
    };
    push("--transfers", transfers.to_string());
    push("--checkers", config.checkers.to_string());
    push("--order-by", order.as_arg().to_string());
    push("--retries", config.retries.to_string());
    push("--low-level-retries", config.low_level_retries.to_string());
    push(
        "--stats",
        format!("{}s", config.stats_interval.as_secs().max(1)),
    );
    if let Some(tps) = config.tpslimit {
        push("--tpslimit", tps.to_string());
        push("--tpslimit-burst", config.tpslimit_burst.max(1).to_string());
    }
    if let Some(exclude) = &config.exclude_from {
        args.push("--exclude-from".into());
        args.push(exclude.as_os_str().to_owned());
    }

    args.push("--stats-one-line".into());
    args.push("--stats-one-line-date".into());
    args.push("--log-level".into());
    args.push("INFO".into());

    match mode {
        TransferMode::Sync => args.push("--delete-after".into()),
        TransferMode::Copy => args.push("--no-traverse".into()),
    }

    args.extend(config.extra_args.iter().map(OsString::from));

    TransferCommand {
        lane,
        program: config.rclone_path.clone(),
        mode,
        source: config.remote.clone(),
        destination: destination.to_path_buf(),
        bounds,
        transfers,
        checkers: config.checkers,
        order,
        args,
    }
}

/// Parse `"512"`, `"64K"`, `"64M"`, `"1.5G"` or `"2T"` into bytes (binary units).
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return None,
    };
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    Some((number * multiplier as f64) as u64)
}
