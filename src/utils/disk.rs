use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tokio::process::Command;
use tracing::debug;

use crate::backup::command::FAT32_MAX_FILE_SIZE;

/// A mounted volume that carries the configured label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub label: String,
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilesystemKind {
    Fat,
    ExFat,
    Ntfs,
    /// Filesystems without a practical file-size limit.
    Native(String),
    Unsupported(String),
}

impl FilesystemKind {
    pub fn from_name(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "vfat" | "fat" | "fat32" | "fat16" | "msdos" => FilesystemKind::Fat,
            "exfat" => FilesystemKind::ExFat,
            "ntfs" | "ntfs3" | "fuseblk" => FilesystemKind::Ntfs,
            "ext2" | "ext3" | "ext4" | "ext2/ext3" | "btrfs" | "xfs" | "f2fs" | "apfs" | "hfs"
            | "hfsplus" | "9p" | "virtiofs" => FilesystemKind::Native(name),
            _ => FilesystemKind::Unsupported(name),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, FilesystemKind::Unsupported(_))
    }

    pub fn max_file_size(&self) -> Option<u64> {
        match self {
            FilesystemKind::Fat => Some(FAT32_MAX_FILE_SIZE),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FilesystemKind::Fat => "vfat",
            FilesystemKind::ExFat => "exfat",
            FilesystemKind::Ntfs => "ntfs",
            FilesystemKind::Native(name) | FilesystemKind::Unsupported(name) => name,
        }
    }
}

/// Finds removable volumes and reports on them.
#[async_trait]
pub trait VolumeLocator: Send + Sync {
    async fn find_by_label(&self, label: &str) -> Result<Option<Volume>>;

    async fn filesystem_type(&self, volume: &Volume) -> Result<FilesystemKind>;

    /// Bytes available to us on the volume.
    async fn free_space(&self, volume: &Volume) -> Result<u64>;
}

/// Looks through mounted disks, falling back to well-known removable-media
/// roots that are named after the volume label.
pub struct MountedVolumeLocator {
    disks: Mutex<Disks>,
    roots: Vec<PathBuf>,
}

impl MountedVolumeLocator {
    pub fn new() -> Self {
        let mut roots = vec![PathBuf::from("/mnt/chromeos/removable")];
        if let Ok(user) = std::env::var("USER") {
            roots.push(PathBuf::from("/media").join(&user));
            roots.push(PathBuf::from("/run/media").join(&user));
        }
        roots.push(PathBuf::from("/media"));
        roots.push(PathBuf::from("/Volumes"));

        Self {
            disks: Mutex::new(Disks::new_with_refreshed_list()),
            roots,
        }
    }

    /// (filesystem, available bytes) for the disk mounted exactly at `mount_point`.
    fn disk_stats(&self, mount_point: &Path) -> Option<(String, u64)> {
        let mut disks = self.disks.lock();
        disks.refresh_list();
        disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == mount_point)
            .map(|disk| {
                (
                    disk.file_system().to_string_lossy().to_string(),
                    disk.available_space(),
                )
            })
    }
}

impl Default for MountedVolumeLocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumeLocator for MountedVolumeLocator {
    async fn find_by_label(&self, label: &str) -> Result<Option<Volume>> {
        let labelled_device = tokio::fs::canonicalize(Path::new("/dev/disk/by-label").join(label))
            .await
            .ok();

        let found = {
            let mut disks = self.disks.lock();
            disks.refresh_list();
            disks
                .list()
                .iter()
                .find(|disk| {
                    // Windows reports the volume label as the disk name
                    let name_matches = disk.name().to_string_lossy().eq_ignore_ascii_case(label);
                    let mount_matches = disk
                        .mount_point()
                        .file_name()
                        .map(|n| n.to_string_lossy().eq_ignore_ascii_case(label))
                        .unwrap_or(false);
                    let device_matches = labelled_device
                        .as_deref()
                        .map(|dev| Path::new(disk.name()) == dev)
                        .unwrap_or(false);
                    name_matches || mount_matches || device_matches
                })
                .map(|disk| disk.mount_point().to_path_buf())
        };

        if let Some(mount_point) = found {
            return Ok(Some(Volume {
                label: label.to_string(),
                mount_point,
            }));
        }

        // ChromeOS exposes removable media under a label-named directory
        // that does not show up as a mount in the Linux container
        for root in &self.roots {
            let Ok(mut entries) = tokio::fs::read_dir(root).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let matches = entry.file_name().to_string_lossy().eq_ignore_ascii_case(label);
                if matches && entry.path().is_dir() {
                    debug!("Found {} under {}", label, root.display());
                    return Ok(Some(Volume {
                        label: label.to_string(),
                        mount_point: entry.path(),
                    }));
                }
            }
        }

        Ok(None)
    }

    async fn filesystem_type(&self, volume: &Volume) -> Result<FilesystemKind> {
        let name = match self.disk_stats(&volume.mount_point) {
            Some((fs, _)) => fs,
            None => df_stats(&volume.mount_point).await?.filesystem,
        };
        Ok(FilesystemKind::from_name(&name))
    }

    async fn free_space(&self, volume: &Volume) -> Result<u64> {
        match self.disk_stats(&volume.mount_point) {
            Some((_, available)) => Ok(available),
            None => Ok(df_stats(&volume.mount_point).await?.available),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfStats {
    pub filesystem: String,
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

async fn df_stats(path: &Path) -> Result<DfStats> {
    // -T adds the type column, -B1 reports bytes
    let output = Command::new("df").arg("-T").arg("-B1").arg(path).output().await?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "df failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    parse_df_output(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| anyhow::anyhow!("unexpected df output for {}", path.display()))
}

/// Parse `df -T -B1` output: a header, then
/// `source type total used available use% mountpoint`.
pub fn parse_df_output(output: &str) -> Option<DfStats> {
    let line = output.lines().nth(1)?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }

    Some(DfStats {
        filesystem: parts[1].to_string(),
        total: parts[2].parse().ok()?,
        used: parts[3].parse().ok()?,
        available: parts[4].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_kinds() {
        assert_eq!(FilesystemKind::from_name("vfat"), FilesystemKind::Fat);
        assert_eq!(FilesystemKind::from_name("FAT32"), FilesystemKind::Fat);
        assert_eq!(FilesystemKind::from_name("exfat"), FilesystemKind::ExFat);
        assert_eq!(FilesystemKind::from_name("fuseblk"), FilesystemKind::Ntfs);
        assert_eq!(
            FilesystemKind::from_name("ext4"),
            FilesystemKind::Native("ext4".into())
        );

        let iso = FilesystemKind::from_name("iso9660");
        assert!(!iso.is_supported());
        assert_eq!(iso.name(), "iso9660");

        assert_eq!(FilesystemKind::Fat.max_file_size(), Some(FAT32_MAX_FILE_SIZE));
        assert_eq!(FilesystemKind::ExFat.max_file_size(), None);
    }

    #[test]
    fn test_parse_df_output() {
        let output = "\
Filesystem     Type     1B-blocks        Used   Available Use% Mounted on
/dev/sdb1      vfat  31992053760  4096000000 27896053760  13% /media/user/BACKUP
";
        let stats = parse_df_output(output).unwrap();
        assert_eq!(stats.filesystem, "vfat");
        assert_eq!(stats.total, 31_992_053_760);
        assert_eq!(stats.used, 4_096_000_000);
        assert_eq!(stats.available, 27_896_053_760);
    }

    #[test]
    fn test_parse_df_output_rejects_garbage() {
        assert_eq!(parse_df_output(""), None);
        assert_eq!(parse_df_output("header only\n"), None);
        assert_eq!(parse_df_output("h\n/dev/sdb1 vfat x y z 1% /m\n"), None);
    }

    #[tokio::test]
    async fn test_unknown_label_is_absent() {
        let locator = MountedVolumeLocator {
            disks: Mutex::new(Disks::new()),
            roots: vec![tempfile::tempdir().unwrap().path().to_path_buf()],
        };
        let found = locator
            .find_by_label("NO-SUCH-LABEL-7f3a9c")
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_label_directory_under_root_is_found() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("Backup-7f3a9c")).unwrap();
        let locator = MountedVolumeLocator {
            disks: Mutex::new(Disks::new()),
            roots: vec![root.path().to_path_buf()],
        };

        let volume = locator.find_by_label("BACKUP-7F3A9C").await.unwrap().unwrap();
        assert_eq!(volume.mount_point, root.path().join("Backup-7f3a9c"));
        assert_eq!(volume.label, "BACKUP-7F3A9C");
    }
}
