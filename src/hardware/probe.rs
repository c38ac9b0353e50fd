//! Disk Probes
//!
//! Implementations of the [`DiskProbe`] port: a sysfs scanner for real
//! hosts and a programmable probe for tests and demo mode.

use crate::domain::ports::DiskProbe;
use crate::domain::types::DiskId;
use crate::error::{Error, Result};
use crate::hardware::inventory::{DiskSample, HealthSample, MediaType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SECTOR_SIZE: u64 = 512;

// =============================================================================
// Sysfs Probe
// =============================================================================

/// Configuration for the sysfs probe
#[derive(Debug, Clone)]
pub struct SysfsProbeConfig {
    /// Root of sysfs (overridden in tests)
    pub sysfs_path: PathBuf,
    /// Minimum device size to report
    pub min_size_bytes: u64,
    /// Report loopback devices
    pub include_loopback: bool,
}

impl Default for SysfsProbeConfig {
    fn default() -> Self {
        Self {
            sysfs_path: PathBuf::from("/sys"),
            min_size_bytes: 1_000_000_000,
            include_loopback: false,
        }
    }
}

/// Enumerates whole-disk block devices from `/sys/class/block`
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    config: SysfsProbeConfig,
}

impl SysfsProbe {
    pub fn new(config: SysfsProbeConfig) -> Self {
        Self { config }
    }

    fn scan_blocking(&self) -> Result<Vec<DiskSample>> {
        let block_path = self.config.sysfs_path.join("class/block");
        if !block_path.exists() {
            return Err(Error::TransientIo {
                operation: "disk scan".into(),
                reason: format!("{} not found", block_path.display()),
            });
        }

        let mut samples = Vec::new();
        for entry in fs::read_dir(&block_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();

            if !self.should_include(&name) || path.join("partition").exists() {
                continue;
            }

            match self.read_device(&name, &path) {
                Ok(sample) if sample.capacity_bytes >= self.config.min_size_bytes => {
                    samples.push(sample)
                }
                Ok(sample) => debug!(
                    "Skipping {}: {} bytes is below the minimum",
                    name, sample.capacity_bytes
                ),
                Err(e) => debug!("Skipping {}: {}", name, e),
            }
        }

        samples.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(samples)
    }

    fn read_device(&self, name: &str, path: &Path) -> Result<DiskSample> {
        let sectors: u64 = read_attr(path, "size")?
            .parse()
            .map_err(|_| Error::Internal(format!("invalid size attribute for {}", name)))?;

        let model = read_attr(path, "device/model")
            .or_else(|_| read_attr(path, "device/name"))
            .unwrap_or_else(|_| "unknown".into());
        let serial = read_attr(path, "device/serial")
            .or_else(|_| read_attr(path, "device/wwid"))
            .unwrap_or_default();

        let media = if name.starts_with("nvme") {
            MediaType::Nvme
        } else {
            match read_attr(path, "queue/rotational").as_deref() {
                Ok("0") => MediaType::Ssd,
                Ok("1") => MediaType::Hdd,
                _ => MediaType::Unknown,
            }
        };

        // SCSI error counters are hex
        let io_errors = read_attr(path, "device/ioerr_cnt")
            .ok()
            .and_then(|v| u64::from_str_radix(v.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0);

        // Device names move between boots, serials do not
        let id = if serial.is_empty() {
            DiskId::new(name)
        } else {
            DiskId::new(serial.as_str())
        };

        Ok(DiskSample {
            id,
            device_path: format!("/dev/{}", name),
            model,
            serial,
            capacity_bytes: sectors * SECTOR_SIZE,
            media,
            health: HealthSample {
                io_errors,
                ..HealthSample::default()
            },
        })
    }

    fn should_include(&self, name: &str) -> bool {
        if name.starts_with("loop") {
            return self.config.include_loopback;
        }
        !["ram", "dm-", "md", "zram", "sr"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }
}

#[async_trait]
impl DiskProbe for SysfsProbe {
    fn name(&self) -> &str {
        "sysfs"
    }

    async fn scan(&self) -> Result<Vec<DiskSample>> {
        let probe = self.clone();
        let samples = tokio::task::spawn_blocking(move || probe.scan_blocking())
            .await
            .map_err(|e| Error::Internal(format!("disk scan panicked: {}", e)))??;
        debug!("sysfs scan found {} disk(s)", samples.len());
        Ok(samples)
    }
}

fn read_attr(base: &Path, attr: &str) -> Result<String> {
    let value = fs::read_to_string(base.join(attr))?;
    Ok(value.trim().to_string())
}

// =============================================================================
// Simulated Probe
// =============================================================================

/// Probe whose devices and counters are set programmatically
#[derive(Debug, Default)]
pub struct SimulatedProbe {
    devices: Mutex<BTreeMap<DiskId, DiskSample>>,
    unavailable: Mutex<bool>,
}

impl SimulatedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// A probe pre-populated with `count` identical disks
    pub fn with_disks(count: usize, capacity_bytes: u64) -> Self {
        let probe = Self::new();
        for i in 0..count {
            probe.insert(DiskSample {
                id: DiskId::new(format!("sim-{:02}", i)),
                device_path: format!("/dev/sim{}", i),
                model: "SIMULATED".into(),
                serial: format!("SIM{:06}", i),
                capacity_bytes,
                media: MediaType::Hdd,
                health: HealthSample::default(),
            });
        }
        info!("Simulated probe with {} disk(s)", count);
        probe
    }

    /// Plug a device in
    pub fn insert(&self, sample: DiskSample) {
        self.devices.lock().insert(sample.id.clone(), sample);
    }

    /// Pull a device out
    pub fn remove(&self, id: &DiskId) -> Option<DiskSample> {
        self.devices.lock().remove(id)
    }

    /// Change the health counters of a device
    pub fn update_health(&self, id: &DiskId, update: impl FnOnce(&mut HealthSample)) -> Result<()> {
        let mut devices = self.devices.lock();
        let sample = devices
            .get_mut(id)
            .ok_or_else(|| Error::not_found("disk", id))?;
        update(&mut sample.health);
        Ok(())
    }

    /// Make scans fail until called again with `false`
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }
}

#[async_trait]
impl DiskProbe for SimulatedProbe {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn scan(&self) -> Result<Vec<DiskSample>> {
        if *self.unavailable.lock() {
            return Err(Error::TransientIo {
                operation: "disk scan".into(),
                reason: "probe unavailable".into(),
            });
        }
        Ok(self.devices.lock().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn write(root: &Path, device: &str, attr: &str, value: &str) {
        let path = root.join("class/block").join(device).join(attr);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("{}\n", value)).unwrap();
    }

    fn probe(root: &Path) -> SysfsProbe {
        SysfsProbe::new(SysfsProbeConfig {
            sysfs_path: root.to_path_buf(),
            min_size_bytes: 1024,
            include_loopback: false,
        })
    }

    #[tokio::test]
    async fn test_sysfs_scan_reads_whole_disks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "sda", "size", "2048");
        write(root, "sda", "queue/rotational", "1");
        write(root, "sda", "device/model", "WDC WD40");
        write(root, "sda", "device/serial", "WD-1234");
        write(root, "sda", "device/ioerr_cnt", "0x3");
        write(root, "sda1", "size", "1024");
        write(root, "sda1", "partition", "1");
        write(root, "nvme0n1", "size", "4096");
        write(root, "loop0", "size", "4096");
        write(root, "sdz", "size", "1");

        let samples = tokio_test::assert_ok!(probe(root).scan().await);
        assert_eq!(samples.len(), 2);

        let sda = samples.iter().find(|s| s.device_path == "/dev/sda").unwrap();
        assert_eq!(sda.id, DiskId::new("WD-1234"));
        assert_eq!(sda.capacity_bytes, 2048 * 512);
        assert_eq!(sda.media, MediaType::Hdd);
        assert_eq!(sda.model, "WDC WD40");
        assert_eq!(sda.health.io_errors, 3);

        let nvme = samples.iter().find(|s| s.device_path == "/dev/nvme0n1").unwrap();
        assert_eq!(nvme.id, DiskId::new("nvme0n1"));
        assert_eq!(nvme.media, MediaType::Nvme);
    }

    #[tokio::test]
    async fn test_sysfs_scan_without_sysfs_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            probe(dir.path()).scan().await,
            Err(Error::TransientIo { .. })
        );
    }

    #[tokio::test]
    async fn test_simulated_probe() {
        let probe = SimulatedProbe::with_disks(3, 1000);
        assert_eq!(probe.scan().await.unwrap().len(), 3);

        let id = DiskId::new("sim-01");
        probe
            .update_health(&id, |h| h.temperature_celsius = Some(70))
            .unwrap();
        probe.remove(&DiskId::new("sim-00"));

        let samples = probe.scan().await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].health.temperature_celsius, Some(70));

        probe.set_unavailable(true);
        tokio_test::assert_err!(probe.scan().await);
    }
}
