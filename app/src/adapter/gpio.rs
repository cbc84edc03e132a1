use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;

use crate::outlet::ChannelId;
use crate::port::{PinDriver, PinLevel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioDriverKind {
    #[default]
    Simulated,
    Sysfs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpioSettings {
    #[serde(default)]
    pub driver: GpioDriverKind,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

impl Default for GpioSettings {
    fn default() -> Self {
        Self {
            driver: GpioDriverKind::default(),
            sysfs_root: default_sysfs_root(),
        }
    }
}

impl GpioSettings {
    pub fn new_driver(&self) -> GpioDriver {
        match self.driver {
            GpioDriverKind::Simulated => {
                tracing::warn!("Using simulated GPIO, no outputs will be switched");
                GpioDriver::Simulated(SimulatedPinDriver)
            }
            GpioDriverKind::Sysfs => GpioDriver::Sysfs(SysfsPinDriver::new(&self.sysfs_root)),
        }
    }
}

pub enum GpioDriver {
    Simulated(SimulatedPinDriver),
    Sysfs(SysfsPinDriver),
}

impl PinDriver for GpioDriver {
    fn open(&self, channel: ChannelId, initial: PinLevel) -> anyhow::Result<()> {
        match self {
            GpioDriver::Simulated(driver) => driver.open(channel, initial),
            GpioDriver::Sysfs(driver) => driver.open(channel, initial),
        }
    }

    fn write(&self, channel: ChannelId, level: PinLevel) -> anyhow::Result<()> {
        match self {
            GpioDriver::Simulated(driver) => driver.write(channel, level),
            GpioDriver::Sysfs(driver) => driver.write(channel, level),
        }
    }
}

pub struct SimulatedPinDriver;

impl PinDriver for SimulatedPinDriver {
    fn open(&self, channel: ChannelId, initial: PinLevel) -> anyhow::Result<()> {
        tracing::info!("Simulated GPIO {} opened as output ({:?})", channel, initial);
        Ok(())
    }

    fn write(&self, channel: ChannelId, level: PinLevel) -> anyhow::Result<()> {
        tracing::info!("Simulated GPIO {} set {:?}", channel, level);
        Ok(())
    }
}

pub struct SysfsPinDriver {
    root: PathBuf,
}

impl SysfsPinDriver {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn pin_dir(&self, channel: ChannelId) -> PathBuf {
        self.root.join(format!("gpio{}", channel))
    }
}

const EXPORT_POLL_ATTEMPTS: u32 = 20;
const EXPORT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

//the kernel creates the pin directory asynchronously after an export
fn wait_for_dir(dir: &Path) -> bool {
    for _ in 0..EXPORT_POLL_ATTEMPTS {
        if dir.exists() {
            return true;
        }
        std::thread::sleep(EXPORT_POLL_INTERVAL);
    }

    dir.exists()
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    std::fs::write(path, content).with_context(|| format!("Error writing {} to {}", content, path.display()))
}

impl PinDriver for SysfsPinDriver {
    fn open(&self, channel: ChannelId, initial: PinLevel) -> anyhow::Result<()> {
        let pin_dir = self.pin_dir(channel);

        if !pin_dir.exists() {
            tracing::debug!("Exporting GPIO {}", channel);
            write_file(&self.root.join("export"), &channel.to_string())?;

            if !wait_for_dir(&pin_dir) {
                anyhow::bail!("GPIO {} did not appear at {} after export", channel, pin_dir.display());
            }
        }

        //"high"/"low" configure the output and its level in one step
        let direction = match initial {
            PinLevel::High => "high",
            PinLevel::Low => "low",
        };
        write_file(&pin_dir.join("direction"), direction)
    }

    fn write(&self, channel: ChannelId, level: PinLevel) -> anyhow::Result<()> {
        let value = match level {
            PinLevel::High => "1",
            PinLevel::Low => "0",
        };
        write_file(&self.pin_dir(channel).join("value"), value)
    }
}
