//! Update engine configuration.
//!
//! [`Config::default`] carries the production values for the STM32G0-based
//! OIS module. With the `serde` feature, a TOML file can override any subset
//! of them:
//!
//! ```toml
//! firmware_dir = "/data/camera"
//! max_update_retries = 5
//!
//! [timing]
//! full_erase_timeout_ms = 2000
//! ```

#[cfg(feature = "serde")]
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::sysboot::MAX_PAYLOAD;
use crate::target::stm32g0;

/// Delays and timeouts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Timing {
    /// How long NRST is held low.
    pub reset_pulse_ms: u32,
    /// Delay after releasing NRST before the bootloader listens on I2C.
    pub startup_delay_ms: u32,
    /// Delay between attempts of a whole bootloader command.
    pub retry_interval_ms: u32,
    /// Back-off between single-byte ACK polls.
    pub inter_packet_ms: u32,
    /// ACK timeout for ordinary frames.
    pub response_timeout_ms: u32,
    /// ACK timeout after a write-memory payload.
    pub write_timeout_ms: u32,
    /// ACK timeout for mass erase and (un)protect commands.
    pub full_erase_timeout_ms: u32,
    /// ACK timeout per page for a page erase.
    pub page_erase_timeout_ms: u32,
    /// Extra ACK time after the GO address frame.
    pub go_extra_ms: u32,
    /// Settle time after returning the target to the application.
    pub disconnect_settle_ms: u32,
    /// Settle time after clearing the empty-check flag.
    pub empty_clear_settle_ms: u32,
    /// Settle time after entering program-update mode.
    pub program_mode_settle_ms: u32,
    /// Self-reset time after writing the image checksum.
    pub checksum_settle_ms: u32,
    /// Restart time after a software reset.
    pub sw_reset_settle_ms: u32,
    /// Flash commit time after writing clock settings.
    pub clock_commit_ms: u32,
    /// Settle time after powering the module.
    pub power_up_settle_ms: u32,
    /// Delay between idle-status polls.
    pub idle_poll_ms: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reset_pulse_ms: 2,
            startup_delay_ms: 50,
            retry_interval_ms: 5,
            inter_packet_ms: 1,
            response_timeout_ms: 100,
            write_timeout_ms: stm32g0::PROGRAM_TIME_MS,
            full_erase_timeout_ms: stm32g0::FULL_ERASE_TIME_MS,
            page_erase_timeout_ms: stm32g0::PAGE_ERASE_TIME_MS,
            go_extra_ms: 200,
            disconnect_settle_ms: 150,
            empty_clear_settle_ms: 50,
            program_mode_settle_ms: 55,
            checksum_settle_ms: 190,
            sw_reset_settle_ms: 50,
            clock_commit_ms: 200,
            power_up_settle_ms: 15,
            idle_poll_ms: 10,
        }
    }
}

/// Convert a millisecond field into a [`Duration`].
pub(crate) fn ms(value: u32) -> Duration {
    Duration::from_millis(u64::from(value))
}

/// Update engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// I2C address of the system bootloader.
    pub bootloader_address: u8,
    /// I2C address of the application firmware.
    pub app_address: u8,
    /// Directory holding the firmware image.
    pub firmware_dir: PathBuf,
    /// Firmware image file name.
    pub firmware_name: String,
    /// File offset of the first half of the version tag.
    pub version_offset: u64,
    /// File offset of the second half of the version tag.
    pub vendor_info_offset: u64,
    /// Payload bytes per write-memory command.
    pub chunk_size: usize,
    /// Bytes erased from the flash base before programming.
    pub app_region_len: u32,
    /// Product id the bootloader is expected to report.
    pub expected_product_id: u16,
    /// Update attempts allowed after the first failure.
    pub max_update_retries: u32,
    /// Idle polls before the application is declared unresponsive.
    pub idle_retries: u32,
    /// External clock frequency fed to the module, in Hz.
    pub ext_clock_hz: u32,
    /// Delays and timeouts.
    pub timing: Timing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootloader_address: 0x51,
            app_address: 0xA2,
            firmware_dir: PathBuf::from("/vendor/lib/camera"),
            firmware_name: "ois_mcu_fw.bin".to_string(),
            version_offset: 0x80F8,
            vendor_info_offset: 0x807C,
            chunk_size: 256,
            app_region_len: 65536 - stm32g0::PAGE_SIZE,
            expected_product_id: stm32g0::PRODUCT_ID,
            max_update_retries: 3,
            idle_retries: 30,
            ext_clock_hz: 24_000_000,
            timing: Timing::default(),
        }
    }
}

impl Config {
    /// Full path of the firmware image.
    pub fn firmware_path(&self) -> PathBuf {
        self.firmware_dir
            .join(&self.firmware_name)
    }

    /// Set the firmware location.
    #[must_use]
    pub fn with_firmware(mut self, dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        self.firmware_dir = dir.into();
        self.firmware_name = name.into();
        self
    }

    /// Set the update retry budget.
    #[must_use]
    pub fn with_max_update_retries(mut self, retries: u32) -> Self {
        self.max_update_retries = retries;
        self
    }

    /// Set the timing block.
    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Set the external clock frequency.
    #[must_use]
    pub fn with_ext_clock(mut self, hz: u32) -> Self {
        self.ext_clock_hz = hz;
        self
    }

    /// Check values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_PAYLOAD {
            return Err(Error::Config(format!(
                "chunk_size must be 1..={}, got {}",
                MAX_PAYLOAD,
                self.chunk_size
            )));
        }
        if self.bootloader_address == self.app_address {
            return Err(Error::Config(
                "bootloader and application addresses must differ".into(),
            ));
        }
        if self.app_region_len == 0 {
            return Err(Error::Config("app_region_len must not be 0".into()));
        }
        let t = &self.timing;
        for (name, value) in [
            ("response_timeout_ms", t.response_timeout_ms),
            ("write_timeout_ms", t.write_timeout_ms),
            ("full_erase_timeout_ms", t.full_erase_timeout_ms),
            ("page_erase_timeout_ms", t.page_erase_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("timing.{name} must not be 0")));
            }
        }
        Ok(())
    }

    /// Parse a TOML override; missing fields keep their defaults.
    #[cfg(feature = "serde")]
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML override file.
    #[cfg(feature = "serde")]
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        log::debug!("Loaded config from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML.
    #[cfg(feature = "serde")]
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}
