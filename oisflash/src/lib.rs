//! # oisflash
//!
//! Firmware update engine for optical image stabilisation (OIS) actuator
//! modules built around an STM32G0 MCU.
//!
//! The crate talks to the module over one I2C bus, either to the running
//! application firmware or to the ROM system bootloader, and provides:
//!
//! - STM32 I2C bootloader framing and ACK handling (AN4221)
//! - Flash memory map and page-aligned erase resolution
//! - Bootloader session management through the reset and boot pins
//! - Complete flash programming with option-byte repair and verification
//! - Boot-time firmware reconciliation with retries and status reporting
//!
//! Hardware access goes through the small traits in [`port`], so the engine
//! runs unchanged against a kernel I2C adapter, a USB bridge or a simulator.
//!
//! ## Features
//!
//! - `serde`: Serialization for configuration types and TOML overrides
//!
//! ## Example
//!
//! ```rust,no_run
//! use oisflash::{Config, FileFirmware, Reconciler, Session};
//! # fn run<B, C, P, W>(bus: B, clock: C, reset: P, boot: P, power: W) -> oisflash::Result<()>
//! # where
//! #     B: oisflash::port::Bus,
//! #     C: oisflash::port::Clock,
//! #     P: oisflash::port::OutputPin,
//! #     W: oisflash::port::Power,
//! # {
//! let config = Config::default();
//! let firmware = FileFirmware::from_config(&config);
//! let session = Session::new(bus, clock, reset, boot, config)?;
//!
//! let mut reconciler = Reconciler::new(session, power, firmware);
//! let report = reconciler.check_and_update(b"CAL01234", false);
//! print!("{}", report.fw_full);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootloader;
pub mod config;
pub mod device;
pub mod error;
pub mod flasher;
pub mod image;
pub mod port;
pub mod protocol;
pub mod reconcile;
pub mod status;
pub mod target;
pub mod transport;
pub mod version;

#[cfg(test)]
mod sim;

// Re-exports for convenience
pub use {
    bootloader::{Bootloader, DeviceIdentity, Session, SessionState},
    config::{Config, Timing},
    device::{DualCalData, FirmwareStatus, Registers},
    error::{AddressError, Error, ErrorKind, Result, VersionError},
    flasher::{FlashProgrammer, FlashReport},
    image::{FileFirmware, FirmwareImage, FirmwareSource},
    reconcile::{Outcome, Reconciler, UpdateReport, UpdateSession},
    target::{EraseRange, FlashGeometry},
    version::VersionRecord,
};
