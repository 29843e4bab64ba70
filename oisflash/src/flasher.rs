//! Full firmware update of the OIS MCU.
//!
//! The programmer takes a target that is running its application, moves it
//! into the system bootloader, rewrites the application region and hands the
//! result back to the application firmware, which checks the image checksum
//! and restarts.
//!
//! ## Example
//!
//! ```rust,no_run
//! use oisflash::{Config, FirmwareImage, FileFirmware, FlashProgrammer, Session};
//! # fn run<B: oisflash::port::Bus, C: oisflash::port::Clock, P: oisflash::port::OutputPin>(
//! #     bus: B, clock: C, reset: P, boot: P,
//! # ) -> oisflash::Result<()> {
//! let config = Config::default();
//! let image = FirmwareImage::load(&mut FileFirmware::from_config(&config), &config)?;
//! let mut session = Session::new(bus, clock, reset, boot, config)?;
//!
//! let report = FlashProgrammer::new(&mut session).run_with_progress(image, false, |done, total| {
//!     println!("{done}/{total}");
//! })?;
//! println!("module now runs {}", report.version);
//! # Ok(())
//! # }
//! ```

use {
    crate::{
        bootloader::{DeviceIdentity, Session},
        config::Config,
        error::{Error, Result},
        image::FirmwareImage,
        port::{Bus, Clock, OutputPin},
        target::{
            EraseRange,
            stm32g0::{ERASED_WORD, OPTION_GUARD_BIT},
        },
        version::{HW_PREFIX_LEN, VERSION_LEN, VersionRecord},
    },
    log::{debug, error, info, warn},
};

/// Read-modify-write attempts on the option bytes.
pub const OPTION_ATTEMPTS: u32 = 3;

/// What one successful update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    /// Identity read while validating the target.
    pub identity: DeviceIdentity,
    /// Whether flash was blank before programming.
    pub was_empty: bool,
    /// Pages erased; `None` for a blank part.
    pub erased: Option<EraseRange>,
    /// Image bytes written.
    pub bytes_written: usize,
    /// Error status reported by the firmware's checksum handshake, when
    /// readable.
    pub update_error: Option<u16>,
    /// Version the module reports after the update.
    pub version: VersionRecord,
}

/// Runs one complete update against a [`Session`].
pub struct FlashProgrammer<'s, B, C, P> {
    session: &'s mut Session<B, C, P>,
}

impl<'s, B: Bus, C: Clock, P: OutputPin> FlashProgrammer<'s, B, C, P> {
    /// Borrow `session` for one update.
    pub fn new(session: &'s mut Session<B, C, P>) -> Self {
        Self { session }
    }

    /// Run the update without progress reporting.
    pub fn run(&mut self, image: FirmwareImage, force: bool) -> Result<FlashReport> {
        self.run_with_progress(image, force, |_, _| {})
    }

    /// Program `image` and verify that the module reports its version.
    ///
    /// Unless `force` is set the module's external clock settings are
    /// checked first. Any failure after the bootloader was entered returns
    /// the target to its application before the error is reported.
    pub fn run_with_progress<F>(
        &mut self,
        image: FirmwareImage,
        force: bool,
        mut progress: F,
    ) -> Result<FlashReport>
    where
        F: FnMut(usize, usize),
    {
        let config = self
            .session
            .config()
            .clone();
        let phone = image.version(&config)?;
        info!(
            "Updating OIS firmware to {phone} ({} bytes, checksum {:#06x})",
            image.len(),
            image.checksum16()
        );

        if !force {
            self.session
                .registers()
                .check_ext_clock()?;
        }
        if let Err(e) = self
            .session
            .registers()
            .enter_program_mode()
        {
            warn!("Program mode request failed: {e}");
        }

        let identity = self
            .session
            .validate()?;

        if let Err(e) = self.reconcile_option_bytes() {
            warn!("Option bytes left as they are: {e}");
        }

        let was_empty = match self.flash_is_empty() {
            Ok(empty) => empty,
            Err(e) => return Err(self.abort(e)),
        };

        let flash_base = self
            .session
            .geometry()
            .flash_base;
        let erased = match self.prepare_flash(was_empty, flash_base, config.app_region_len) {
            Ok(range) => range,
            Err(e) => return Err(self.abort(e)),
        };

        if let Err(e) = self.program(flash_base, &image, &mut progress) {
            return Err(self.abort(e));
        }

        match self.read_programmed_tag(flash_base, &config) {
            Ok(tag) => info!(
                "Programmed hw {} vendor {}",
                String::from_utf8_lossy(&tag[..HW_PREFIX_LEN]),
                String::from_utf8_lossy(&tag[HW_PREFIX_LEN..])
            ),
            Err(e) => warn!("Could not read back the programmed version: {e}"),
        }

        if was_empty {
            if let Err(e) = self.clear_empty_check() {
                warn!("Empty-check clear failed, resetting instead: {e}");
                self.release();
            }
        } else {
            self.release();
        }

        let update_error = self.finish_on_app(image.checksum16());
        self.verify(phone)
            .map(|version| FlashReport {
                identity,
                was_empty,
                erased,
                bytes_written: image.len(),
                update_error,
                version,
            })
    }

    /// Disconnect after a failure and hand back the error.
    fn abort(&mut self, e: Error) -> Error {
        error!("Update aborted: {e}");
        self.release();
        e
    }

    fn release(&mut self) {
        if let Err(e) = self
            .session
            .disconnect()
        {
            warn!("Disconnect failed: {e}");
        }
    }

    /// Clear the option guard bit so the boot pin selects the boot source.
    ///
    /// An unreadable option word is treated as read protection and lifted
    /// with READ_UNPROTECT before the next attempt.
    fn reconcile_option_bytes(&mut self) -> Result<()> {
        let option_base = self
            .session
            .geometry()
            .option_byte_base;

        for attempt in 1..=OPTION_ATTEMPTS {
            let mut bl = self
                .session
                .bootloader()?;
            let word = match bl.read_u32(option_base) {
                Ok(word) => word,
                Err(e) => {
                    warn!("Option bytes unreadable (attempt {attempt}/{OPTION_ATTEMPTS}): {e}");
                    if let Err(e) = bl.read_unprotect() {
                        warn!("Read unprotect failed: {e}");
                    }
                    continue;
                },
            };

            if word & OPTION_GUARD_BIT == 0 {
                debug!("Option bytes {word:#010x}");
                return Ok(());
            }

            info!("Clearing option guard bit in {word:#010x}");
            if let Err(e) = bl.write_u32(option_base, word & !OPTION_GUARD_BIT) {
                warn!("Option byte write failed (attempt {attempt}/{OPTION_ATTEMPTS}): {e}");
                self.session
                    .delay_ms(1);
            }
        }

        Err(Error::Protocol(format!(
            "option guard bit still set after {OPTION_ATTEMPTS} attempts"
        )))
    }

    fn flash_is_empty(&mut self) -> Result<bool> {
        let flash_base = self
            .session
            .geometry()
            .flash_base;
        let word = self
            .session
            .bootloader()?
            .read_u32(flash_base)?;
        debug!("First flash word {word:#010x}");
        Ok(word == ERASED_WORD)
    }

    /// Enter the programming state, then erase the application region
    /// unless the flash is already blank.
    fn prepare_flash(&mut self, was_empty: bool, flash_base: u32, len: u32) -> Result<Option<EraseRange>> {
        self.session
            .begin_programming()?;
        if was_empty {
            info!("Flash is blank, skipping erase");
            return Ok(None);
        }
        self.session
            .bootloader()?
            .erase_region(flash_base, len)
            .map(Some)
    }

    fn program<F>(&mut self, flash_base: u32, image: &FirmwareImage, progress: &mut F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let chunk = self
            .session
            .config()
            .chunk_size;
        info!("Programming {} bytes @ {flash_base:#010x}", image.len());
        self.session
            .bootloader()?
            .program(flash_base, image.data(), chunk, |done, total| progress(done, total))?;
        info!("Programming done");
        Ok(())
    }

    fn read_programmed_tag(
        &mut self,
        flash_base: u32,
        config: &Config,
    ) -> Result<[u8; VERSION_LEN]> {
        let offset = |value: u64| {
            u32::try_from(value)
                .ok()
                .and_then(|v| flash_base.checked_add(v))
                .ok_or_else(|| Error::Config(format!("version offset {value:#x} out of range")))
        };
        let hw_address = offset(config.version_offset)?;
        let vendor_address = offset(config.vendor_info_offset)?;

        let mut tag = [0u8; VERSION_LEN];
        let (hw, vendor) = tag.split_at_mut(HW_PREFIX_LEN);
        let mut bl = self
            .session
            .bootloader()?;
        bl.read_memory(hw_address, hw)?;
        bl.read_memory(vendor_address, vendor)?;
        Ok(tag)
    }

    /// Rewrite the option word unchanged. The resulting option reload
    /// re-evaluates the blank-flash boot condition and starts the new
    /// application.
    fn clear_empty_check(&mut self) -> Result<()> {
        let option_base = self
            .session
            .geometry()
            .option_byte_base;
        let settle = self
            .session
            .config()
            .timing
            .empty_clear_settle_ms;

        let mut bl = self
            .session
            .bootloader()?;
        let word = bl.read_u32(option_base)?;
        bl.write_u32(option_base, word)?;

        self.session
            .delay_ms(settle);
        self.session
            .detach();
        Ok(())
    }

    /// Checksum handshake and software reset on the application side.
    fn finish_on_app(&mut self, checksum: u16) -> Option<u16> {
        let mut regs = self
            .session
            .registers();
        if let Err(e) = regs.write_update_checksum(checksum) {
            warn!("Checksum handshake write failed: {e}");
        }
        let update_error = match regs.update_error() {
            Ok(0) => {
                info!("Program code update accepted");
                Some(0)
            },
            Ok(status) => {
                error!("Program code update rejected, status {status:#06x}");
                Some(status)
            },
            Err(e) => {
                warn!("Update status unreadable: {e}");
                None
            },
        };
        if let Err(e) = regs.sw_reset() {
            warn!("Software reset failed: {e}");
        }
        update_error
    }

    fn verify(&mut self, phone: VersionRecord) -> Result<VersionRecord> {
        let module = self
            .session
            .registers()
            .module_version()?;
        if module != *phone.as_bytes() {
            let module = String::from_utf8_lossy(&module).into_owned();
            error!("Module reports {module} after update, expected {phone}");
            return Err(Error::VerifyMismatch {
                phone: phone.to_string(),
                module,
            });
        }
        info!("OIS firmware {phone} verified");
        Ok(phone)
    }
}
