//! Boot-time firmware reconciliation.
//!
//! [`Reconciler::check_and_update`] powers the module, asks the running
//! firmware for its health and version, compares it with the image shipped
//! on the phone and runs a [`FlashProgrammer`] when they disagree. Failed
//! updates are retried with a fresh power cycle. Nothing here returns an
//! error: the result is an [`UpdateReport`] plus the status lines that other
//! subsystems publish.

use {
    crate::{
        bootloader::Session,
        device::DualCalData,
        error::{Error, ErrorKind, Result},
        flasher::FlashProgrammer,
        image::{FirmwareImage, FirmwareSource, read_version_tag},
        port::{Bus, Clock, OutputPin, Power},
        status,
        version::{LEGACY_PREFIX, VERSION_LEN, VersionRecord},
    },
    log::{debug, error, info, warn},
};

/// Result of one reconciliation attempt.
#[derive(Debug)]
pub enum Outcome {
    /// The module runs the expected firmware, or there is nothing to do.
    Success,
    /// The attempt failed in a way a power cycle may fix.
    RetryableFailure(Error),
    /// Retrying cannot help.
    FatalFailure(Error),
}

impl Outcome {
    fn from_error(e: Error) -> Self {
        match e.kind() {
            ErrorKind::OutOfMemory | ErrorKind::Image | ErrorKind::Io | ErrorKind::Config => {
                Self::FatalFailure(e)
            },
            _ => Self::RetryableFailure(e),
        }
    }
}

/// Bookkeeping for one [`Reconciler::check_and_update`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    /// Update regardless of the version comparison. Once set it stays set
    /// for the remaining attempts.
    pub force_update: bool,
    /// Attempts left after the current one.
    pub retries_remaining: u32,
    /// Category of the most recent failure.
    pub last_error: Option<ErrorKind>,
}

impl UpdateSession {
    /// Start with `retries` attempts in reserve.
    pub fn new(force_update: bool, retries: u32) -> Self {
        Self {
            force_update,
            retries_remaining: retries,
            last_error: None,
        }
    }

    /// Record a failure; returns whether another attempt is allowed.
    pub fn record_failure(&mut self, e: &Error) -> bool {
        self.last_error = Some(e.kind());
        if self.retries_remaining == 0 {
            return false;
        }
        self.retries_remaining -= 1;
        true
    }
}

/// What the module looked like during the last attempt.
#[derive(Debug, Clone, Default)]
struct Observed {
    module: Option<VersionRecord>,
    module_missing: bool,
    phone: Option<VersionRecord>,
    firmware_unreadable: bool,
    updated: bool,
}

/// Summary of [`Reconciler::check_and_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// Whether the module ended up in a consistent state.
    pub succeeded: bool,
    /// Whether new firmware was written and verified.
    pub updated: bool,
    /// Attempts made.
    pub attempts: u32,
    /// Module version as last read.
    pub module: Option<VersionRecord>,
    /// Version of the firmware image on the phone.
    pub phone: Option<VersionRecord>,
    /// Whether the calibration version passed the alphanumeric check.
    pub cal_valid: bool,
    /// Firmware status could not be read at the end of the last attempt.
    pub firmware_unreadable: bool,
    /// Category of the last failure, if any attempt failed.
    pub last_error: Option<ErrorKind>,
    /// `"{module} {phone}\n"` status line.
    pub fw_full: String,
}

/// Owns the update session, the power rail and the firmware source.
pub struct Reconciler<B, C, P, W, F> {
    session: Session<B, C, P>,
    power: W,
    firmware: F,
    module: Option<VersionRecord>,
    phone: Option<VersionRecord>,
    cal: Option<String>,
}

impl<B, C, P, W, F> Reconciler<B, C, P, W, F>
where
    B: Bus,
    C: Clock,
    P: OutputPin,
    W: Power,
    F: FirmwareSource,
{
    /// Build a reconciler around an idle session.
    pub fn new(session: Session<B, C, P>, power: W, firmware: F) -> Self {
        Self {
            session,
            power,
            firmware,
            module: None,
            phone: None,
            cal: None,
        }
    }

    /// The underlying session.
    pub fn session(&self) -> &Session<B, C, P> {
        &self.session
    }

    /// The underlying session, for register access.
    pub fn session_mut(&mut self) -> &mut Session<B, C, P> {
        &mut self.session
    }

    /// The power rail.
    pub fn power_mut(&mut self) -> &mut W {
        &mut self.power
    }

    /// Give back the owned collaborators.
    pub fn into_parts(self) -> (Session<B, C, P>, W, F) {
        (self.session, self.power, self.firmware)
    }

    /// Bring the module firmware in line with the image on the phone.
    ///
    /// `cal_version` is the calibration version from the module EEPROM; a
    /// corrupt one only changes the reported module version. `force`
    /// requests an update even when the versions agree.
    pub fn check_and_update(&mut self, cal_version: &[u8], force: bool) -> UpdateReport {
        let cal_valid = VersionRecord::parse(cal_version).is_ok();
        if !cal_valid {
            warn!("Calibration version {cal_version:02X?} is not valid");
        }
        self.cal = cal_version
            .first()
            .filter(|&&b| b != 0)
            .map(|_| {
                let len = cal_version.len().min(VERSION_LEN);
                String::from_utf8_lossy(&cal_version[..len]).into_owned()
            });

        let retries = self
            .session
            .config()
            .max_update_retries;
        let mut update = UpdateSession::new(force, retries);
        let mut seen = Observed::default();
        let mut attempts = 0;

        let succeeded = loop {
            attempts += 1;
            match self.attempt(&mut update, &mut seen) {
                Outcome::Success => break true,
                Outcome::RetryableFailure(e) => {
                    if !update.record_failure(&e) {
                        error!("OIS firmware update failed after {attempts} attempts: {e}");
                        break false;
                    }
                    warn!(
                        "OIS firmware update failed, retrying ({} left): {e}",
                        update.retries_remaining
                    );
                },
                Outcome::FatalFailure(e) => {
                    update.record_failure(&e);
                    error!("OIS firmware update aborted: {e}");
                    break false;
                },
            }
        };

        let module_text = if seen.firmware_unreadable {
            status::NG_FIRMWARE.to_string()
        } else if !cal_valid {
            status::NG_CALIBRATION.to_string()
        } else {
            seen
                .module
                .map_or_else(|| status::NULL_MARKER.to_string(), |m| m.to_string())
        };
        let phone_text = seen
            .phone
            .filter(|_| !seen.module_missing)
            .map(|p| p.to_string());
        let fw_full = status::fw_full_line(&module_text, phone_text.as_deref());
        info!(
            "OIS version: module {module_text}, phone {}",
            phone_text
                .as_deref()
                .unwrap_or(status::NULL_MARKER)
        );

        self.module = seen.module;
        self.phone = seen.phone;

        UpdateReport {
            succeeded,
            updated: seen.updated,
            attempts,
            module: seen.module,
            phone: seen.phone,
            cal_valid,
            firmware_unreadable: seen.firmware_unreadable,
            last_error: update.last_error,
            fw_full,
        }
    }

    /// One power cycle: read the module, decide, maybe update, then power down.
    fn attempt(&mut self, update: &mut UpdateSession, seen: &mut Observed) -> Outcome {
        if let Err(e) = self
            .power
            .power_up()
        {
            return Outcome::FatalFailure(Error::Link(e));
        }
        let settle = self
            .session
            .config()
            .timing
            .power_up_settle_ms;
        self.session
            .delay_ms(settle);

        let outcome = self.decide_and_update(update, seen);

        seen.firmware_unreadable = self
            .session
            .registers()
            .fw_status()
            .is_err();
        if let Err(e) = self
            .power
            .power_down()
        {
            warn!("OIS power down failed: {e}");
        }
        outcome
    }

    fn decide_and_update(&mut self, update: &mut UpdateSession, seen: &mut Observed) -> Outcome {
        let config = self
            .session
            .config()
            .clone();
        let mut nack = false;

        let mut regs = self
            .session
            .registers();
        if let Err(e) = regs.wait_idle(config.idle_retries) {
            warn!("OIS not idle, firmware may be broken: {e}");
            update.force_update = true;
            nack = true;
        }
        match regs.fw_status() {
            Ok(fw) if fw.update_interrupted() => {
                warn!("Previous update did not complete, forcing update");
                update.force_update = true;
            },
            Ok(_) => {},
            Err(e) => {
                warn!("Firmware status unreadable, forcing update: {e}");
                update.force_update = true;
                nack = true;
            },
        }

        seen.module = None;
        seen.module_missing = false;
        match regs.module_version() {
            Ok(raw) => match VersionRecord::parse(&raw) {
                Ok(version) => seen.module = Some(version),
                Err(e) => {
                    warn!("Module version {raw:02X?} is corrupt: {e}");
                    seen.module_missing = true;
                },
            },
            Err(e) => {
                warn!("Module version unreadable: {e}");
                seen.module_missing = true;
                nack = true;
            },
        }

        let phone = read_version_tag(&mut self.firmware, &config);
        seen.phone = match &phone {
            Ok(version) => Some(*version),
            Err(e) => {
                warn!("No usable OIS firmware on the phone: {e}");
                None
            },
        };
        info!(
            "OIS version: phone {:?}, module {:?}",
            seen
                .phone
                .map(|v| v.to_string()),
            seen
                .module
                .map(|v| v.to_string())
        );

        if let Some(module) = seen.module.filter(|m| m.is_dev_core()) {
            info!("Development module (core {})", char::from(module.as_bytes()[0]));
        }

        if let Some(p) = seen.phone {
            if p.hw_prefix() == LEGACY_PREFIX && seen.module.is_none_or(|m| !m.same_hw(&p)) {
                info!("Module predates the {p} rule set, forcing update");
                update.force_update = true;
            }
        }

        let newer = matches!(
            (seen.phone, seen.module),
            (Some(p), Some(m)) if p.same_hw(&m) && p > m
        );
        if !(nack || update.force_update || newer) {
            debug!("OIS firmware up to date");
            return Outcome::Success;
        }

        let phone = match phone {
            Ok(version) => version,
            Err(e) => return Outcome::FatalFailure(e),
        };
        info!(
            "Updating OIS firmware to {phone} (force {}, nack {nack})",
            update.force_update
        );

        let image = match FirmwareImage::load(&mut self.firmware, &config) {
            Ok(image) => image,
            Err(e) => return Outcome::from_error(e),
        };

        match FlashProgrammer::new(&mut self.session).run(image, update.force_update) {
            Ok(report) => {
                info!("OIS firmware update succeeded");
                seen.module = Some(report.version);
                seen.module_missing = false;
                seen.updated = true;
                Outcome::Success
            },
            Err(e) => Outcome::from_error(e),
        }
    }

    /// `"{module} {phone}\n"` from the last reconciliation.
    pub fn fw_full(&self) -> String {
        let module = self
            .module
            .map_or_else(|| status::NULL_MARKER.to_string(), |m| m.to_string());
        status::fw_full_line(
            &module,
            self.phone
                .map(|p| p.to_string())
                .as_deref(),
        )
    }

    /// EXIF debug line for the current operating `mode`.
    ///
    /// Reads the error and status registers; unreadable registers show as
    /// zero.
    pub fn debug_info(&mut self, mode: u16) -> String {
        let mut regs = self
            .session
            .registers();
        let error_flags = regs
            .error_flags()
            .unwrap_or_else(|e| {
                warn!("OIS error register unreadable: {e}");
                0
            });
        let status_reg = regs
            .status()
            .unwrap_or_else(|e| {
                warn!("OIS status register unreadable: {e}");
                0
            });

        let module = self
            .module
            .map(|m| m.to_string());
        let phone = self
            .phone
            .map(|p| p.to_string());
        let line = status::debug_line(
            module.as_deref(),
            phone.as_deref(),
            self.cal.as_deref(),
            error_flags,
            status_reg,
            mode,
        );
        debug!("OIS debug info {}", line.trim_end());
        line
    }

    /// Write calibration blocks to the running firmware.
    pub fn write_cal_data(&mut self, cal: &DualCalData<'_>) -> Result<()> {
        self.session
            .registers()
            .write_cal_data(cal)
    }

    /// Core, gyro and driver-IC versions of the calibration.
    pub fn read_manual_cal_info(&mut self) -> Result<[u8; 3]> {
        self.session
            .registers()
            .read_manual_cal_info()
    }
}
