//! Register interface of the OIS application firmware.
//!
//! Registers use a 16-bit big-endian address. A write is one bus
//! transaction `[addr_hi, addr_lo, data...]`; a read sends the address and
//! then receives the requested number of bytes. Multi-byte registers are
//! big-endian unless noted.

use {
    crate::{
        config::{Config, ms},
        error::{Error, Result},
        port::{Bus, Clock},
        transport::Transport,
    },
    log::{debug, info, warn},
};

/// Register addresses.
pub mod regs {
    /// OIS status; [`super::STATUS_IDLE`] when ready.
    pub const STATUS: u16 = 0x0001;
    /// Commit clock and I2C settings to the data section.
    pub const DATA_SECTION: u16 = 0x0003;
    /// OIS error flags (16-bit).
    pub const ERROR: u16 = 0x0004;
    /// Program-code update error status (16-bit, zero on success).
    pub const UPDATE_ERROR: u16 = 0x0006;
    /// Update checksum handshake (4 bytes).
    pub const UPDATE_CHECKSUM: u16 = 0x0008;
    /// Program-code update mode.
    pub const PROGRAM_MODE: u16 = 0x000C;
    /// Data flash control.
    pub const FLASH_CTRL: u16 = 0x000D;
    /// Data flash command.
    pub const FLASH_CMD: u16 = 0x000E;
    /// Vendor half of the module version (4 bytes).
    pub const VERSION_VENDOR: u16 = 0x007C;
    /// Hardware half of the module version (4 bytes).
    pub const VERSION_HW: u16 = 0x00F8;
    /// Firmware status word (4 bytes, little-endian).
    pub const FW_STATUS: u16 = 0x00FC;
    /// Manual calibration info request (20 bytes).
    pub const CAL_INFO_REQUEST: u16 = 0x0100;
    /// Manual calibration info result: core, gyro, driver IC.
    pub const CAL_INFO: u16 = 0x0118;
    /// Gyro orientation block.
    pub const GYRO_ORIENT_X: u16 = 0x0240;
    /// Gyro orientation block.
    pub const GYRO_ORIENT_Y: u16 = 0x0241;
    /// Gyro sensor selection.
    pub const GYRO_SELECT: u16 = 0x0242;
    /// Wide module gain calibration.
    pub const WIDE_GAIN: u16 = 0x0254;
    /// Wide/tele center shift.
    pub const CENTER_SHIFT: u16 = 0x0442;
    /// Tele gyro orientation.
    pub const TELE_ORIENT_X: u16 = 0x0552;
    /// Tele gyro orientation.
    pub const TELE_ORIENT_Y: u16 = 0x0553;
    /// Tele module gain calibration.
    pub const TELE_GAIN: u16 = 0x0554;
    /// External clock frequency in Hz (4 bytes, little-endian).
    pub const EXT_CLOCK: u16 = 0x03F0;
    /// PLL multiplier.
    pub const PLL_MULTIPLY: u16 = 0x03F4;
    /// PLL divider.
    pub const PLL_DIVIDE: u16 = 0x03F5;
}

/// STATUS value of an idle module.
pub const STATUS_IDLE: u8 = 0x01;

/// PROGRAM_MODE value that arms a program-code update.
pub const PROGRAM_MODE_ENTER: u8 = 0xB5;

/// FLASH_CMD value that resets the MCU.
pub const FLASH_CMD_RESET: u8 = 0x06;

/// FW_STATUS value left behind by an interrupted update.
pub const FW_UPDATE_INTERRUPTED: u32 = 4451;

/// Request that makes the firmware publish its calibration info.
pub const CAL_INFO_QUERY: [u8; 20] = [
    0x21, 0x43, 0x65, 0x87, 0x23, 0x01, 0xEF, 0xCD, 0x00, 0x74, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x00, 0x00,
];

/// Supported external clocks and their PLL multiplier/divider.
pub const EXT_CLOCK_TABLE: [(u32, u8, u8); 5] = [
    (12_000_000, 0x08, 0x03),
    (17_000_000, 0x09, 0x05),
    (19_200_000, 0x05, 0x03),
    (24_000_000, 0x04, 0x03),
    (26_000_000, 0x06, 0x05),
];

/// PLL multiplier and divider for `hz`.
pub fn pll_settings(hz: u32) -> Option<(u8, u8)> {
    EXT_CLOCK_TABLE
        .iter()
        .find(|(clock, _, _)| *clock == hz)
        .map(|&(_, multiply, divide)| (multiply, divide))
}

/// Firmware status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareStatus(pub u32);

impl FirmwareStatus {
    /// Whether the previous update was interrupted.
    pub fn update_interrupted(self) -> bool {
        self.0 == FW_UPDATE_INTERRUPTED
    }
}

/// Calibration blocks written into the firmware at init.
///
/// The buffers belong to the camera module layer and only need to live for
/// the duration of one [`Registers::write_cal_data`] call.
#[derive(Debug, Clone, Copy)]
pub struct DualCalData<'a> {
    /// Wide module X/Y gyro gain.
    pub wide: &'a [u8],
    /// Tele module X/Y gyro gain.
    pub tele: &'a [u8],
    /// Center shift between wide and tele.
    pub center_shift: &'a [u8],
}

/// Register access to the application firmware, borrowed from a session.
pub struct Registers<'a, B, C> {
    transport: &'a mut Transport<B, C>,
    config: &'a Config,
}

impl<'a, B: Bus, C: Clock> Registers<'a, B, C> {
    pub(crate) fn new(transport: &'a mut Transport<B, C>, config: &'a Config) -> Self {
        transport.set_address(config.app_address);
        Self { transport, config }
    }

    /// Write `data` starting at `reg`.
    pub fn write(&mut self, reg: u16, data: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(data.len() + 2);
        frame.extend_from_slice(&reg.to_be_bytes());
        frame.extend_from_slice(data);
        self.transport
            .send(&frame)
            .map(|_| ())
    }

    /// Write one byte.
    pub fn write_u8(&mut self, reg: u16, value: u8) -> Result<()> {
        self.write(reg, &[value])
    }

    /// Read `buf.len()` bytes starting at `reg`.
    pub fn read(&mut self, reg: u16, buf: &mut [u8]) -> Result<()> {
        self.transport
            .send(&reg.to_be_bytes())?;
        self.transport
            .receive(buf)
            .map(|_| ())
    }

    /// Read one byte.
    pub fn read_u8(&mut self, reg: u16) -> Result<u8> {
        let mut value = [0u8; 1];
        self.read(reg, &mut value)?;
        Ok(value[0])
    }

    /// Read a big-endian 16-bit register.
    pub fn read_u16(&mut self, reg: u16) -> Result<u16> {
        let mut value = [0u8; 2];
        self.read(reg, &mut value)?;
        Ok(u16::from_be_bytes(value))
    }

    /// Read a little-endian 32-bit register.
    pub fn read_u32_le(&mut self, reg: u16) -> Result<u32> {
        let mut value = [0u8; 4];
        self.read(reg, &mut value)?;
        Ok(u32::from_le_bytes(value))
    }

    fn sleep_ms(&mut self, value: u32) {
        self.transport
            .delay(ms(value));
    }

    /// Poll STATUS until the module reports idle.
    ///
    /// Gives up after `retries` extra polls. Reports [`Error::Link`] if the
    /// last poll failed on the bus, [`Error::Busy`] if the module answered
    /// but never went idle.
    pub fn wait_idle(&mut self, retries: u32) -> Result<()> {
        let mut remaining = retries;
        loop {
            let status = self.read_u8(regs::STATUS);
            if matches!(status, Ok(STATUS_IDLE)) {
                return Ok(());
            }
            if remaining == 0 {
                return match status {
                    Err(e) => {
                        warn!("OIS status unreadable: {e}");
                        Err(e)
                    },
                    Ok(value) => {
                        warn!("OIS not idle, status {value:#04x}");
                        Err(Error::Busy)
                    },
                };
            }
            remaining -= 1;
            self.sleep_ms(self.config.timing.idle_poll_ms);
        }
    }

    /// Read the firmware status word.
    pub fn fw_status(&mut self) -> Result<FirmwareStatus> {
        let status = FirmwareStatus(self.read_u32_le(regs::FW_STATUS)?);
        if status.update_interrupted() {
            warn!("Firmware status {}: previous update was interrupted", status.0);
        }
        Ok(status)
    }

    /// Read the raw eight version bytes: hardware half then vendor half.
    pub fn module_version(&mut self) -> Result<[u8; 8]> {
        let mut version = [0u8; 8];
        let (hw, vendor) = version.split_at_mut(4);
        for (reg, half) in [(regs::VERSION_HW, hw), (regs::VERSION_VENDOR, vendor)] {
            for (i, pair) in half
                .chunks_exact_mut(2)
                .enumerate()
            {
                #[allow(clippy::cast_possible_truncation)] // i < 2
                let word = self.read_u16(reg + 2 * i as u16)?;
                pair.copy_from_slice(&word.to_be_bytes());
            }
        }
        Ok(version)
    }

    /// Arm the firmware for a program-code update.
    pub fn enter_program_mode(&mut self) -> Result<()> {
        debug!("Entering program-code update mode");
        self.write_u8(regs::PROGRAM_MODE, PROGRAM_MODE_ENTER)?;
        self.sleep_ms(self.config.timing.program_mode_settle_ms);
        Ok(())
    }

    /// Hand the image checksum to the firmware's update handshake and wait
    /// for its self-reset.
    pub fn write_update_checksum(&mut self, checksum: u16) -> Result<()> {
        let [lo, hi] = checksum.to_le_bytes();
        debug!("Writing update checksum {checksum:#06x}");
        self.write(regs::UPDATE_CHECKSUM, &[lo, hi, 0x00, 0x80])?;
        self.sleep_ms(self.config.timing.checksum_settle_ms);
        Ok(())
    }

    /// Program-code update error status; zero on success.
    pub fn update_error(&mut self) -> Result<u16> {
        self.read_u16(regs::UPDATE_ERROR)
    }

    /// OIS error flags.
    pub fn error_flags(&mut self) -> Result<u16> {
        self.read_u16(regs::ERROR)
    }

    /// OIS status byte.
    pub fn status(&mut self) -> Result<u8> {
        self.read_u8(regs::STATUS)
    }

    /// Software reset, then wait for the firmware to restart.
    pub fn sw_reset(&mut self) -> Result<()> {
        debug!("Software reset");
        self.write_u8(regs::FLASH_CTRL, 0x01)?;
        self.write_u8(regs::FLASH_CMD, FLASH_CMD_RESET)?;
        self.sleep_ms(self.config.timing.sw_reset_settle_ms);
        Ok(())
    }

    /// Make sure the firmware runs from the configured external clock.
    ///
    /// Returns whether the clock settings were rewritten.
    pub fn check_ext_clock(&mut self) -> Result<bool> {
        self.wait_idle(20)?;
        let wanted = self.config.ext_clock_hz;
        let current = self.read_u32_le(regs::EXT_CLOCK)?;
        if current == wanted {
            debug!("Keeping external clock {current} Hz");
            return Ok(false);
        }
        let (multiply, divide) = pll_settings(wanted)
            .ok_or_else(|| Error::Config(format!("unsupported external clock {wanted} Hz")))?;

        self.write(regs::EXT_CLOCK, &wanted.to_le_bytes())?;
        self.write_u8(regs::PLL_MULTIPLY, multiply)?;
        self.write_u8(regs::PLL_DIVIDE, divide)?;
        self.write_u8(regs::DATA_SECTION, 0x01)?;
        self.sleep_ms(self.config.timing.clock_commit_ms);
        self.sw_reset()?;

        info!("External clock {current} Hz -> {wanted} Hz");
        Ok(true)
    }

    /// Write the gain and center-shift calibration, then the fixed gyro
    /// orientation.
    ///
    /// Every write is attempted; the first failure is returned.
    pub fn write_cal_data(&mut self, cal: &DualCalData<'_>) -> Result<()> {
        let writes: [(u16, &[u8]); 8] = [
            (regs::WIDE_GAIN, cal.wide),
            (regs::TELE_GAIN, cal.tele),
            (regs::CENTER_SHIFT, cal.center_shift),
            (regs::GYRO_ORIENT_X, &[0x01]),
            (regs::GYRO_ORIENT_Y, &[0x01]),
            (regs::TELE_ORIENT_X, &[0x00]),
            (regs::TELE_ORIENT_Y, &[0x00]),
            (regs::GYRO_SELECT, &[0x20]),
        ];

        let mut first_error = None;
        for (reg, data) in writes {
            if data.is_empty() {
                continue;
            }
            if let Err(e) = self.write(reg, data) {
                warn!("Calibration write @ {reg:#06x} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Query the core, gyro and driver-IC versions of the calibration.
    pub fn read_manual_cal_info(&mut self) -> Result<[u8; 3]> {
        self.write(regs::CAL_INFO_REQUEST, &CAL_INFO_QUERY)?;
        self.sleep_ms(5);
        let mut info = [0u8; 3];
        self.read(regs::CAL_INFO, &mut info)?;
        info!(
            "Core version {:#04x}, gyro sensor {:#04x}, driver IC {:#04x}",
            info[0], info[1], info[2]
        );
        Ok(info)
    }
}
