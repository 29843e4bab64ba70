//! Simulated OIS module for tests.
//!
//! [`SimMcu`] models an STM32G0 behind one I2C bus: the ROM bootloader
//! answers at `0x51`, the application firmware exposes its register file at
//! `0xA2`. Which of the two is alive depends on the reset and boot pins, the
//! option bytes and the blank-flash boot condition, the same way the part
//! decides after a reset. All handles share one state, and the clock is
//! virtual so timing assertions are exact.

use {
    crate::{
        device::{CAL_INFO_QUERY, FLASH_CMD_RESET, FW_UPDATE_INTERRUPTED, PROGRAM_MODE_ENTER, regs},
        port::{Bus, Clock, OutputPin, Power},
        protocol::{
            ACK, BUSY, NACK, checksum16,
            sysboot::{Command, SYNC},
        },
        target::stm32g0::{ERASED_WORD, GEOMETRY, OPTION_GUARD_BIT, PAGE_SIZE, PRODUCT_ID},
    },
    std::{cell::RefCell, collections::VecDeque, io, rc::Rc, time::Duration},
};

const BOOT_ADDR: u8 = 0x51;
const APP_ADDR: u8 = 0xA2;
const FLASH_SIZE: usize = 64 * 1024;
const BOOTLOADER_VERSION: u8 = 0x12;
const SUPPORTED: [u8; 11] = [0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92];
const FACTORY_OPTIONS: u32 = 0xDFFF_E1AA;
const HW_TAG: usize = 0x80F8;
const VENDOR_TAG: usize = 0x807C;
const IMAGE_LEN: usize = 0x8100;
const CAL_INFO: [u8; 3] = [0x31, 0x41, 0x42];

/// Image of [`IMAGE_LEN`] bytes carrying `tag` at the version offsets.
pub fn firmware_image(tag: &[u8; 8]) -> Vec<u8> {
    let mut image: Vec<u8> = (0..IMAGE_LEN)
        .map(|i| (i.wrapping_mul(31) + 7) as u8)
        .collect();
    image[HW_TAG..HW_TAG + 4].copy_from_slice(&tag[..4]);
    image[VENDOR_TAG..VENDOR_TAG + 4].copy_from_slice(&tag[4..]);
    image
}

/// Pin change or SYNC, in the order the target saw them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinEvent {
    /// NRST asserted (`true`) or released.
    Reset(bool),
    /// BOOT0 asserted (`true`) or released.
    Boot(bool),
    /// SYNC byte accepted by the bootloader.
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Off,
    Reset,
    App,
    Bootloader,
}

/// Takes effect once the host has read the last pending response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterAck {
    OptionReload,
    Jump,
}

#[derive(Debug, Clone, Copy)]
enum Expect {
    Command,
    ReadAddress,
    WriteAddress,
    GoAddress,
    ReadLength(u32),
    WriteData(u32),
    EraseCount,
    ErasePages(usize),
}

struct State {
    now: Duration,
    powered: bool,
    mode: Mode,
    reset_held: bool,
    boot_high: bool,
    empty_flag: bool,
    flash: Vec<u8>,
    written_extent: usize,
    option_word: u32,
    read_protected: bool,
    product_id: u16,
    silent: bool,
    expect: Expect,
    responses: VecDeque<u8>,
    after_ack: Option<AfterAck>,
    nack_writes: u32,
    regs: Vec<u8>,
    reg_pointer: u16,
    app_hung: bool,
    app_busy: bool,
    version_garbled: bool,
    reported_version: Option<[u8; 8]>,
    busy_polls: u32,
    stalled: bool,
    events: Vec<PinEvent>,
    boot_frames: u32,
    register_writes: u32,
    sw_resets: u32,
    power_cycles: u32,
}

fn link_down(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, what.to_string())
}

fn xor(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0, |acc, b| acc ^ b)
}

impl State {
    fn new() -> Self {
        let mut file = vec![0u8; 0x10000];
        file[usize::from(regs::STATUS)] = 0x01;
        let clock = usize::from(regs::EXT_CLOCK);
        file[clock..clock + 4].copy_from_slice(&24_000_000u32.to_le_bytes());
        Self {
            now: Duration::ZERO,
            powered: true,
            mode: Mode::Bootloader,
            reset_held: false,
            boot_high: false,
            empty_flag: true,
            flash: vec![0xFF; FLASH_SIZE],
            written_extent: 0,
            option_word: FACTORY_OPTIONS,
            read_protected: false,
            product_id: PRODUCT_ID,
            silent: false,
            expect: Expect::Command,
            responses: VecDeque::new(),
            after_ack: None,
            nack_writes: 0,
            regs: file,
            reg_pointer: 0,
            app_hung: false,
            app_busy: false,
            version_garbled: false,
            reported_version: None,
            busy_polls: 0,
            stalled: false,
            events: Vec::new(),
            boot_frames: 0,
            register_writes: 0,
            sw_resets: 0,
            power_cycles: 0,
        }
    }

    fn flash_offset(address: u32, len: usize) -> Option<usize> {
        let offset = usize::try_from(address.checked_sub(GEOMETRY.flash_base)?).ok()?;
        (offset + len <= FLASH_SIZE).then_some(offset)
    }

    fn first_word(&self) -> u32 {
        u32::from_le_bytes([self.flash[0], self.flash[1], self.flash[2], self.flash[3]])
    }

    fn app_alive(&self) -> bool {
        self.powered && self.mode == Mode::App && !self.app_hung && self.first_word() != ERASED_WORD
    }

    fn bootloader_up(&self) -> bool {
        self.powered && self.mode == Mode::Bootloader && !self.silent
    }

    /// Boot source selection at reset release.
    fn boot(&mut self) {
        let pin_selects = self.boot_high && self.option_word & OPTION_GUARD_BIT == 0;
        self.mode = if pin_selects || self.empty_flag {
            Mode::Bootloader
        } else {
            Mode::App
        };
        self.expect = Expect::Command;
        self.after_ack = None;
        self.responses
            .clear();
        if self.mode == Mode::App {
            self.app_start();
        }
    }

    /// Option byte loading: latches the blank-flash flag and resets.
    fn option_reload(&mut self) {
        self.empty_flag = self.first_word() == ERASED_WORD;
        if !self.reset_held {
            self.boot();
        }
    }

    fn app_start(&mut self) {
        let (hw, vendor) = (usize::from(regs::VERSION_HW), usize::from(regs::VERSION_VENDOR));
        let tag: Vec<u8> = self.flash[HW_TAG..HW_TAG + 4]
            .iter()
            .chain(&self.flash[VENDOR_TAG..VENDOR_TAG + 4])
            .copied()
            .collect();
        self.regs[hw..hw + 4].copy_from_slice(&tag[..4]);
        self.regs[vendor..vendor + 4].copy_from_slice(&tag[4..]);
        self.regs[usize::from(regs::STATUS)] = 0x01;
    }

    fn read_reg(&self, reg: usize) -> u8 {
        if self.app_busy && reg == usize::from(regs::STATUS) {
            return 0x13;
        }
        let vendor = usize::from(regs::VERSION_VENDOR);
        if self.version_garbled && (vendor..vendor + 4).contains(&reg) {
            return 0x00;
        }
        if let Some(version) = self.reported_version {
            for (base, half) in [(regs::VERSION_HW, 0), (regs::VERSION_VENDOR, 4)] {
                let base = usize::from(base);
                if (base..base + 4).contains(&reg) {
                    return version[half + reg - base];
                }
            }
        }
        self.regs[reg]
    }

    fn set_fw_status(&mut self, value: u32) {
        let at = usize::from(regs::FW_STATUS);
        self.regs[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn app_write(&mut self, reg: u16, data: &[u8]) -> io::Result<()> {
        let start = usize::from(reg);
        let end = start + data.len();
        if end > self.regs.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "register out of range"));
        }
        self.register_writes += 1;
        self.regs[start..end].copy_from_slice(data);

        match (reg, data) {
            (regs::PROGRAM_MODE, [PROGRAM_MODE_ENTER]) => self.set_fw_status(FW_UPDATE_INTERRUPTED),
            (regs::FLASH_CMD, [FLASH_CMD_RESET]) if self.regs[usize::from(regs::FLASH_CTRL)] == 1 => {
                self.sw_resets += 1;
                self.app_start();
            },
            (regs::UPDATE_CHECKSUM, [lo, hi, 0x00, 0x80]) => {
                let expected = u16::from_le_bytes([*lo, *hi]);
                let ok = checksum16(&self.flash[..self.written_extent]) == expected;
                let at = usize::from(regs::UPDATE_ERROR);
                self.regs[at..at + 2].copy_from_slice(&u16::from(!ok).to_be_bytes());
                if ok {
                    self.set_fw_status(0);
                }
                self.app_start();
            },
            (regs::CAL_INFO_REQUEST, query) if query == CAL_INFO_QUERY => {
                let at = usize::from(regs::CAL_INFO);
                self.regs[at..at + 3].copy_from_slice(&CAL_INFO);
            },
            _ => {},
        }
        Ok(())
    }

    fn ack(&mut self) {
        self.responses
            .push_back(ACK);
    }

    fn nack(&mut self) {
        self.responses
            .push_back(NACK);
    }

    fn erase_page(&mut self, page: usize) {
        let size = PAGE_SIZE as usize;
        self.flash[page * size..(page + 1) * size].fill(0xFF);
        if page == 0 {
            self.written_extent = 0;
        }
        self.clear_app_faults();
    }

    fn clear_app_faults(&mut self) {
        self.app_hung = false;
        self.app_busy = false;
        self.version_garbled = false;
    }

    fn read_mem(&self, address: u32, len: usize) -> Option<Vec<u8>> {
        if let Some(offset) = Self::flash_offset(address, len) {
            return Some(self.flash[offset..offset + len].to_vec());
        }
        (address == GEOMETRY.option_byte_base && len <= 4)
            .then(|| self.option_word.to_le_bytes()[..len].to_vec())
    }

    fn write_mem(&mut self, address: u32, data: &[u8]) -> bool {
        if let Some(offset) = Self::flash_offset(address, data.len()) {
            self.flash[offset..offset + data.len()].copy_from_slice(data);
            self.written_extent = self
                .written_extent
                .max(offset + data.len());
            return true;
        }
        if let (true, Ok(word)) = (address == GEOMETRY.option_byte_base, <[u8; 4]>::try_from(data)) {
            self.option_word = u32::from_le_bytes(word);
            self.after_ack = Some(AfterAck::OptionReload);
            return true;
        }
        false
    }

    fn boot_frame(&mut self, frame: &[u8]) {
        match std::mem::replace(&mut self.expect, Expect::Command) {
            Expect::Command => self.boot_command(frame),
            Expect::ReadAddress | Expect::WriteAddress | Expect::GoAddress
                if frame.len() != 5 || xor(&frame[..4]) != frame[4] =>
            {
                self.nack();
            },
            Expect::ReadAddress => {
                self.ack();
                self.expect = Expect::ReadLength(u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]));
            },
            Expect::WriteAddress => {
                self.ack();
                self.expect = Expect::WriteData(u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]));
            },
            Expect::GoAddress => {
                self.ack();
                self.after_ack = Some(AfterAck::Jump);
            },
            Expect::ReadLength(address) => match frame {
                [n, c] if n ^ c == 0xFF => match self.read_mem(address, usize::from(*n) + 1) {
                    Some(data) => {
                        self.ack();
                        self.responses
                            .extend(data);
                    },
                    None => self.nack(),
                },
                _ => self.nack(),
            },
            Expect::WriteData(address) => {
                let Some((&sum, body)) = frame.split_last() else {
                    self.nack();
                    return;
                };
                let valid = body.len() >= 2 && usize::from(body[0]) + 2 == body.len() && xor(body) == sum;
                if !valid {
                    self.nack();
                } else if self.nack_writes > 0 {
                    self.nack_writes -= 1;
                    self.nack();
                } else if self.write_mem(address, &body[1..]) {
                    self.ack();
                } else {
                    self.nack();
                }
            },
            Expect::EraseCount => match frame {
                [0xFF, 0xFF, 0x00] => {
                    for page in 0..FLASH_SIZE / PAGE_SIZE as usize {
                        self.erase_page(page);
                    }
                    self.ack();
                },
                [hi, lo, sum] if hi ^ lo == *sum => {
                    self.ack();
                    self.expect = Expect::ErasePages(usize::from(u16::from_be_bytes([*hi, *lo])) + 1);
                },
                _ => self.nack(),
            },
            Expect::ErasePages(count) => {
                let pages = FLASH_SIZE / PAGE_SIZE as usize;
                let Some((&sum, body)) = frame.split_last() else {
                    self.nack();
                    return;
                };
                let numbers: Vec<usize> = body
                    .chunks_exact(2)
                    .map(|p| usize::from(u16::from_be_bytes([p[0], p[1]])))
                    .collect();
                if body.len() != count * 2 || xor(body) != sum || numbers.iter().any(|&p| p >= pages) {
                    self.nack();
                    return;
                }
                for page in numbers {
                    self.erase_page(page);
                }
                self.ack();
            },
        }
    }

    fn boot_command(&mut self, frame: &[u8]) {
        self.responses
            .clear();
        let command = match frame {
            [op, complement] if op ^ complement == 0xFF => Command::from_opcode(*op),
            _ => None,
        };
        let Some(command) = command else {
            self.nack();
            return;
        };
        let protected = self.read_protected;
        match command {
            Command::Get => {
                self.ack();
                self.responses
                    .push_back(SUPPORTED.len() as u8);
                self.responses
                    .push_back(BOOTLOADER_VERSION);
                self.responses
                    .extend(SUPPORTED);
                self.ack();
            },
            Command::GetVersion => {
                self.ack();
                self.responses
                    .push_back(BOOTLOADER_VERSION);
                self.ack();
            },
            Command::GetId => {
                let [hi, lo] = self
                    .product_id
                    .to_be_bytes();
                self.ack();
                self.responses
                    .extend([1, hi, lo]);
                self.ack();
            },
            Command::ReadMemory | Command::WriteMemory | Command::Erase if protected => self.nack(),
            Command::ReadMemory => {
                self.ack();
                self.expect = Expect::ReadAddress;
            },
            Command::WriteMemory => {
                self.ack();
                self.expect = Expect::WriteAddress;
            },
            Command::Erase => {
                self.ack();
                self.expect = Expect::EraseCount;
            },
            Command::Go => {
                self.ack();
                self.expect = Expect::GoAddress;
            },
            Command::WriteUnprotect => {
                self.ack();
                self.ack();
            },
            Command::ReadUnprotect => {
                self.ack();
                self.flash
                    .fill(0xFF);
                self.written_extent = 0;
                self.clear_app_faults();
                self.read_protected = false;
                self.ack();
            },
        }
    }
}

/// Shared handle to the simulated module.
#[derive(Clone)]
pub struct SimMcu {
    state: Rc<RefCell<State>>,
}

impl SimMcu {
    /// Factory-fresh part: blank flash, factory option bytes, sitting in the
    /// bootloader.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State::new())),
        }
    }

    /// Part running firmware `1ADA0101` with the boot pin enabled.
    pub fn with_app_image() -> Self {
        let mcu = Self::new();
        {
            let mut s = mcu
                .state
                .borrow_mut();
            let image = firmware_image(b"1ADA0101");
            s.flash[..image.len()].copy_from_slice(&image);
            s.written_extent = image.len();
            s.option_word = FACTORY_OPTIONS & !OPTION_GUARD_BIT;
            s.empty_flag = false;
            s.mode = Mode::App;
            s.app_start();
        }
        mcu
    }

    /// Bus handle.
    pub fn bus(&self) -> SimBus {
        SimBus {
            state: self
                .state
                .clone(),
        }
    }

    /// Virtual clock handle.
    pub fn clock(&self) -> SimClock {
        SimClock {
            state: self
                .state
                .clone(),
        }
    }

    /// NRST handle.
    pub fn reset_pin(&self) -> SimPin {
        SimPin {
            state: self
                .state
                .clone(),
            reset: true,
        }
    }

    /// BOOT0 handle.
    pub fn boot_pin(&self) -> SimPin {
        SimPin {
            state: self
                .state
                .clone(),
            reset: false,
        }
    }

    /// Power rail handle.
    pub fn power(&self) -> SimPower {
        SimPower {
            state: self
                .state
                .clone(),
        }
    }

    /// Jump straight into the bootloader.
    pub fn enter_bootloader(&self) {
        let mut s = self
            .state
            .borrow_mut();
        s.mode = Mode::Bootloader;
        s.expect = Expect::Command;
        s.responses
            .clear();
    }

    /// Virtual time.
    pub fn now(&self) -> Duration {
        self.state
            .borrow()
            .now
    }

    /// Whether the module is powered.
    pub fn powered(&self) -> bool {
        self.state
            .borrow()
            .powered
    }

    /// Number of power-ups.
    pub fn power_cycles(&self) -> u32 {
        self.state
            .borrow()
            .power_cycles
    }

    /// Whether the ROM bootloader is running.
    pub fn in_bootloader(&self) -> bool {
        let s = self
            .state
            .borrow();
        s.powered && s.mode == Mode::Bootloader
    }

    /// Whether the application answers on the bus.
    pub fn app_running(&self) -> bool {
        self.state
            .borrow()
            .app_alive()
    }

    /// Pin and SYNC history.
    pub fn pin_events(&self) -> Vec<PinEvent> {
        self.state
            .borrow()
            .events
            .clone()
    }

    /// Forget the pin history.
    pub fn clear_pin_events(&self) {
        self.state
            .borrow_mut()
            .events
            .clear();
    }

    /// Frames accepted by the bootloader.
    pub fn boot_frames(&self) -> u32 {
        self.state
            .borrow()
            .boot_frames
    }

    /// Application register writes.
    pub fn register_writes(&self) -> u32 {
        self.state
            .borrow()
            .register_writes
    }

    /// Software resets requested through the register file.
    pub fn sw_resets(&self) -> u32 {
        self.state
            .borrow()
            .sw_resets
    }

    /// Zero the frame and write counters.
    pub fn reset_counters(&self) {
        let mut s = self
            .state
            .borrow_mut();
        s.boot_frames = 0;
        s.register_writes = 0;
        s.sw_resets = 0;
        s.power_cycles = 0;
    }

    /// Reject the next `n` write-memory payloads with NACK.
    pub fn nack_next_writes(&self, n: u32) {
        self.state
            .borrow_mut()
            .nack_writes = n;
    }

    /// Silence the bootloader completely.
    pub fn set_bootloader_silent(&self, silent: bool) {
        self.state
            .borrow_mut()
            .silent = silent;
    }

    /// Product id answered to GET_ID.
    pub fn set_product_id(&self, id: u16) {
        self.state
            .borrow_mut()
            .product_id = id;
    }

    /// Enable flash read protection.
    pub fn set_read_protected(&self, protected: bool) {
        self.state
            .borrow_mut()
            .read_protected = protected;
    }

    /// Crash the application; reprogramming flash recovers it.
    pub fn set_app_hung(&self, hung: bool) {
        self.state
            .borrow_mut()
            .app_hung = hung;
    }

    /// Make the application report busy until flash is reprogrammed.
    pub fn set_app_busy(&self, busy: bool) {
        self.state
            .borrow_mut()
            .app_busy = busy;
    }

    /// Zero the vendor half of the reported version until flash is
    /// reprogrammed.
    pub fn set_version_garbled(&self, garbled: bool) {
        self.state
            .borrow_mut()
            .version_garbled = garbled;
    }

    /// Answer the next `polls` status reads with BUSY; `u32::MAX` never
    /// stops.
    pub fn busy_next_polls(&self, polls: u32) {
        self.state
            .borrow_mut()
            .busy_polls = polls;
    }

    /// Let every bootloader read hang for a second and then time out.
    pub fn set_bootloader_stalled(&self, stalled: bool) {
        self.state
            .borrow_mut()
            .stalled = stalled;
    }

    /// Make the application report `version` regardless of flash content.
    pub fn set_reported_version(&self, version: Option<[u8; 8]>) {
        self.state
            .borrow_mut()
            .reported_version = version;
    }

    /// Current option word.
    pub fn option_word(&self) -> u32 {
        self.state
            .borrow()
            .option_word
    }

    /// Copy `data` into flash at `address`.
    pub fn load_flash(&self, address: u32, data: &[u8]) {
        let mut s = self
            .state
            .borrow_mut();
        let offset = address.saturating_sub(GEOMETRY.flash_base) as usize;
        s.flash[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Flash bytes at `address`.
    pub fn flash_range(&self, address: u32, len: usize) -> Vec<u8> {
        let offset = address.saturating_sub(GEOMETRY.flash_base) as usize;
        self.state
            .borrow()
            .flash[offset..offset + len]
            .to_vec()
    }

    /// Little-endian flash word at `address`.
    pub fn flash_word(&self, address: u32) -> u32 {
        let bytes = self.flash_range(address, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Register byte.
    pub fn register(&self, reg: u16) -> u8 {
        self.state
            .borrow()
            .regs[usize::from(reg)]
    }

    /// Register bytes from `reg`.
    pub fn register_bytes(&self, reg: u16, len: usize) -> Vec<u8> {
        let at = usize::from(reg);
        self.state
            .borrow()
            .regs[at..at + len]
            .to_vec()
    }

    /// Set a register byte.
    pub fn set_register(&self, reg: u16, value: u8) {
        self.set_register_bytes(reg, &[value]);
    }

    /// Set register bytes from `reg`.
    pub fn set_register_bytes(&self, reg: u16, data: &[u8]) {
        let at = usize::from(reg);
        self.state
            .borrow_mut()
            .regs[at..at + data.len()]
            .copy_from_slice(data);
    }

    /// Firmware status word.
    pub fn fw_status(&self) -> u32 {
        let bytes = self.register_bytes(regs::FW_STATUS, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Set the firmware status word.
    pub fn set_fw_status(&self, value: u32) {
        self.state
            .borrow_mut()
            .set_fw_status(value);
    }
}

/// [`Bus`] into the simulated module.
pub struct SimBus {
    state: Rc<RefCell<State>>,
}

impl Bus for SimBus {
    fn send(&mut self, addr: u8, bytes: &[u8]) -> io::Result<usize> {
        let mut s = self
            .state
            .borrow_mut();
        match addr {
            BOOT_ADDR => {
                if !s.bootloader_up() {
                    return Err(link_down("bootloader not responding"));
                }
                s.boot_frames += 1;
                if matches!(s.expect, Expect::Command) && bytes == [SYNC] {
                    s.events
                        .push(PinEvent::Sync);
                } else {
                    s.boot_frame(bytes);
                }
                Ok(bytes.len())
            },
            APP_ADDR => {
                if !s.app_alive() {
                    return Err(link_down("application not responding"));
                }
                match bytes {
                    [hi, lo] => s.reg_pointer = u16::from_be_bytes([*hi, *lo]),
                    [hi, lo, data @ ..] if !data.is_empty() => {
                        s.app_write(u16::from_be_bytes([*hi, *lo]), data)?;
                    },
                    _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "short frame")),
                }
                Ok(bytes.len())
            },
            _ => Err(link_down("no device at address")),
        }
    }

    fn recv(&mut self, addr: u8, buf: &mut [u8]) -> io::Result<usize> {
        let mut s = self
            .state
            .borrow_mut();
        match addr {
            BOOT_ADDR => {
                if !s.bootloader_up() {
                    return Err(link_down("bootloader not responding"));
                }
                if s.stalled {
                    s.now += Duration::from_secs(1);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "bootloader stalled"));
                }
                if s.busy_polls > 0 && buf.len() == 1 && !s.responses.is_empty() {
                    if s.busy_polls != u32::MAX {
                        s.busy_polls -= 1;
                    }
                    buf[0] = BUSY;
                    return Ok(1);
                }
                if s.responses.len() < buf.len() {
                    s.responses
                        .clear();
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no response pending"));
                }
                for slot in buf.iter_mut() {
                    *slot = s
                        .responses
                        .pop_front()
                        .unwrap_or(NACK);
                }
                if s.responses.is_empty() {
                    match s.after_ack.take() {
                        Some(AfterAck::OptionReload) => s.option_reload(),
                        Some(AfterAck::Jump) => {
                            s.mode = Mode::App;
                            s.app_start();
                        },
                        None => {},
                    }
                }
                Ok(buf.len())
            },
            APP_ADDR => {
                if !s.app_alive() {
                    return Err(link_down("application not responding"));
                }
                let start = usize::from(s.reg_pointer);
                if start + buf.len() > s.regs.len() {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "register out of range"));
                }
                for (i, slot) in buf.iter_mut().enumerate() {
                    *slot = s.read_reg(start + i);
                }
                Ok(buf.len())
            },
            _ => Err(link_down("no device at address")),
        }
    }
}

/// Virtual [`Clock`]; sleeping advances time instantly.
pub struct SimClock {
    state: Rc<RefCell<State>>,
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.state
            .borrow()
            .now
    }

    fn sleep(&mut self, duration: Duration) {
        self.state
            .borrow_mut()
            .now += duration;
    }
}

/// NRST or BOOT0.
pub struct SimPin {
    state: Rc<RefCell<State>>,
    reset: bool,
}

impl SimPin {
    fn drive(&mut self, active: bool) {
        let mut s = self
            .state
            .borrow_mut();
        if self.reset {
            s.events
                .push(PinEvent::Reset(active));
            s.reset_held = active;
            if !s.powered {
                return;
            }
            if active {
                s.mode = Mode::Reset;
            } else {
                s.boot();
            }
        } else {
            s.events
                .push(PinEvent::Boot(active));
            s.boot_high = active;
        }
    }
}

impl OutputPin for SimPin {
    fn assert(&mut self) -> io::Result<()> {
        self.drive(true);
        Ok(())
    }

    fn deassert(&mut self) -> io::Result<()> {
        self.drive(false);
        Ok(())
    }
}

/// Module power rail.
pub struct SimPower {
    state: Rc<RefCell<State>>,
}

impl Power for SimPower {
    fn power_up(&mut self) -> io::Result<()> {
        let mut s = self
            .state
            .borrow_mut();
        s.powered = true;
        s.power_cycles += 1;
        s.empty_flag = s.first_word() == ERASED_WORD;
        if s.reset_held {
            s.mode = Mode::Reset;
        } else {
            s.boot();
        }
        Ok(())
    }

    fn power_down(&mut self) -> io::Result<()> {
        let mut s = self
            .state
            .borrow_mut();
        s.powered = false;
        s.mode = Mode::Off;
        Ok(())
    }
}
