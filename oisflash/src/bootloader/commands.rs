//! Bootloader command sequences.
//!
//! Each command is a fixed series of frames, each followed by an ACK wait.
//! A failure anywhere restarts the whole command from its first frame, up to
//! [`COMMAND_ATTEMPTS`] times.

use {
    crate::{
        config::{Timing, ms},
        error::{Error, Result},
        port::{Bus, Clock},
        protocol::sysboot::{self, BootloaderInfo, Command, MAX_PAYLOAD},
        target::{EraseRange, FlashGeometry},
        transport::Transport,
    },
    log::{debug, info, trace, warn},
    std::time::Duration,
};

/// Attempts per bootloader command.
pub const COMMAND_ATTEMPTS: u32 = 3;

/// ACK timeout for the last frame of an erase.
pub fn erase_timeout(timing: &Timing, range: &EraseRange) -> Duration {
    match range {
        EraseRange::Full { .. } => ms(timing.full_erase_timeout_ms),
        EraseRange::Pages { count, .. } => {
            ms(timing.page_erase_timeout_ms.saturating_mul(count.saturating_add(1)))
        }
    }
}

/// Command interface to a synced system bootloader.
///
/// Borrowed from a [`Session`](super::Session) in the synced state.
pub struct Bootloader<'a, B, C> {
    transport: &'a mut Transport<B, C>,
    timing: &'a Timing,
    geometry: &'a FlashGeometry,
}

impl<'a, B: Bus, C: Clock> Bootloader<'a, B, C> {
    pub(crate) fn new(
        transport: &'a mut Transport<B, C>,
        timing: &'a Timing,
        geometry: &'a FlashGeometry,
    ) -> Self {
        Self {
            transport,
            timing,
            geometry,
        }
    }

    /// Flash geometry of the target.
    pub fn geometry(&self) -> &FlashGeometry {
        self.geometry
    }

    fn response_timeout(&self) -> Duration {
        ms(self.timing.response_timeout_ms)
    }

    /// Run `op` until it succeeds or the attempts run out.
    fn with_retry<T>(
        &mut self,
        command: Command,
        mut op: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let mut last_error = None;

        for attempt in 1..=COMMAND_ATTEMPTS {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < COMMAND_ATTEMPTS {
                        warn!(
                            "{} failed (attempt {attempt}/{COMMAND_ATTEMPTS}): {e}",
                            command.name()
                        );
                        self.transport
                            .delay(ms(self.timing.retry_interval_ms));
                    } else {
                        warn!("{} failed after {COMMAND_ATTEMPTS} attempts: {e}", command.name());
                    }
                    last_error = Some(e);
                },
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Protocol(format!("{} failed", command.name()))))
    }

    /// Send a command frame and wait for its ACK.
    fn open(&mut self, command: Command) -> Result<()> {
        trace!("{}", command.name());
        self.transport
            .send(&command.frame())?;
        self.transport
            .wait_ack(self.response_timeout())
    }

    fn send_address(&mut self, address: u32, timeout: Duration) -> Result<()> {
        self.transport
            .send(&sysboot::address_frame(address)?)?;
        self.transport
            .wait_ack(timeout)
    }

    /// Send the single SYNC byte.
    ///
    /// The bootloader does not acknowledge it; the frame counts as delivered
    /// when the bus accepts it.
    pub fn sync(&mut self) -> Result<()> {
        debug!("SYNC");
        self.transport
            .send(&sysboot::sync_frame())
            .map(|_| ())
    }

    /// GET: protocol version and supported commands.
    pub fn get(&mut self) -> Result<BootloaderInfo> {
        let timeout = self.response_timeout();
        self.with_retry(Command::Get, |bl| {
            bl.open(Command::Get)?;
            let mut count = [0u8; 1];
            bl.transport
                .receive(&mut count)?;
            let mut payload = vec![0u8; usize::from(count[0]) + 2];
            payload[0] = count[0];
            bl.transport
                .receive(&mut payload[1..])?;
            bl.transport
                .wait_ack(timeout)?;
            BootloaderInfo::parse(&payload)
        })
    }

    /// GET_VERSION: bootloader protocol version.
    pub fn get_version(&mut self) -> Result<u8> {
        let timeout = self.response_timeout();
        let version = self.with_retry(Command::GetVersion, |bl| {
            bl.open(Command::GetVersion)?;
            let mut version = [0u8; 1];
            bl.transport
                .receive(&mut version)?;
            bl.transport
                .wait_ack(timeout)?;
            Ok(version[0])
        })?;
        debug!("Bootloader version {version:#04x}");
        Ok(version)
    }

    /// GET_ID: product id.
    pub fn get_id(&mut self) -> Result<u16> {
        let timeout = self.response_timeout();
        let id = self.with_retry(Command::GetId, |bl| {
            bl.open(Command::GetId)?;
            let mut payload = [0u8; 3];
            bl.transport
                .receive(&mut payload)?;
            bl.transport
                .wait_ack(timeout)?;
            sysboot::parse_product_id(&payload)
        })?;
        debug!("Product id {id:#05x}");
        Ok(id)
    }

    /// READ_MEMORY: fill `buf` from `address`. At most [`MAX_PAYLOAD`] bytes.
    pub fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let len_frame = sysboot::read_length_frame(buf.len())?;
        let timeout = self.response_timeout();
        trace!("read {} bytes @ {address:#010x}", buf.len());
        self.with_retry(Command::ReadMemory, |bl| {
            bl.open(Command::ReadMemory)?;
            bl.send_address(address, timeout)?;
            bl.transport
                .send(&len_frame)?;
            bl.transport
                .wait_ack(timeout)?;
            bl.transport
                .receive(buf)?;
            Ok(())
        })
    }

    /// WRITE_MEMORY: write `data` at `address`.
    ///
    /// The caller splits data into payloads of at most [`MAX_PAYLOAD`] bytes.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let frame = sysboot::write_frame(data)?;
        let timeout = self.response_timeout();
        let write_timeout = ms(self.timing.write_timeout_ms);
        trace!("write {} bytes @ {address:#010x}", data.len());
        self.with_retry(Command::WriteMemory, |bl| {
            bl.open(Command::WriteMemory)?;
            bl.send_address(address, timeout)?;
            bl.transport
                .send(&frame)?;
            bl.transport
                .wait_ack(write_timeout)
        })
    }

    /// Read a little-endian word.
    pub fn read_u32(&mut self, address: u32) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read_memory(address, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Write a little-endian word.
    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<()> {
        self.write_memory(address, &value.to_le_bytes())
    }

    /// ERASE (extended): erase the pages in `range`.
    pub fn erase(&mut self, range: &EraseRange) -> Result<()> {
        let timeout = self.response_timeout();
        let (count_frame, pages_frame) = match *range {
            EraseRange::Full { .. } => (sysboot::full_erase_frame(), None),
            EraseRange::Pages { start, count } => {
                let start = u16::try_from(start)
                    .map_err(|_| Error::Protocol(format!("page {start} out of range")))?;
                let count = u16::try_from(count)
                    .map_err(|_| Error::Protocol(format!("page count {count} out of range")))?;
                (
                    sysboot::erase_count_frame(count)?,
                    Some(sysboot::erase_pages_frame(start, count)?),
                )
            },
        };
        let count_timeout = if range.is_full() {
            erase_timeout(self.timing, range)
        } else {
            timeout
        };
        let final_timeout = erase_timeout(self.timing, range);

        info!("Erasing {range}");
        self.with_retry(Command::Erase, |bl| {
            bl.open(Command::Erase)?;
            bl.transport
                .send(&count_frame)?;
            bl.transport
                .wait_ack(count_timeout)?;
            if let Some(pages) = &pages_frame {
                bl.transport
                    .send(pages)?;
                bl.transport
                    .wait_ack(final_timeout)?;
            }
            Ok(())
        })
    }

    /// Erase `[address, address + length)`; the range must be page aligned.
    pub fn erase_region(&mut self, address: u32, length: u32) -> Result<EraseRange> {
        let range = self
            .geometry
            .resolve(address, length)?;
        self.erase(&range)?;
        Ok(range)
    }

    /// GO: jump to the code whose vector table is at `address`.
    pub fn go(&mut self, address: u32) -> Result<()> {
        let timeout = self.response_timeout();
        let go_timeout = timeout + ms(self.timing.go_extra_ms);
        info!("Jumping to {address:#010x}");
        self.with_retry(Command::Go, |bl| {
            bl.open(Command::Go)?;
            bl.send_address(address, go_timeout)
        })
    }

    fn unprotect(&mut self, command: Command) -> Result<()> {
        let timeout = ms(self.timing.full_erase_timeout_ms);
        info!("{}", command.name());
        self.with_retry(command, |bl| {
            bl.transport
                .send(&command.frame())?;
            bl.transport
                .wait_ack(timeout)?;
            bl.transport
                .wait_ack(timeout)
        })
    }

    /// WRITE_UNPROTECT: disable write protection. The target resets afterwards.
    pub fn write_unprotect(&mut self) -> Result<()> {
        self.unprotect(Command::WriteUnprotect)
    }

    /// READ_UNPROTECT: disable read protection. This mass-erases flash.
    pub fn read_unprotect(&mut self) -> Result<()> {
        self.unprotect(Command::ReadUnprotect)
    }

    /// Write `image` from `base` in `chunk`-byte commands.
    ///
    /// Stops at the first chunk that still fails after its retries.
    pub fn program(
        &mut self,
        base: u32,
        image: &[u8],
        chunk: usize,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<()> {
        if chunk == 0 || chunk > MAX_PAYLOAD {
            return Err(Error::Protocol(format!("invalid chunk size {chunk}")));
        }
        let total = image.len();
        let mut written = 0;
        for (index, data) in image
            .chunks(chunk)
            .enumerate()
        {
            let offset = u32::try_from(index * chunk)
                .map_err(|_| Error::Protocol("image exceeds 32-bit address space".into()))?;
            let address = base
                .checked_add(offset)
                .ok_or_else(|| Error::Protocol("image exceeds 32-bit address space".into()))?;
            self.write_memory(address, data)
                .inspect_err(|e| log::error!("Chunk {index} @ {address:#010x} failed: {e}"))?;
            written += data.len();
            progress(written, total);
        }
        Ok(())
    }
}
