//! Blocking send/receive with the bootloader's single-byte handshake.
//!
//! [`Transport`] owns the bus and the clock for the duration of an update and
//! remembers which target address it is talking to. The same physical bus
//! reaches the application firmware and the system bootloader at different
//! addresses, so callers switch with [`Transport::set_address`].

use {
    crate::{
        error::{Error, Result},
        port::{Bus, Clock},
        protocol::sysboot::{ACK, BUSY},
    },
    log::{trace, warn},
    std::time::Duration,
};

/// Receive attempts per ACK wait.
pub const ACK_ATTEMPTS: u32 = 3;

/// Bus plus clock, addressed at one target at a time.
#[derive(Debug)]
pub struct Transport<B, C> {
    bus: B,
    clock: C,
    address: u8,
    inter_packet: Duration,
}

impl<B: Bus, C: Clock> Transport<B, C> {
    /// Create a transport addressed at `address`.
    pub fn new(bus: B, clock: C, address: u8, inter_packet: Duration) -> Self {
        Self {
            bus,
            clock,
            address,
            inter_packet,
        }
    }

    /// Current target address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Address subsequent transactions to `address`.
    pub fn set_address(&mut self, address: u8) {
        if self.address != address {
            trace!("bus address {:#04x} -> {:#04x}", self.address, address);
            self.address = address;
        }
    }

    /// Write one frame to the target.
    pub fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        trace!("TX @{:#04x}: {:02X?}", self.address, bytes);
        self.bus
            .send(self.address, bytes)
            .map_err(Error::Link)
    }

    /// Read exactly `buf.len()` bytes from the target.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self
            .bus
            .recv(self.address, buf)
            .map_err(Error::Link)?;
        trace!("RX @{:#04x}: {:02X?}", self.address, &buf[..n.min(buf.len())]);
        Ok(n)
    }

    /// Wait for the target to acknowledge the last frame.
    ///
    /// Polls a single status byte up to [`ACK_ATTEMPTS`] times. A busy byte
    /// does not use up an attempt. The wait gives up early once `timeout`
    /// has elapsed since the call. When it fails, a timeout is reported in
    /// preference to a NACK, and a NACK in preference to a bus error.
    pub fn wait_ack(&mut self, timeout: Duration) -> Result<()> {
        let deadline = self.clock.now() + timeout;
        let mut attempts = 0;
        let mut nack = None;
        let mut link = None;

        while attempts < ACK_ATTEMPTS {
            let mut status = [0u8; 1];
            match self.bus.recv(self.address, &mut status) {
                Ok(_) if status[0] == ACK => return Ok(()),
                Ok(_) if status[0] == BUSY => {
                    if self.clock.now() >= deadline {
                        warn!("Target still busy after {}ms", timeout.as_millis());
                        return Err(Error::Busy);
                    }
                    self.clock.sleep(self.inter_packet);
                    continue;
                }
                Ok(_) => {
                    trace!("NACK {:#04x} @{:#04x}", status[0], self.address);
                    nack = Some(status[0]);
                }
                Err(e) => {
                    trace!("ACK poll failed @{:#04x}: {e}", self.address);
                    link = Some(e);
                }
            }
            attempts += 1;
            if self.clock.now() >= deadline {
                return Err(Error::Timeout(format!(
                    "no ACK from {:#04x} within {}ms",
                    self.address,
                    timeout.as_millis()
                )));
            }
            if attempts < ACK_ATTEMPTS {
                self.clock.sleep(self.inter_packet);
            }
        }

        match (nack, link) {
            (Some(byte), _) => Err(Error::Nack { byte }),
            (None, Some(e)) => Err(Error::Link(e)),
            (None, None) => Err(Error::Timeout(format!("no ACK from {:#04x}", self.address))),
        }
    }

    /// Block for `duration`.
    pub fn delay(&mut self, duration: Duration) {
        self.clock.sleep(duration);
    }

    /// Current monotonic time.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Give back the bus and clock.
    pub fn into_parts(self) -> (B, C) {
        (self.bus, self.clock)
    }
}
