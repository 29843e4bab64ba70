//! Hardware collaborator interfaces.
//!
//! The update engine never touches hardware directly. Everything it needs
//! from the platform is expressed as a small trait here, so the protocol
//! logic stays I/O-agnostic and can run against a simulated target in tests.
//!
//! ```text
//! +--------------------+   +----------------------+
//! |  Reconciler        |-->|  FlashProgrammer     |
//! +--------------------+   +----------+-----------+
//!                                     |
//!                          +----------v-----------+
//!                          |  Session / Transport |
//!                          +--+------+-------+----+
//!                             |      |       |
//!                           Bus  OutputPin  Clock
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use oisflash::port::{Bus, Clock};
//! use std::time::Duration;
//!
//! fn ping<B: Bus, C: Clock>(bus: &mut B, clock: &mut C) -> std::io::Result<u8> {
//!     bus.send(0x51, &[0x01, 0xFE])?;
//!     clock.sleep(Duration::from_millis(1));
//!     let mut ack = [0u8; 1];
//!     bus.recv(0x51, &mut ack)?;
//!     Ok(ack[0])
//! }
//! ```

use std::io;
use std::time::{Duration, Instant};

/// Addressable request/response byte bus (I2C master).
///
/// Each call is one complete bus transaction to the 7-bit `addr`.
pub trait Bus {
    /// Write `bytes` to the target; returns the number of bytes accepted.
    fn send(&mut self, addr: u8, bytes: &[u8]) -> io::Result<usize>;

    /// Read exactly `buf.len()` bytes from the target; returns the count read.
    fn recv(&mut self, addr: u8, buf: &mut [u8]) -> io::Result<usize>;
}

impl<B: Bus + ?Sized> Bus for &mut B {
    fn send(&mut self, addr: u8, bytes: &[u8]) -> io::Result<usize> {
        (**self).send(addr, bytes)
    }

    fn recv(&mut self, addr: u8, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(addr, buf)
    }
}

/// Two-state digital output.
///
/// The active level is the implementor's business: asserting the reset line
/// holds the MCU in reset, asserting the boot strap selects the system
/// bootloader.
pub trait OutputPin {
    /// Drive the line to its active level.
    fn assert(&mut self) -> io::Result<()>;

    /// Drive the line to its inactive level.
    fn deassert(&mut self) -> io::Result<()>;
}

/// Monotonic time source and blocking delay.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    /// Block the calling thread for `duration`.
    fn sleep(&mut self, duration: Duration);
}

/// Module power rail control, owned by the camera subsystem.
pub trait Power {
    /// Power the module and its regulators.
    fn power_up(&mut self) -> io::Result<()>;

    /// Remove power from the module.
    fn power_down(&mut self) -> io::Result<()>;
}

/// [`Clock`] backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now(&self) -> Duration {
        self.origin
            .elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
