//! STM32 system bootloader over I2C.
//!
//! [`Session`] owns the transport and the strap pins and tracks whether the
//! ROM bootloader is reachable; [`Bootloader`] borrows a validated session
//! and issues the individual commands.

pub mod commands;
pub mod session;

pub use {
    commands::{Bootloader, COMMAND_ATTEMPTS, erase_timeout},
    session::{DeviceIdentity, Session, SessionState},
};
