//! Bootloader session: pin strapping and mode tracking.
//!
//! ```text
//! AppMode --connect--> Connecting --SYNC ok--> Synced --begin_programming--> Programming
//!    ^                     |                     |                              |
//!    |                     +------fail-----------+------------------------------+
//!    |                                           v
//!    +------------------------------------ Disconnecting
//! ```
//!
//! Entering the bootloader holds NRST low with BOOT0 high, releases NRST,
//! waits for the ROM to start listening, then drops BOOT0. The target only
//! settles on the I2C interface after a SYNC byte followed by a second
//! reset cycle, so [`Session::connect`] strobes the pins twice.

use {
    super::commands::Bootloader,
    crate::{
        config::{Config, ms},
        device::Registers,
        error::{Error, Result},
        port::{Bus, Clock, OutputPin},
        target::{FlashGeometry, stm32g0},
        transport::Transport,
    },
    log::{debug, error, info, warn},
    std::{fmt, time::Duration},
};

/// Where the target is in the bootloader life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Running the application image.
    AppMode,
    /// Strapping pins for bootloader entry.
    Connecting,
    /// Bootloader answered SYNC.
    Synced,
    /// Erasing or writing flash.
    Programming,
    /// Returning to the application.
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppMode => write!(f, "app"),
            Self::Connecting => write!(f, "connecting"),
            Self::Synced => write!(f, "synced"),
            Self::Programming => write!(f, "programming"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Target identity read through the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// GET_ID product id.
    pub product_id: u16,
    /// GET_VERSION bootloader version.
    pub bootloader_version: u8,
}

/// Exclusive owner of the physical link: bus, clock, NRST and BOOT0.
pub struct Session<B, C, P> {
    transport: Transport<B, C>,
    reset: P,
    boot: P,
    config: Config,
    geometry: FlashGeometry,
    state: SessionState,
    identity: Option<DeviceIdentity>,
}

impl<B: Bus, C: Clock, P: OutputPin> Session<B, C, P> {
    /// Create a session; the target is assumed to run its application.
    ///
    /// Fails with [`Error::Config`] when `config` does not validate.
    pub fn new(bus: B, clock: C, reset: P, boot: P, config: Config) -> Result<Self> {
        config.validate()?;
        let transport = Transport::new(
            bus,
            clock,
            config.app_address,
            ms(config.timing.inter_packet_ms),
        );
        Ok(Self {
            transport,
            reset,
            boot,
            config,
            geometry: stm32g0::GEOMETRY,
            state: SessionState::AppMode,
            identity: None,
        })
    }

    /// Use a different flash geometry.
    #[must_use]
    pub fn with_geometry(mut self, geometry: FlashGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity read by the last successful [`validate`](Self::validate).
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flash geometry.
    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    /// Block for `duration`.
    pub fn delay(&mut self, duration: Duration) {
        self.transport
            .delay(duration);
    }

    /// Block for `value` milliseconds.
    pub(crate) fn delay_ms(&mut self, value: u32) {
        self.delay(ms(value));
    }

    fn pin(result: std::io::Result<()>) -> Result<()> {
        result.map_err(Error::Link)
    }

    /// Hold NRST with BOOT0 high, release NRST, then drop BOOT0.
    fn strap_bootloader(&mut self) -> Result<()> {
        let timing = self.config.timing.clone();
        Self::pin(self.reset.assert())?;
        Self::pin(self.boot.assert())?;
        self.delay_ms(timing.reset_pulse_ms);
        Self::pin(self.reset.deassert())?;
        self.delay_ms(timing.startup_delay_ms);
        Self::pin(self.boot.deassert())
    }

    /// Reset the target into its system bootloader and synchronize.
    ///
    /// Leaves the session in [`SessionState::Connecting`] on failure; use
    /// [`validate`](Self::validate) for a connect that cleans up after itself.
    pub fn connect(&mut self) -> Result<()> {
        info!("Connecting to bootloader at {:#04x}", self.config.bootloader_address);
        self.state = SessionState::Connecting;
        self.identity = None;
        self.transport
            .set_address(self.config.bootloader_address);

        self.strap_bootloader()?;
        Bootloader::new(&mut self.transport, &self.config.timing, &self.geometry).sync()?;
        // I2C mode needs one more reset cycle after SYNC.
        self.strap_bootloader()?;

        self.state = SessionState::Synced;
        debug!("Bootloader synced");
        Ok(())
    }

    fn read_identity(&mut self) -> Result<DeviceIdentity> {
        let mut bl = Bootloader::new(&mut self.transport, &self.config.timing, &self.geometry);
        let product_id = bl.get_id()?;
        let bootloader_version = bl.get_version()?;
        Ok(DeviceIdentity {
            product_id,
            bootloader_version,
        })
    }

    /// Connect and read the target identity.
    ///
    /// Any failure returns the target to its application before the error
    /// is reported.
    pub fn validate(&mut self) -> Result<DeviceIdentity> {
        let result = self
            .connect()
            .and_then(|()| self.read_identity());

        match result {
            Ok(identity) => {
                if identity.product_id != self.config.expected_product_id {
                    warn!(
                        "Unexpected product id {:#05x} (expected {:#05x})",
                        identity.product_id, self.config.expected_product_id
                    );
                }
                info!(
                    "Target PID {:#05x}, bootloader version {:#04x}",
                    identity.product_id, identity.bootloader_version
                );
                self.identity = Some(identity);
                Ok(identity)
            },
            Err(e) => {
                error!("Target validation failed: {e}");
                if let Err(d) = self.disconnect() {
                    warn!("Disconnect after failed validation: {d}");
                }
                Err(e)
            },
        }
    }

    /// Mark the start of flash modification.
    pub fn begin_programming(&mut self) -> Result<()> {
        match self.state {
            SessionState::Synced | SessionState::Programming => {
                self.state = SessionState::Programming;
                Ok(())
            },
            _ => Err(Error::NotConnected),
        }
    }

    /// Command interface; only available while synced.
    pub fn bootloader(&mut self) -> Result<Bootloader<'_, B, C>> {
        match self.state {
            SessionState::Synced | SessionState::Programming => Ok(Bootloader::new(
                &mut self.transport,
                &self.config.timing,
                &self.geometry,
            )),
            _ => Err(Error::NotConnected),
        }
    }

    /// Return the target to its application image.
    ///
    /// Drops BOOT0, pulses NRST and waits for the application to boot.
    pub fn disconnect(&mut self) -> Result<()> {
        info!("Disconnecting from bootloader");
        self.state = SessionState::Disconnecting;
        let timing = self.config.timing.clone();

        let pins = Self::pin(self.boot.deassert()).and_then(|()| {
            self.delay_ms(1);
            Self::pin(self.reset.assert())?;
            self.delay_ms(timing.reset_pulse_ms);
            Self::pin(self.reset.deassert())
        });
        self.delay_ms(timing.disconnect_settle_ms);

        self.transport
            .set_address(self.config.app_address);
        self.state = SessionState::AppMode;
        pins
    }

    /// Record that the target left the bootloader on its own (for example
    /// after an option-byte reload).
    pub fn detach(&mut self) {
        debug!("Target left bootloader");
        self.transport
            .set_address(self.config.app_address);
        self.state = SessionState::AppMode;
    }

    /// Register interface of the application firmware.
    pub fn registers(&mut self) -> Registers<'_, B, C> {
        Registers::new(&mut self.transport, &self.config)
    }

    /// Give back the owned collaborators.
    pub fn into_parts(self) -> (B, C, P, P) {
        let (bus, clock) = self
            .transport
            .into_parts();
        (bus, clock, self.reset, self.boot)
    }
}
