//! One powered test session with a module: startup handshake, typed send and
//! receive, console access and teardown.
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::{CanBus, Delay, StdDelay};
use crate::can_decoder::{self, InboundMessage};
use crate::catalog::{Catalog, MessageDefinition, CONSOLE_ID, SIGN_ON_ID};
use crate::config::SessionConfig;
use crate::error::{ModuleError, SessionError};
use crate::frame::Frame;
use crate::messages::{Outbound, SignOn};
use crate::power::{PowerControl, PowerSequencer, PowerState};
use crate::receiver::FilteredReceiver;

/// Owns the bus and the power backend for the duration of a test run.
///
/// The bus is shut down when the session is dropped, whichever way the test
/// ends.
pub struct Session<B: CanBus, P: PowerControl, D: Delay = StdDelay> {
    catalog: Catalog,
    receiver: FilteredReceiver<B>,
    power: PowerSequencer<P>,
    delay: D,
    config: SessionConfig,
    sign_on: Arc<MessageDefinition>,
}

impl<B: CanBus, P: PowerControl, D: Delay> Session<B, P, D> {
    pub fn new(
        catalog: Catalog,
        bus: B,
        power: P,
        delay: D,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let receiver = FilteredReceiver::new(bus, &catalog)?;
        let sign_on = catalog.sign_on()?;
        Ok(Self {
            catalog,
            receiver,
            power: PowerSequencer::new(power),
            delay,
            config,
            sign_on,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn receiver(&self) -> &FilteredReceiver<B> {
        &self.receiver
    }

    pub fn bus(&self) -> &B {
        self.receiver.bus()
    }

    pub fn power_state(&self) -> PowerState {
        self.power.state()
    }

    /// Power-cycle the module and wait for it to sign on.
    pub fn start(&mut self) -> Result<SignOn, SessionError> {
        info!(variant = %self.catalog.variant(), "starting module");
        self.power.set_power_off()?;
        self.delay.delay(self.config.settle());
        self.drain()?;
        self.power.set_power_t30()?;

        let timeout = self.config.sign_on_timeout();
        let Some(frame) = self.receiver.receive(timeout, &[SIGN_ON_ID])? else {
            return Err(ModuleError::NoPowerOn {
                timeout_ms: timeout.as_millis() as u64,
            }
            .into());
        };
        let sign_on = can_decoder::decode(&self.sign_on, &frame)
            .and_then(|message| SignOn::try_from(&message))
            .map_err(|source| ModuleError::UnexpectedPowerOn { frame, source })?;
        info!("module signed on: {sign_on}");
        Ok(sign_on)
    }

    /// Power the module off.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        info!("stopping module");
        self.power.set_power_off()?;
        Ok(())
    }

    /// Switch the rails directly, e.g. to add T15 for ignition-on tests.
    pub fn set_power(&mut self, state: PowerState) -> Result<(), SessionError> {
        match state {
            PowerState::Off => self.power.set_power_off()?,
            PowerState::T30 => self.power.set_power_t30()?,
            PowerState::T30T15 => self.power.set_power_t30_t15()?,
        }
        Ok(())
    }

    /// Encode and transmit a typed message. Returns the frame that went out.
    pub fn send(&mut self, message: &Outbound) -> Result<Frame, SessionError> {
        let frame = message.encode(&self.catalog)?;
        debug!(?message, "send");
        self.receiver.send(&frame)?;
        Ok(frame)
    }

    /// Transmit a frame as-is.
    pub fn send_raw(&mut self, frame: &Frame) -> Result<(), SessionError> {
        self.receiver.send(frame)?;
        Ok(())
    }

    pub fn receive(
        &mut self,
        timeout: Duration,
        filter: &[u32],
    ) -> Result<Option<Frame>, SessionError> {
        Ok(self.receiver.receive(timeout, filter)?)
    }

    /// Drain with the configured budget. Returns `false` if the bus stayed busy.
    pub fn drain(&mut self) -> Result<bool, SessionError> {
        let quiet = self.receiver.drain(self.config.drain_attempts, self.config.drain_quiet())?;
        Ok(quiet)
    }

    /// Wait for one message of `kind` and decode it. Decode failures propagate.
    pub fn wait_for(&mut self, kind: &str, timeout: Duration) -> Result<InboundMessage, SessionError> {
        let definition = self.catalog.get(kind)?;
        let Some(frame) = self.receiver.receive(timeout, &[definition.id()])? else {
            return Err(SessionError::Timeout {
                what: kind.to_owned(),
                timeout_ms: timeout.as_millis() as u64,
            });
        };
        Ok(can_decoder::decode(&definition, &frame)?)
    }

    /// Next status report of the module.
    pub fn status(&mut self) -> Result<InboundMessage, SessionError> {
        let kind = self.catalog.status_kind();
        self.wait_for(kind, self.config.status_timeout())
    }

    pub fn enable_debug(&mut self, enable: bool) -> Result<(), SessionError> {
        self.send(&Outbound::Debug { enable })?;
        Ok(())
    }

    /// Per-test setup after `start`: wait for the first status report, then
    /// turn on debug mode.
    pub fn prepare(&mut self) -> Result<(), SessionError> {
        let status_id = self.catalog.status()?.id();
        if self
            .receiver
            .receive(self.config.status_timeout(), &[status_id])?
            .is_none()
        {
            warn!("no status report after sign-on");
        }
        self.enable_debug(true)
    }

    /// Wait for one console packet from the module firmware.
    ///
    /// Sign-on frames seen meanwhile are reported as resets by the receiver.
    /// `CONSOLE_ID` is above the 11-bit range, so only extended frames match.
    pub fn read_console(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        let frame = self.receiver.receive(timeout, &[CONSOLE_ID])?;
        Ok(frame.map(|frame| frame.payload().to_vec()))
    }

    /// Sample an analog input of the bench.
    pub fn read_input_mv(&mut self, channel: u8) -> Result<u32, SessionError> {
        let analog = self.power.analog().ok_or(SessionError::NoAnalogDevice)?;
        Ok(analog.read_input(channel)?)
    }

    pub fn sleep(&mut self, duration: Duration) {
        self.delay.delay(duration);
    }
}

impl<B: CanBus, P: PowerControl, D: Delay> Drop for Session<B, P, D> {
    fn drop(&mut self) {
        self.receiver.shutdown();
    }
}
