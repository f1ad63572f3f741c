//! Module power sequencing over the T30 (permanent) and T15 (ignition) rails.
//!
//! Backends only differ in how a rail change is carried out: `ManualPower`
//! asks an operator, `AnalogPower` drives two analog outputs.
use std::fmt;
use std::io::{self, Write};

use tracing::info;

use crate::config::SessionConfig;
use crate::error::{AnalogError, PowerError};

/// Analog output line feeding T30.
pub const T30_CHANNEL: u8 = 1;
/// Analog output line feeding T15.
pub const T15_CHANNEL: u8 = 2;
/// Rail voltage when a line is on.
pub const DEFAULT_RAIL_MV: u32 = 12_000;

/// Rails currently powered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PowerState {
    #[default]
    Off,
    T30,
    T30T15,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Off => f.write_str("off"),
            PowerState::T30 => f.write_str("T30"),
            PowerState::T30T15 => f.write_str("T30+T15"),
        }
    }
}

/// Level requested on an analog output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLevel {
    Off,
    On,
    Millivolts(u32),
}

/// Analog I/O device of the bench.
pub trait AnalogIo {
    /// Sample an input in millivolts.
    fn read_input(&mut self, channel: u8) -> Result<u32, AnalogError>;
    fn set_output(&mut self, channel: u8, level: OutputLevel) -> Result<(), AnalogError>;
}

impl<A: AnalogIo + ?Sized> AnalogIo for Box<A> {
    fn read_input(&mut self, channel: u8) -> Result<u32, AnalogError> {
        (**self).read_input(channel)
    }

    fn set_output(&mut self, channel: u8, level: OutputLevel) -> Result<(), AnalogError> {
        (**self).set_output(channel, level)
    }
}

/// Capability set every power backend provides.
pub trait PowerControl {
    fn set_power_off(&mut self) -> Result<(), PowerError>;
    fn set_power_t30(&mut self) -> Result<(), PowerError>;
    fn set_power_t30_t15(&mut self) -> Result<(), PowerError>;

    /// Analog device behind the backend, if it has one.
    fn analog(&mut self) -> Option<&mut dyn AnalogIo> {
        None
    }
}

impl<P: PowerControl + ?Sized> PowerControl for Box<P> {
    fn set_power_off(&mut self) -> Result<(), PowerError> {
        (**self).set_power_off()
    }

    fn set_power_t30(&mut self) -> Result<(), PowerError> {
        (**self).set_power_t30()
    }

    fn set_power_t30_t15(&mut self) -> Result<(), PowerError> {
        (**self).set_power_t30_t15()
    }

    fn analog(&mut self) -> Option<&mut dyn AnalogIo> {
        (**self).analog()
    }
}

/// Prints instructions for a human operator to switch the rails.
pub struct ManualPower {
    out: Box<dyn Write>,
}

impl ManualPower {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self { out }
    }

    fn prompt(&mut self, instruction: &str) -> Result<(), PowerError> {
        writeln!(self.out, "POWER: {instruction}")?;
        self.out.flush()?;
        Ok(())
    }
}

impl Default for ManualPower {
    fn default() -> Self {
        Self::new(Box::new(io::stdout()))
    }
}

impl PowerControl for ManualPower {
    fn set_power_off(&mut self) -> Result<(), PowerError> {
        self.prompt("turn module power off")
    }

    fn set_power_t30(&mut self) -> Result<(), PowerError> {
        self.prompt("turn module power on (T30 only)")
    }

    fn set_power_t30_t15(&mut self) -> Result<(), PowerError> {
        self.prompt("turn module power on (T30 and T15)")
    }
}

/// Switches the rails through two analog outputs.
pub struct AnalogPower<A: AnalogIo> {
    device: A,
    rail_mv: u32,
}

impl<A: AnalogIo> AnalogPower<A> {
    pub fn new(device: A) -> Self {
        Self::with_rail_mv(device, DEFAULT_RAIL_MV)
    }

    pub fn with_rail_mv(device: A, rail_mv: u32) -> Self {
        Self { device, rail_mv }
    }

    /// Rail voltage taken from the session config.
    pub fn from_config(device: A, config: &SessionConfig) -> Self {
        Self::with_rail_mv(device, config.rail_mv)
    }

    pub fn device(&self) -> &A {
        &self.device
    }

    fn set_rails(&mut self, t30: bool, t15: bool) -> Result<(), PowerError> {
        let level = |on: bool| {
            if on {
                OutputLevel::Millivolts(self.rail_mv)
            } else {
                OutputLevel::Millivolts(0)
            }
        };
        let (t30_level, t15_level) = (level(t30), level(t15));
        self.device.set_output(T30_CHANNEL, t30_level)?;
        self.device.set_output(T15_CHANNEL, t15_level)?;
        Ok(())
    }
}

impl<A: AnalogIo> PowerControl for AnalogPower<A> {
    fn set_power_off(&mut self) -> Result<(), PowerError> {
        self.set_rails(false, false)
    }

    fn set_power_t30(&mut self) -> Result<(), PowerError> {
        self.set_rails(true, false)
    }

    fn set_power_t30_t15(&mut self) -> Result<(), PowerError> {
        self.set_rails(true, true)
    }

    fn analog(&mut self) -> Option<&mut dyn AnalogIo> {
        Some(&mut self.device)
    }
}

/// Tracks the commanded power state on top of a backend.
///
/// Transitions happen only through the explicit setters. The state is updated
/// only when the backend reports success.
pub struct PowerSequencer<P: PowerControl> {
    backend: P,
    state: PowerState,
}

impl<P: PowerControl> PowerSequencer<P> {
    pub fn new(backend: P) -> Self {
        Self {
            backend,
            state: PowerState::Off,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn set_power_off(&mut self) -> Result<(), PowerError> {
        self.backend.set_power_off()?;
        self.transition(PowerState::Off);
        Ok(())
    }

    pub fn set_power_t30(&mut self) -> Result<(), PowerError> {
        self.backend.set_power_t30()?;
        self.transition(PowerState::T30);
        Ok(())
    }

    pub fn set_power_t30_t15(&mut self) -> Result<(), PowerError> {
        self.backend.set_power_t30_t15()?;
        self.transition(PowerState::T30T15);
        Ok(())
    }

    pub fn analog(&mut self) -> Option<&mut dyn AnalogIo> {
        self.backend.analog()
    }

    pub fn backend(&self) -> &P {
        &self.backend
    }

    fn transition(&mut self, next: PowerState) {
        info!(from = %self.state, to = %next, "power");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::mock::MockAnalog;

    /// Shared buffer so the test can read what the operator was told.
    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_manual_prompts() {
        let buf = SharedBuf::default();
        let mut power = PowerSequencer::new(ManualPower::new(Box::new(buf.clone())));
        power.set_power_off().unwrap();
        power.set_power_t30().unwrap();
        power.set_power_t30_t15().unwrap();
        let text = String::from_utf8(buf.0.borrow().clone()).unwrap();
        assert_eq!(
            text,
            "POWER: turn module power off\n\
             POWER: turn module power on (T30 only)\n\
             POWER: turn module power on (T30 and T15)\n"
        );
        assert!(power.analog().is_none());
    }

    #[test]
    fn test_state_follows_setters() {
        let mut power = PowerSequencer::new(AnalogPower::new(MockAnalog::new()));
        assert_eq!(power.state(), PowerState::Off);
        power.set_power_t30().unwrap();
        assert_eq!(power.state(), PowerState::T30);
        power.set_power_t30_t15().unwrap();
        assert_eq!(power.state(), PowerState::T30T15);
        power.set_power_off().unwrap();
        assert_eq!(power.state(), PowerState::Off);
    }

    #[test]
    fn test_analog_outputs() {
        let mut power = AnalogPower::new(MockAnalog::new());
        power.set_power_t30().unwrap();
        assert_eq!(power.device().output(T30_CHANNEL), Some(OutputLevel::Millivolts(12_000)));
        assert_eq!(power.device().output(T15_CHANNEL), Some(OutputLevel::Millivolts(0)));

        power.set_power_t30_t15().unwrap();
        assert_eq!(power.device().output(T15_CHANNEL), Some(OutputLevel::Millivolts(12_000)));

        power.set_power_off().unwrap();
        assert_eq!(power.device().output(T30_CHANNEL), Some(OutputLevel::Millivolts(0)));
        assert_eq!(power.device().output(T15_CHANNEL), Some(OutputLevel::Millivolts(0)));
    }

    #[test]
    fn test_rail_voltage_from_config() {
        let config = SessionConfig {
            rail_mv: 13_800,
            ..SessionConfig::default()
        };
        let mut power = AnalogPower::from_config(MockAnalog::new(), &config);
        power.set_power_t30_t15().unwrap();
        assert_eq!(power.device().output(T30_CHANNEL), Some(OutputLevel::Millivolts(13_800)));
        assert_eq!(power.device().output(T15_CHANNEL), Some(OutputLevel::Millivolts(13_800)));
    }

    #[test]
    fn test_failed_backend_keeps_state() {
        let mut device = MockAnalog::new();
        device.fail_outputs(true);
        let mut power = PowerSequencer::new(AnalogPower::new(device));
        assert!(power.set_power_t30().is_err());
        assert_eq!(power.state(), PowerState::Off);
    }

    #[test]
    fn test_boxed_backends_are_interchangeable() {
        let backends: Vec<Box<dyn PowerControl>> = vec![
            Box::new(ManualPower::new(Box::new(io::sink()))),
            Box::new(AnalogPower::new(MockAnalog::new())),
        ];
        for backend in backends {
            let mut power = PowerSequencer::new(backend);
            power.set_power_t30().unwrap();
            assert_eq!(power.state(), PowerState::T30);
        }
    }
}
