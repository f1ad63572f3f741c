//! Typed views over the catalog: the messages the harness transmits and
//! semantic accessors for the ones it receives.
use std::fmt;

use crate::can_decoder::InboundMessage;
use crate::can_encoder::{self, FrameBuilder};
use crate::catalog::Catalog;
use crate::error::{DecodeError, EncodeError, SessionError};
use crate::frame::Frame;

/// Brake state byte reported by the brake controller.
pub const BRAKE_APPLIED: i64 = 32;
pub const BRAKE_RELEASED: i64 = 3;

/// Engine speed is transmitted in quarter-rpm units.
pub const RPM_SCALE: u32 = 4;

/// Fuel-sender voltage resolution in the tail status report.
pub const FUEL_SENDER_MV_PER_BIT: u32 = 50;

/// Gear lever position on the gear selector message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gear {
    Park,
    Reverse,
    Neutral,
    Drive,
}

impl Gear {
    pub fn code(self) -> u8 {
        match self {
            Gear::Park => 0xE1,
            Gear::Reverse => 0xD2,
            Gear::Neutral => 0xB4,
            Gear::Drive => 0x78,
        }
    }

    /// Letter the PDM reports for this gear.
    pub fn letter(self) -> char {
        match self {
            Gear::Park => 'P',
            Gear::Reverse => 'R',
            Gear::Neutral => 'N',
            Gear::Drive => 'D',
        }
    }
}

/// Light switch positions carried by the light control message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LightRequest {
    pub brake: bool,
    pub tail: bool,
    pub rain: bool,
    pub reverse: bool,
}

/// Every kind of frame the harness puts on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    Brake { applied: bool },
    Lights(LightRequest),
    Debug { enable: bool },
    EngineSpeed { rpm: u32 },
    GearSelector { gear: Gear, engine_running: bool },
    KeypadBoot,
    KeypadModel { rows: u8, columns: u8 },
    KeypadKeys { pressed: u16 },
}

impl Outbound {
    /// Catalog kind name this message encodes as.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Brake { .. } => "BrakeControl",
            Outbound::Lights(_) => "LightControl",
            Outbound::Debug { .. } => "DebugControl",
            Outbound::EngineSpeed { .. } => "EngineSpeed",
            Outbound::GearSelector { .. } => "GearSelector",
            Outbound::KeypadBoot => "KeypadBoot",
            Outbound::KeypadModel { .. } => "KeypadModel",
            Outbound::KeypadKeys { .. } => "KeypadKeys",
        }
    }

    /// Encode into exactly one frame using the catalog's definition.
    pub fn encode(&self, catalog: &Catalog) -> Result<Frame, SessionError> {
        let definition = catalog.get(self.kind())?;
        let frame = match *self {
            Outbound::Brake { applied } => {
                let state = if applied { BRAKE_APPLIED } else { BRAKE_RELEASED };
                can_encoder::encode(&definition, &[("brake_state", state)], &[])?
            }
            Outbound::Lights(request) => can_encoder::encode(
                &definition,
                &[],
                &[
                    ("brake", request.brake),
                    ("tail", request.tail),
                    ("rain", request.rain),
                    ("reverse", request.reverse),
                ],
            )?,
            Outbound::Debug { enable } => {
                can_encoder::encode(&definition, &[("enable", enable as i64)], &[])?
            }
            Outbound::EngineSpeed { rpm } => {
                let raw = rpm as i64 * RPM_SCALE as i64;
                can_encoder::encode(&definition, &[("engine_speed", raw)], &[])?
            }
            Outbound::GearSelector {
                gear,
                engine_running,
            } => can_encoder::encode(
                &definition,
                &[("gear", gear.code() as i64), ("engine", engine_running as i64)],
                &[],
            )?,
            Outbound::KeypadBoot => can_encoder::encode(&definition, &[], &[])?,
            Outbound::KeypadModel { rows, columns } => FrameBuilder::new(&definition)
                .set("rows", ascii_digit("rows", rows)?)?
                .set("columns", ascii_digit("columns", columns)?)?
                .build()?,
            Outbound::KeypadKeys { pressed } => can_encoder::encode(
                &definition,
                &[
                    ("keys_low", (pressed & 0xFF) as i64),
                    ("keys_high", (pressed >> 8) as i64),
                ],
                &[],
            )?,
        };
        Ok(frame)
    }
}

fn ascii_digit(field: &str, value: u8) -> Result<i64, EncodeError> {
    if value > 9 {
        return Err(EncodeError::OutOfRange {
            field: field.to_owned(),
            value: value as i64,
            min: 0,
            max: 9,
        });
    }
    Ok((b'0' + value) as i64)
}

/// Why the module (re)started, from the sign-on message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    PowerOn,
    Reset,
    LowVoltageReset,
    ClockLost,
    AddressError,
    IllegalOpcode,
    WatchdogTimeout,
    Unknown(u8),
}

impl From<u8> for ResetReason {
    fn from(code: u8) -> Self {
        match code {
            0x00 => ResetReason::PowerOn,
            0x01 => ResetReason::Reset,
            0x11 => ResetReason::LowVoltageReset,
            0x21 => ResetReason::ClockLost,
            0x31 => ResetReason::AddressError,
            0x41 => ResetReason::IllegalOpcode,
            0x51 => ResetReason::WatchdogTimeout,
            other => ResetReason::Unknown(other),
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetReason::PowerOn => f.write_str("power-on"),
            ResetReason::Reset => f.write_str("reset"),
            ResetReason::LowVoltageReset => f.write_str("low-voltage reset"),
            ResetReason::ClockLost => f.write_str("clock lost"),
            ResetReason::AddressError => f.write_str("address error"),
            ResetReason::IllegalOpcode => f.write_str("illegal opcode"),
            ResetReason::WatchdogTimeout => f.write_str("watchdog timeout"),
            ResetReason::Unknown(code) => write!(f, "unknown ({code:#04x})"),
        }
    }
}

/// Application status from the sign-on message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Ok,
    /// Bootloader is running with no valid application.
    NoProgram,
    Unknown(u8),
}

impl From<u8> for ModuleStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => ModuleStatus::Ok,
            4 => ModuleStatus::NoProgram,
            other => ModuleStatus::Unknown(other),
        }
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::Ok => f.write_str("OK"),
            ModuleStatus::NoProgram => f.write_str("NO PROG"),
            ModuleStatus::Unknown(code) => write!(f, "unknown ({code:#04x})"),
        }
    }
}

/// Decoded sign-on (power-on acknowledgement) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignOn {
    pub reason: ResetReason,
    pub module_id: u32,
    pub status: ModuleStatus,
    pub sw_version: u16,
}

impl TryFrom<&InboundMessage> for SignOn {
    type Error = DecodeError;

    fn try_from(message: &InboundMessage) -> Result<Self, Self::Error> {
        Ok(SignOn {
            reason: ResetReason::from(message.field("reason")? as u8),
            module_id: message.field("module_id")? as u32,
            status: ModuleStatus::from(message.field("status")? as u8),
            sw_version: message.field("sw_version")? as u16,
        })
    }
}

impl fmt::Display for SignOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "module {:#x} sw {} status {} after {}",
            self.module_id, self.sw_version, self.status, self.reason
        )
    }
}

/// Engine speed in rpm from a PDM status report.
pub fn engine_rpm(status: &InboundMessage) -> Result<u32, DecodeError> {
    Ok(status.field("engine_rpm")? as u32)
}

/// Selected gear letter from a PDM status report (`\0` when none is known yet).
pub fn selected_gear(status: &InboundMessage) -> Result<char, DecodeError> {
    Ok(status.field("selected_gear")? as u8 as char)
}

/// Fuel-sender voltage in millivolts from a tail status report carrying it.
pub fn fuel_sender_mv(status: &InboundMessage) -> Result<u32, DecodeError> {
    Ok(status.field("fuel_sender")? as u32 * FUEL_SENDER_MV_PER_BIT)
}
