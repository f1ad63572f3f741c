//! Error definitions shared across the harness modules.
//! Codec errors stay local to the frame they concern; session-level errors
//! wrap them together with transport and power failures.
use std::io;

use thiserror::Error;

use crate::frame::Frame;

//==================================================================================FRAME_ERROR
#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// A raw frame could not be constructed.
pub enum FrameError {
    /// Identifier does not fit the 11-bit or 29-bit ID format.
    #[error("ID {id:#x} out of range (extended: {is_extended})")]
    IdOutOfRange { id: u32, is_extended: bool },
    /// Classic CAN carries at most 8 data bytes.
    #[error("payload of {len} bytes exceeds 8")]
    PayloadTooLong { len: usize },
}

//==================================================================================CATALOG_ERROR
#[derive(Error, Debug)]
/// Failures while loading or querying the message catalog.
pub enum CatalogError {
    /// DBC text could not be parsed.
    #[error("failed to parse DBC {source_name}: {reason}")]
    Parse { source_name: String, reason: String },
    /// DBC file could not be read.
    #[error("failed to read DBC {path}: {source}")]
    Io { path: String, source: io::Error },
    /// Signal does not follow the field / bit-field conventions.
    #[error("unsupported signal {message}.{signal}: {reason}")]
    UnsupportedSignal {
        message: String,
        signal: String,
        reason: &'static str,
    },
    /// Layout fields leave a hole or overlap.
    #[error("layout of {message} is not contiguous at byte {offset}")]
    LayoutGap { message: String, offset: usize },
    /// Layout fields do not add up to the declared payload length.
    #[error("layout of {message} covers {covered} bytes but the message declares {declared}")]
    LayoutLength {
        message: String,
        declared: usize,
        covered: usize,
    },
    /// A bit-field lands on a byte that no layout field covers.
    #[error("bit-field {message}.{signal} is outside every layout field")]
    OrphanBit { message: String, signal: String },
    /// Two sources define the same message name.
    #[error("message {0} defined more than once")]
    DuplicateMessage(String),
    /// Name does not match any module variant.
    #[error("unknown module variant {0}")]
    UnknownVariant(String),
    /// No definition with this kind name.
    #[error("unknown message kind {0}")]
    UnknownMessage(String),
}

//==================================================================================CODEC_ERROR
#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// Issues encountered while encoding a message into a frame.
pub enum EncodeError {
    /// Value does not fit the field width; never truncated.
    #[error("value {value} out of range for {field} ({min}..={max})")]
    OutOfRange {
        field: String,
        value: i64,
        min: i64,
        max: i64,
    },
    /// Field or bit-field name not part of the definition.
    #[error("{message} has no field {field}")]
    UnknownField { message: String, field: String },
    /// Attempt to override a fixed field with another value.
    #[error("{field} is fixed to {expected}, got {value}")]
    FixedField {
        field: String,
        expected: i64,
        value: i64,
    },
    /// Frame construction rejected the definition's ID.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// Errors raised while validating a received frame against a definition.
pub enum DecodeError {
    /// Frame carries another identifier (or ID format).
    #[error(
        "expected ID {expected_id:#x} (extended: {expected_extended}) \
         but got {actual_id:#x} (extended: {actual_extended})"
    )]
    IdentityMismatch {
        expected_id: u32,
        expected_extended: bool,
        actual_id: u32,
        actual_extended: bool,
    },
    /// Payload length differs from the layout width.
    #[error("expected length {expected} but got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    /// A fixed field holds another value.
    #[error("field {index} is {actual:#x} but expected {expected:#x}")]
    FieldConstraintViolation {
        index: usize,
        expected: i64,
        actual: i64,
    },
    /// Accessor asked for a name the definition does not have.
    #[error("{message} has no field {field}")]
    UnknownField { message: String, field: String },
}

//==================================================================================IO_ERRORS
#[derive(Error, Debug)]
/// Transport failures.
pub enum BusError {
    #[error("CAN transport I/O error: {0}")]
    Io(#[from] io::Error),
    /// Received data could not be turned into a frame.
    #[error("invalid frame from transport: {0}")]
    InvalidFrame(#[from] FrameError),
    /// The bus was already shut down.
    #[error("CAN transport closed")]
    Closed,
}

#[derive(Error, Debug)]
/// Analog I/O failures.
pub enum AnalogError {
    #[error("no analog channel {0}")]
    NoChannel(u8),
    #[error("analog device error: {0}")]
    Device(String),
}

#[derive(Error, Debug)]
/// Power backend failures.
pub enum PowerError {
    /// Operator prompt could not be written.
    #[error("failed to prompt operator: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Analog(#[from] AnalogError),
}

//==================================================================================SESSION_ERROR
#[derive(Error, Debug)]
/// The module did something unexpected during startup. Always fatal.
pub enum ModuleError {
    #[error("no power-on message from module within {timeout_ms} ms")]
    NoPowerOn { timeout_ms: u64 },
    #[error("unexpected power-on message from module: {frame}")]
    UnexpectedPowerOn { frame: Frame, source: DecodeError },
}

#[derive(Error, Debug)]
/// Errors surfaced by the session controller.
pub enum SessionError {
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Power(#[from] PowerError),
    #[error(transparent)]
    Analog(#[from] AnalogError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Nothing matching arrived inside the window.
    #[error("timed out after {timeout_ms} ms waiting for {what}")]
    Timeout { what: String, timeout_ms: u64 },
    /// The active power backend has no analog device to sample.
    #[error("power backend has no analog inputs")]
    NoAnalogDevice,
}

#[derive(Error, Debug)]
/// A scenario step failed.
pub enum ScenarioError {
    #[error(transparent)]
    Session(#[from] SessionError),
    /// An expectation on received data did not hold.
    #[error("check failed: {0}")]
    Check(String),
}
