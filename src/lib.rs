//! Hardware-in-the-loop test harness for CAN body modules.
//!
//! Message definitions come from DBC files and drive a strict frame codec;
//! a session power-cycles the module over its T30/T15 rails and plays test
//! scenarios against it over any `CanBus` transport.
pub mod bus;
pub mod can_decoder;
pub mod can_encoder;
pub mod canlog_reader;
pub mod canlog_writer;
pub mod catalog;
pub mod config;
pub mod error;
pub mod frame;
pub mod messages;
pub mod mock;
pub mod power;
pub mod receiver;
pub mod scenario;
pub mod session;
pub mod signal_layout;
