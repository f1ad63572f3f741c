//! Test doubles for the transport and analog boundaries.
//!
//! Supports scripted receive queues and frame recording so the receiver and
//! session logic can be exercised without bench hardware.
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::bus::CanBus;
use crate::error::{AnalogError, BusError};
use crate::frame::Frame;
use crate::power::{AnalogIo, OutputLevel};

/// Mock CAN transport with a scripted receive queue and frame recording.
#[derive(Debug, Default)]
pub struct MockBus {
    /// Returned by `recv` in FIFO order.
    responses: VecDeque<Frame>,
    /// Returned forever once the queue is empty, simulating a stuck bus.
    chatter: Option<Frame>,
    sent: Vec<Frame>,
    polls: usize,
    shut_down: bool,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock pre-loaded with frames to receive.
    pub fn with_responses(responses: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            responses: responses.into_iter().collect(),
            ..Self::default()
        }
    }

    /// A bus that never falls quiet.
    pub fn chatty(frame: Frame) -> Self {
        Self {
            chatter: Some(frame),
            ..Self::default()
        }
    }

    pub fn queue_response(&mut self, frame: Frame) {
        self.responses.push_back(frame);
    }

    /// Frames passed to `send`, in order.
    pub fn sent(&self) -> &[Frame] {
        &self.sent
    }

    pub fn last_sent(&self) -> Option<&Frame> {
        self.sent.last()
    }

    /// Number of `recv` calls so far.
    pub fn polls(&self) -> usize {
        self.polls
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl CanBus for MockBus {
    fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
        if self.shut_down {
            return Err(BusError::Closed);
        }
        self.sent.push(*frame);
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration) -> Result<Option<Frame>, BusError> {
        if self.shut_down {
            return Err(BusError::Closed);
        }
        self.polls += 1;
        Ok(self.responses.pop_front().or(self.chatter))
    }

    fn shutdown(&mut self) {
        self.shut_down = true;
    }
}

/// Mock analog device: inputs are preset, outputs are remembered.
#[derive(Debug, Default)]
pub struct MockAnalog {
    inputs: BTreeMap<u8, u32>,
    outputs: BTreeMap<u8, OutputLevel>,
    fail_outputs: bool,
}

impl MockAnalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&mut self, channel: u8, millivolts: u32) {
        self.inputs.insert(channel, millivolts);
    }

    /// Last level written to an output.
    pub fn output(&self, channel: u8) -> Option<OutputLevel> {
        self.outputs.get(&channel).copied()
    }

    /// Make every `set_output` fail, as a disconnected device would.
    pub fn fail_outputs(&mut self, fail: bool) {
        self.fail_outputs = fail;
    }
}

impl AnalogIo for MockAnalog {
    fn read_input(&mut self, channel: u8) -> Result<u32, AnalogError> {
        self.inputs
            .get(&channel)
            .copied()
            .ok_or(AnalogError::NoChannel(channel))
    }

    fn set_output(&mut self, channel: u8, level: OutputLevel) -> Result<(), AnalogError> {
        if self.fail_outputs {
            return Err(AnalogError::Device("output stage not responding".into()));
        }
        self.outputs.insert(channel, level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_sent_frames() {
        let mut bus = MockBus::new();
        let frame = Frame::standard(0x21A, &[0x80, 0, 0xF7]).unwrap();
        bus.send(&frame).unwrap();
        assert_eq!(bus.sent(), &[frame]);
        assert_eq!(bus.last_sent(), Some(&frame));
    }

    #[test]
    fn test_returns_queued_responses_then_none() {
        let frame = Frame::standard(0x781, &[0, 0]).unwrap();
        let mut bus = MockBus::with_responses([frame]);
        assert_eq!(bus.recv(Duration::ZERO).unwrap(), Some(frame));
        assert_eq!(bus.recv(Duration::ZERO).unwrap(), None);
        assert_eq!(bus.polls(), 2);
    }

    #[test]
    fn test_chatty_never_quiet() {
        let frame = Frame::standard(0x781, &[0, 0]).unwrap();
        let mut bus = MockBus::chatty(frame);
        for _ in 0..10 {
            assert_eq!(bus.recv(Duration::ZERO).unwrap(), Some(frame));
        }
    }

    #[test]
    fn test_closed_after_shutdown() {
        let mut bus = MockBus::new();
        bus.shutdown();
        assert!(bus.is_shut_down());
        assert!(matches!(bus.recv(Duration::ZERO), Err(BusError::Closed)));
    }

    #[test]
    fn test_analog_channels() {
        let mut analog = MockAnalog::new();
        analog.set_input(3, 4_800);
        assert_eq!(analog.read_input(3).unwrap(), 4_800);
        assert!(matches!(analog.read_input(4), Err(AnalogError::NoChannel(4))));
        analog.set_output(1, OutputLevel::On).unwrap();
        assert_eq!(analog.output(1), Some(OutputLevel::On));
    }
}
