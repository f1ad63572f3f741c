/*!
 * Interfaces to write CAN frames to output log files
 */

use std::io::{self, Write};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::bus::CanBus;
use crate::canlog_reader::LoggedFrame;
use crate::error::BusError;
use crate::frame::Frame;

/// Convert a logged frame to an ascii candump line
/// Example: (1436509053.850870) vcan0 1A0#9C20407F96EA167B
pub fn frame_to_candump_line(logged: &LoggedFrame) -> String {
    format!(
        "({:.6}) {} {}",
        logged.timestamp, logged.channel, logged.frame
    )
}

/// Writes frames as candump lines to any `io::Write`.
pub struct CanLogWriter<W: Write> {
    writer: W,
    channel: String,
    frames_written: usize,
}

impl<W: Write> CanLogWriter<W> {
    pub fn new(writer: W, channel: &str) -> Self {
        Self {
            writer,
            channel: channel.to_owned(),
            frames_written: 0,
        }
    }

    /// Append one frame captured at `timestamp` seconds.
    pub fn write_frame(&mut self, timestamp: f64, frame: &Frame) -> io::Result<()> {
        let logged = LoggedFrame {
            timestamp,
            channel: self.channel.clone(),
            frame: *frame,
        };
        writeln!(self.writer, "{}", frame_to_candump_line(&logged))?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Transport wrapper that records all traffic, both directions, to a log.
///
/// Timestamps are seconds since the wrapper was created. A failing log write
/// is reported once and then ignored, the bus keeps working.
pub struct CaptureBus<B: CanBus, W: Write> {
    inner: B,
    log: CanLogWriter<W>,
    started: Instant,
    log_failed: bool,
}

impl<B: CanBus, W: Write> CaptureBus<B, W> {
    pub fn new(inner: B, log: CanLogWriter<W>) -> Self {
        Self {
            inner,
            log,
            started: Instant::now(),
            log_failed: false,
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn log(&self) -> &CanLogWriter<W> {
        &self.log
    }

    fn record(&mut self, frame: &Frame) {
        if self.log_failed {
            return;
        }
        let timestamp = self.started.elapsed().as_secs_f64();
        if let Err(err) = self.log.write_frame(timestamp, frame) {
            warn!("capture stopped: {err}");
            self.log_failed = true;
        }
    }
}

impl<B: CanBus, W: Write> CanBus for CaptureBus<B, W> {
    fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
        self.inner.send(frame)?;
        self.record(frame);
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        let frame = self.inner.recv(timeout)?;
        if let Some(frame) = &frame {
            self.record(frame);
        }
        Ok(frame)
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.log.flush() {
            warn!("flushing capture failed: {err}");
        }
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canlog_reader::{self, CanLogParser};
    use crate::mock::MockBus;

    #[test]
    fn test_frame_to_candump_line() {
        let expected_line = "(1436509053.850870) vcan0 1A0#9C20407F96EA167B";
        let logged = LoggedFrame {
            timestamp: 1436509053.850870,
            channel: "vcan0".to_string(),
            frame: Frame::standard(0x1A0, &[0x9C, 0x20, 0x40, 0x7F, 0x96, 0xEA, 0x16, 0x7B])
                .unwrap(),
        };
        assert_eq!(frame_to_candump_line(&logged), expected_line);
    }

    #[test]
    fn test_extended_line_reads_back() {
        let line = "(1769227442.503764) vcan1 1FFFFFF0#0000001234040102";
        let logged = canlog_reader::parse_candump_line(line).unwrap();
        assert_eq!(frame_to_candump_line(&logged), line);
    }

    #[test]
    fn test_writer_output_parses() {
        let mut writer = CanLogWriter::new(Vec::new(), "can0");
        writer
            .write_frame(0.0, &Frame::standard(0x21A, &[0x80, 0x00, 0xF7]).unwrap())
            .unwrap();
        writer
            .write_frame(0.25, &Frame::extended(0x1FFF_FFFE, b"hi").unwrap())
            .unwrap();
        assert_eq!(writer.frames_written(), 2);

        let bytes = writer.into_inner();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            "(0.000000) can0 21A#8000F7\n(0.250000) can0 1FFFFFFE#6869\n"
        );
        let frames: Vec<LoggedFrame> = CanLogParser::from_bytes(bytes).collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].frame.is_extended());
    }

    #[test]
    fn test_capture_records_both_directions() {
        let status = Frame::standard(0x781, &[0, 4]).unwrap();
        let brake = Frame::standard(0xA8, &[0x54, 0, 0, 0, 0, 0xF0, 0x0F, 0x20]).unwrap();
        let mut bus = CaptureBus::new(
            MockBus::with_responses([status]),
            CanLogWriter::new(Vec::new(), "can0"),
        );
        bus.send(&brake).unwrap();
        assert_eq!(bus.recv(Duration::ZERO).unwrap(), Some(status));
        assert_eq!(bus.recv(Duration::ZERO).unwrap(), None);
        bus.shutdown();
        assert!(bus.inner().is_shut_down());
        assert_eq!(bus.log().frames_written(), 2);

        let CaptureBus { log, .. } = bus;
        let frames: Vec<Frame> = CanLogParser::from_bytes(log.into_inner())
            .map(|logged| logged.frame)
            .collect();
        assert_eq!(frames, [brake, status]);
    }

    #[test]
    fn test_capture_survives_broken_log() {
        struct Broken;

        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let status = Frame::standard(0x781, &[0, 4]).unwrap();
        let mut bus = CaptureBus::new(
            MockBus::with_responses([status]),
            CanLogWriter::new(Broken, "can0"),
        );
        assert_eq!(bus.recv(Duration::ZERO).unwrap(), Some(status));
        bus.send(&status).unwrap();
        assert_eq!(bus.log().frames_written(), 0);
        assert_eq!(bus.inner().sent(), &[status]);
    }
}
