/*!
 * Reading candump logs, and replaying them as a CAN transport
 */

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor};
use std::num::ParseIntError;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::bus::CanBus;
use crate::error::BusError;
use crate::frame::{Frame, MAX_PAYLOAD_LEN};

/// One line of a candump log.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedFrame {
    /// Time the frame was captured (seconds)
    pub timestamp: f64,
    /// Name of the CAN interface the frame was seen on
    pub channel: String,
    pub frame: Frame,
}

/*
(1436509052.249713) vcan0 781#0306
(1436509052.449847) vcan0 1FFFFFF0#0000000000000000
(1436509052.650004) vcan0 0A8#5400000000F00F20
*/

/// Turn hex data from a candump log into byte values
pub fn candump_hex_to_bytes(hex_str: &str) -> anyhow::Result<Vec<u8>> {
    if !hex_str.is_ascii() {
        anyhow::bail!("non-ASCII characters in payload {hex_str}");
    }
    if hex_str.len() % 2 != 0 {
        anyhow::bail!("odd number of hex digits in {hex_str}");
    }
    if hex_str.len() / 2 > MAX_PAYLOAD_LEN {
        anyhow::bail!("payload {hex_str} longer than {MAX_PAYLOAD_LEN} bytes");
    }
    let bytes = (0..hex_str.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex_str[i..i + 2], 16))
        .collect::<Result<Vec<u8>, ParseIntError>>()?;
    Ok(bytes)
}

/// Parse a line in candump format
/// (1436509053.850870) vcan0 1A0#9C20407F96EA167B
///
/// An identifier written with 8 hex digits is an extended (29-bit) ID.
/// ```
/// let logged = benchcan::canlog_reader::parse_candump_line("(1436509053.850870) vcan0 781#0306").unwrap();
/// assert_eq!(logged.frame.id(), 0x781);
/// ```
pub fn parse_candump_line(line: &str) -> anyhow::Result<LoggedFrame> {
    let mut line_splits = line.split_whitespace();
    let timestamp = line_splits
        .next()
        .ok_or_else(|| anyhow::anyhow!("Error parsing timestamp of {line}"))?;
    let timestamp = timestamp
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| anyhow::anyhow!("Timestamp not in parentheses on {line}"))?
        .parse::<f64>()?;
    let channel = line_splits
        .next()
        .ok_or_else(|| anyhow::anyhow!("Error parsing interface of {line}"))?;
    let id_and_data = line_splits
        .next()
        .ok_or_else(|| anyhow::anyhow!("Error no id#data on {line}"))?;
    if id_and_data.contains("##") {
        anyhow::bail!("CAN FD frames are not supported: {line}");
    }
    let (id_str, data_str) = id_and_data
        .split_once('#')
        .ok_or_else(|| anyhow::anyhow!("Error no '#' separator on {line}"))?;
    let id = u32::from_str_radix(id_str, 16)?;
    let is_extended = id_str.len() == 8;
    let data = candump_hex_to_bytes(data_str)?;
    let frame = Frame::new(id, is_extended, &data)?;
    Ok(LoggedFrame {
        timestamp,
        channel: channel.to_owned(),
        frame,
    })
}

/// Iterator over the frames of a candump log.
///
/// Lines that do not parse are skipped with a warning.
pub struct CanLogParser {
    reader: Box<dyn BufRead>,
    buf: String, // local buf to re-use so we don't keep allocating
    line_number: usize,
}

impl CanLogParser {
    /// Create CanLogParser from a file path
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::from_reader(BufReader::new(file)))
    }

    /// Create CanLogParser from raw bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::from_reader(Cursor::new(bytes))
    }

    /// Create CanLogParser from any type that implements the BufRead trait
    pub fn from_reader<R: BufRead + 'static>(reader: R) -> Self {
        Self {
            reader: Box::new(reader),
            buf: String::new(),
            line_number: 0,
        }
    }
}

impl Iterator for CanLogParser {
    type Item = LoggedFrame;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line_number += 1;
                    if self.buf.trim().is_empty() {
                        continue;
                    }
                    match parse_candump_line(&self.buf) {
                        Ok(logged) => return Some(logged),
                        Err(e) => warn!(line = self.line_number, "skipping log line: {e}"),
                    }
                }
                Err(e) => {
                    warn!("stopped reading log: {e}");
                    return None;
                }
            }
        }
    }
}

/// Transport that plays back a recorded log.
///
/// Frames are served in log order, paced in virtual time: each `recv` advances
/// a clock by at most its timeout and hands out the next frame only once the
/// clock reaches that frame's offset from the first timestamp. Sent frames are
/// recorded rather than transmitted.
pub struct ReplayBus {
    frames: VecDeque<LoggedFrame>,
    start: Option<f64>,
    clock: Duration,
    sent: Vec<Frame>,
}

impl ReplayBus {
    pub fn new(frames: impl IntoIterator<Item = LoggedFrame>) -> Self {
        let frames: VecDeque<LoggedFrame> = frames.into_iter().collect();
        let start = frames.front().map(|logged| logged.timestamp);
        Self {
            frames,
            start,
            clock: Duration::ZERO,
            sent: Vec::new(),
        }
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        Ok(Self::new(CanLogParser::from_file(path)?))
    }

    /// Frames still waiting to be served.
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    /// Frames passed to `send`, in order.
    pub fn sent(&self) -> &[Frame] {
        &self.sent
    }

    fn offset_of(&self, logged: &LoggedFrame) -> Duration {
        let start = self.start.unwrap_or(logged.timestamp);
        Duration::from_secs_f64((logged.timestamp - start).max(0.0))
    }
}

impl CanBus for ReplayBus {
    fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
        debug!(%frame, "replay TX");
        self.sent.push(*frame);
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        let Some(next) = self.frames.front() else {
            self.clock += timeout;
            return Ok(None);
        };
        let due = self.offset_of(next);
        if due > self.clock + timeout {
            self.clock += timeout;
            return Ok(None);
        }
        self.clock = self.clock.max(due);
        Ok(self.frames.pop_front().map(|logged| logged.frame))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_candump_hex_data() {
        let result = candump_hex_to_bytes("010211120A0B").unwrap();
        assert_eq!(result, vec![1u8, 2, 17, 18, 10, 11]);
        assert!(candump_hex_to_bytes("123").is_err());
        assert!(candump_hex_to_bytes("0011223344556677889900").is_err());
        assert!(candump_hex_to_bytes("ZZ").is_err());
    }

    #[test]
    fn test_candump_standard_id() {
        let logged = parse_candump_line("(1769227752.525818) vcan1 123#1122334455667788").unwrap();
        assert_eq!(logged.timestamp, 1769227752.525818);
        assert_eq!(logged.channel, "vcan1");
        assert_eq!(logged.frame.id(), 0x123);
        assert!(!logged.frame.is_extended());
        assert_eq!(
            logged.frame.payload(),
            &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
    }

    #[test]
    fn test_candump_extended_id() {
        let logged = parse_candump_line("(1.0) can0 1FFFFFF0#0000001234040102").unwrap();
        assert!(logged.frame.is_extended());
        assert_eq!(logged.frame.id(), 0x1FFF_FFF0);

        // 8 hex digits mark an extended ID even when the value would fit 11 bits
        let logged = parse_candump_line("(1.0) can0 00000123#").unwrap();
        assert!(logged.frame.is_extended());
        assert!(logged.frame.is_empty());
    }

    #[test]
    fn test_candump_rejects_bad_lines() {
        assert!(parse_candump_line("").is_err());
        assert!(parse_candump_line("1.0 vcan0 123#00").is_err());
        assert!(parse_candump_line("(1.0) vcan0 123").is_err());
        assert!(parse_candump_line("(1.0) vcan0 123##400").is_err());
        assert!(parse_candump_line("(1.0) vcan0 800#00").is_err());
    }

    #[test]
    fn test_parser_skips_garbage() {
        let log = b"(0.0) vcan0 781#0306\n\
                    not a frame\n\
                    \n\
                    (0.25) vcan0 781#0307\n"
            .to_vec();
        let frames: Vec<LoggedFrame> = CanLogParser::from_bytes(log).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].frame.payload(), &[0x03, 0x07]);
    }

    #[test]
    fn test_parser_skips_non_ascii_payload() {
        assert!(candump_hex_to_bytes("0\u{e9}0").is_err());

        let log = "(0.0) vcan0 781#0306\n\
                   (0.1) vcan0 781#0\u{e9}0\n\
                   (0.2) vcan0 781#0307\n"
            .as_bytes()
            .to_vec();
        let frames: Vec<LoggedFrame> = CanLogParser::from_bytes(log).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].frame.payload(), &[0x03, 0x07]);
    }

    #[test]
    fn test_parser_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(10.0) vcan0 0A8#5400000000F00F20").unwrap();
        writeln!(file, "(10.5) vcan0 21A#8000F7").unwrap();
        let frames: Vec<LoggedFrame> = CanLogParser::from_file(file.path()).unwrap().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame.id(), 0xA8);
    }

    #[test]
    fn test_replay_paces_frames_in_virtual_time() {
        let log = b"(100.0) vcan0 781#0000\n\
                    (100.5) vcan0 781#0001\n"
            .to_vec();
        let mut bus = ReplayBus::new(CanLogParser::from_bytes(log));
        assert_eq!(bus.remaining(), 2);

        // First frame is due immediately
        let first = bus.recv(Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.payload(), &[0, 0]);

        // Second one is 500 ms later
        assert!(bus.recv(Duration::from_millis(200)).unwrap().is_none());
        assert!(bus.recv(Duration::from_millis(200)).unwrap().is_none());
        let second = bus.recv(Duration::from_millis(200)).unwrap().unwrap();
        assert_eq!(second.payload(), &[0, 1]);

        assert!(bus.recv(Duration::from_secs(1)).unwrap().is_none());
    }

    #[test]
    fn test_replay_records_sent() {
        let mut bus = ReplayBus::new(Vec::new());
        let frame = Frame::standard(0x7FF, b"debug\x01").unwrap();
        bus.send(&frame).unwrap();
        assert_eq!(bus.sent(), &[frame]);
    }
}
