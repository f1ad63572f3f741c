//! Minimal abstraction for a blocking CAN transport, plus the delay hook the
//! session uses for settle times so tests can substitute virtual time.
use std::time::Duration;

use crate::error::BusError;
use crate::frame::Frame;

/// Contract to send and receive CAN frames.
pub trait CanBus {
    /// Put one frame on the bus.
    fn send(&mut self, frame: &Frame) -> Result<(), BusError>;
    /// Wait up to `timeout` for the next frame. `None` means the timeout elapsed;
    /// a zero timeout polls once without blocking.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError>;
    /// Release the transport. Called once when the owning session ends.
    fn shutdown(&mut self) {}
}

impl<B: CanBus + ?Sized> CanBus for Box<B> {
    fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
        (**self).send(frame)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        (**self).recv(timeout)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// Blocking pause between steps.
pub trait Delay {
    fn delay(&mut self, duration: Duration);
}

/// Wall-clock delay backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<D: Delay + ?Sized> Delay for Box<D> {
    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
}

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use self::socket::SocketCanBus;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
mod socket {
    use std::io;
    use std::time::{Duration, Instant};

    use socketcan::{
        CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId,
    };
    use tracing::info;

    use super::CanBus;
    use crate::error::{BusError, FrameError};
    use crate::frame::Frame;

    /// Linux SocketCAN transport. The interface must already be up:
    /// `ip link set can0 up type can bitrate 500000`.
    pub struct SocketCanBus {
        socket: Option<CanSocket>,
        channel: String,
    }

    impl SocketCanBus {
        pub fn open(channel: &str) -> Result<Self, BusError> {
            let socket = CanSocket::open(channel)?;
            info!(channel, "opened SocketCAN interface");
            Ok(Self {
                socket: Some(socket),
                channel: channel.to_owned(),
            })
        }

        fn socket(&self) -> Result<&CanSocket, BusError> {
            self.socket.as_ref().ok_or(BusError::Closed)
        }
    }

    fn to_socketcan(frame: &Frame) -> Result<CanFrame, BusError> {
        let id_error = || FrameError::IdOutOfRange {
            id: frame.id(),
            is_extended: frame.is_extended(),
        };
        let id: Id = if frame.is_extended() {
            ExtendedId::new(frame.id()).ok_or_else(id_error)?.into()
        } else {
            StandardId::new(frame.id() as u16)
                .ok_or_else(id_error)?
                .into()
        };
        let frame = CanFrame::new(id, frame.payload()).ok_or(FrameError::PayloadTooLong {
            len: frame.len(),
        })?;
        Ok(frame)
    }

    fn from_socketcan(frame: &CanFrame) -> Result<Frame, BusError> {
        let frame = match frame.id() {
            Id::Standard(id) => Frame::standard(id.as_raw() as u32, frame.data())?,
            Id::Extended(id) => Frame::extended(id.as_raw(), frame.data())?,
        };
        Ok(frame)
    }

    impl CanBus for SocketCanBus {
        fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
            let raw = to_socketcan(frame)?;
            self.socket()?.write_frame(&raw)?;
            Ok(())
        }

        fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
            let deadline = Instant::now() + timeout;
            loop {
                // A zero timeout would block forever on the socket
                let remaining = deadline
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_micros(1));
                match self.socket()?.read_frame_timeout(remaining) {
                    Ok(frame @ CanFrame::Data(_)) => return from_socketcan(&frame).map(Some),
                    // Remote and error frames are not part of the harness traffic
                    Ok(_) if Instant::now() < deadline => continue,
                    Ok(_) => return Ok(None),
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                        return Ok(None)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        fn shutdown(&mut self) {
            if self.socket.take().is_some() {
                info!(channel = %self.channel, "closed SocketCAN interface");
            }
        }
    }
}
