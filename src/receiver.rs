//! Framed receive on top of a `CanBus`: filtering by arbitration ID, draining,
//! and passive detection of module resets.
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bus::CanBus;
use crate::can_decoder;
use crate::catalog::{Catalog, MessageDefinition, SIGN_ON_ID};
use crate::error::{BusError, CatalogError};
use crate::frame::Frame;
use crate::messages::SignOn;

/// Polls allowed by a default `drain`.
pub const DEFAULT_DRAIN_ATTEMPTS: usize = 100;
/// Per-poll timeout of a default `drain`.
pub const DEFAULT_DRAIN_QUIET: Duration = Duration::from_millis(1);

/// Owns the transport and hands out only the frames a caller asked for.
pub struct FilteredReceiver<B: CanBus> {
    bus: B,
    sign_on: Arc<MessageDefinition>,
    default_filter: Vec<u32>,
    resets_seen: usize,
    last_reset: Option<SignOn>,
}

impl<B: CanBus> FilteredReceiver<B> {
    pub fn new(bus: B, catalog: &Catalog) -> Result<Self, CatalogError> {
        Ok(Self {
            bus,
            sign_on: catalog.sign_on()?,
            default_filter: catalog.default_filter()?,
            resets_seen: 0,
            last_reset: None,
        })
    }

    pub fn default_filter(&self) -> &[u32] {
        &self.default_filter
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Resets noticed on frames the caller was not waiting for.
    pub fn resets_seen(&self) -> usize {
        self.resets_seen
    }

    pub fn last_reset(&self) -> Option<&SignOn> {
        self.last_reset.as_ref()
    }

    pub fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
        debug!("CAN TX: {frame}");
        self.bus.send(frame)
    }

    /// Wait up to `timeout` for a frame whose ID is in `filter`.
    ///
    /// Other frames are discarded. The transport is polled at least once, so a
    /// zero timeout checks for an already queued frame without blocking.
    pub fn receive(&mut self, timeout: Duration, filter: &[u32]) -> Result<Option<Frame>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(frame) = self.bus.recv(remaining)? else {
                return Ok(None);
            };
            if filter.contains(&frame.id()) {
                debug!("CAN RX: {frame}");
                return Ok(Some(frame));
            }
            self.sniff_sign_on(&frame);
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// `receive` with the default filter (sign-on and module status).
    pub fn receive_default(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        let filter = self.default_filter.clone();
        self.receive(timeout, &filter)
    }

    /// Discard buffered traffic. Returns `true` once a poll of `quiet` passes
    /// without a matching frame, `false` if the bus is still busy after
    /// `attempts` polls.
    pub fn drain(&mut self, attempts: usize, quiet: Duration) -> Result<bool, BusError> {
        for _ in 0..attempts {
            if self.receive_default(quiet)?.is_none() {
                return Ok(true);
            }
        }
        warn!(attempts, "bus still chatty after drain");
        Ok(false)
    }

    fn sniff_sign_on(&mut self, frame: &Frame) {
        if frame.id() != SIGN_ON_ID || !frame.is_extended() {
            return;
        }
        let Ok(message) = can_decoder::decode(&self.sign_on, frame) else {
            return;
        };
        if let Ok(sign_on) = SignOn::try_from(&message) {
            warn!("module reset due to {}", sign_on.reason);
            self.resets_seen += 1;
            self.last_reset = Some(sign_on);
        }
    }

    /// Release the transport.
    pub fn shutdown(&mut self) {
        self.bus.shutdown();
    }
}
