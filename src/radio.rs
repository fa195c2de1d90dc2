//! Radio driver interface.
//!
//! The MAC consumes an 802.15.4-class framing driver through the
//! [`RadioDriver`] trait. Every call is synchronous and returns immediately;
//! completion is reported later through the event callback, for which the
//! driver glue holds an [`EventSender`].
//!
//! # Callback contexts
//!
//! From hard-IRQ context the driver is expected to post only
//! [`RadioEvent::Isr`] and [`RadioEvent::RxPending`]; completion events come
//! from its soft-IRQ context. The [`EventSender`] never blocks: it flips the
//! shared `irq_pending` flag and `try_send`s into the mailbox.

use crate::frame::Frame;
use crate::worker::MacMsg;
use log::error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Radio power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Radio off, lowest power.
    Sleep,
    /// Radio powered but neither transmitting nor receiving.
    Idle,
    /// Receiver on.
    Rx,
}

/// Events the driver reports through the callback.
#[derive(Debug)]
pub enum RadioEvent {
    /// An interrupt fired; the MAC must run the driver's ISR body.
    Isr,
    /// A reception started or the peer flagged more pending frames.
    RxPending,
    /// A frame was received and is handed over.
    RxComplete(Frame),
    /// Transmission finished.
    TxComplete,
    /// Transmission finished and the peer has more frames queued for us.
    TxCompletePending,
    /// Carrier sense found the medium busy.
    TxMediumBusy,
    /// No acknowledgement arrived.
    TxNoAck,
}

/// Typed option surface shared by the upward SET/GET API and the driver.
///
/// The MAC intercepts `DutyCycling` and constrains `SourceAddressLength`;
/// everything else passes through transparently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOption {
    /// Enable or disable the duty-cycling leaf behavior.
    DutyCycling(bool),
    /// Source address length in octets; fixed at 2 while duty cycling.
    SourceAddressLength(u8),
    /// Short address.
    Address(u16),
    /// PAN identifier.
    PanId(u16),
    /// Channel number.
    Channel(u8),
    /// Transmit power in dBm.
    TxPower(i8),
    /// Direct power-state poke-through to the driver.
    PowerState(PowerState),
}

/// Keys for the GET side of the option surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOptionKey {
    DutyCycling,
    SourceAddressLength,
    Address,
    PanId,
    Channel,
    TxPower,
    PowerState,
}

/// Errors reported by the driver or the option surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The radio cannot take the request right now.
    Busy,
    /// The option or operation is not supported.
    NotSupported,
    /// Driver-specific failure.
    Driver(&'static str),
    /// The MAC worker is gone.
    Closed,
}

impl std::fmt::Display for RadioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => write!(f, "radio busy"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Driver(msg) => write!(f, "driver error: {}", msg),
            Self::Closed => write!(f, "MAC worker stopped"),
        }
    }
}

impl std::error::Error for RadioError {}

/// The framing driver the MAC drives.
///
/// `send`/`resend` borrow the frame: the transmit queue keeps ownership of
/// the buffer until the entry is head-removed after completion.
pub trait RadioDriver {
    /// Bring the radio up.
    fn init(&mut self) -> Result<(), RadioError>;

    /// Set a driver option.
    fn set_option(&mut self, option: &LinkOption) -> Result<(), RadioError>;

    /// Read a driver option.
    fn option(&self, key: LinkOptionKey) -> Result<LinkOption, RadioError>;

    /// Current power state.
    fn power_state(&self) -> PowerState;

    /// Change the power state.
    fn set_power_state(&mut self, state: PowerState) -> Result<(), RadioError>;

    /// Run the ISR body after an `Isr` event.
    fn isr(&mut self);

    /// Start transmitting a frame. Completion arrives as a `Tx*` event.
    fn send(&mut self, frame: &Frame) -> Result<(), RadioError>;

    /// Reissue a frame after a failed attempt.
    fn resend(&mut self, frame: &Frame) -> Result<(), RadioError>;

    /// Transmit a wakeup beacon.
    fn send_beacon(&mut self) -> Result<(), RadioError>;
}

/// Handle the driver glue uses to report events into the MAC.
///
/// Cloneable and safe to call from interrupt-adjacent contexts: posting
/// never blocks and never allocates.
#[derive(Clone)]
pub struct EventSender {
    irq_pending: Arc<AtomicBool>,
    mailbox: mpsc::Sender<MacMsg>,
}

impl EventSender {
    pub(crate) fn new(irq_pending: Arc<AtomicBool>, mailbox: mpsc::Sender<MacMsg>) -> Self {
        Self {
            irq_pending,
            mailbox,
        }
    }

    /// Post a driver event.
    ///
    /// For [`RadioEvent::Isr`] the shared `irq_pending` flag is raised
    /// before the message is posted, so the transmit policy observes the
    /// interrupt no matter how the mailbox interleaves it.
    pub fn post(&self, event: RadioEvent) {
        if matches!(event, RadioEvent::Isr) {
            self.irq_pending.store(true, Ordering::Release);
        }
        if self.mailbox.try_send(MacMsg::Radio(event)).is_err() {
            // A dropped radio event can wedge the transmit path; make it loud.
            error!("mailbox full or closed, radio event lost");
        }
    }
}
