//! Duty-cycling MAC adaptation layer for battery-powered leaf nodes.
//!
//! Sits between an 802.15.4-class radio driver and a network-layer
//! dispatcher and decides when the radio is on: sleep most of the time, wake
//! to announce availability with a beacon, drain pending transmissions and
//! solicited receptions, then go back to sleep. Idle nodes back their wake
//! interval off exponentially; productive nodes snap back to the minimum.
//!
//! This module contains:
//! - [`config`]: duty-cycle intervals, queue bounds and retry budgets
//! - [`frame`]: move-only frame handles and queue entries
//! - [`queue`]: the bounded transmit FIFO
//! - [`governor`]: the sleep-interval governor
//! - [`retry`]: the CSMA / retransmission helper
//! - [`radio`]: the consumed radio driver interface
//! - [`core`]: the duty-cycle state machine
//! - [`worker`]: the event loop and the public [`Mac`] handle
//!
//! # Example
//!
//! ```ignore
//! use leafmac::{Mac, MacConfig, Frame, SenderId};
//!
//! let (delivery_tx, mut delivery_rx) = tokio::sync::mpsc::channel(16);
//! let mac = Mac::spawn(radio, MacConfig::default(), delivery_tx)?;
//!
//! // Wire the driver's event callback to the MAC.
//! driver_glue.set_callback(mac.event_sender());
//!
//! mac.enable().await?;
//! mac.send(SenderId(1), Frame::new(payload)).await?;
//!
//! while let Some(frame) = delivery_rx.recv().await {
//!     // frames received during listen windows arrive here
//! }
//! ```

pub mod config;
pub mod core;
pub mod frame;
pub mod governor;
pub mod queue;
pub mod radio;
pub mod retry;
pub mod worker;

// Re-export commonly used items
pub use crate::core::{Core, DutyState, Effects, Post, TimerOp};
pub use config::{ConfigError, MacConfig, RetryConfig};
pub use frame::{Frame, QueueEntry, SenderId, TxKind};
pub use governor::IntervalGovernor;
pub use queue::{QueueFull, TransmitQueue};
pub use radio::{
    EventSender, LinkOption, LinkOptionKey, PowerState, RadioDriver, RadioError, RadioEvent,
};
pub use retry::{LinkRetry, RetryDecision};
pub use worker::{Mac, MacError, MacMsg, SendError};
