//! Duty-cycle state machine.
//!
//! Orchestrates SLEEP/BEACON/DATA/LISTEN transitions for a battery-powered
//! leaf node. The machine is pure and synchronous: every mailbox message
//! maps to one handler which mutates the state and returns the [`Effects`]
//! the event loop must apply (self-posts, timer operations, scheduled
//! retransmissions, upward deliveries). That keeps the whole protocol
//! host-testable against a mock radio, with no runtime in the loop.
//!
//! # Safe transmit policy
//!
//! A transmission or beacon is launched only while `!radio_busy`,
//! `!irq_pending` and the radio is not receiving. A beacon wanted while the
//! policy fails is remembered in `beacon_pending` and drained exactly once
//! after the next ISR completes with the radio available.

use crate::config::{ConfigError, MacConfig};
use crate::frame::{Frame, QueueEntry, SenderId, TxKind};
use crate::governor::IntervalGovernor;
use crate::queue::{QueueFull, TransmitQueue};
use crate::radio::{LinkOption, LinkOptionKey, PowerState, RadioDriver, RadioError, RadioEvent};
use crate::retry::{LinkRetry, RetryDecision};
use crate::worker::SendError;
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// States of the duty-cycle machine. Starts in `Init`; runs forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyState {
    /// Duty cycling disabled; the core passes messages through.
    Init,
    /// Radio off, waiting for the next wake.
    Sleep,
    /// Waking to announce availability.
    TxBeacon,
    /// Draining the transmit queue.
    TxData,
    /// Draining the transmit queue, beacon owed afterwards.
    TxDataBeforeBeacon,
    /// Listen window held open for solicited receptions.
    Listen,
}

impl DutyState {
    /// True for the data-draining states.
    fn is_tx_data(self) -> bool {
        matches!(self, DutyState::TxData | DutyState::TxDataBeforeBeacon)
    }
}

/// Booleans co-owned by the state machine.
#[derive(Debug, Default)]
struct RadioFlags {
    /// A transmission is in flight (or owed a retry).
    radio_busy: bool,
    /// A beacon was wanted while the radio was unavailable.
    beacon_pending: bool,
    /// The peer flagged more frames during the last reception.
    additional_wakeup: bool,
    /// The in-flight transmission is a beacon, not a data frame.
    sending_beacon: bool,
    /// The in-flight transmission is a reissue.
    retry_rexmit: bool,
}

/// Messages the state machine posts back into its own mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Post {
    /// Evaluate the current state (radio power, timers, pending transmits).
    DutyEvent,
    /// Try transmitting the queue head without removing it.
    CheckQueue,
    /// Remove the head and continue the drain.
    RemoveQueue,
}

/// Duty-timer operation requested by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    /// Stop the pending wake.
    Cancel,
    /// Replace the pending wake; implies cancellation of the previous one.
    Rearm(Duration),
}

/// Side effects of one handled message, applied by the event loop.
#[derive(Debug, Default)]
pub struct Effects {
    /// Self-posts, in order.
    pub posts: Vec<Post>,
    /// Duty-timer operation.
    pub timer: Option<TimerOp>,
    /// Schedule a retransmission message after the backoff: `(delay, deferrals)`.
    pub retransmit_in: Option<(Duration, u8)>,
    /// Frames to deliver to the upper layer.
    pub deliver: Vec<Frame>,
}

/// The duty-cycle core: state machine, transmit queue, interval governor
/// and retry helper, driving a [`RadioDriver`].
pub struct Core<R: RadioDriver> {
    config: MacConfig,
    radio: R,
    state: DutyState,
    flags: RadioFlags,
    /// Raised by the driver callback before the ISR message lands; the
    /// transmit policy reads it so either interleaving is tolerated.
    irq_pending: Arc<AtomicBool>,
    queue: TransmitQueue,
    governor: IntervalGovernor,
    retry: LinkRetry,
    dutycycling: bool,
    /// LCG state for the randomized first wake and deferral jitter.
    rng_state: u32,
}

impl<R: RadioDriver> Core<R> {
    /// Create a core over a radio driver. The config is validated here so a
    /// bad setup never reaches the event loop.
    pub fn new(radio: R, config: MacConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            governor: IntervalGovernor::new(config.interval_min, config.interval_max),
            queue: TransmitQueue::new(config.queue_capacity),
            retry: LinkRetry::new(config.retry),
            config,
            radio,
            state: DutyState::Init,
            flags: RadioFlags::default(),
            irq_pending: Arc::new(AtomicBool::new(false)),
            dutycycling: false,
            rng_state: 0x12345678,
        })
    }

    /// Bring the radio up. Called once before the event loop starts.
    pub fn init(&mut self) -> Result<(), RadioError> {
        self.radio.init()
    }

    /// Seed the first-wake and deferral jitter.
    pub fn seed(&mut self, seed: u32) {
        self.rng_state = if seed == 0 { 1 } else { seed };
        self.retry.seed(seed.wrapping_add(0x9e3779b9));
    }

    /// Current state.
    pub fn state(&self) -> DutyState {
        self.state
    }

    /// Number of queued frames.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// The interval governor, shared with the timer path.
    pub fn governor(&self) -> &IntervalGovernor {
        &self.governor
    }

    /// The flag the driver callback raises before posting an ISR message.
    pub fn irq_flag(&self) -> Arc<AtomicBool> {
        self.irq_pending.clone()
    }

    // ==================== timer ====================

    /// The duty-cycle timer fired.
    pub fn handle_timer(&mut self) -> Effects {
        let mut fx = Effects::default();
        match self.state {
            DutyState::Sleep => {
                self.state = if self.queue.is_empty() {
                    DutyState::TxBeacon
                } else {
                    DutyState::TxDataBeforeBeacon
                };
                debug!("wake: {:?}", self.state);
                fx.posts.push(Post::DutyEvent);
            }
            DutyState::Listen => {
                if self.queue.is_empty() {
                    debug!("listen window closed, back to sleep");
                    self.state = DutyState::Sleep;
                    fx.posts.push(Post::DutyEvent);
                } else {
                    debug!("listen window closed, draining {} frames", self.queue.len());
                    self.state = DutyState::TxData;
                    fx.timer = Some(TimerOp::Rearm(self.governor.current()));
                    fx.posts.push(Post::CheckQueue);
                }
            }
            // Sleep interval elapsed during an active drain: the drain keeps
            // running and ends in a beacon instead of sleep.
            DutyState::TxData => {
                self.state = DutyState::TxDataBeforeBeacon;
                trace!("interval elapsed mid-drain, beacon owed");
            }
            ref state => trace!("timer fired in {:?}, ignored", state),
        }
        fx
    }

    // ==================== duty event ====================

    /// Evaluate the current state: power the radio and arm timers, or
    /// launch the transmission the state calls for.
    pub fn handle_duty_event(&mut self) -> Effects {
        let mut fx = Effects::default();
        match self.state {
            DutyState::TxBeacon => self.send_beacon(&mut fx),
            DutyState::TxDataBeforeBeacon => self.try_transmit_head(&mut fx),
            DutyState::Listen => {
                self.set_radio_state(PowerState::Idle);
                fx.timer = Some(TimerOp::Rearm(self.config.wakeup_interval));
            }
            DutyState::Sleep => {
                self.set_radio_state(PowerState::Sleep);
                fx.timer = Some(TimerOp::Rearm(self.governor.current()));
            }
            ref state => trace!("duty event in {:?}, ignored", state),
        }
        fx
    }

    // ==================== radio events ====================

    /// A driver event arrived through the mailbox.
    pub fn handle_radio_event(&mut self, event: RadioEvent) -> Effects {
        let mut fx = Effects::default();
        match event {
            RadioEvent::Isr => {
                self.radio.isr();
                self.irq_pending.store(false, Ordering::Release);
                self.drain_deferred_beacon(&mut fx);
            }
            RadioEvent::RxPending => {
                trace!("peer has more frames pending");
                self.flags.additional_wakeup = true;
            }
            RadioEvent::RxComplete(frame) => self.on_rx_complete(frame, &mut fx),
            RadioEvent::TxComplete => self.on_tx_complete(false, &mut fx),
            RadioEvent::TxCompletePending => self.on_tx_complete(true, &mut fx),
            RadioEvent::TxMediumBusy => self.on_medium_busy(&mut fx),
            RadioEvent::TxNoAck => self.on_no_ack(&mut fx),
        }
        fx
    }

    fn on_rx_complete(&mut self, frame: Frame, fx: &mut Effects) {
        debug!("received frame ({} bytes)", frame.len());
        fx.deliver.push(frame);
        if !self.dutycycling {
            return;
        }
        fx.timer = Some(TimerOp::Cancel);
        if self.flags.additional_wakeup {
            // Re-extend the listen window for the frames still queued at
            // the peer.
            self.flags.additional_wakeup = false;
            self.state = DutyState::Listen;
            fx.posts.push(Post::DutyEvent);
        } else if self.queue.is_empty() {
            self.state = DutyState::Sleep;
            fx.posts.push(Post::DutyEvent);
        } else {
            self.state = DutyState::TxData;
            fx.timer = Some(TimerOp::Rearm(self.governor.current()));
            fx.posts.push(Post::CheckQueue);
        }
    }

    fn on_tx_complete(&mut self, peer_pending: bool, fx: &mut Effects) {
        if !self.flags.radio_busy {
            warn!("spurious transmit completion in {:?}", self.state);
            return;
        }
        let was_rexmit = self.flags.retry_rexmit;
        self.flags.radio_busy = false;
        self.flags.retry_rexmit = false;
        self.retry.on_success();

        if self.flags.sending_beacon {
            self.flags.sending_beacon = false;
            if self.state != DutyState::TxBeacon {
                // Duty cycling was toggled while the beacon was in flight.
                trace!("beacon completion in {:?}, ignored", self.state);
                return;
            }
            fx.timer = Some(TimerOp::Cancel);
            if peer_pending {
                debug!("beacon answered with pending data, listening");
                self.governor.reset();
                self.state = DutyState::Listen;
            } else {
                self.governor.backoff();
                self.state = DutyState::Sleep;
                debug!("idle beacon cycle, next wake in {:?}", self.governor.current());
            }
            fx.posts.push(Post::DutyEvent);
            return;
        }

        // Data completion. A pending bit on the ack is honored on the RX
        // path; here it changes nothing.
        trace!("data transmit complete (rexmit={})", was_rexmit);
        if self.state.is_tx_data() {
            self.governor.reset();
        }
        fx.posts.push(Post::RemoveQueue);
    }

    fn on_medium_busy(&mut self, fx: &mut Effects) {
        match self.retry.on_medium_busy() {
            RetryDecision::Retry { backoff } => {
                // radio_busy stays set: nothing else may launch while the
                // reissue is owed.
                fx.retransmit_in = Some((backoff, 0));
            }
            RetryDecision::GiveUp => self.give_up_transmission(fx),
        }
    }

    fn on_no_ack(&mut self, fx: &mut Effects) {
        match self.retry.on_no_ack() {
            RetryDecision::Retry { backoff } => {
                fx.retransmit_in = Some((backoff, 0));
            }
            RetryDecision::GiveUp => self.give_up_transmission(fx),
        }
    }

    fn give_up_transmission(&mut self, fx: &mut Effects) {
        self.flags.radio_busy = false;
        self.flags.retry_rexmit = false;
        if self.flags.sending_beacon {
            self.flags.sending_beacon = false;
            warn!("beacon abandoned after retry exhaustion");
            fx.timer = Some(TimerOp::Cancel);
            if self.state == DutyState::TxBeacon {
                self.state = DutyState::Sleep;
                fx.posts.push(Post::DutyEvent);
            }
        } else {
            warn!("frame abandoned after retry exhaustion");
            // Head removal continues the drain; the governor stays
            // untouched since nothing was delivered.
            fx.posts.push(Post::RemoveQueue);
        }
    }

    // ==================== queue messages ====================

    /// Try transmitting the head without removing it. Idempotent; an empty
    /// queue is a no-op.
    pub fn handle_check_queue(&mut self) -> Effects {
        let mut fx = Effects::default();
        if self.queue.is_empty() {
            trace!("check queue: empty");
            return fx;
        }
        match self.state {
            DutyState::TxData | DutyState::TxDataBeforeBeacon | DutyState::Init => {
                self.try_transmit_head(&mut fx)
            }
            ref state => trace!("check queue in {:?}, ignored", state),
        }
        fx
    }

    /// Remove the transmitted head and continue the drain.
    pub fn handle_remove_queue(&mut self) -> Effects {
        let mut fx = Effects::default();
        match self.queue.pop_head() {
            Some(entry) => debug!(
                "head removed ({} bytes, {:?}), {} remaining",
                entry.frame().len(),
                entry.kind,
                self.queue.len()
            ),
            // A completion can race a queue already drained elsewhere;
            // nothing to pop then.
            None => trace!("remove queue: already empty"),
        }
        if self.queue.is_empty() {
            match self.state {
                DutyState::TxDataBeforeBeacon => {
                    debug!("drain finished, beacon owed");
                    self.state = DutyState::TxBeacon;
                    self.send_beacon(&mut fx);
                }
                DutyState::TxData => {
                    debug!("drain finished, back to sleep");
                    self.state = DutyState::Sleep;
                    self.set_radio_state(PowerState::Sleep);
                }
                _ => {}
            }
        } else if self.can_transmit() {
            self.try_transmit_head(&mut fx);
        }
        fx
    }

    // ==================== retransmission ====================

    /// A scheduled retransmission came due. Reissues the in-flight
    /// transmission, or reposts itself (bounded) while the radio is
    /// momentarily unavailable.
    pub fn handle_retransmit(&mut self, deferrals: u8) -> Effects {
        let mut fx = Effects::default();
        if !self.flags.radio_busy {
            trace!("retransmit with nothing in flight, ignored");
            return fx;
        }
        // The busy slot is ours; gate only on the interrupt and RX window.
        if self.irq_pending.load(Ordering::Acquire)
            || self.radio.power_state() == PowerState::Rx
        {
            if deferrals >= self.config.max_deferrals {
                warn!("retransmission deferred {} times, giving up", deferrals);
                self.give_up_transmission(&mut fx);
            } else {
                let jitter = self.next_random() as u64 % self.config.retry.min_backoff_ms as u64;
                let delay = Duration::from_millis(self.config.retry.min_backoff_ms as u64 + jitter);
                trace!("radio unavailable, deferring retransmission {:?}", delay);
                fx.retransmit_in = Some((delay, deferrals + 1));
            }
            return fx;
        }

        if self.flags.sending_beacon {
            trace!("reissuing beacon");
            if let Err(e) = self.radio.send_beacon() {
                warn!("driver rejected beacon reissue: {}", e);
                self.on_medium_busy(&mut fx);
            }
            return fx;
        }

        let result = {
            let Core {
                ref mut radio,
                ref mut queue,
                ref mut flags,
                ..
            } = *self;
            match queue.head_mut() {
                None => {
                    warn!("retransmission owed but queue is empty");
                    flags.radio_busy = false;
                    return fx;
                }
                Some(entry) => {
                    entry.mark_retransmit();
                    flags.retry_rexmit = true;
                    trace!("reissuing head ({} bytes)", entry.frame().len());
                    radio.resend(entry.frame())
                }
            }
        };
        if let Err(e) = result {
            warn!("driver rejected reissue: {}", e);
            self.on_medium_busy(&mut fx);
        }
        fx
    }

    // ==================== upward API ====================

    /// Queue an outbound frame, transmitting immediately when the state
    /// allows. Overflow hands the frame back to the caller.
    pub fn handle_send(&mut self, sender: SenderId, frame: Frame) -> (Result<(), SendError>, Effects) {
        let mut fx = Effects::default();
        let entry = QueueEntry::data(sender, frame);
        if let Err(QueueFull(rejected)) = self.queue.enqueue(entry) {
            return (Err(SendError::QueueFull(rejected.into_frame())), fx);
        }
        match self.state {
            // Pass-through mode: behave as an always-on node.
            DutyState::Init => self.try_transmit_head(&mut fx),
            DutyState::Sleep if self.can_transmit() => {
                debug!("send while asleep, draining immediately");
                self.state = DutyState::TxData;
                self.try_transmit_head(&mut fx);
            }
            ref state => trace!("queued in {:?} ({} waiting)", state, self.queue.len()),
        }
        (Ok(()), fx)
    }

    /// Apply a SET. Duty cycling and the source address length are
    /// intercepted; everything else passes through to the driver.
    pub fn handle_set(&mut self, option: &LinkOption) -> (Result<(), RadioError>, Effects) {
        let mut fx = Effects::default();
        let result = match *option {
            LinkOption::DutyCycling(true) => self.enable(&mut fx),
            LinkOption::DutyCycling(false) => self.disable(&mut fx),
            LinkOption::SourceAddressLength(len) if self.dutycycling && len != 2 => {
                warn!("source address length is fixed at 2 while duty cycling");
                Err(RadioError::NotSupported)
            }
            LinkOption::PowerState(state) => self.radio.set_power_state(state),
            ref option => self.radio.set_option(option),
        };
        (result, fx)
    }

    /// Apply a GET. The duty-cycling bit is answered here; everything else
    /// comes from the driver.
    pub fn handle_get(&mut self, key: LinkOptionKey) -> Result<LinkOption, RadioError> {
        match key {
            LinkOptionKey::DutyCycling => Ok(LinkOption::DutyCycling(self.dutycycling)),
            LinkOptionKey::PowerState => Ok(LinkOption::PowerState(self.radio.power_state())),
            key => self.radio.option(key),
        }
    }

    fn enable(&mut self, fx: &mut Effects) -> Result<(), RadioError> {
        if self.dutycycling {
            debug!("duty cycling already enabled");
            return Ok(());
        }
        // Leaf nodes address with short source addresses.
        self.radio.set_option(&LinkOption::SourceAddressLength(2))?;
        self.radio.set_power_state(PowerState::Sleep)?;
        self.governor.reset();
        self.dutycycling = true;
        self.state = DutyState::Sleep;
        // Uniform random first wake desynchronizes neighboring leaves.
        let first = Duration::from_millis(
            self.next_random() as u64 % self.config.interval_max.as_millis() as u64,
        );
        info!("duty cycling enabled, first wake in {:?}", first);
        fx.timer = Some(TimerOp::Rearm(first));
        Ok(())
    }

    fn disable(&mut self, fx: &mut Effects) -> Result<(), RadioError> {
        if !self.dutycycling {
            debug!("duty cycling already disabled");
            return Ok(());
        }
        self.dutycycling = false;
        self.state = DutyState::Init;
        self.flags.beacon_pending = false;
        self.flags.additional_wakeup = false;
        self.flags.sending_beacon = false;
        self.flags.retry_rexmit = false;
        // radio_busy survives: an in-flight completion still has to land.
        self.governor.reset();
        fx.timer = Some(TimerOp::Cancel);
        self.radio.set_power_state(PowerState::Sleep)?;
        info!("duty cycling disabled");
        Ok(())
    }

    // ==================== transmit paths ====================

    /// The safe transmit policy.
    fn can_transmit(&self) -> bool {
        !self.flags.radio_busy
            && !self.irq_pending.load(Ordering::Acquire)
            && self.radio.power_state() != PowerState::Rx
    }

    /// Launch a beacon under the safe policy, or remember that one is owed.
    fn send_beacon(&mut self, fx: &mut Effects) {
        if !self.can_transmit() {
            debug!("beacon deferred, radio unavailable");
            self.flags.beacon_pending = true;
            return;
        }
        self.flags.sending_beacon = true;
        self.flags.retry_rexmit = false;
        self.flags.radio_busy = true;
        if let Err(e) = self.radio.send_beacon() {
            warn!("driver rejected beacon: {}", e);
            self.on_medium_busy(fx);
        } else {
            trace!("beacon transmitting");
        }
    }

    /// Launch the queue head under the safe policy.
    fn try_transmit_head(&mut self, fx: &mut Effects) {
        if !self.can_transmit() {
            trace!("transmit blocked by safe policy");
            return;
        }
        let (result, rexmit) = {
            let Core {
                ref mut radio,
                ref queue,
                ..
            } = *self;
            match queue.head() {
                None => {
                    trace!("nothing queued");
                    return;
                }
                Some(entry) => {
                    let rexmit = matches!(entry.kind, TxKind::Retransmit);
                    trace!(
                        "transmitting head ({} bytes, rexmit={})",
                        entry.frame().len(),
                        rexmit
                    );
                    let result = if rexmit {
                        radio.resend(entry.frame())
                    } else {
                        radio.send(entry.frame())
                    };
                    (result, rexmit)
                }
            }
        };
        self.flags.sending_beacon = false;
        self.flags.retry_rexmit = rexmit;
        self.flags.radio_busy = true;
        if let Err(e) = result {
            // A negative driver return behaves like a busy medium so the
            // normal retry logic engages.
            warn!("driver rejected send: {}", e);
            self.on_medium_busy(fx);
        }
    }

    /// Send the deferred beacon exactly once when the deferring condition
    /// has cleared.
    fn drain_deferred_beacon(&mut self, fx: &mut Effects) {
        if self.flags.beacon_pending && self.can_transmit() {
            self.flags.beacon_pending = false;
            debug!("sending deferred beacon");
            self.send_beacon(fx);
        }
    }

    fn set_radio_state(&mut self, state: PowerState) {
        if let Err(e) = self.radio.set_power_state(state) {
            warn!("failed to set radio {:?}: {}", state, e);
        }
    }

    /// LCG with Numerical Recipes parameters.
    fn next_random(&mut self) -> u32 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(1664525)
            .wrapping_add(1013904223);
        self.rng_state
    }
}
