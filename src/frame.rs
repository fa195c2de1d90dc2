//! Outbound frame handles.
//!
//! A [`Frame`] owns its packet buffer and is deliberately move-only: the
//! transmit queue takes ownership on enqueue, the transmit path borrows it,
//! and dropping the entry at head-remove releases the buffer. This mirrors
//! the pool-allocated packet buffers of the surrounding stack without
//! exposing the pool itself.

/// An owned, move-only packet buffer.
pub struct Frame {
    payload: Vec<u8>,
}

impl Frame {
    /// Create a frame owning the given octets.
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// The frame octets.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Frame length in octets.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true for a zero-length frame.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Payload bytes are not interesting in traces, the length is.
        f.debug_struct("Frame").field("len", &self.len()).finish()
    }
}

/// Opaque identifier of the upper-layer entity that queued a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderId(pub u16);

/// How a queued frame is (re)issued to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    /// First attempt of a freshly queued frame.
    Data,
    /// The frame has been reissued at least once after a failed attempt.
    Retransmit,
}

/// One entry of the transmit queue.
#[derive(Debug)]
pub struct QueueEntry {
    /// Who queued the frame.
    pub sender: SenderId,
    /// First attempt or retransmission.
    pub kind: TxKind,
    frame: Frame,
}

impl QueueEntry {
    /// Create a fresh data entry.
    pub fn data(sender: SenderId, frame: Frame) -> Self {
        Self {
            sender,
            kind: TxKind::Data,
            frame,
        }
    }

    /// Borrow the owned frame for transmission.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Mark this entry as reissued.
    pub fn mark_retransmit(&mut self) {
        self.kind = TxKind::Retransmit;
    }

    /// Take the frame back out, releasing the entry.
    pub fn into_frame(self) -> Frame {
        self.frame
    }
}
