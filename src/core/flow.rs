//! Per-call message credit.
//!
//! Each direction of a call is flow controlled on its own. The receiver owns a
//! queue of `window` messages and hands credit back as its consumer drains
//! the queue; the sender spends one credit per message and waits when it has
//! none. A stalled consumer therefore holds back only its own call and never
//! the connection reader.
//!
//! ## Initial credit
//! - Requests: the client may send one message before the server grants more,
//!   so single-request calls never wait a round trip.
//! - Responses: the client announces its window in `Headers`.

use tokio::sync::Semaphore;

/// Credit the client holds for its first request message
pub const INITIAL_REQUEST_CREDIT: u32 = 1;

const MAX_CREDIT: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Sending side: message credit granted by the peer
#[derive(Debug)]
pub struct SendCredit {
    permits: Semaphore,
}

impl SendCredit {
    pub fn new(initial: u32) -> Self {
        Self {
            permits: Semaphore::new((initial as usize).min(MAX_CREDIT)),
        }
    }

    /// Add credit granted by the peer, saturating at the ceiling
    pub fn grant(&self, credit: u32) {
        let room = MAX_CREDIT.saturating_sub(self.permits.available_permits());
        let credit = (credit as usize).min(room);
        if credit > 0 {
            self.permits.add_permits(credit);
        }
    }

    /// Spend one credit, waiting for the peer if none is left.
    ///
    /// Returns false once the credit is closed.
    pub async fn acquire(&self) -> bool {
        match self.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Wake every waiting sender; later acquisitions fail
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Receiving side: batches credit returned to the peer
#[derive(Debug)]
pub struct CreditGrant {
    threshold: u32,
    pending: u32,
}

impl CreditGrant {
    /// Return credit in batches of half the window
    pub fn new(window: u32) -> Self {
        Self {
            threshold: (window / 2).max(1),
            pending: 0,
        }
    }

    /// Record one consumed message; yields the credit to send once a batch is full
    pub fn consumed(&mut self) -> Option<u32> {
        self.pending += 1;
        if self.pending >= self.threshold {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }
}

/// Window size for a configured per-call buffer
pub fn window(call_buffer: usize) -> u32 {
    u32::try_from(call_buffer).unwrap_or(u32::MAX).max(1)
}
