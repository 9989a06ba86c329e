//! Hop-count loop guard.
//!
//! Hop counts only ever grow along a path, so any forwarding cycle is cut
//! after at most `max_hops` forwards.

/// What to do with a request given the hop count it arrived with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopDecision {
    /// Forward with `X-Hop-Count: hop`.
    Forward { hop: u32 },
    /// Ceiling exceeded; answer locally and do not forward.
    Drop { hop: u32 },
}

impl HopDecision {
    #[must_use]
    pub fn hop(self) -> u32 {
        match self {
            Self::Forward { hop } | Self::Drop { hop } => hop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopGuard {
    max_hops: u32,
}

impl LoopGuard {
    #[must_use]
    pub fn new(max_hops: u32) -> Self {
        Self { max_hops }
    }

    #[must_use]
    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// The next hop is `previous + 1`; it is forwarded only while it does
    /// not exceed the ceiling.
    #[must_use]
    pub fn check(&self, previous: u32) -> HopDecision {
        let hop = previous.saturating_add(1);
        if hop > self.max_hops {
            HopDecision::Drop { hop }
        } else {
            HopDecision::Forward { hop }
        }
    }
}
