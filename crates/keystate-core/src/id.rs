//! Identity types for keystate
//!
//! Owners and subscriptions are plain 64-bit identities. Fresh values come
//! from process-wide counters so they never collide within a process.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);
static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Owner identity - the party that scopes a listener (a view, a worker)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct OwnerId(pub u64);

impl OwnerId {
    pub const ZERO: OwnerId = OwnerId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        OwnerId(id)
    }

    /// Allocate an owner identity unique within this process
    pub fn next() -> Self {
        OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owner({:016x})", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Subscription identity - one listener registration
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    /// Allocate a subscription identity unique within this process
    pub fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
