//! Collaborators the traffic manager depends on.
//!
//! These traits keep the cache independent of the firmware around it:
//! - [`Clock`]: monotonic millisecond time (hardware uptime, or simulated)
//! - [`MeshServices`]: node database lookup and the send queue used for
//!   direct NodeInfo replies

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::packet::NodeId;

/// Monotonic millisecond time source.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin. Never decreases.
    fn now_ms(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Clock backed by [`Instant`], counting from construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start counting now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Externally driven clock for replays and tests.
///
/// Share it through an `Arc` to advance time while a manager holds it.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Clock reading `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    /// Jump to `now_ms`. Earlier values are ignored to stay monotonic.
    ///
    /// Returns `false` if `now_ms` was earlier than the current reading.
    pub fn set(&self, now_ms: u64) -> bool {
        self.now_ms.fetch_max(now_ms, Ordering::Relaxed) <= now_ms
    }

    /// Move forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

/// What the local node database knows about another node's user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node the info describes.
    pub num: NodeId,
    /// User-visible long name.
    #[serde(default)]
    pub long_name: String,
    /// Four-character short name.
    #[serde(default)]
    pub short_name: String,
}

/// A NodeInfo answer sent on behalf of the requested node.
///
/// The reply is addressed as if the target node had answered and travels a
/// single hop back to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfoReply {
    /// Node the reply speaks for (the request's destination).
    pub from: NodeId,
    /// Requesting node.
    pub to: NodeId,
    /// Channel the request arrived on.
    pub channel: u8,
    /// Id of the request packet being answered.
    pub request_id: u32,
    /// Always 0: the reply must not be relayed.
    pub hop_limit: u8,
    /// Always 0: spoofed origin means the router will not fill it in.
    pub hop_start: u8,
    /// Always false.
    pub want_response: bool,
    /// Low byte of the requester's node id, for next-hop routing.
    pub next_hop: u8,
    /// Cached user info of the target node.
    pub user: NodeInfo,
}

/// Access to the rest of the mesh stack.
pub trait MeshServices {
    /// Cached user info for `node`, if the node database has it.
    fn node_info(&self, node: NodeId) -> Option<NodeInfo>;

    /// Queue a direct NodeInfo reply for transmission.
    ///
    /// Returns `false` if the reply could not be queued (no packet buffer).
    fn send_reply(&self, reply: NodeInfoReply) -> bool;
}

impl<M: MeshServices + ?Sized> MeshServices for Arc<M> {
    fn node_info(&self, node: NodeId) -> Option<NodeInfo> {
        (**self).node_info(node)
    }

    fn send_reply(&self, reply: NodeInfoReply) -> bool {
        (**self).send_reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_is_monotonic() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        assert!(!clock.set(1_200));
        assert_eq!(clock.now_ms(), 1_500);
        assert!(clock.set(1_500));
        assert!(clock.set(9_000));
        assert_eq!(clock.now_ms(), 9_000);
    }

    #[test]
    fn test_shared_manual_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let held = clock.clone();
        clock.advance(42);
        assert_eq!(held.now_ms(), 42);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let first = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now_ms() >= first + 5);
    }
}
