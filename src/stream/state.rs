//! Virtual stream lifecycle
//!
//! ```text
//!   Pending ──accept──► Open ──one side ends──► Closing ──both ended──► Closed
//!      │                                                                  │
//!      └──reject──► Rejected                                              │
//!                                                                         ▼
//!                 (any state) ─────────────── destroy ──────────────► Destroyed
//! ```
//!
//! A peer that closes before the handshake completes moves a `Pending`
//! stream straight to `Closing`.

/// Lifecycle state of a virtual stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Channel requested, handshake not yet admitted
    Pending,
    /// Handshake admitted, both directions usable
    Open,
    /// Handshake declined, teardown in progress
    Rejected,
    /// One direction has ended
    Closing,
    /// Both directions have ended, inbound data may remain
    Closed,
    /// Terminal, channel released
    Destroyed,
}

impl StreamState {
    /// Check if the stream reached its terminal state
    pub fn is_destroyed(self) -> bool {
        self == StreamState::Destroyed
    }

    /// State after the given directions have ended
    ///
    /// Only states still carrying data move; `Rejected` and `Destroyed` stay put.
    pub fn settle(self, local_ended: bool, remote_ended: bool) -> StreamState {
        match self {
            StreamState::Pending | StreamState::Open | StreamState::Closing => {
                if local_ended && remote_ended {
                    StreamState::Closed
                } else if local_ended || remote_ended {
                    StreamState::Closing
                } else {
                    self
                }
            }
            other => other,
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamState::Pending => "pending",
            StreamState::Open => "open",
            StreamState::Rejected => "rejected",
            StreamState::Closing => "closing",
            StreamState::Closed => "closed",
            StreamState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_half_close() {
        assert_eq!(StreamState::Open.settle(true, false), StreamState::Closing);
        assert_eq!(StreamState::Open.settle(false, true), StreamState::Closing);
        assert_eq!(StreamState::Closing.settle(true, true), StreamState::Closed);
        assert_eq!(StreamState::Open.settle(false, false), StreamState::Open);
    }

    #[test]
    fn test_settle_pre_open_close() {
        assert_eq!(StreamState::Pending.settle(false, true), StreamState::Closing);
    }

    #[test]
    fn test_settle_terminal_states_stay() {
        assert_eq!(StreamState::Rejected.settle(true, true), StreamState::Rejected);
        assert_eq!(
            StreamState::Destroyed.settle(true, true),
            StreamState::Destroyed
        );
    }

    #[test]
    fn test_terminal() {
        assert!(StreamState::Destroyed.is_destroyed());
        assert!(!StreamState::Closed.is_destroyed());
        assert_eq!(StreamState::Closing.to_string(), "closing");
    }
}
