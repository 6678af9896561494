//! Session keepalive: liveness pings and ping-abuse enforcement.
//!
//! A session with [`KeepaliveParams`] pings its peer every `time` and closes
//! the session if the pong does not arrive within `timeout`. A session with an
//! [`EnforcementPolicy`] counts pings that arrive too often (or with no call
//! in flight when that is not permitted); more than [`MAX_PING_STRIKES`]
//! violations end the session with a `go_away` of reason
//! [`TOO_MANY_PINGS`].

use std::time::{Duration, Instant};

/// Violations tolerated before the peer is sent away.
pub const MAX_PING_STRIKES: u32 = 2;

/// `go_away` reason sent to a peer that broke the enforcement policy.
pub const TOO_MANY_PINGS: &str = "too_many_pings";

/// Outgoing ping schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveParams {
    /// Quiet period between a pong and the next ping.
    pub time: Duration,
    /// How long to wait for a pong before declaring the peer dead.
    pub timeout: Duration,
    /// Ping even when no call is in flight.
    pub permit_without_stream: bool,
}

impl KeepaliveParams {
    /// Driver-side schedule over the stdio pipe: ping every 10s, give up
    /// after 20s.
    pub fn driver_server() -> Self {
        Self {
            time: Duration::from_secs(10),
            timeout: Duration::from_secs(20),
            permit_without_stream: true,
        }
    }

    /// Orchestrator-side schedule: ping every 10s, give up after 20s.
    pub fn driver_client() -> Self {
        Self {
            time: Duration::from_secs(10),
            timeout: Duration::from_secs(20),
            permit_without_stream: true,
        }
    }
}

/// Limits on how often the peer may ping us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnforcementPolicy {
    pub min_time: Duration,
    pub permit_without_stream: bool,
}

/// Accepts client pings down to every 2s, idle or not.
impl Default for EnforcementPolicy {
    fn default() -> Self {
        Self {
            min_time: Duration::from_secs(2),
            permit_without_stream: true,
        }
    }
}

/// Keepalive settings for one side of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub params: Option<KeepaliveParams>,
    pub enforcement: Option<EnforcementPolicy>,
}

impl KeepaliveConfig {
    /// Settings used by driver processes serving over stdio.
    pub fn driver_server() -> Self {
        Self {
            params: Some(KeepaliveParams::driver_server()),
            enforcement: Some(EnforcementPolicy::default()),
        }
    }

    /// Settings used by the orchestrator when talking to a driver.
    pub fn driver_client() -> Self {
        Self {
            params: Some(KeepaliveParams::driver_client()),
            enforcement: None,
        }
    }

    /// No pings, no enforcement.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: KeepaliveParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_enforcement(mut self, policy: EnforcementPolicy) -> Self {
        self.enforcement = Some(policy);
        self
    }
}

/// Tracks ping strikes against an [`EnforcementPolicy`].
#[derive(Debug)]
pub(crate) struct PingEnforcer {
    policy: EnforcementPolicy,
    last_ping: Option<Instant>,
    strikes: u32,
}

impl PingEnforcer {
    pub(crate) fn new(policy: EnforcementPolicy) -> Self {
        Self {
            policy,
            last_ping: None,
            strikes: 0,
        }
    }

    /// Records a ping received at `now`. Returns true when the peer has
    /// exceeded its strikes and must be sent away.
    pub(crate) fn on_ping(&mut self, now: Instant, active_calls: usize) -> bool {
        let violation = if active_calls == 0 && !self.policy.permit_without_stream {
            true
        } else {
            matches!(self.last_ping, Some(last) if now.saturating_duration_since(last) < self.policy.min_time)
        };
        self.last_ping = Some(now);

        if violation {
            self.strikes += 1;
            tracing::debug!(strikes = self.strikes, "Ping policy violation");
        }
        self.strikes > MAX_PING_STRIKES
    }

    /// New call activity forgives earlier strikes.
    pub(crate) fn reset_strikes(&mut self) {
        self.strikes = 0;
    }
}
