//! Configuration types and protocol constants.

/// Credits (and request slots) per session.
pub const SESSION_CREDITS: usize = 8;

/// Server-side cap on concurrent multi-fragment requests in reception,
/// counted in session credits admitted.
pub const UNEXP_PKT_WINDOW: usize = 32;

/// Maximum application message size.
pub const MAX_MSG_SIZE: usize = 8 << 20;

/// Outbound packets staged per instance before a forced flush.
pub const TX_BATCH_SIZE: usize = 32;

/// Upper bound on packets drained from the transport per RX poll.
pub const RX_BATCH_SIZE: usize = 16;

/// RPC configuration.
///
/// Controls session flow control, reliability timing, congestion control,
/// and session-management retry behavior.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Credits (concurrent requests) per session.
    /// Default: [`SESSION_CREDITS`]
    pub session_credits: usize,
    /// Admission budget for concurrent requests across all server-side
    /// sessions. Default: [`UNEXP_PKT_WINDOW`]
    pub unexp_pkt_window: usize,
    /// Maximum message size accepted by `enqueue_request`.
    /// Default: [`MAX_MSG_SIZE`]
    pub max_msg_size: usize,
    /// Maximum concurrently active sessions.
    /// Default: 256
    pub max_sessions: usize,
    /// Retransmission timeout floor in microseconds; the effective RTO is
    /// `max(rto_mult * srtt, rto_min_us)`. Default: 5000 (5 ms)
    pub rto_min_us: u64,
    /// SRTT multiplier for the initial RTO. Default: 5
    pub rto_mult: u64,
    /// Consecutive RTO doublings without progress before the session
    /// transitions to Error. Default: 3
    pub rto_max_doublings: u8,
    /// Session-management retransmission interval in milliseconds.
    /// Default: 50
    pub sm_retry_ms: u64,
    /// Session-management retransmissions before giving up.
    /// Default: 40 (2 s at the default interval)
    pub sm_retry_budget: u32,
    /// Re-send a connect request this long after an InvalidRemoteRpcId
    /// reject, when `retry_connect_on_invalid_rpc_id` is set.
    /// Default: 1000 ms
    pub reconnect_delay_ms: u64,
    /// Retry connects rejected with InvalidRemoteRpcId (the remote RPC
    /// may still be initializing). Default: false
    pub retry_connect_on_invalid_rpc_id: bool,
    /// Enable Timely congestion control and packet pacing.
    /// Default: false (send at line rate)
    pub enable_cc: bool,
    /// Link rate in Gbit/s, the Timely rate ceiling. Default: 10.0
    pub link_rate_gbps: f64,
    /// Probability of dropping an outbound packet before it reaches the
    /// transport, for loss testing. Default: 0.0
    pub pkt_drop_prob: f64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            session_credits: SESSION_CREDITS,
            unexp_pkt_window: UNEXP_PKT_WINDOW,
            max_msg_size: MAX_MSG_SIZE,
            max_sessions: 256,
            rto_min_us: 5000,
            rto_mult: 5,
            rto_max_doublings: 3,
            sm_retry_ms: 50,
            sm_retry_budget: 40,
            reconnect_delay_ms: 1000,
            retry_connect_on_invalid_rpc_id: false,
            enable_cc: false,
            link_rate_gbps: 10.0,
            pkt_drop_prob: 0.0,
        }
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-session credit count.
    pub fn with_session_credits(mut self, session_credits: usize) -> Self {
        self.session_credits = session_credits;
        self
    }

    /// Set the unexpected-packet admission window.
    pub fn with_unexp_pkt_window(mut self, window: usize) -> Self {
        self.unexp_pkt_window = window;
        self
    }

    /// Set the maximum message size.
    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Set the maximum session count.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the retransmission timeout floor in microseconds.
    pub fn with_rto_min_us(mut self, rto_min_us: u64) -> Self {
        self.rto_min_us = rto_min_us;
        self
    }

    /// Enable or disable Timely congestion control.
    pub fn with_cc(mut self, enable_cc: bool) -> Self {
        self.enable_cc = enable_cc;
        self
    }

    /// Set the link rate used as the congestion-control ceiling.
    pub fn with_link_rate_gbps(mut self, gbps: f64) -> Self {
        self.link_rate_gbps = gbps;
        self
    }

    /// Retry connects rejected with InvalidRemoteRpcId.
    pub fn with_retry_connect_on_invalid_rpc_id(mut self, retry: bool) -> Self {
        self.retry_connect_on_invalid_rpc_id = retry;
        self
    }

    /// Set the outbound packet-drop probability for loss testing.
    pub fn with_pkt_drop_prob(mut self, prob: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&prob));
        self.pkt_drop_prob = prob;
        self
    }

    /// Set the session-management retry interval in milliseconds.
    pub fn with_sm_retry_ms(mut self, ms: u64) -> Self {
        self.sm_retry_ms = ms;
        self
    }

    /// Set the session-management retry budget.
    pub fn with_sm_retry_budget(mut self, budget: u32) -> Self {
        self.sm_retry_budget = budget;
        self
    }
}
