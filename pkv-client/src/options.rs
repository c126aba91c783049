//! # Connection Options
//!
//! Purpose: Policy knobs for reconnection, activation and backpressure.
//!
//! ## Usage Notes
//!
//! - Every connection copies the client's options when it is created, so
//!   changing `Client::set_options` afterwards only affects new connections.
//! - Options can be built in code (`..Default::default()`) or deserialized
//!   from config files; missing fields fall back to the defaults below.
//!
//! ## Defaults
//!
//! | option                                  | default  |
//! |-----------------------------------------|----------|
//! | `auto_reconnect`                        | `true`   |
//! | `request_queue_size`                    | unbounded (`usize::MAX`) |
//! | `ping_before_activate_connection`       | `false`  |
//! | `suspend_reconnect_on_protocol_failure` | `false`  |
//! | `cancel_commands_on_reconnect_failure`  | `false`  |
//! | `reconnect_delay`                       | 10ms doubling up to 30s |

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Client-wide connection policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Reconnect automatically after the transport drops unexpectedly.
    pub auto_reconnect: bool,
    /// Maximum number of queued plus in-flight commands per connection.
    pub request_queue_size: usize,
    /// Require a PING/PONG round trip before a transport is usable.
    pub ping_before_activate_connection: bool,
    /// Stop automatic reconnects after an activation protocol violation.
    pub suspend_reconnect_on_protocol_failure: bool,
    /// Cancel queued commands whenever a reconnect attempt fails.
    pub cancel_commands_on_reconnect_failure: bool,
    /// Backoff between reconnect attempts.
    pub reconnect_delay: ReconnectDelay,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            auto_reconnect: true,
            request_queue_size: usize::MAX,
            ping_before_activate_connection: false,
            suspend_reconnect_on_protocol_failure: false,
            cancel_commands_on_reconnect_failure: false,
            reconnect_delay: ReconnectDelay::default(),
        }
    }
}

/// Bounded exponential backoff, without jitter.
///
/// Attempt `n` (zero-based) waits `initial * factor^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectDelay {
    /// Delay before the first attempt after a disconnect.
    #[serde(rename = "initial_ms", deserialize_with = "millis")]
    pub initial: Duration,
    /// Upper bound for any single delay.
    #[serde(rename = "max_ms", deserialize_with = "millis")]
    pub max: Duration,
    /// Growth factor per failed attempt. Values below 1 are treated as 1.
    pub factor: u32,
}

impl Default for ReconnectDelay {
    fn default() -> Self {
        ReconnectDelay {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(30),
            factor: 2,
        }
    }
}

impl ReconnectDelay {
    /// Returns the delay to wait before the given attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1);
        let mut delay = self.initial.min(self.max);
        if factor == 1 || delay.is_zero() {
            return delay;
        }
        for _ in 0..attempt {
            delay = delay.saturating_mul(factor);
            if delay >= self.max {
                return self.max;
            }
        }
        delay
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
