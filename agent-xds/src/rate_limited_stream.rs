//! Connection state machine and pacing for the aggregated discovery stream (§4.A).
//!
//! Grounded on `src/xds/client.rs`'s `AdsClient::run_loop`: a jittered, capped exponential
//! backoff between reconnect attempts (`INITIAL_BACKOFF = 10ms`, `MAX_BACKOFF = 15s`), reset on a
//! successful connection, plus a [`crate::token_bucket::TokenBucket`] gating how fast outbound
//! requests may be written once established.

use std::time::Duration;

use rand::Rng;

use crate::token_bucket::TokenBucket;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Established,
}

/// Full-jitter capped exponential backoff, reset on every successful connection.
struct Backoff {
	current: Duration,
}

impl Backoff {
	fn new() -> Self {
		Backoff { current: INITIAL_BACKOFF }
	}

	fn reset(&mut self) {
		self.current = INITIAL_BACKOFF;
	}

	fn next_delay(&mut self) -> Duration {
		let jittered = if self.current.is_zero() {
			Duration::ZERO
		} else {
			rand::rng().random_range(Duration::ZERO..=self.current)
		};
		self.current = (self.current * 2).min(MAX_BACKOFF);
		jittered
	}
}

/// Drives one aggregated discovery stream's reconnect pacing and outbound rate limit. Does not
/// perform any I/O itself; callers drive the transport and report transitions through this type.
pub struct RateLimitedStream {
	state: ConnectionState,
	backoff: Backoff,
	bucket: TokenBucket,
}

impl RateLimitedStream {
	pub fn new(burst: u32, fill_rate_per_sec: f64) -> Self {
		RateLimitedStream {
			state: ConnectionState::Disconnected,
			backoff: Backoff::new(),
			bucket: TokenBucket::new(burst, fill_rate_per_sec),
		}
	}

	pub fn state(&self) -> ConnectionState {
		self.state
	}

	pub fn start_connecting(&mut self) {
		self.state = ConnectionState::Connecting;
	}

	/// Call when the transport reports the stream is up. Resets the backoff schedule.
	pub fn on_established(&mut self) {
		self.state = ConnectionState::Established;
		self.backoff.reset();
	}

	/// Call on a failed connection attempt or a mid-stream disconnect. Returns how long to wait
	/// before the next attempt.
	pub fn on_disconnect(&mut self) -> Duration {
		self.state = ConnectionState::Disconnected;
		self.backoff.next_delay()
	}

	/// Whether an outbound request may be written right now (established and a token available).
	pub fn try_send(&mut self) -> bool {
		self.state == ConnectionState::Established && self.bucket.consume(1)
	}

	/// How long until the pacing limit would allow the next send, regardless of connection state.
	pub fn next_send_available(&mut self) -> Duration {
		self.bucket.next_token_available()
	}

	/// Whether the stream may be torn down immediately (no half-sent request in flight). The
	/// multiplexer consults this before honoring a drain request.
	pub fn drain_allowed(&self) -> bool {
		self.state != ConnectionState::Connecting
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_resets_on_successful_connection() {
		let mut s = RateLimitedStream::new(10, 10.0);
		s.start_connecting();
		let d1 = s.on_disconnect();
		assert!(d1 <= INITIAL_BACKOFF);
		s.start_connecting();
		let d2 = s.on_disconnect();
		assert!(d2 <= INITIAL_BACKOFF * 2);

		s.start_connecting();
		s.on_established();
		assert_eq!(s.state(), ConnectionState::Established);
		s.start_connecting();
		let d3 = s.on_disconnect();
		assert!(d3 <= INITIAL_BACKOFF, "backoff should restart from the initial delay after a success");
	}

	#[test]
	fn backoff_is_capped() {
		let mut s = RateLimitedStream::new(10, 10.0);
		for _ in 0..20 {
			s.start_connecting();
			let d = s.on_disconnect();
			assert!(d <= MAX_BACKOFF);
		}
	}

	#[test]
	fn send_requires_established_state_and_a_token() {
		let mut s = RateLimitedStream::new(1, 1.0);
		assert!(!s.try_send(), "not yet established");
		s.start_connecting();
		s.on_established();
		assert!(s.try_send());
		assert!(!s.try_send(), "burst of 1 exhausted");
	}

	#[test]
	fn drain_allowed_unless_mid_connect() {
		let mut s = RateLimitedStream::new(1, 1.0);
		assert!(s.drain_allowed(), "disconnected stream has nothing to drain");
		s.start_connecting();
		assert!(!s.drain_allowed());
		s.on_established();
		assert!(s.drain_allowed());
	}
}
