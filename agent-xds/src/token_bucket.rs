//! Ported from `envoy/common/token_bucket.h`'s minimal `consume`/`nextTokenAvailableMs` contract.

use std::time::{Duration, Instant};

/// A token bucket with a configurable max size and fill rate, used by the rate-limited stream
/// (§4.A) to pace outbound discovery requests without busy-looping.
pub struct TokenBucket {
	max_tokens: f64,
	fill_rate: f64, // tokens per second
	tokens: f64,
	last_fill: Instant,
}

impl TokenBucket {
	pub fn new(max_tokens: u32, fill_rate_per_sec: f64) -> Self {
		TokenBucket {
			max_tokens: max_tokens as f64,
			fill_rate: fill_rate_per_sec,
			tokens: max_tokens as f64,
			last_fill: Instant::now(),
		}
	}

	fn refill(&mut self) {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last_fill).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.max_tokens);
			self.last_fill = now;
		}
	}

	/// Attempts to consume `tokens` tokens. Returns whether the bucket had enough.
	pub fn consume(&mut self, tokens: u32) -> bool {
		self.refill();
		let tokens = tokens as f64;
		if self.tokens >= tokens {
			self.tokens -= tokens;
			true
		} else {
			false
		}
	}

	/// Milliseconds until at least one token will be available, 0 if one already is.
	pub fn next_token_available(&mut self) -> Duration {
		self.refill();
		if self.tokens >= 1.0 {
			return Duration::ZERO;
		}
		let deficit = 1.0 - self.tokens;
		Duration::from_secs_f64(deficit / self.fill_rate)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn consumes_up_to_burst_then_blocks() {
		let mut tb = TokenBucket::new(3, 1.0);
		assert!(tb.consume(1));
		assert!(tb.consume(1));
		assert!(tb.consume(1));
		assert!(!tb.consume(1));
	}

	#[test]
	fn next_token_available_is_zero_when_tokens_present() {
		let mut tb = TokenBucket::new(1, 1.0);
		assert_eq!(tb.next_token_available(), Duration::ZERO);
	}
}
