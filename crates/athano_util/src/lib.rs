#![forbid(unsafe_code)]

pub mod dedup {
	use std::collections::VecDeque;

	/// Number of recent message ids remembered per connection.
	pub const DEFAULT_CAPACITY: usize = 50;

	/// Bounded FIFO set of recently seen message ids.
	///
	/// Insertion order is arrival order; once full, recording a new id evicts the oldest one.
	#[derive(Debug, Clone)]
	pub struct DedupLedger {
		ids: VecDeque<String>,
		capacity: usize,
	}

	impl Default for DedupLedger {
		fn default() -> Self {
			Self::new(DEFAULT_CAPACITY)
		}
	}

	impl DedupLedger {
		/// Create a ledger holding at most `capacity` ids (minimum 1).
		pub fn new(capacity: usize) -> Self {
			let capacity = capacity.max(1);
			Self {
				ids: VecDeque::with_capacity(capacity),
				capacity,
			}
		}

		pub fn capacity(&self) -> usize {
			self.capacity
		}

		pub fn len(&self) -> usize {
			self.ids.len()
		}

		pub fn is_empty(&self) -> bool {
			self.ids.is_empty()
		}

		pub fn contains(&self, id: &str) -> bool {
			self.ids.iter().any(|seen| seen == id)
		}

		/// Record `id`. Returns `false` if it was already present, in which case nothing changes.
		pub fn record(&mut self, id: &str) -> bool {
			if self.contains(id) {
				return false;
			}

			if self.ids.len() >= self.capacity {
				self.ids.pop_front();
			}
			self.ids.push_back(id.to_string());
			true
		}

		pub fn clear(&mut self) {
			self.ids.clear();
		}

		/// Ids oldest first.
		pub fn iter(&self) -> impl Iterator<Item = &str> {
			self.ids.iter().map(String::as_str)
		}
	}

}

pub mod backoff {
	use std::time::Duration;

	use rand::Rng;

	/// `min * 2^attempt`, clamped to `[min, max]`.
	pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min)
	}

	/// Apply a uniform `+/- fraction` jitter to `delay`.
	pub fn jitter<R: Rng + ?Sized>(delay: Duration, fraction: f64, rng: &mut R) -> Duration {
		if fraction <= 0.0 || delay.is_zero() {
			return delay;
		}

		let ms = delay.as_millis() as f64;
		let offset = rng.random_range(-fraction..=fraction);
		Duration::from_millis((ms + ms * offset).max(0.0).floor() as u64)
	}

	/// Retry schedule for a reconnecting socket client.
	#[derive(Debug, Clone, PartialEq)]
	pub struct BackoffPolicy {
		pub base: Duration,
		pub max: Duration,
		/// Fraction of the computed delay applied as random +/- jitter.
		pub jitter: f64,
		/// Reconnect attempts allowed before giving up.
		pub max_retries: u32,
		/// Lower bound used when the failure looked like rate limiting.
		pub rate_limit_floor: Duration,
	}

	impl BackoffPolicy {
		/// Twitch EventSub: `min(2^n * 1s, 10s)`, no jitter, 50 attempts.
		pub const fn eventsub() -> Self {
			Self {
				base: Duration::from_secs(1),
				max: Duration::from_secs(10),
				jitter: 0.0,
				max_retries: 50,
				rate_limit_floor: Duration::from_secs(10),
			}
		}

		/// 7TV event API: 1s base, 60s cap, 20% jitter, 8 attempts, 30s floor when rate limited.
		pub const fn seventv() -> Self {
			Self {
				base: Duration::from_secs(1),
				max: Duration::from_secs(60),
				jitter: 0.2,
				max_retries: 8,
				rate_limit_floor: Duration::from_secs(30),
			}
		}

		pub fn delay(&self, attempt: u32) -> Duration {
			self.delay_with(attempt, &mut rand::rng())
		}

		pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
			jitter(backoff_delay(attempt, self.base, self.max), self.jitter, rng)
		}

		pub fn rate_limited_delay(&self, attempt: u32) -> Duration {
			self.rate_limited_delay_with(attempt, &mut rand::rng())
		}

		/// Same curve started from the rate-limit floor, never below the floor.
		pub fn rate_limited_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
			let exp = backoff_delay(attempt, self.rate_limit_floor, self.max);
			jitter(exp, self.jitter, rng).max(self.rate_limit_floor)
		}

		/// Whether `retries` attempts already used up the budget.
		pub fn exhausted(&self, retries: u32) -> bool {
			retries >= self.max_retries
		}
	}

	#[cfg(test)]
	mod tests {
		use proptest::prelude::*;
		use rand::SeedableRng;
		use rand::rngs::StdRng;

		use super::*;

		#[test]
		fn eventsub_curve_doubles_then_caps() {
			let policy = BackoffPolicy::eventsub();
			let got: Vec<u64> = (0..6).map(|a| policy.delay(a).as_millis() as u64).collect();
			assert_eq!(got, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
		}

		#[test]
		fn huge_attempts_do_not_overflow() {
			let d = backoff_delay(u32::MAX, Duration::from_millis(500), Duration::from_secs(30));
			assert_eq!(d, Duration::from_secs(30));
		}

		#[test]
		fn exhausted_after_max_retries() {
			let policy = BackoffPolicy::seventv();
			assert!(!policy.exhausted(7));
			assert!(policy.exhausted(8));
		}

		proptest! {
			#[test]
			fn seventv_delay_stays_within_jitter_band(attempt in 0u32..40, seed in any::<u64>()) {
				let policy = BackoffPolicy::seventv();
				let mut rng = StdRng::seed_from_u64(seed);
				let d = policy.delay_with(attempt, &mut rng).as_millis() as f64;
				let exp = backoff_delay(attempt, policy.base, policy.max).as_millis() as f64;
				prop_assert!(d >= (exp * 0.8).floor() - 1.0);
				prop_assert!(d <= exp * 1.2);
			}

			#[test]
			fn rate_limited_delay_respects_floor(attempt in 0u32..40, seed in any::<u64>()) {
				let policy = BackoffPolicy::seventv();
				let mut rng = StdRng::seed_from_u64(seed);
				let d = policy.rate_limited_delay_with(attempt, &mut rng);
				prop_assert!(d >= policy.rate_limit_floor);
				prop_assert!(d.as_millis() as f64 <= policy.max.as_millis() as f64 * 1.2);
			}
		}
	}
}
