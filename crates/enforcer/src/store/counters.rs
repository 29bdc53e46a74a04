use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Process-wide tallies keyed by a caller-chosen string. Counters are created
/// on first increment; reads of unknown keys are zero.
#[derive(Debug, Default)]
pub struct RequestCountStore {
	counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl RequestCountStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn counter(&self, key: &str) -> Arc<AtomicU64> {
		if let Some(counter) = self.counters.read().get(key) {
			return counter.clone();
		}
		self
			.counters
			.write()
			.entry(key.to_string())
			.or_default()
			.clone()
	}

	/// Increments and returns the new value.
	pub fn increment(&self, key: &str) -> u64 {
		self.counter(key).fetch_add(1, Ordering::Relaxed) + 1
	}

	pub fn get(&self, key: &str) -> u64 {
		self
			.counters
			.read()
			.get(key)
			.map(|c| c.load(Ordering::Relaxed))
			.unwrap_or(0)
	}

	pub fn reset(&self, key: &str) {
		if let Some(counter) = self.counters.read().get(key) {
			counter.store(0, Ordering::Relaxed);
		}
	}

	pub fn remove(&self, key: &str) {
		self.counters.write().remove(key);
	}
}
