use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::exec::RouteChain;

/// An immutable map from route id to resolved policy chain. Built off-line by
/// the policy-chain handler and published whole; readers never observe a
/// partial install.
#[derive(Default)]
pub struct Snapshot {
	pub version: String,
	pub routes: HashMap<String, Arc<RouteChain>>,
}

impl Snapshot {
	pub fn new(version: impl Into<String>, routes: HashMap<String, Arc<RouteChain>>) -> Self {
		Self {
			version: version.into(),
			routes,
		}
	}
}

impl std::fmt::Debug for Snapshot {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Snapshot")
			.field("version", &self.version)
			.field("routes", &self.routes.keys().collect::<Vec<_>>())
			.finish()
	}
}

/// The per-request lookup takes no locks: the current snapshot is an
/// atomically swapped reference.
#[derive(Debug, Default)]
pub struct SnapshotStore {
	current: ArcSwap<Snapshot>,
}

impl SnapshotStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn current(&self) -> Arc<Snapshot> {
		self.current.load_full()
	}

	pub fn chain(&self, route_id: &str) -> Option<Arc<RouteChain>> {
		self.current.load().routes.get(route_id).cloned()
	}

	pub fn install(&self, snapshot: Snapshot) {
		info!(
			version = %snapshot.version,
			routes = snapshot.routes.len(),
			"installing policy-chain snapshot"
		);
		self.current.store(Arc::new(snapshot));
	}

	/// True once any snapshot (even an empty one) has been pushed.
	pub fn installed(&self) -> bool {
		!self.current.load().version.is_empty()
	}
}
