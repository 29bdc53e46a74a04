use std::sync::Arc;

pub mod apikeys;
pub mod counters;
pub mod lazy;
pub mod snapshot;

pub use apikeys::ApiKeyStore;
pub use counters::RequestCountStore;
pub use lazy::LazyResourceStore;
pub use snapshot::SnapshotStore;

/// The process-wide stores, injected rather than reached for globally so
/// tests can stand up isolated copies. Writers are the xDS handler task;
/// readers are the request-handling tasks.
#[derive(Clone, Debug, Default)]
pub struct Stores {
	pub snapshot: Arc<SnapshotStore>,
	pub api_keys: Arc<ApiKeyStore>,
	pub lazy: Arc<LazyResourceStore>,
	pub counts: Arc<RequestCountStore>,
}

impl Stores {
	pub fn new() -> Self {
		Self::default()
	}
}
