use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Typed metadata resource pushed by the control plane. Identity is the
/// `(resource type, id)` pair; the payload is opaque to the engine.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct LazyResource {
	pub resource_type: String,
	pub id: String,
	#[serde(default)]
	pub payload: Payload,
}

/// State-of-the-world store: every push replaces the full set, and anything
/// not present in the push is gone.
#[derive(Debug, Default)]
pub struct LazyResourceStore {
	resources: RwLock<HashMap<(String, String), Arc<Payload>>>,
}

impl LazyResourceStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Precise lookup by `(type, id)`.
	pub fn get_typed(&self, resource_type: &str, id: &str) -> Option<Arc<Payload>> {
		self
			.resources
			.read()
			.get(&(resource_type.to_string(), id.to_string()))
			.cloned()
	}

	/// Lookup by id alone; ambiguous when two types share an id, in which
	/// case which one is returned is unspecified.
	pub fn get(&self, id: &str) -> Option<Arc<Payload>> {
		self
			.resources
			.read()
			.iter()
			.find(|((_, rid), _)| rid == id)
			.map(|(_, payload)| payload.clone())
	}

	pub fn list(&self, resource_type: &str) -> Vec<(String, Arc<Payload>)> {
		self
			.resources
			.read()
			.iter()
			.filter(|((rtype, _), _)| rtype == resource_type)
			.map(|((_, id), payload)| (id.clone(), payload.clone()))
			.collect()
	}

	pub fn replace_all(&self, resources: Vec<LazyResource>) {
		let next: HashMap<_, _> = resources
			.into_iter()
			.map(|r| ((r.resource_type, r.id), Arc::new(r.payload)))
			.collect();
		debug!(resources = next.len(), "replacing lazy resources");
		*self.resources.write() = next;
	}

	pub fn len(&self) -> usize {
		self.resources.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.resources.read().is_empty()
	}
}
