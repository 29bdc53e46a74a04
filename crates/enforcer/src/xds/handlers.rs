use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::client::ResourceHandler;
use super::{
	API_KEY_STATE_TYPE_URL, ApiKeyAction, ApiKeyOpBatch, LAZY_RESOURCE_TYPE_URL,
	POLICY_CHAIN_TYPE_URL, PolicyChainResource,
};
use crate::exec::{ChainEntry, RouteChain};
use crate::policy::registry::PolicyRegistry;
use crate::store::lazy::LazyResource;
use crate::store::snapshot::Snapshot;
use crate::store::{ApiKeyStore, LazyResourceStore, SnapshotStore};

/// Builds and installs policy-chain snapshots. All-or-nothing: any
/// undecodable resource or factory failure rejects the whole push and the
/// prior snapshot keeps serving.
pub struct PolicyChainHandler {
	registry: PolicyRegistry,
	snapshots: Arc<SnapshotStore>,
}

impl PolicyChainHandler {
	pub fn new(registry: PolicyRegistry, snapshots: Arc<SnapshotStore>) -> Self {
		Self { registry, snapshots }
	}
}

impl ResourceHandler for PolicyChainHandler {
	fn type_url(&self) -> &'static str {
		POLICY_CHAIN_TYPE_URL
	}

	fn apply(&self, version: &str, resources: &[prost_types::Any]) -> anyhow::Result<()> {
		let prior = self.snapshots.current();
		let mut routes = HashMap::with_capacity(resources.len());

		for any in resources {
			let resource: PolicyChainResource = serde_json::from_slice(&any.value)?;
			let route_id = resource.route.route_name.clone();
			let prior_chain = prior.routes.get(&route_id);

			let mut entries = Vec::with_capacity(resource.policies.len());
			for spec in resource.policies {
				// An instance from the prior snapshot is reusable when the
				// same route carries the same policy with equal parameters.
				let reusable = prior_chain.and_then(|chain| {
					chain.entries.iter().find(|e| {
						e.spec.name == spec.name
							&& e.spec.version == spec.version
							&& e.spec.parameters == spec.parameters
					})
				});
				let instance = match reusable {
					Some(entry) => {
						debug!(route = %route_id, policy = %spec.key(), "reusing policy instance");
						entry.instance.clone()
					},
					None => self.registry.build(&spec, &resource.route)?.0,
				};
				entries.push(ChainEntry {
					spec: Arc::new(spec),
					instance,
				});
			}
			routes.insert(route_id, Arc::new(RouteChain::new(resource.route, entries)));
		}

		self.snapshots.install(Snapshot::new(version, routes));
		Ok(())
	}
}

/// Applies API-key operation batches in order. Ordering is guaranteed; batch
/// atomicity is not, so ops applied before a failing op stay applied and the
/// push as a whole is NACKed.
pub struct ApiKeyHandler {
	store: Arc<ApiKeyStore>,
}

impl ApiKeyHandler {
	pub fn new(store: Arc<ApiKeyStore>) -> Self {
		Self { store }
	}
}

impl ResourceHandler for ApiKeyHandler {
	fn type_url(&self) -> &'static str {
		API_KEY_STATE_TYPE_URL
	}

	fn apply(&self, _version: &str, resources: &[prost_types::Any]) -> anyhow::Result<()> {
		for any in resources {
			let batch: ApiKeyOpBatch = serde_json::from_slice(&any.value)?;
			debug!(batch = %batch.batch_id, ops = batch.ops.len(), "applying API key batch");
			for op in batch.ops {
				match op.action {
					ApiKeyAction::Store => {
						let record = op
							.key
							.ok_or_else(|| anyhow::anyhow!("store op without key payload"))?;
						self.store.store(record)?;
					},
					ApiKeyAction::Revoke => {
						let plaintext = op
							.plaintext_key
							.ok_or_else(|| anyhow::anyhow!("revoke op without key payload"))?;
						self.store.revoke(&op.api_id, &plaintext);
					},
					ApiKeyAction::RemoveByApi => {
						self.store.remove_by_api(&op.api_id);
					},
				}
			}
		}
		Ok(())
	}
}

/// State-of-the-world replacement of the lazy/metadata resource set.
pub struct LazyResourceHandler {
	store: Arc<LazyResourceStore>,
}

impl LazyResourceHandler {
	pub fn new(store: Arc<LazyResourceStore>) -> Self {
		Self { store }
	}
}

impl ResourceHandler for LazyResourceHandler {
	fn type_url(&self) -> &'static str {
		LAZY_RESOURCE_TYPE_URL
	}

	fn apply(&self, _version: &str, resources: &[prost_types::Any]) -> anyhow::Result<()> {
		let decoded = resources
			.iter()
			.map(|any| serde_json::from_slice::<LazyResource>(&any.value))
			.collect::<Result<Vec<_>, _>>()?;
		self.store.replace_all(decoded);
		Ok(())
	}
}
