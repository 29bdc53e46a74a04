use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Parameters, Policy, PolicyDefinition, PolicyFactory, PolicySpec, RouteMetadata};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("unknown policy {name}@{version}")]
	UnknownPolicy { name: String, version: String },

	#[error("factory for {name}@{version} failed: {source}")]
	Factory {
		name: String,
		version: String,
		#[source]
		source: anyhow::Error,
	},
}

struct Registered {
	definition: Arc<PolicyDefinition>,
	factory: PolicyFactory,
}

/// Maps `(name, version)` to the factory that builds instances for routes.
/// Registration happens at startup; lookups happen on every snapshot install.
#[derive(Clone, Default)]
pub struct PolicyRegistry {
	inner: Arc<RwLock<HashMap<(String, String), Registered>>>,
}

impl PolicyRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, definition: PolicyDefinition, factory: PolicyFactory) {
		let key = (definition.name.clone(), definition.version.clone());
		self.inner.write().insert(
			key,
			Registered {
				definition: Arc::new(definition),
				factory,
			},
		);
	}

	pub fn definition(&self, name: &str, version: &str) -> Option<Arc<PolicyDefinition>> {
		self
			.inner
			.read()
			.get(&(name.to_string(), version.to_string()))
			.map(|r| r.definition.clone())
	}

	pub fn contains(&self, name: &str, version: &str) -> bool {
		self
			.inner
			.read()
			.contains_key(&(name.to_string(), version.to_string()))
	}

	/// Resolve a spec: merge the definition's static parameters under the
	/// runtime parameters (runtime wins) and invoke the factory.
	pub fn build(
		&self,
		spec: &PolicySpec,
		route: &RouteMetadata,
	) -> Result<(Arc<dyn Policy>, Parameters), Error> {
		let guard = self.inner.read();
		let registered = guard
			.get(&(spec.name.clone(), spec.version.clone()))
			.ok_or_else(|| Error::UnknownPolicy {
				name: spec.name.clone(),
				version: spec.version.clone(),
			})?;
		let merged = registered.definition.merged_parameters(spec);
		let factory = registered.factory.clone();
		drop(guard);

		let instance = factory(route, &merged).map_err(|source| Error::Factory {
			name: spec.name.clone(),
			version: spec.version.clone(),
			source,
		})?;
		Ok((instance, merged))
	}
}

impl std::fmt::Debug for PolicyRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let keys: Vec<String> = self
			.inner
			.read()
			.keys()
			.map(|(n, v)| format!("{n}@{v}"))
			.collect();
		f.debug_struct("PolicyRegistry").field("policies", &keys).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::policy::ProcessingMode;

	struct Noop;

	#[async_trait::async_trait]
	impl Policy for Noop {
		fn mode(&self) -> ProcessingMode {
			ProcessingMode::passthrough()
		}

		async fn on_request(
			&self,
			_ctx: &mut crate::exec::context::RequestContext,
			_parameters: &Parameters,
		) -> anyhow::Result<Option<crate::policy::RequestAction>> {
			Ok(None)
		}
	}

	fn definition(name: &str) -> PolicyDefinition {
		PolicyDefinition {
			name: name.to_string(),
			version: "v1".to_string(),
			system_parameters: serde_json::from_value(serde_json::json!({
				"timeout": "30s",
				"target": "static",
			}))
			.unwrap(),
			..Default::default()
		}
	}

	#[test]
	fn merges_runtime_over_static_parameters() {
		let registry = PolicyRegistry::new();
		registry.register(definition("rate-limit"), Arc::new(|_, _| Ok(Arc::new(Noop))));

		let spec = PolicySpec {
			name: "rate-limit".into(),
			version: "v1".into(),
			enabled: true,
			parameters: serde_json::from_value(serde_json::json!({"target": "runtime"})).unwrap(),
			execution_condition: None,
		};
		let (_, merged) = registry.build(&spec, &RouteMetadata::default()).unwrap();
		assert_eq!(merged.get("target").unwrap(), "runtime");
		assert_eq!(merged.get("timeout").unwrap(), "30s");
	}

	#[test]
	fn unknown_policy_is_an_error() {
		let registry = PolicyRegistry::new();
		let spec = PolicySpec {
			name: "missing".into(),
			version: "v9".into(),
			..Default::default()
		};
		let err = registry.build(&spec, &RouteMetadata::default()).unwrap_err();
		assert!(matches!(err, Error::UnknownPolicy { .. }));
	}
}
