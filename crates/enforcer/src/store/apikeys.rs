use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hashing;

#[cfg(test)]
#[path = "apikeys_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("duplicate key id {id} for API {api_id}")]
	Conflict { api_id: String, id: String },
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
	#[default]
	Active,
	Expired,
	Revoked,
}

/// One provisioned API key. `key_hash` is the prefix-identified stored hash of
/// the key's secret part; the engine never sees unhashed secrets at rest.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
	pub id: String,
	pub name: String,
	pub key_hash: String,
	pub api_id: String,
	/// `*` or explicit `METHOD path` entries.
	#[serde(default)]
	pub allowed_operations: Vec<String>,
	#[serde(default)]
	pub status: KeyStatus,
	#[serde(default)]
	pub created_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub updated_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
}

/// Supplied keys have the shape `<secret>.<hex(key id)>`; split at the last
/// dot so secrets may themselves contain dots.
fn parse_supplied(supplied: &str) -> Option<(&str, String)> {
	let (secret, id_hex) = supplied.rsplit_once('.')?;
	if secret.is_empty() {
		return None;
	}
	let id = hex::decode(id_hex).ok()?;
	let id = String::from_utf8(id).ok()?;
	Some((secret, id))
}

fn operation_allowed(allowed: &[String], method: &str, path: &str) -> bool {
	let wanted = format!("{} {}", method.to_ascii_uppercase(), path);
	allowed.iter().any(|op| op == "*" || op == &wanted)
}

/// Concurrency-safe key state, mutated only by xDS op batches. Records are
/// indexed by `(api id, key id)`.
#[derive(Debug, Default)]
pub struct ApiKeyStore {
	records: RwLock<HashMap<(String, String), ApiKeyRecord>>,
}

impl ApiKeyStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Upsert by `(api id, display name)`: a record with the same name for
	/// the same API is replaced in place. An id collision with a *different*
	/// name is a conflict and fails the calling batch.
	pub fn store(&self, record: ApiKeyRecord) -> Result<(), Error> {
		let mut records = self.records.write();
		let key = (record.api_id.clone(), record.id.clone());

		if let Some(existing) = records.get(&key)
			&& existing.name != record.name
		{
			return Err(Error::Conflict {
				api_id: record.api_id,
				id: record.id,
			});
		}
		// Same display name under a new id: drop the old entry first.
		let prior = records
			.iter()
			.find(|((api, _), r)| *api == record.api_id && r.name == record.name && r.id != record.id)
			.map(|(k, _)| k.clone());
		if let Some(prior) = prior {
			records.remove(&prior);
		}

		debug!(api_id = %record.api_id, id = %record.id, "storing API key");
		records.insert(key, record);
		Ok(())
	}

	/// Validates a supplied plaintext key for `METHOD path` on an API.
	/// Constant-time with respect to the supplied key material; a lookup miss
	/// is a deny, not an error. An active record past its expiry is
	/// transitioned to `Expired` and denied.
	pub fn validate(&self, api_id: &str, path: &str, method: &str, supplied: &str) -> bool {
		let Some((secret, id)) = parse_supplied(supplied) else {
			return false;
		};
		let key = (api_id.to_string(), id);
		let Some(record) = self.records.read().get(&key).cloned() else {
			return false;
		};

		if !hashing::verify_stored_hash(&record.key_hash, secret) {
			return false;
		}
		if record.status == KeyStatus::Active
			&& let Some(expires_at) = record.expires_at
			&& expires_at < Utc::now()
		{
			let mut records = self.records.write();
			if let Some(stored) = records.get_mut(&key) {
				stored.status = KeyStatus::Expired;
				stored.updated_at = Some(Utc::now());
			}
			debug!(api_id, id = %key.1, "API key expired");
			return false;
		}
		if record.status != KeyStatus::Active {
			return false;
		}
		operation_allowed(&record.allowed_operations, method, path)
	}

	/// Revokes the record matching the supplied plaintext key. Missing or
	/// already-revoked keys are a no-op, so replays of the same op batch are
	/// harmless.
	pub fn revoke(&self, api_id: &str, supplied: &str) {
		let Some((secret, id)) = parse_supplied(supplied) else {
			return;
		};
		let key = (api_id.to_string(), id);
		let mut records = self.records.write();
		if let Some(record) = records.get_mut(&key)
			&& hashing::verify_stored_hash(&record.key_hash, secret)
			&& record.status != KeyStatus::Revoked
		{
			record.status = KeyStatus::Revoked;
			record.updated_at = Some(Utc::now());
			debug!(api_id, id = %key.1, "API key revoked");
		}
	}

	pub fn remove_by_api(&self, api_id: &str) {
		let mut records = self.records.write();
		records.retain(|(api, _), _| api != api_id);
	}

	pub fn clear(&self) {
		self.records.write().clear();
	}

	pub fn get(&self, api_id: &str, id: &str) -> Option<ApiKeyRecord> {
		self
			.records
			.read()
			.get(&(api_id.to_string(), id.to_string()))
			.cloned()
	}

	pub fn count(&self) -> usize {
		self.records.read().len()
	}
}
