//! Storage module for the split-bill settlement system.
//!
//! This module provides abstractions for the shared durable store every client
//! reads and writes. Backends only need to offer key-value primitives plus two
//! conditional writes (insert-if-absent and compare-and-swap); all cross-client
//! safety of the settlement protocol is built on those two operations.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when a requested item is not found.
	#[error("Not found")]
	NotFound,
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// A conditional write lost against a concurrent writer.
	#[error("Conflict: {0}")]
	Conflict(String),
}

/// Trait defining the low-level interface for storage backends.
///
/// This trait must be implemented by any storage backend that wants to
/// integrate with the settlement system. It provides basic key-value operations
/// and the conditional writes used for idempotency.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Retrieves raw bytes for the given key.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores raw bytes, replacing any previous value.
	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

	/// Stores raw bytes only if the key does not exist yet.
	///
	/// Returns `true` when this call created the key.
	async fn set_bytes_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StorageError>;

	/// Replaces the value only if the current bytes equal `expected`.
	///
	/// Returns `false` when the stored value differs, `NotFound` when the key
	/// does not exist.
	async fn compare_and_swap(
		&self,
		key: &str,
		expected: &[u8],
		value: Vec<u8>,
	) -> Result<bool, StorageError>;

	/// Deletes the value associated with the given key.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	/// Lists every key starting with `prefix`, in no particular order.
	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// High-level storage service that provides typed operations.
///
/// The StorageService wraps a low-level storage backend and provides
/// convenient methods for storing and retrieving typed data with
/// automatic serialization/deserialization.
pub struct StorageService {
	/// The underlying storage backend implementation.
	backend: Box<dyn StorageInterface>,
}

fn key_for(namespace: &str, id: &str) -> String {
	format!("{}:{}", namespace, id)
}

fn encode<T: Serialize>(data: &T) -> Result<Vec<u8>, StorageError> {
	serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
	serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl StorageService {
	/// Creates a new StorageService with the specified backend.
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	/// Stores a serializable value.
	///
	/// The namespace and id are combined to form a unique key.
	/// The data is serialized to JSON before storage.
	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let bytes = encode(data)?;
		self.backend.set_bytes(&key_for(namespace, id), bytes).await
	}

	/// Stores a value only if nothing is stored under the same key yet.
	///
	/// Returns `true` when the value was written by this call.
	pub async fn store_if_absent<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<bool, StorageError> {
		let bytes = encode(data)?;
		self.backend
			.set_bytes_if_absent(&key_for(namespace, id), bytes)
			.await
	}

	/// Replaces `expected` with `data`, failing with `Conflict` when the stored
	/// value is no longer `expected`.
	///
	/// Both values go through the same JSON encoding, so the comparison is
	/// exact for types without unordered maps.
	pub async fn compare_and_swap<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		expected: &T,
		data: &T,
	) -> Result<(), StorageError> {
		let key = key_for(namespace, id);
		let expected = encode(expected)?;
		let bytes = encode(data)?;
		if self.backend.compare_and_swap(&key, &expected, bytes).await? {
			Ok(())
		} else {
			Err(StorageError::Conflict(key))
		}
	}

	/// Retrieves and deserializes a value from storage.
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&key_for(namespace, id)).await?;
		decode(&bytes)
	}

	/// Like [`retrieve`](Self::retrieve) but maps `NotFound` to `None`.
	pub async fn retrieve_optional<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<Option<T>, StorageError> {
		match self.retrieve(namespace, id).await {
			Ok(value) => Ok(Some(value)),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Retrieves every value whose id starts with `id_prefix` in `namespace`.
	///
	/// Entries deleted between listing and reading are skipped.
	pub async fn list<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id_prefix: &str,
	) -> Result<Vec<T>, StorageError> {
		let keys = self
			.backend
			.list_keys(&key_for(namespace, id_prefix))
			.await?;

		let mut values = Vec::with_capacity(keys.len());
		for key in keys {
			match self.backend.get_bytes(&key).await {
				Ok(bytes) => values.push(decode(&bytes)?),
				Err(StorageError::NotFound) => continue,
				Err(e) => return Err(e),
			}
		}
		Ok(values)
	}

	/// Removes a value from storage.
	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&key_for(namespace, id)).await
	}
}

/// Builds a storage backend by name.
///
/// Known backends are `memory` and `file`; see each implementation's factory
/// for its configuration parameters.
pub fn create_storage(
	backend: &str,
	config: &toml::Value,
) -> Result<Box<dyn StorageInterface>, StorageError> {
	match backend {
		"memory" => Ok(implementations::memory::create_storage(config)),
		"file" => Ok(implementations::file::create_storage(config)),
		other => Err(StorageError::Backend(format!(
			"Unknown storage backend: {}",
			other
		))),
	}
}
