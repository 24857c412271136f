//! In-memory storage backend.
//!
//! All clients that share one `MemoryStorage` (for example several
//! coordinators in the same process) see a single consistent store. Conditional
//! writes are atomic because they run under the map's shard lock.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

/// In-memory storage implementation
#[derive(Default)]
pub struct MemoryStorage {
	data: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self {
			data: DashMap::new(),
		}
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		self.data
			.get(key)
			.map(|bytes| bytes.clone())
			.ok_or(StorageError::NotFound)
	}

	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
		self.data.insert(key.to_string(), value);
		Ok(())
	}

	async fn set_bytes_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StorageError> {
		match self.data.entry(key.to_string()) {
			Entry::Occupied(_) => Ok(false),
			Entry::Vacant(vacant) => {
				vacant.insert(value);
				Ok(true)
			}
		}
	}

	async fn compare_and_swap(
		&self,
		key: &str,
		expected: &[u8],
		value: Vec<u8>,
	) -> Result<bool, StorageError> {
		let mut current = self.data.get_mut(key).ok_or(StorageError::NotFound)?;
		if current.as_slice() != expected {
			return Ok(false);
		}
		*current = value;
		Ok(true)
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		self.data.remove(key);
		Ok(())
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		Ok(self
			.data
			.iter()
			.filter(|entry| entry.key().starts_with(prefix))
			.map(|entry| entry.key().clone())
			.collect())
	}
}

/// Factory function to create an in-memory backend. Takes no parameters.
pub fn create_storage(_config: &toml::Value) -> Box<dyn StorageInterface> {
	Box::new(MemoryStorage::new())
}
