//! File-based storage backend.
//!
//! Each key is stored as one file under the base directory. Whole-value writes
//! go through a temp file and a rename. Insert-if-absent hard-links a fully
//! written temp file into place, so it is atomic even across processes sharing
//! the directory. Compare-and-swap is serialized by an in-process lock only.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;

const EXTENSION: &str = "bin";

/// File-based storage implementation.
pub struct FileStorage {
	/// Base directory path for storing files.
	base_path: PathBuf,
	/// Serializes compare-and-swap within this process.
	swap_lock: Mutex<()>,
	temp_counter: AtomicU64,
}

/// Escapes the characters that are unsafe in file names, reversibly.
fn encode_key(key: &str) -> String {
	let mut out = String::with_capacity(key.len());
	for c in key.chars() {
		match c {
			'%' => out.push_str("%25"),
			'/' => out.push_str("%2F"),
			':' => out.push_str("%3A"),
			'\\' => out.push_str("%5C"),
			_ => out.push(c),
		}
	}
	out
}

fn decode_key(name: &str) -> Option<String> {
	let mut out = String::with_capacity(name.len());
	let mut chars = name.chars();
	while let Some(c) = chars.next() {
		if c != '%' {
			out.push(c);
			continue;
		}
		let code: String = chars.by_ref().take(2).collect();
		match code.as_str() {
			"25" => out.push('%'),
			"2F" => out.push('/'),
			"3A" => out.push(':'),
			"5C" => out.push('\\'),
			_ => return None,
		}
	}
	Some(out)
}

fn backend_error(e: std::io::Error) -> StorageError {
	StorageError::Backend(e.to_string())
}

impl FileStorage {
	/// Creates a new FileStorage instance with the specified base path.
	pub fn new(base_path: PathBuf) -> Self {
		Self {
			base_path,
			swap_lock: Mutex::new(()),
			temp_counter: AtomicU64::new(0),
		}
	}

	fn get_file_path(&self, key: &str) -> PathBuf {
		self.base_path
			.join(format!("{}.{}", encode_key(key), EXTENSION))
	}

	fn temp_path(&self) -> PathBuf {
		let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
		self.base_path
			.join(format!(".{}-{}.tmp", std::process::id(), n))
	}

	async fn write_temp(&self, value: &[u8]) -> Result<PathBuf, StorageError> {
		fs::create_dir_all(&self.base_path)
			.await
			.map_err(backend_error)?;
		let temp_path = self.temp_path();
		fs::write(&temp_path, value).await.map_err(backend_error)?;
		Ok(temp_path)
	}

	async fn replace(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
		let temp_path = self.write_temp(value).await?;
		fs::rename(&temp_path, self.get_file_path(key))
			.await
			.map_err(backend_error)
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let path = self.get_file_path(key);

		match fs::read(&path).await {
			Ok(data) => Ok(data),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
			Err(e) => Err(backend_error(e)),
		}
	}

	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
		self.replace(key, &value).await
	}

	async fn set_bytes_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StorageError> {
		let temp_path = self.write_temp(&value).await?;
		let result = fs::hard_link(&temp_path, self.get_file_path(key)).await;
		let _ = fs::remove_file(&temp_path).await;

		match result {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
			Err(e) => Err(backend_error(e)),
		}
	}

	async fn compare_and_swap(
		&self,
		key: &str,
		expected: &[u8],
		value: Vec<u8>,
	) -> Result<bool, StorageError> {
		let _guard = self.swap_lock.lock().await;

		let current = self.get_bytes(key).await?;
		if current != expected {
			return Ok(false);
		}
		self.replace(key, &value).await?;
		Ok(true)
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		let path = self.get_file_path(key);

		match fs::remove_file(&path).await {
			Ok(_) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(backend_error(e)),
		}
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		let mut entries = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(backend_error(e)),
		};

		let mut keys = Vec::new();
		while let Some(entry) = entries.next_entry().await.map_err(backend_error)? {
			let name = entry.file_name();
			let Some(name) = name.to_str() else {
				continue;
			};
			let Some(stem) = name.strip_suffix(&format!(".{}", EXTENSION)) else {
				continue;
			};
			if let Some(key) = decode_key(stem) {
				if key.starts_with(prefix) {
					keys.push(key);
				}
			}
		}
		Ok(keys)
	}
}

/// Factory function to create a storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for file storage (default: "./data/storage")
pub fn create_storage(config: &toml::Value) -> Box<dyn StorageInterface> {
	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage")
		.to_string();

	Box::new(FileStorage::new(PathBuf::from(storage_path)))
}
