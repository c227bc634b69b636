use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Key-addressed artifact store. Control-plane records and binary artifacts
/// (narration clips, export manifests) both go through here, under different keys.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

pub async fn read_json<T: DeserializeOwned>(storage: &dyn Storage, path: &str) -> Result<Option<T>> {
    if !storage.exists(path).await? {
        return Ok(None);
    }
    let bytes = storage.read(path).await?;
    let value = serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path))?;
    Ok(Some(value))
}

pub async fn write_json<T: Serialize>(storage: &dyn Storage, path: &str, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    storage
        .write(path, content.as_bytes())
        .await
        .with_context(|| format!("Failed to write {}", path))
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Record {
        name: String,
    }

    #[tokio::test]
    async fn test_json_helpers_create_parents_and_report_missing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let path = dir.path().join("nested").join("record.json");
        let path = path.to_string_lossy().to_string();

        let missing: Option<Record> = read_json(&storage, &path).await?;
        assert!(missing.is_none());

        write_json(&storage, &path, &Record { name: "scene".to_string() }).await?;
        assert!(storage.exists(&path).await?);
        let loaded: Option<Record> = read_json(&storage, &path).await?;
        assert_eq!(loaded, Some(Record { name: "scene".to_string() }));
        Ok(())
    }
}
