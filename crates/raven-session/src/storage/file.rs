//! Worker registry persisted as a JSON file.
//!
//! The file is one object keyed by host:
//!
//! ```json
//! {
//! 	"10.0.0.5": {
//! 		"machine": "gpu1",
//! 		"devices": [{"name": "GPU-A", "int_name": "dev:0", "memory": 8589934592}]
//! 	}
//! }
//! ```
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! crash never leaves a half-written registry behind.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use raven_core::{NodeInfo, RegistryError, WorkerDescriptor, WorkerRegistry};
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use tokio::{io::AsyncWriteExt, sync::Mutex};

type Nodes = BTreeMap<String, NodeInfo>;

/// Registry backed by a JSON file.
///
/// Read-modify-write cycles are serialized within the process.
pub struct JsonFileRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileRegistry {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Nodes, RegistryError> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Nodes::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(Nodes::new());
        }
        Ok(serde_json::from_slice(&contents)?)
    }

    async fn store(&self, nodes: &Nodes) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut serialized = Vec::new();
        let mut serializer = Serializer::with_formatter(&mut serialized, PrettyFormatter::with_indent(b"\t"));
        nodes.serialize(&mut serializer)?;

        let temp_path = self.path.with_extension(format!("json.{}.tmp", std::process::id()));
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&serialized).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        tracing::debug!(path = %self.path.display(), nodes = nodes.len(), "Registry saved");
        Ok(())
    }
}

#[async_trait]
impl WorkerRegistry for JsonFileRegistry {
    async fn get(&self, host: &str) -> Result<Option<WorkerDescriptor>, RegistryError> {
        let _guard = self.lock.lock().await;
        let mut nodes = self.load().await?;
        Ok(nodes.remove(host).map(|info| WorkerDescriptor::from_node_info(host, info)))
    }

    async fn put(&self, worker: &WorkerDescriptor) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().await;
        let mut nodes = self.load().await?;
        nodes.insert(worker.host.clone(), worker.node_info());
        self.store(&nodes).await
    }

    async fn list(&self) -> Result<Vec<WorkerDescriptor>, RegistryError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .into_iter()
            .map(|(host, info)| WorkerDescriptor::from_node_info(host, info))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use raven_core::DeviceDescriptor;
    use serde_json::{Value, json};

    use super::*;

    fn gpu1() -> WorkerDescriptor {
        WorkerDescriptor::from_node_info(
            "10.0.0.5",
            NodeInfo::new("gpu1").with_device(DeviceDescriptor::new("GPU-A", "dev:0", 8_589_934_592)),
        )
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JsonFileRegistry::new(dir.path().join(".odin/nodes.json"));
        assert!(registry.list().await.unwrap().is_empty());
        assert!(registry.get("10.0.0.5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_writes_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".odin/nodes.json");
        let registry = JsonFileRegistry::new(&path);

        registry.put(&gpu1()).await.unwrap();

        let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            on_disk,
            json!({
                "10.0.0.5": {
                    "machine": "gpu1",
                    "devices": [{"name": "GPU-A", "int_name": "dev:0", "memory": 8_589_934_592_u64}]
                }
            })
        );
        assert_eq!(registry.get("10.0.0.5").await.unwrap(), Some(gpu1()));
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        JsonFileRegistry::new(&path).put(&gpu1()).await.unwrap();
        let reopened = JsonFileRegistry::new(&path);
        assert_eq!(reopened.list().await.unwrap(), vec![gpu1()]);
    }

    #[tokio::test]
    async fn test_reads_hand_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        std::fs::write(&path, r#"{"10.0.0.9": {"machine": "cpu-box"}}"#).unwrap();

        let worker = JsonFileRegistry::new(&path).get("10.0.0.9").await.unwrap().unwrap();
        assert_eq!(worker.machine_name, "cpu-box");
        assert!(worker.devices.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = JsonFileRegistry::new(&path).list().await.unwrap_err();
        assert!(matches!(err, RegistryError::Json(_)));
    }

    #[tokio::test]
    async fn test_concurrent_puts_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JsonFileRegistry::new(dir.path().join("nodes.json")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let worker = WorkerDescriptor::from_node_info(format!("10.0.0.{i}"), NodeInfo::new(format!("n{i}")));
                    registry.put(&worker).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.list().await.unwrap().len(), 8);
    }
}
