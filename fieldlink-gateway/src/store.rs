//! Crash-safe persistence of the device document.
//!
//! One store instance is shared by every component that touches the file.
//! All file access goes through a single async lock acquired with a bounded
//! wait, and a document only ever reaches the live path through a verified
//! temp file plus `rename`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};

use crate::document::{ConfigDocument, DocumentError};
use crate::outbox::Outbox;

/// What `validate` should check.
#[derive(Debug)]
pub enum ConfigSource<'a> {
    /// A document file on disk, read under the file lock.
    File(&'a Path),
    /// An already parsed document.
    Document(serde_json::Value),
}

/// Timing knobs for file access and startup retries.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Longest wait for the file lock.
    pub lock_wait: Duration,
    /// Read attempts made by `read_setup` before falling back.
    pub attempts: u32,
    /// Retry delay grows by this much per attempt.
    pub retry_base: Duration,
    /// Upper bound of the random extra delay per retry.
    pub retry_jitter: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(10),
            attempts: 5,
            retry_base: Duration::from_secs(1),
            retry_jitter: Duration::from_secs(1),
        }
    }
}

/// Owner of the live document file.
#[derive(Debug)]
pub struct ConfigStore {
    live_path: PathBuf,
    temp_path: PathBuf,
    lock: Mutex<()>,
    options: StoreOptions,
    outbox: Arc<Outbox>,
}

impl ConfigStore {
    /// Create a store; `temp_path` defaults to `<stem>_temp.json` beside the live file.
    pub fn new(
        live_path: impl Into<PathBuf>,
        temp_path: Option<PathBuf>,
        options: StoreOptions,
        outbox: Arc<Outbox>,
    ) -> Self {
        let live_path = live_path.into();
        let temp_path = temp_path.unwrap_or_else(|| default_temp_path(&live_path));
        Self {
            live_path,
            temp_path,
            lock: Mutex::new(()),
            options,
            outbox,
        }
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Parse and range-check a document from a file or from memory.
    pub async fn validate(
        &self,
        source: ConfigSource<'_>,
    ) -> Result<ConfigDocument, DocumentError> {
        match source {
            ConfigSource::Document(value) => ConfigDocument::from_value(value),
            ConfigSource::File(path) => {
                let _guard = self.acquire().await?;
                self.validate_file_locked(path).await
            }
        }
    }

    /// The live document as currently on disk.
    pub async fn current(&self) -> Result<ConfigDocument, DocumentError> {
        self.validate(ConfigSource::File(&self.live_path)).await
    }

    /// Load the live document, retrying a few times before falling back.
    ///
    /// Never fails: after the last attempt the built-in fallback document
    /// is returned. With `announce` set, the loaded port settings are
    /// reported as a state message.
    pub async fn read_setup(&self, announce: bool) -> ConfigDocument {
        let attempts = self.options.attempts.max(1);

        for attempt in 1..=attempts {
            match self.current().await {
                Ok(document) => {
                    if announce {
                        self.outbox.push_state(format!(
                            "started with configuration {}, {} operations",
                            document.port_config,
                            document.operation_count()
                        ));
                    }
                    return document;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.live_path.display(),
                        attempt,
                        attempts,
                        error = %e,
                        "Failed to read configuration document"
                    );
                    if attempt > 1 {
                        self.outbox.push_state(format!(
                            "reading configuration failed ({}/{}): {}",
                            attempt, attempts, e
                        ));
                    }
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_delay(attempt)).await;
                    }
                }
            }
        }

        let fallback = ConfigDocument::fallback();
        self.outbox.push_state(format!(
            "no valid configuration found, using fallback {}",
            fallback.port_config
        ));
        fallback
    }

    /// Replace the live document with `document`.
    ///
    /// The candidate is written to the temp path and synced, then read back
    /// and validated. Only an exact match is renamed over the live file;
    /// anything else removes the temp file and leaves the live file as it was.
    pub async fn execute_configuration_message(
        &self,
        document: &ConfigDocument,
    ) -> Result<(), DocumentError> {
        let bytes = document.to_pretty_json()?;
        let _guard = self.acquire().await?;

        if let Err(e) = self.write_staged(&bytes).await {
            self.discard_staged().await;
            return Err(e.into());
        }

        let staged = match tokio::fs::read(&self.temp_path).await {
            Ok(staged) => staged,
            Err(e) => {
                self.discard_staged().await;
                return Err(e.into());
            }
        };

        if staged != bytes {
            self.discard_staged().await;
            return Err(DocumentError::Mismatch(format!(
                "wrote {} bytes, read back {}",
                bytes.len(),
                staged.len()
            )));
        }

        match self.validate_file_locked(&self.temp_path).await {
            Ok(reread) if reread == *document => {}
            Ok(_) => {
                self.discard_staged().await;
                return Err(DocumentError::Mismatch(
                    "document changed on re-read".to_string(),
                ));
            }
            Err(e) => {
                self.discard_staged().await;
                return Err(e);
            }
        }

        if let Err(e) = tokio::fs::rename(&self.temp_path, &self.live_path).await {
            self.discard_staged().await;
            return Err(e.into());
        }

        tracing::info!(
            path = %self.live_path.display(),
            operations = document.operation_count(),
            "Configuration document committed"
        );
        Ok(())
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, ()>, DocumentError> {
        tokio::time::timeout(self.options.lock_wait, self.lock.lock())
            .await
            .map_err(|_| DocumentError::LockTimeout)
    }

    async fn validate_file_locked(&self, path: &Path) -> Result<ConfigDocument, DocumentError> {
        if path != self.temp_path && tokio::fs::try_exists(&self.temp_path).await? {
            self.recover_staged().await;
        }

        let text = tokio::fs::read_to_string(path).await?;
        ConfigDocument::parse(&text)
    }

    /// Finish or roll back a swap interrupted by a crash.
    async fn recover_staged(&self) {
        let staged = match tokio::fs::read_to_string(&self.temp_path).await {
            Ok(text) => ConfigDocument::parse(&text),
            Err(e) => Err(e.into()),
        };

        match staged {
            Ok(_) => match tokio::fs::rename(&self.temp_path, &self.live_path).await {
                Ok(()) => tracing::warn!(
                    temp = %self.temp_path.display(),
                    "Promoted staged configuration left by an interrupted write"
                ),
                Err(e) => tracing::error!(error = %e, "Failed to promote staged configuration"),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Discarding invalid staged configuration");
                self.discard_staged().await;
            }
        }
    }

    async fn write_staged(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(&self.temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }

    async fn discard_staged(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "Failed to remove staged configuration");
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.options.retry_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        self.options.retry_base * attempt + jitter
    }
}

fn default_temp_path(live: &Path) -> PathBuf {
    let stem = live
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "setup".to_string());
    live.with_file_name(format!("{}_temp.json", stem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_common::{Compression, Format, OutboundMessage};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn quick() -> StoreOptions {
        StoreOptions {
            lock_wait: Duration::from_secs(5),
            attempts: 3,
            retry_base: Duration::from_millis(1),
            retry_jitter: Duration::ZERO,
        }
    }

    fn store_in(dir: &Path) -> (ConfigStore, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let outbox = Arc::new(Outbox::with_encoding(tx, 10, Format::Json, Compression::None));
        (
            ConfigStore::new(dir.join("setup_modbus.json"), None, quick(), outbox),
            rx,
        )
    }

    fn states(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(serde_json::from_slice(&message.payload).unwrap());
        }
        out
    }

    fn document(baud: u32) -> ConfigDocument {
        ConfigDocument::from_value(json!({
            "port_config": {
                "port": "/dev/ttyS1",
                "baudrate": baud,
                "databits": 8,
                "parity": "N",
                "stopbits": 1.0,
                "timeout_connection": 1.0
            },
            "slaveconfig": {
                "meter": {
                    "slave_id": 1,
                    "operations": {
                        "power": {
                            "startadress": 0,
                            "function_code": 4,
                            "display_name": "meter_power",
                            "sampling_interval": 1.0,
                            "quantity_of_x": 2
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_default_temp_path() {
        assert_eq!(
            default_temp_path(Path::new("/etc/fieldlink/setup_modbus.json")),
            PathBuf::from("/etc/fieldlink/setup_modbus_temp.json")
        );
    }

    #[tokio::test]
    async fn test_commit_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = store_in(dir.path());

        store.execute_configuration_message(&document(9600)).await.unwrap();

        assert_eq!(store.current().await.unwrap(), document(9600));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_validate_in_memory_document() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = store_in(dir.path());

        let value = serde_json::to_value(document(19200)).unwrap();
        let parsed = store.validate(ConfigSource::Document(value)).await.unwrap();
        assert_eq!(parsed, document(19200));

        let mut bad = serde_json::to_value(document(19200)).unwrap();
        bad["port_config"]["baudrate"] = json!(1234);
        let result = store.validate(ConfigSource::Document(bad)).await;
        assert!(matches!(result, Err(DocumentError::Validation(_))));
    }

    #[tokio::test]
    async fn test_read_setup_falls_back_with_state_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut rx) = store_in(dir.path());

        let loaded = store.read_setup(true).await;

        assert_eq!(loaded, ConfigDocument::fallback());
        let states = states(&mut rx);
        // Attempts 2 and 3 report, then the fallback notice.
        assert_eq!(states.len(), 3);
        assert!(states[2].contains("fallback"));
    }

    #[tokio::test]
    async fn test_read_setup_announces() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut rx) = store_in(dir.path());
        store.execute_configuration_message(&document(9600)).await.unwrap();

        let loaded = store.read_setup(true).await;

        assert_eq!(loaded, document(9600));
        let states = states(&mut rx);
        assert_eq!(states.len(), 1);
        assert!(states[0].starts_with("started with configuration /dev/ttyS1 9600 8N1"));
    }

    #[tokio::test]
    async fn test_valid_stray_temp_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = store_in(dir.path());
        store.execute_configuration_message(&document(9600)).await.unwrap();

        std::fs::write(store.temp_path(), document(38400).to_pretty_json().unwrap()).unwrap();

        assert_eq!(store.current().await.unwrap(), document(38400));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_invalid_stray_temp_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = store_in(dir.path());
        store.execute_configuration_message(&document(9600)).await.unwrap();

        std::fs::write(store.temp_path(), b"{\"port_config\": {").unwrap();

        assert_eq!(store.current().await.unwrap(), document(9600));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _rx) = store_in(dir.path());
        store.options.lock_wait = Duration::from_millis(50);

        let _held = store.lock.lock().await;
        let result = store.current().await;
        assert!(matches!(result, Err(DocumentError::LockTimeout)));
    }

    #[tokio::test]
    async fn test_concurrent_commits_leave_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = store_in(dir.path());
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for baud in [9600, 19200, 38400, 57600, 115200] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.execute_configuration_message(&document(baud)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let live = store.current().await.unwrap();
        assert!([9600, 19200, 38400, 57600, 115200].contains(&live.port_config.baud_rate));
    }

    #[tokio::test]
    async fn test_failed_commits_interleaved_with_good_ones() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = store_in(dir.path());
        let store = Arc::new(store);
        store.execute_configuration_message(&document(4800)).await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    store.current().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut handles = Vec::new();
        for (i, baud) in [9600, 19200, 38400, 57600].into_iter().enumerate() {
            let store = store.clone();
            let good = document(baud);
            let mut bad = document(baud);
            bad.port_config.baud_rate = 12345 + i as u32;
            handles.push(tokio::spawn(async move {
                let committed = store.execute_configuration_message(&good).await;
                let rejected = store.execute_configuration_message(&bad).await;
                (committed, rejected)
            }));
        }
        for handle in handles {
            let (committed, rejected) = handle.await.unwrap();
            committed.unwrap();
            assert!(matches!(rejected, Err(DocumentError::Validation(_))));
        }
        reader.await.unwrap();

        let text = std::fs::read_to_string(store.live_path()).unwrap();
        let live = ConfigDocument::parse(&text).unwrap();
        assert!([9600, 19200, 38400, 57600].contains(&live.port_config.baud_rate));
        assert!(!store.temp_path().exists());
    }
}
