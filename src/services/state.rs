use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::info;

use crate::db::Database;
use crate::models::UploadEvent;
use crate::services::batch;
use crate::services::extractor::ModelClient;
use crate::services::processor::PipelineConfig;
use crate::services::store::ObjectStore;
use crate::services::watcher::{self, WatcherService};

pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub objects: Arc<dyn ObjectStore>,
    pub model: Arc<dyn ModelClient>,
    pub config: Arc<PipelineConfig>,
    inbox: PathBuf,
}

impl AppState {
    pub fn new(
        db: Arc<Mutex<Database>>,
        objects: Arc<dyn ObjectStore>,
        model: Arc<dyn ModelClient>,
        config: Arc<PipelineConfig>,
        inbox: PathBuf,
    ) -> Self {
        AppState {
            db,
            objects,
            model,
            config,
            inbox,
        }
    }

    /// Process files already sitting in the inbox, e.g. dropped while the
    /// daemon was down. Duplicate suppression keeps this idempotent.
    pub async fn initial_scan(&self) -> Result<()> {
        let paths = walkdir::WalkDir::new(&self.inbox)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter(|entry| watcher::is_image(entry.path()))
            .map(|entry| entry.path().to_path_buf())
            .collect::<Vec<_>>();

        let events = paths
            .iter()
            .filter_map(|path| self.upload_event(path))
            .collect::<Vec<_>>();
        if events.is_empty() {
            return Ok(());
        }

        info!("initial scan found {} files", events.len());
        let result =
            batch::process_batch(&self.db, &self.objects, &self.model, &self.config, events).await;
        info!("{}", result.message);
        Ok(())
    }

    /// Watch the inbox and process new files in small bursts.
    pub async fn run(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<PathBuf>(64);
        let _watcher = WatcherService::start(self.inbox.clone(), tx)?;
        info!("watching {}", self.inbox.display());

        while let Some(first) = rx.recv().await {
            let mut paths = vec![first];
            while let Ok(Some(path)) = timeout(Duration::from_millis(500), rx.recv()).await {
                paths.push(path);
            }
            paths.sort();
            paths.dedup();

            let mut events = Vec::new();
            for path in &paths {
                if !watcher::settle_file(path, 300).await {
                    continue;
                }
                if let Some(event) = self.upload_event(path) {
                    events.push(event);
                }
            }
            if events.is_empty() {
                continue;
            }

            let result =
                batch::process_batch(&self.db, &self.objects, &self.model, &self.config, events)
                    .await;
            info!("{}", result.message);
        }

        Ok(())
    }

    fn upload_event(&self, path: &Path) -> Option<UploadEvent> {
        let relative = path.strip_prefix(&self.inbox).ok()?;
        let key = relative.to_string_lossy().replace('\\', "/");
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Some(UploadEvent {
            bucket_name: self
                .inbox
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("inbox")
                .to_string(),
            object_key: urlencoding::encode(&key).into_owned(),
            object_size: size,
        })
    }
}
