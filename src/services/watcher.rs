use anyhow::Result;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct WatcherService {
    _watcher: RecommendedWatcher,
}

impl WatcherService {
    pub fn start(inbox: PathBuf, tx: mpsc::Sender<PathBuf>) -> Result<Self> {
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) => {}
                    _ => return,
                }
                for path in event.paths {
                    if is_image(&path) {
                        let _ = tx.blocking_send(path);
                    }
                }
            }
        })?;

        watcher.watch(&inbox, RecursiveMode::Recursive)?;
        Ok(WatcherService { _watcher: watcher })
    }
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ext.eq_ignore_ascii_case("png")
                || ext.eq_ignore_ascii_case("jpg")
                || ext.eq_ignore_ascii_case("jpeg")
        })
        .unwrap_or(false)
}

/// Wait until the file size is stable so half-written uploads are not
/// processed. Returns false when the file vanished or stayed empty.
pub async fn settle_file(path: &Path, debounce_ms: u64) -> bool {
    let mut last_size = None;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
        match tokio::fs::metadata(path).await {
            Ok(metadata) => {
                let size = metadata.len();
                if Some(size) == last_size {
                    return size > 0;
                }
                last_size = Some(size);
            }
            Err(_) => return false,
        }
    }
    last_size.unwrap_or(0) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_image_extensions_are_watched() {
        assert!(is_image(Path::new("a.png")));
        assert!(is_image(Path::new("b.JPG")));
        assert!(is_image(Path::new("c.jpeg")));
        assert!(!is_image(Path::new("d.pdf")));
        assert!(!is_image(Path::new("noext")));
    }

    #[tokio::test]
    async fn settled_file_passes_the_debounce() {
        let path = std::env::temp_dir().join(format!("ordersnap-settle-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"stable content").unwrap();
        assert!(settle_file(&path, 10).await);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn missing_file_fails_the_debounce() {
        let path = std::env::temp_dir().join("ordersnap-never-existed.png");
        assert!(!settle_file(&path, 10).await);
    }
}
