use std::sync::{Arc, Mutex};
use tracing::{error, info};
use uuid::Uuid;

use crate::db::Database;
use crate::models::{BatchResult, DocumentOutcome, UploadEvent};
use crate::services::extractor::ModelClient;
use crate::services::processor::{self, PipelineConfig, ProcessOutcome};
use crate::services::store::ObjectStore;
use crate::utils;

/// Run every event of a batch through the pipeline independently. One
/// document's failure never aborts its siblings; all tasks settle and the
/// result reports per-document outcomes alongside the counts.
pub async fn process_batch(
    db: &Arc<Mutex<Database>>,
    objects: &Arc<dyn ObjectStore>,
    model: &Arc<dyn ModelClient>,
    config: &Arc<PipelineConfig>,
    events: Vec<UploadEvent>,
) -> BatchResult {
    let batch_id = Uuid::new_v4().to_string();
    let total = events.len();
    info!("processing batch {} ({} files)", batch_id, total);

    let mut handles = Vec::with_capacity(total);
    for event in events {
        let db = Arc::clone(db);
        let objects = Arc::clone(objects);
        let model = Arc::clone(model);
        let config = Arc::clone(config);
        handles.push(tokio::spawn(async move {
            run_document(&db, &objects, &model, &config, event).await
        }));
    }

    let mut outcomes = Vec::with_capacity(total);
    for handle in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => outcomes.push(DocumentOutcome {
                document_name: String::new(),
                order_id: None,
                status: "failed".to_string(),
                message: Some(format!("task join failed: {}", err)),
            }),
        }
    }

    let failed_files = outcomes.iter().filter(|o| o.status == "failed").count();
    let processed_files = total - failed_files;
    info!(
        "batch {} finished: {} processed, {} failed",
        batch_id, processed_files, failed_files
    );

    BatchResult {
        batch_id,
        message: format!("{}件のファイルを処理しました", processed_files),
        processed_files,
        failed_files,
        outcomes,
    }
}

async fn run_document(
    db: &Arc<Mutex<Database>>,
    objects: &Arc<dyn ObjectStore>,
    model: &Arc<dyn ModelClient>,
    config: &Arc<PipelineConfig>,
    event: UploadEvent,
) -> DocumentOutcome {
    let key = utils::decode_object_key(&event.object_key);
    let document_name = utils::file_name_from_key(&key);

    match processor::process_document(db, objects, model, config, &event).await {
        Ok(ProcessOutcome::Done(header)) => DocumentOutcome {
            document_name,
            order_id: Some(header.order_id),
            status: "done".to_string(),
            message: None,
        },
        Ok(ProcessOutcome::Skipped) => DocumentOutcome {
            document_name,
            order_id: None,
            status: "skipped".to_string(),
            message: None,
        },
        Err(err) => {
            error!("processing {} failed: {:#}", document_name, err);
            if let Ok(db) = db.lock() {
                let _ = db.log_processing(None, &key, "", "process", "failed", Some(&err.to_string()));
            }
            DocumentOutcome {
                document_name,
                order_id: None,
                status: "failed".to_string(),
                message: Some(err.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CategoryPolicy;
    use crate::services::extractor::{
        ContentBlock, GenerationParams, InvokeRequest, RetryPolicy, ServiceError,
    };
    use crate::services::normalizer::{self, NormalizeConstraints};
    use crate::services::store::LocalObjectStore;
    use async_trait::async_trait;
    use base64::{engine::general_purpose, Engine as _};
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_png(width: u32, height: u32, seed: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                ((x * 7 + y * 13 + seed) % 256) as u8,
                ((x * 3 + y * 5 + seed * 2) % 256) as u8,
                ((x + y + seed * 3) % 256) as u8,
            ])
        });
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageOutputFormat::Png)
            .unwrap();
        buffer
    }

    struct ScriptedClient {
        calls: AtomicUsize,
        reject_payload: String,
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn invoke(&self, request: &InvokeRequest) -> Result<String, ServiceError> {
            let image_payload = request.messages.iter().flat_map(|m| m.content.iter()).find_map(
                |block| match block {
                    ContentBlock::Image { source } => Some(source.data.as_str()),
                    _ => None,
                },
            );
            if image_payload == Some(self.reject_payload.as_str()) {
                return Err(ServiceError::new("model unavailable"));
            }

            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let body = format!(
                r##"{{"orderHeader": {{"orderId": "#TEST-{}", "orderDate": "2025-08-06",
                     "subtotal": 1000, "shippingFee": 0, "totalAmount": 1000,
                     "category": "ホロライブ"}},
                    "orderDetails": [{{"itemId": "ITEM_001", "productName": "テスト商品",
                                       "unitPrice": 1000, "quantity": 1, "subtotal": 1000}}]}}"##,
                call
            );
            if call % 2 == 0 {
                Ok(format!("```json\n{}\n```", body))
            } else {
                Ok(body)
            }
        }
    }

    #[tokio::test]
    async fn one_failing_document_does_not_abort_its_siblings() {
        let dir = std::env::temp_dir().join(format!("ordersnap-batch-{}", Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("media")).unwrap();

        let doc1 = test_png(120, 80, 1);
        let doc2 = test_png(90, 140, 2);
        let doc3 = test_png(60, 60, 3);
        std::fs::write(dir.join("media/doc1.png"), &doc1).unwrap();
        std::fs::write(dir.join("media/doc2.png"), &doc2).unwrap();
        std::fs::write(dir.join("media/doc3.png"), &doc3).unwrap();

        let constraints = NormalizeConstraints {
            max_bytes: 1024 * 1024,
            min_dim: 50,
            max_dim: 100,
            quality: 85,
            enhance: false,
        };

        // Normalization is deterministic, so the rejected payload can be
        // computed up front to make exactly document 2 fail.
        let doc2_normalized = normalizer::normalize(&doc2, &constraints);
        let reject_payload = general_purpose::STANDARD.encode(&doc2_normalized.bytes);

        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.clone()));
        let model: Arc<dyn ModelClient> = Arc::new(ScriptedClient {
            calls: AtomicUsize::new(0),
            reject_payload,
        });
        let config = Arc::new(PipelineConfig {
            constraints,
            generation: GenerationParams::default(),
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            },
            category_policy: CategoryPolicy::TrustModel,
        });

        let events = vec![
            UploadEvent {
                bucket_name: "inbox".to_string(),
                object_key: "media/doc1.png".to_string(),
                object_size: doc1.len() as u64,
            },
            UploadEvent {
                bucket_name: "inbox".to_string(),
                object_key: "media/doc2.png".to_string(),
                object_size: doc2.len() as u64,
            },
            UploadEvent {
                bucket_name: "inbox".to_string(),
                object_key: "media/doc3.png".to_string(),
                object_size: doc3.len() as u64,
            },
        ];

        let result = process_batch(&db, &objects, &model, &config, events).await;

        assert_eq!(result.processed_files, 2);
        assert_eq!(result.failed_files, 1);
        assert_eq!(result.outcomes.len(), 3);
        assert_eq!(result.outcomes[0].status, "done");
        assert_eq!(result.outcomes[1].status, "failed");
        assert_eq!(result.outcomes[1].document_name, "doc2.png");
        assert_eq!(result.outcomes[2].status, "done");

        // The surviving documents reached the store.
        let db = db.lock().unwrap();
        let headers = crate::db::OrderStore::list_headers(&*db, None).unwrap();
        assert_eq!(headers.len(), 2);
        for header in &headers {
            let details = crate::db::OrderStore::list_details(&*db, &header.order_id).unwrap();
            assert_eq!(details.len(), 1);
            assert_eq!(details[0].order_header_id, header.order_id);
        }

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn second_upload_of_identical_content_is_skipped() {
        let dir = std::env::temp_dir().join(format!("ordersnap-skip-{}", Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("media")).unwrap();
        let doc = test_png(80, 80, 9);
        std::fs::write(dir.join("media/doc.png"), &doc).unwrap();

        let constraints = NormalizeConstraints {
            max_bytes: 1024 * 1024,
            min_dim: 50,
            max_dim: 100,
            quality: 85,
            enhance: false,
        };

        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.clone()));
        let model: Arc<dyn ModelClient> = Arc::new(ScriptedClient {
            calls: AtomicUsize::new(0),
            reject_payload: String::new(),
        });
        let config = Arc::new(PipelineConfig {
            constraints,
            generation: GenerationParams::default(),
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            },
            category_policy: CategoryPolicy::TrustModel,
        });

        let event = UploadEvent {
            bucket_name: "inbox".to_string(),
            object_key: "media/doc.png".to_string(),
            object_size: doc.len() as u64,
        };

        let first = process_batch(&db, &objects, &model, &config, vec![event.clone()]).await;
        assert_eq!(first.outcomes[0].status, "done");

        let second = process_batch(&db, &objects, &model, &config, vec![event]).await;
        assert_eq!(second.outcomes[0].status, "skipped");
        assert_eq!(second.failed_files, 0);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
