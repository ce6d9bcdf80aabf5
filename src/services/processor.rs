use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{Database, OrderStore, StoreError};
use crate::models::{CategoryPolicy, OrderDetail, OrderExtraction, OrderHeader, Settings, UploadEvent};
use crate::services::extractor::{self, GenerationParams, ModelClient, RetryPolicy};
use crate::services::normalizer::{self, NormalizeConstraints};
use crate::services::parser;
use crate::services::store::ObjectStore;
use crate::utils;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub constraints: NormalizeConstraints,
    pub generation: GenerationParams,
    pub retry: RetryPolicy,
    pub category_policy: CategoryPolicy,
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        PipelineConfig {
            constraints: NormalizeConstraints::default(),
            generation: GenerationParams::default(),
            retry: RetryPolicy {
                max_attempts: settings.max_attempts.max(1),
                ..RetryPolicy::default()
            },
            category_policy: settings.category_policy,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("header write failed: {0}")]
    Header(#[source] StoreError),
    #[error("header key missing for {document}")]
    HeaderKeyMissing { document: String },
    #[error("detail write failed for {item_id}: {source}")]
    Detail {
        item_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Done(OrderHeader),
    Skipped,
}

/// Write the header row, then the detail rows. Details are only written
/// once the store confirms the header key, and they carry the confirmed key
/// rather than the extracted one. A failed detail write aborts the rest;
/// already-written rows are not rolled back (the store has no transactions).
pub fn persist_order(
    store: &dyn OrderStore,
    extraction: &OrderExtraction,
    document_name: &str,
    document_uri: &str,
) -> Result<(OrderHeader, usize), PersistError> {
    let now = utils::now_rfc3339();
    let content = serde_json::to_string(extraction).unwrap_or_else(|_| "{}".to_string());

    let mut header = OrderHeader {
        order_id: extraction.order_id.clone(),
        order_date: extraction.order_date.clone(),
        subtotal: extraction.subtotal,
        shipping_fee: extraction.shipping_fee,
        total_amount: extraction.total_amount,
        category: extraction.category.clone(),
        document_name: document_name.to_string(),
        document_uri: document_uri.to_string(),
        content,
        created_at: now.clone(),
        updated_at: now.clone(),
    };

    let confirmed_key = store
        .create_header(&header)
        .map_err(PersistError::Header)?
        .ok_or_else(|| PersistError::HeaderKeyMissing {
            document: document_name.to_string(),
        })?;
    header.order_id = confirmed_key.clone();

    let mut written = 0;
    for item in &extraction.items {
        let detail = OrderDetail {
            item_id: item.item_id.clone(),
            order_header_id: confirmed_key.clone(),
            product_name: item.product_name.clone(),
            unit_price: item.unit_price,
            quantity: item.quantity,
            subtotal: item.subtotal,
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        store.create_detail(&detail).map_err(|source| PersistError::Detail {
            item_id: item.item_id.clone(),
            source,
        })?;
        written += 1;
    }

    Ok((header, written))
}

/// Remove an order: details first, then the header, so a failure midway
/// never leaves orphaned details behind. Returns the number of details
/// removed.
pub fn delete_order(store: &dyn OrderStore, order_id: &str) -> Result<usize, StoreError> {
    let details = store.list_details(order_id)?;
    for detail in &details {
        store.delete_detail(order_id, &detail.item_id)?;
    }
    store.delete_header(order_id)?;
    Ok(details.len())
}

/// Full pipeline for one uploaded document: download, normalize, extract,
/// repair off-contract output once, parse tolerantly, persist.
pub async fn process_document(
    db: &Arc<Mutex<Database>>,
    objects: &Arc<dyn ObjectStore>,
    model: &Arc<dyn ModelClient>,
    config: &PipelineConfig,
    event: &UploadEvent,
) -> Result<ProcessOutcome> {
    let key = utils::decode_object_key(&event.object_key);
    let file_name = utils::file_name_from_key(&key);

    let bytes = objects.get_object(&key)?;
    let file_hash = utils::sha256_bytes(&bytes);

    {
        let db = db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
        if db.has_processed(&key, &file_hash)? {
            info!("skipping already-processed document {}", file_name);
            db.log_processing(None, &key, &file_hash, "process", "skipped", None)?;
            return Ok(ProcessOutcome::Skipped);
        }
    }

    let constraints = config.constraints.clone();
    let normalized =
        tokio::task::spawn_blocking(move || normalizer::normalize(&bytes, &constraints)).await?;
    if normalized.passthrough {
        warn!("document {} was not re-encoded, extracting from original bytes", file_name);
    }

    let request =
        extractor::build_request(&normalized, extractor::EXTRACTION_INSTRUCTION, &config.generation);
    let raw = extractor::invoke_with_retry(model.as_ref(), &request, &config.retry).await?;
    let raw = repair_if_off_contract(model.as_ref(), raw, config).await;

    let extraction = parser::parse(&raw, config.category_policy);

    let db = db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    let (header, detail_count) = persist_order(&*db, &extraction, &file_name, &key)?;
    db.log_processing(Some(&header.order_id), &key, &file_hash, "process", "success", None)?;
    info!(
        "persisted order {} ({} line items) from {}",
        header.order_id, detail_count, file_name
    );

    Ok(ProcessOutcome::Done(header))
}

async fn repair_if_off_contract(
    model: &dyn ModelClient,
    raw: String,
    config: &PipelineConfig,
) -> String {
    let schema = extractor::contract_schema();
    let on_contract = serde_json::from_str::<Value>(parser::fenced_payload(&raw))
        .map(|value| schema.is_valid(&value))
        .unwrap_or(false);
    if on_contract {
        return raw;
    }

    warn!("model output is off-contract, requesting one repair pass");
    let request = extractor::build_repair_request(&raw, &config.generation);
    match extractor::invoke_with_retry(model, &request, &config.retry).await {
        Ok(fixed) => fixed,
        Err(err) => {
            warn!("repair invocation failed, parsing original output: {}", err);
            raw
        }
    }
}
