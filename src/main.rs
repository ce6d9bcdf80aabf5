mod db;
mod models;
mod services;
mod utils;

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

use crate::db::{Database, OrderStore};
use crate::models::{CategoryPolicy, OrderWithDetails, Settings};
use crate::services::crypto;
use crate::services::extractor::{HttpModelClient, ModelClient};
use crate::services::processor::{self, PipelineConfig};
use crate::services::state::AppState;
use crate::services::store::{LocalObjectStore, ObjectStore};

const DEFAULT_ENDPOINT: &str = "https://bedrock-runtime.us-west-2.amazonaws.com";
const DEFAULT_MODEL_ID: &str = "us.anthropic.claude-3-7-sonnet-20250219-v1:0";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let data_dir = data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    let db = Database::new(data_dir.join("ordersnap.sqlite"))?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("watch") => watch(db).await,
        Some("list") => list(&db, args.get(1).map(String::as_str)),
        Some("delete") => {
            let order_id = args
                .get(1)
                .ok_or_else(|| anyhow!("usage: ordersnap delete <order-id>"))?;
            delete(&db, order_id)
        }
        Some("set-inbox") => {
            let folder = args
                .get(1)
                .ok_or_else(|| anyhow!("usage: ordersnap set-inbox <folder>"))?;
            db.set_setting("inbox_folder", folder)?;
            println!("inbox folder set to {}", folder);
            Ok(())
        }
        Some("set-api-key") => {
            let key = args
                .get(1)
                .ok_or_else(|| anyhow!("usage: ordersnap set-api-key <key>"))?;
            let encrypted = crypto::encrypt(key)?;
            db.set_setting("api_key", &encrypted)?;
            println!("api key stored");
            Ok(())
        }
        Some("set-policy") => {
            let value = args
                .get(1)
                .ok_or_else(|| anyhow!("usage: ordersnap set-policy <trust-model|trust-prefix>"))?;
            let policy = CategoryPolicy::parse(value);
            db.set_setting("category_policy", policy.as_str())?;
            println!("category policy set to {}", policy.as_str());
            Ok(())
        }
        Some(other) => Err(anyhow!(
            "unknown command: {} (expected watch, list, delete, set-inbox, set-api-key or set-policy)",
            other
        )),
    }
}

async fn watch(db: Database) -> Result<()> {
    let settings = load_settings(&db);
    let inbox = settings.inbox_folder.clone().ok_or_else(|| {
        anyhow!("no inbox folder configured; run `ordersnap set-inbox <folder>` first")
    })?;
    let inbox = PathBuf::from(inbox);
    if !inbox.is_dir() {
        return Err(anyhow!("inbox folder {} does not exist", inbox.display()));
    }

    let api_key = resolve_api_key(&settings)?;
    let model: Arc<dyn ModelClient> = Arc::new(HttpModelClient::new(
        settings.model_endpoint.clone(),
        settings.model_id.clone(),
        api_key,
    ));
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(inbox.clone()));
    let config = Arc::new(PipelineConfig::from_settings(&settings));

    let state = AppState::new(Arc::new(Mutex::new(db)), objects, model, config, inbox);
    state.initial_scan().await?;
    state.run().await
}

fn list(db: &Database, category: Option<&str>) -> Result<()> {
    let mut orders = Vec::new();
    for header in db.list_headers(category)? {
        let details = db.list_details(&header.order_id)?;
        orders.push(OrderWithDetails { header, details });
    }

    if orders.is_empty() {
        println!("注文データがありません");
        return Ok(());
    }

    for order in orders {
        println!(
            "{}\t{}\t{}\t¥{}\t{}",
            order.header.order_id,
            order.header.order_date,
            order.header.category,
            order.header.total_amount,
            order.header.document_name
        );
        for detail in order.details {
            println!(
                "  {}\t{}\t¥{} x {}",
                detail.item_id, detail.product_name, detail.unit_price, detail.quantity
            );
        }
    }
    Ok(())
}

fn delete(db: &Database, order_id: &str) -> Result<()> {
    let removed = processor::delete_order(db, order_id)?;
    println!("{} を削除しました（明細{}件）", order_id, removed);
    Ok(())
}

fn load_settings(db: &Database) -> Settings {
    let inbox_folder = db.get_setting("inbox_folder").ok().flatten();
    let model_endpoint = db
        .get_setting("model_endpoint")
        .ok()
        .flatten()
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let model_id = db
        .get_setting("model_id")
        .ok()
        .flatten()
        .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());
    let api_key = db.get_setting("api_key").ok().flatten();
    let category_policy = db
        .get_setting("category_policy")
        .ok()
        .flatten()
        .map(|value| CategoryPolicy::parse(&value))
        .unwrap_or(CategoryPolicy::TrustModel);
    let max_attempts = db
        .get_setting("max_attempts")
        .ok()
        .flatten()
        .and_then(|value| value.parse().ok())
        .unwrap_or(2);

    Settings {
        inbox_folder,
        model_endpoint,
        model_id,
        api_key,
        category_policy,
        max_attempts,
    }
}

fn resolve_api_key(settings: &Settings) -> Result<String> {
    if let Ok(key) = std::env::var("ORDERSNAP_API_KEY") {
        if !key.trim().is_empty() {
            return Ok(key);
        }
    }
    match &settings.api_key {
        Some(encrypted) => crypto::decrypt(encrypted),
        None => Err(anyhow!(
            "no api key configured; set ORDERSNAP_API_KEY or run `ordersnap set-api-key <key>`"
        )),
    }
}

fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("ORDERSNAP_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("ordersnap"))
        .ok_or_else(|| anyhow!("could not determine data directory"))
}
