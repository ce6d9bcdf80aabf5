use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHeader {
    pub order_id: String,
    pub order_date: String,
    pub subtotal: i64,
    pub shipping_fee: i64,
    pub total_amount: i64,
    pub category: String,
    pub document_name: String,
    pub document_uri: String,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetail {
    pub item_id: String,
    pub order_header_id: String,
    pub product_name: String,
    pub unit_price: i64,
    pub quantity: i64,
    pub subtotal: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderWithDetails {
    pub header: OrderHeader,
    pub details: Vec<OrderDetail>,
}

/// Fully-typed extraction result. Every field already carries its default,
/// so persistence never sees a missing or mistyped value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderExtraction {
    pub order_id: String,
    pub order_date: String,
    pub subtotal: i64,
    pub shipping_fee: i64,
    pub total_amount: i64,
    pub category: String,
    pub items: Vec<ExtractedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub item_id: String,
    pub product_name: String,
    pub unit_price: i64,
    pub quantity: i64,
    pub subtotal: i64,
}

/// One "object created" notification. The key is URL-encoded as delivered
/// by the event source and decoded by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEvent {
    pub bucket_name: String,
    pub object_key: String,
    pub object_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub document_name: String,
    pub order_id: Option<String>,
    pub status: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub message: String,
    pub processed_files: usize,
    pub failed_files: usize,
    pub outcomes: Vec<DocumentOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CategoryPolicy {
    /// Keep a model-supplied category, fill from the prefix rule only when absent.
    TrustModel,
    /// Re-derive the category from the order-id prefix unconditionally.
    TrustPrefix,
}

impl CategoryPolicy {
    pub fn parse(value: &str) -> Self {
        match value {
            "trust-prefix" => CategoryPolicy::TrustPrefix,
            _ => CategoryPolicy::TrustModel,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryPolicy::TrustModel => "trust-model",
            CategoryPolicy::TrustPrefix => "trust-prefix",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub inbox_folder: Option<String>,
    pub model_endpoint: String,
    pub model_id: String,
    pub api_key: Option<String>,
    pub category_policy: CategoryPolicy,
    pub max_attempts: u32,
}
