use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::services::normalizer::NormalizedImage;

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

pub const SYSTEM_PROMPT: &str = "あなたは注文書画像から構造化データを抽出する専門家です。";

/// The extraction contract: the exact JSON shape, unquoted numbers, the
/// prefix-based category rule, and a JSON-only output requirement. Parser
/// tolerance exists because this contract is not always honored.
pub const EXTRACTION_INSTRUCTION: &str = r#"この注文書の画像を分析し、次の構造のJSONのみを出力してください。

{
  "orderHeader": {
    "orderId": "注文番号",
    "orderDate": "YYYY-MM-DD",
    "subtotal": 0,
    "shippingFee": 0,
    "totalAmount": 0,
    "category": "カテゴリ"
  },
  "orderDetails": [
    {
      "itemId": "明細番号",
      "productName": "品名",
      "unitPrice": 0,
      "quantity": 1,
      "subtotal": 0
    }
  ]
}

金額と数量は引用符で囲まないJSON数値として出力すること。
カテゴリは注文番号の先頭で判断すること。「#」で始まる場合はホロライブ、「SN」で始まる場合はにじさんじ、「sxfn」で始まる場合はSIXFONIA、それ以外はその他とする。
説明文やコードフェンスを付けず、JSONのみを出力してください。"#;

#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        // Near-deterministic decoding: literal transcription, not completion.
        GenerationParams {
            max_tokens: 4096,
            temperature: 0.0,
            top_p: 0.9,
            top_k: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvokeRequest {
    pub anthropic_version: String,
    pub max_tokens: u32,
    pub system: String,
    pub messages: Vec<RequestMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

#[derive(Deserialize)]
struct InvokeResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

/// One user turn: the fixed instruction text plus the base64 image payload.
pub fn build_request(
    image: &NormalizedImage,
    instruction: &str,
    params: &GenerationParams,
) -> InvokeRequest {
    let encoded = general_purpose::STANDARD.encode(&image.bytes);
    InvokeRequest {
        anthropic_version: ANTHROPIC_VERSION.to_string(),
        max_tokens: params.max_tokens,
        system: SYSTEM_PROMPT.to_string(),
        messages: vec![RequestMessage {
            role: "user".to_string(),
            content: vec![
                ContentBlock::Text {
                    text: instruction.to_string(),
                },
                ContentBlock::Image {
                    source: ImageSource {
                        source_type: "base64".to_string(),
                        media_type: image.media_type.to_string(),
                        data: encoded,
                    },
                },
            ],
        }],
        temperature: params.temperature,
        top_p: params.top_p,
        top_k: params.top_k,
    }
}

/// Text-only follow-up asking the model to reshape an off-contract response.
pub fn build_repair_request(raw: &str, params: &GenerationParams) -> InvokeRequest {
    let instruction = format!(
        "次のJSONを指定の形式に正確に一致するよう修正してください。JSONのみを出力してください。JSON:\n{}",
        raw
    );
    InvokeRequest {
        anthropic_version: ANTHROPIC_VERSION.to_string(),
        max_tokens: params.max_tokens,
        system: SYSTEM_PROMPT.to_string(),
        messages: vec![RequestMessage {
            role: "user".to_string(),
            content: vec![ContentBlock::Text { text: instruction }],
        }],
        temperature: params.temperature,
        top_p: params.top_p,
        top_k: params.top_k,
    }
}

#[derive(Debug, Error)]
#[error("extraction service error: {message}")]
pub struct ServiceError {
    pub message: String,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        ServiceError {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::new(err.to_string())
    }
}

/// Call-with-request, get-text-back view of the extraction model. The raw
/// response text is surfaced unmodified; no JSON interpretation here.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(&self, request: &InvokeRequest) -> Result<String, ServiceError>;
}

pub struct HttpModelClient {
    http: reqwest::Client,
    endpoint: String,
    model_id: String,
    api_key: String,
}

impl HttpModelClient {
    pub fn new(endpoint: impl Into<String>, model_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpModelClient {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model_id: model_id.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn invoke(&self, request: &InvokeRequest) -> Result<String, ServiceError> {
        let url = format!(
            "{}/model/{}/invoke",
            self.endpoint.trim_end_matches('/'),
            self.model_id
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::new(format!("model invocation {}: {}", status, body)));
        }

        let body: InvokeResponse = response
            .json()
            .await
            .map_err(|err| ServiceError::new(format!("invalid response body: {}", err)))?;

        let text = body
            .content
            .iter()
            .find(|block| block.block_type == "text")
            .map(|block| block.text.trim().to_string())
            .ok_or_else(|| ServiceError::new("empty response"))?;

        Ok(text)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(300),
        }
    }
}

pub async fn invoke_with_retry(
    client: &dyn ModelClient,
    request: &InvokeRequest,
    policy: &RetryPolicy,
) -> Result<String, ServiceError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_err = ServiceError::new("no attempts made");

    for attempt in 1..=attempts {
        match client.invoke(request).await {
            Ok(text) => return Ok(text),
            Err(err) => {
                if attempt < attempts {
                    let delay = policy.base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "extraction attempt {}/{} failed, retrying in {:?}: {}",
                        attempt, attempts, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = err;
            }
        }
    }

    Err(last_err)
}

/// Schema of the contract output, used to decide whether a response earns a
/// repair round-trip before tolerant parsing.
pub fn contract_schema() -> JSONSchema {
    let schema = json!({
        "type": "object",
        "required": ["orderHeader", "orderDetails"],
        "properties": {
            "orderHeader": {
                "type": "object",
                "required": ["orderId"],
                "properties": {
                    "orderId": {"type": ["string", "number"]},
                    "orderDate": {"type": ["string", "null"]},
                    "subtotal": {"type": ["number", "null"]},
                    "shippingFee": {"type": ["number", "null"]},
                    "totalAmount": {"type": ["number", "null"]},
                    "category": {"type": ["string", "null"]}
                }
            },
            "orderDetails": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["productName"],
                    "properties": {
                        "itemId": {"type": ["string", "number", "null"]},
                        "productName": {"type": ["string", "null"]},
                        "unitPrice": {"type": ["number", "null"]},
                        "quantity": {"type": ["number", "null"]},
                        "subtotal": {"type": ["number", "null"]}
                    }
                }
            }
        }
    });

    JSONSchema::compile(&schema).expect("invalid contract schema")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_image() -> NormalizedImage {
        NormalizedImage {
            bytes: vec![1, 2, 3, 4],
            media_type: "image/png",
            passthrough: false,
        }
    }

    #[test]
    fn request_carries_one_text_and_one_image_block() {
        let request = build_request(&sample_image(), EXTRACTION_INSTRUCTION, &GenerationParams::default());
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"][0]["type"], "text");
        assert_eq!(value["messages"][0]["content"][1]["type"], "image");
        assert_eq!(value["messages"][0]["content"][1]["source"]["type"], "base64");
        assert_eq!(
            value["messages"][0]["content"][1]["source"]["media_type"],
            "image/png"
        );
        assert_eq!(
            value["messages"][0]["content"][1]["source"]["data"],
            general_purpose::STANDARD.encode([1u8, 2, 3, 4])
        );
        assert_eq!(value["temperature"], 0.0);
    }

    #[test]
    fn contract_schema_accepts_contract_output() {
        let schema = contract_schema();
        let good = serde_json::json!({
            "orderHeader": {"orderId": "#12345", "orderDate": "2025-08-06",
                            "subtotal": 3150, "shippingFee": 500, "totalAmount": 3650,
                            "category": "ホロライブ"},
            "orderDetails": [{"itemId": "ITEM_001", "productName": "アクリルスタンド",
                              "unitPrice": 1575, "quantity": 2, "subtotal": 3150}]
        });
        assert!(schema.is_valid(&good));

        let bad = serde_json::json!({"orderHeader": {"orderId": "#1"}});
        assert!(!schema.is_valid(&bad));
    }

    struct FlakyClient {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl ModelClient for FlakyClient {
        async fn invoke(&self, _request: &InvokeRequest) -> Result<String, ServiceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(ServiceError::new("quota exceeded"))
            } else {
                Ok("{}".to_string())
            }
        }
    }

    #[tokio::test]
    async fn retry_policy_recovers_from_transient_failures() {
        let client = FlakyClient {
            calls: AtomicUsize::new(0),
            fail_first: 1,
        };
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };
        let request = build_request(&sample_image(), EXTRACTION_INSTRUCTION, &GenerationParams::default());

        let text = invoke_with_retry(&client, &request, &policy).await.unwrap();
        assert_eq!(text, "{}");
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        let client = FlakyClient {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
        };
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };
        let request = build_request(&sample_image(), EXTRACTION_INSTRUCTION, &GenerationParams::default());

        let err = invoke_with_retry(&client, &request, &policy).await.unwrap_err();
        assert!(err.message.contains("quota exceeded"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }
}
