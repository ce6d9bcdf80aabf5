use serde_json::Value;

use crate::models::{CategoryPolicy, ExtractedItem, OrderExtraction};
use crate::utils;

pub const CATEGORY_HOLOLIVE: &str = "ホロライブ";
pub const CATEGORY_NIJISANJI: &str = "にじさんじ";
pub const CATEGORY_SIXFONIA: &str = "SIXFONIA";
pub const CATEGORY_OTHER: &str = "その他";
pub const CATEGORY_ERROR: &str = "エラー";

pub const UNKNOWN_PRODUCT: &str = "不明な商品";
pub const UNREADABLE_PRODUCT: &str = "読み取りできませんでした";

/// Turn raw model output into a fully-typed `OrderExtraction`. Never fails:
/// a response that cannot be parsed at all degrades to a sentinel error
/// record, and every field of a parsed response falls back to its default.
pub fn parse(raw: &str, policy: CategoryPolicy) -> OrderExtraction {
    let payload = fenced_payload(raw);
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => return sentinel(),
    };

    let header = value.get("orderHeader");

    let mut order_id = string_or(header.and_then(|h| h.get("orderId")), "");
    if order_id.trim().is_empty() {
        order_id = format!("ORDER_{}", utils::order_token());
    }

    let order_date = string_or(header.and_then(|h| h.get("orderDate")), "");
    let order_date = utils::normalize_date(&order_date).unwrap_or_else(utils::today_iso);

    let category = resolve_category(
        &string_or(header.and_then(|h| h.get("category")), ""),
        &order_id,
        policy,
    );

    let items = match value.get("orderDetails") {
        Some(Value::Array(entries)) => entries
            .iter()
            .enumerate()
            .map(|(index, entry)| extracted_item(entry, index))
            .collect(),
        _ => Vec::new(),
    };

    OrderExtraction {
        order_id,
        order_date,
        subtotal: amount_or(header.and_then(|h| h.get("subtotal")), 0),
        shipping_fee: amount_or(header.and_then(|h| h.get("shippingFee")), 0),
        total_amount: amount_or(header.and_then(|h| h.get("totalAmount")), 0),
        category,
        items,
    }
}

/// Category from the order-id prefix. `#` orders come from the Hololive
/// shop, `SN` from the Nijisanji store, `sxfn` from SIXFONIA's.
pub fn infer_category(order_id: &str) -> &'static str {
    if order_id.starts_with('#') {
        CATEGORY_HOLOLIVE
    } else if order_id.starts_with("SN") {
        CATEGORY_NIJISANJI
    } else if order_id.starts_with("sxfn") {
        CATEGORY_SIXFONIA
    } else {
        CATEGORY_OTHER
    }
}

/// Extract the payload from an optional ```json fenced block; the contract
/// forbids fencing but the service does not always comply.
pub fn fenced_payload(raw: &str) -> &str {
    if raw.contains("```json") {
        raw.split("```json")
            .nth(1)
            .and_then(|rest| rest.split("```").next())
            .unwrap_or(raw)
            .trim()
    } else if raw.contains("```") {
        raw.split("```").nth(1).unwrap_or(raw).trim()
    } else {
        raw.trim()
    }
}

fn resolve_category(model_value: &str, order_id: &str, policy: CategoryPolicy) -> String {
    let known = [
        CATEGORY_HOLOLIVE,
        CATEGORY_NIJISANJI,
        CATEGORY_SIXFONIA,
        CATEGORY_OTHER,
    ];

    match policy {
        CategoryPolicy::TrustPrefix => infer_category(order_id).to_string(),
        CategoryPolicy::TrustModel => {
            let trimmed = model_value.trim();
            if known.contains(&trimmed) {
                trimmed.to_string()
            } else {
                // Absent or outside the closed set: fall back to the rule.
                infer_category(order_id).to_string()
            }
        }
    }
}

fn extracted_item(entry: &Value, index: usize) -> ExtractedItem {
    let mut item_id = string_or(entry.get("itemId"), "");
    if item_id.trim().is_empty() {
        item_id = format!("ITEM_{:03}", index + 1);
    }

    let mut product_name = string_or(entry.get("productName"), "");
    if product_name.trim().is_empty() {
        product_name = UNKNOWN_PRODUCT.to_string();
    }

    ExtractedItem {
        item_id,
        product_name,
        unit_price: amount_or(entry.get("unitPrice"), 0),
        quantity: amount_or(entry.get("quantity"), 1),
        subtotal: amount_or(entry.get("subtotal"), 0),
    }
}

fn string_or(value: Option<&Value>, default: &str) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => default.to_string(),
    }
}

/// Numbers may arrive as JSON numbers or numeric strings; anything else
/// coerces to the field default, never to an error.
fn amount_or(value: Option<&Value>, default: i64) -> i64 {
    let parsed = match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Some(Value::String(s)) => {
            let cleaned = s.trim().replace(',', "");
            cleaned.parse::<f64>().ok().map(|f| f.round() as i64)
        }
        _ => None,
    };
    parsed.unwrap_or(default).max(0)
}

/// Well-formed "error" record written when a response cannot be parsed at
/// all, so the failure stays visible and queryable instead of vanishing.
fn sentinel() -> OrderExtraction {
    OrderExtraction {
        order_id: format!("ERROR_{}", utils::order_token()),
        order_date: utils::today_iso(),
        subtotal: 0,
        shipping_fee: 0,
        total_amount: 0,
        category: CATEGORY_ERROR.to_string(),
        items: vec![ExtractedItem {
            item_id: "ITEM_001".to_string(),
            product_name: UNREADABLE_PRODUCT.to_string(),
            unit_price: 0,
            quantity: 1,
            subtotal: 0,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_RESPONSE: &str = r##"{
        "orderHeader": {
            "orderId": "#802-1234567",
            "orderDate": "2025-08-06",
            "subtotal": 3150,
            "shippingFee": 500,
            "totalAmount": 3650,
            "category": "ホロライブ"
        },
        "orderDetails": [
            {"itemId": "A-1", "productName": "アクリルスタンド", "unitPrice": 1575, "quantity": 2, "subtotal": 3150}
        ]
    }"##;

    #[test]
    fn well_formed_response_parses_verbatim() {
        let extraction = parse(FULL_RESPONSE, CategoryPolicy::TrustModel);
        assert_eq!(extraction.order_id, "#802-1234567");
        assert_eq!(extraction.order_date, "2025-08-06");
        assert_eq!(extraction.subtotal, 3150);
        assert_eq!(extraction.shipping_fee, 500);
        assert_eq!(extraction.total_amount, 3650);
        assert_eq!(extraction.category, CATEGORY_HOLOLIVE);
        assert_eq!(extraction.items.len(), 1);
        assert_eq!(extraction.items[0].item_id, "A-1");
        assert_eq!(extraction.items[0].quantity, 2);
    }

    #[test]
    fn fenced_response_parses_same_as_unfenced() {
        let fenced = format!("```json\n{}\n```", FULL_RESPONSE);
        let plain = parse(FULL_RESPONSE, CategoryPolicy::TrustModel);
        let wrapped = parse(&fenced, CategoryPolicy::TrustModel);
        assert_eq!(
            serde_json::to_value(&plain).unwrap(),
            serde_json::to_value(&wrapped).unwrap()
        );

        let bare_fence = format!("```\n{}\n```", FULL_RESPONSE);
        let bare = parse(&bare_fence, CategoryPolicy::TrustModel);
        assert_eq!(bare.order_id, "#802-1234567");
    }

    #[test]
    fn every_missing_field_gets_its_default() {
        let cases = [
            "{}",
            r#"{"orderHeader": {}}"#,
            r#"{"orderHeader": null, "orderDetails": null}"#,
            r#"{"orderDetails": "not a list"}"#,
            r#"{"orderHeader": {"orderId": null, "subtotal": "abc"}, "orderDetails": [{}]}"#,
        ];

        for raw in cases {
            let extraction = parse(raw, CategoryPolicy::TrustModel);
            assert!(!extraction.order_id.is_empty(), "case: {}", raw);
            assert!(extraction.order_id.starts_with("ORDER_"), "case: {}", raw);
            assert!(!extraction.order_date.is_empty(), "case: {}", raw);
            assert_eq!(extraction.subtotal, 0, "case: {}", raw);
            assert_eq!(extraction.shipping_fee, 0, "case: {}", raw);
            assert_eq!(extraction.total_amount, 0, "case: {}", raw);
            assert_eq!(extraction.category, CATEGORY_OTHER, "case: {}", raw);
            for item in &extraction.items {
                assert!(!item.item_id.is_empty());
                assert!(!item.product_name.is_empty());
                assert_eq!(item.quantity, 1);
            }
        }
    }

    #[test]
    fn numeric_strings_coerce_to_numbers() {
        let raw = r##"{
            "orderHeader": {"orderId": "#1", "subtotal": "3150", "shippingFee": "1,000", "totalAmount": 4150.0},
            "orderDetails": [{"productName": "本", "unitPrice": "525", "quantity": "3", "subtotal": "1575"}]
        }"##;
        let extraction = parse(raw, CategoryPolicy::TrustModel);
        assert_eq!(extraction.subtotal, 3150);
        assert_eq!(extraction.shipping_fee, 1000);
        assert_eq!(extraction.total_amount, 4150);
        assert_eq!(extraction.items[0].unit_price, 525);
        assert_eq!(extraction.items[0].quantity, 3);
        assert_eq!(extraction.items[0].subtotal, 1575);
    }

    #[test]
    fn negative_amounts_clamp_to_zero() {
        let raw = r##"{"orderHeader": {"orderId": "#1", "subtotal": -500}, "orderDetails": []}"##;
        let extraction = parse(raw, CategoryPolicy::TrustModel);
        assert_eq!(extraction.subtotal, 0);
    }

    #[test]
    fn missing_item_ids_are_synthesized_in_order() {
        let raw = r##"{
            "orderHeader": {"orderId": "#1"},
            "orderDetails": [
                {"productName": "A"}, {"productName": "B"}, {"productName": "C"},
                {"productName": "D"}, {"productName": "E"}, {"productName": "F"},
                {"productName": "G"}, {"productName": "H"}, {"productName": "I"},
                {"productName": "J"}, {"productName": "K"}, {"productName": "L"}
            ]
        }"##;
        let extraction = parse(raw, CategoryPolicy::TrustModel);
        assert_eq!(extraction.items.len(), 12);
        assert_eq!(extraction.items[0].item_id, "ITEM_001");
        assert_eq!(extraction.items[8].item_id, "ITEM_009");
        assert_eq!(extraction.items[11].item_id, "ITEM_012");
    }

    #[test]
    fn category_inference_is_deterministic_per_prefix() {
        assert_eq!(infer_category("#802-123"), CATEGORY_HOLOLIVE);
        assert_eq!(infer_category("SN20250806"), CATEGORY_NIJISANJI);
        assert_eq!(infer_category("SNabcDEF"), CATEGORY_NIJISANJI);
        assert_eq!(infer_category("sxfn-0001"), CATEGORY_SIXFONIA);
        assert_eq!(infer_category("sxfnXYZ"), CATEGORY_SIXFONIA);
        assert_eq!(infer_category("B000ABCD"), CATEGORY_OTHER);
        assert_eq!(infer_category(""), CATEGORY_OTHER);
    }

    #[test]
    fn trust_model_keeps_supplied_category_and_fills_absent() {
        let supplied = r##"{"orderHeader": {"orderId": "#1", "category": "にじさんじ"}, "orderDetails": []}"##;
        let extraction = parse(supplied, CategoryPolicy::TrustModel);
        assert_eq!(extraction.category, CATEGORY_NIJISANJI);

        let absent = r#"{"orderHeader": {"orderId": "sxfn-1"}, "orderDetails": []}"#;
        let extraction = parse(absent, CategoryPolicy::TrustModel);
        assert_eq!(extraction.category, CATEGORY_SIXFONIA);

        let unknown = r#"{"orderHeader": {"orderId": "SN-1", "category": "謎のレーベル"}, "orderDetails": []}"#;
        let extraction = parse(unknown, CategoryPolicy::TrustModel);
        assert_eq!(extraction.category, CATEGORY_NIJISANJI);
    }

    #[test]
    fn trust_prefix_overrides_supplied_category() {
        let raw = r##"{"orderHeader": {"orderId": "#1", "category": "にじさんじ"}, "orderDetails": []}"##;
        let extraction = parse(raw, CategoryPolicy::TrustPrefix);
        assert_eq!(extraction.category, CATEGORY_HOLOLIVE);
    }

    #[test]
    fn unparseable_response_degrades_to_sentinel() {
        for raw in ["definitely not json", "", "```\nnothing here\n```"] {
            let extraction = parse(raw, CategoryPolicy::TrustModel);
            assert!(extraction.order_id.starts_with("ERROR_"), "case: {}", raw);
            assert_eq!(extraction.category, CATEGORY_ERROR);
            assert_eq!(extraction.subtotal, 0);
            assert_eq!(extraction.total_amount, 0);
            assert_eq!(extraction.items.len(), 1);
            assert_eq!(extraction.items[0].product_name, UNREADABLE_PRODUCT);
        }
    }

    #[test]
    fn numeric_order_id_is_stringified() {
        let raw = r#"{"orderHeader": {"orderId": 12345}, "orderDetails": []}"#;
        let extraction = parse(raw, CategoryPolicy::TrustModel);
        assert_eq!(extraction.order_id, "12345");
    }
}
