//! Order domain events carried in [`Envelope::data`](crate::envelope::Envelope).
//!
//! The bus treats payloads as opaque JSON; these types are the schema the
//! producer writes and the services read back. Fields copied from a client
//! request are kept as raw [`Value`]s and published exactly as received.
//! Reading is lenient: any missing field takes its default, and text fields
//! accept any scalar, so a payload from another producer never fails to decode
//! as long as it is a JSON object.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Event type tag for a newly created order.
pub const ORDER_CREATED: &str = "order.created";
/// Event type tag for a completed payment.
pub const PAYMENT_COMPLETED: &str = "payment.completed";
/// Event type tag for a shipped order.
pub const ORDER_SHIPPED: &str = "order.shipped";

/// Payload of `order.created`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderCreated {
    #[serde(deserialize_with = "lenient_text")]
    pub order_id: String,
    pub user_id: Value,
    pub product_id: Value,
    pub quantity: Value,
    pub total_amount: Value,
    #[serde(deserialize_with = "lenient_text")]
    pub status: String,
    #[serde(deserialize_with = "lenient_text")]
    pub created_at: String,
}

/// Payload of `payment.completed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaymentCompleted {
    #[serde(deserialize_with = "lenient_text")]
    pub order_id: String,
    pub payment_method: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub amount: Value,
    #[serde(deserialize_with = "lenient_text")]
    pub status: String,
    #[serde(deserialize_with = "lenient_text")]
    pub transaction_id: String,
    #[serde(deserialize_with = "lenient_text")]
    pub paid_at: String,
}

/// Payload of `order.shipped`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderShipped {
    #[serde(deserialize_with = "lenient_text")]
    pub order_id: String,
    #[serde(deserialize_with = "lenient_text")]
    pub tracking_number: String,
    pub carrier: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub address: Value,
    #[serde(deserialize_with = "lenient_text")]
    pub status: String,
    #[serde(deserialize_with = "lenient_text")]
    pub shipped_at: String,
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(|value| text(&value))
}

/// Render a field for display: strings verbatim, null as empty, anything
/// else in its JSON form.
pub fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => f.to_string(),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Numeric reading of a field. Numeric strings count; anything else is `None`.
pub fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payment_without_amount_omits_field() {
        let payment = PaymentCompleted {
            order_id: "ORD-1".to_string(),
            payment_method: json!("credit_card"),
            amount: Value::Null,
            status: "completed".to_string(),
            transaction_id: "TXN-1".to_string(),
            paid_at: "2024-01-01T00:00:00.000Z".to_string(),
        };

        let value = serde_json::to_value(&payment).unwrap();
        assert!(value.get("amount").is_none());
        assert_eq!(value["paymentMethod"], "credit_card");
    }

    #[test]
    fn test_shipment_reads_missing_address() {
        let shipped: OrderShipped = serde_json::from_value(json!({
            "orderId": "ORD-2",
            "trackingNumber": "TRK-2",
            "carrier": "DHL",
            "status": "shipped",
            "shippedAt": "2024-01-01T00:00:00.000Z"
        }))
        .unwrap();

        assert_eq!(shipped.address, Value::Null);
        assert_eq!(shipped.carrier, "DHL");
    }

    #[test]
    fn test_sparse_order_decodes_with_defaults() {
        let order: OrderCreated =
            serde_json::from_value(json!({ "orderId": 42, "totalAmount": "40", "status": null }))
                .unwrap();

        assert_eq!(order.order_id, "42");
        assert_eq!(order.status, "");
        assert_eq!(order.user_id, Value::Null);
        assert_eq!(number(&order.total_amount), Some(40.0));
        assert_eq!(order.created_at, "");
    }

    #[test]
    fn test_client_fields_round_trip_unchanged() {
        let data = json!({
            "orderId": "ORD-1",
            "userId": true,
            "productId": 7,
            "quantity": "2",
            "totalAmount": 1.5,
            "status": "created",
            "createdAt": "2024-01-01T00:00:00.000Z"
        });
        let order: OrderCreated = serde_json::from_value(data.clone()).unwrap();

        assert_eq!(serde_json::to_value(&order).unwrap(), data);
    }

    #[test]
    fn test_text_and_number() {
        assert_eq!(text(&json!("abc")), "abc");
        assert_eq!(text(&json!(100)), "100");
        assert_eq!(text(&json!(100.0)), "100");
        assert_eq!(text(&json!(99.5)), "99.5");
        assert_eq!(text(&json!(true)), "true");
        assert_eq!(text(&Value::Null), "");

        assert_eq!(number(&json!(" 3 ")), Some(3.0));
        assert_eq!(number(&json!("three")), None);
        assert_eq!(number(&json!(null)), None);
    }
}
