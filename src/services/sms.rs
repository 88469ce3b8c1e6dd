//! SMS service. Every notice goes to one fixed number.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{amount, decode};
use crate::bus::{EventHandler, HandlerError};
use crate::envelope::Envelope;
use crate::events::{
    text, OrderCreated, OrderShipped, PaymentCompleted, ORDER_CREATED, ORDER_SHIPPED,
    PAYMENT_COMPLETED,
};

pub const SMS_RECIPIENT: &str = "+57-300-123-4567";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    pub to: String,
    pub text: String,
}

pub fn compose(envelope: &Envelope) -> Result<Option<SmsMessage>, HandlerError> {
    let text = match envelope.event_type.as_str() {
        ORDER_CREATED => {
            let order: OrderCreated = decode(envelope)?;
            format!(
                "Your order {} was created. Total: ${}. Thanks for your purchase!",
                order.order_id,
                amount(&order.total_amount)
            )
        }
        PAYMENT_COMPLETED => {
            let payment: PaymentCompleted = decode(envelope)?;
            format!(
                "Payment confirmed for order {}. Amount: ${}. ID: {}",
                payment.order_id,
                amount(&payment.amount),
                payment.transaction_id
            )
        }
        ORDER_SHIPPED => {
            let shipment: OrderShipped = decode(envelope)?;
            format!(
                "Your order {} has shipped! Tracking: {} via {}",
                shipment.order_id,
                shipment.tracking_number,
                text(&shipment.carrier)
            )
        }
        _ => return Ok(None),
    };

    Ok(Some(SmsMessage {
        to: SMS_RECIPIENT.to_string(),
        text,
    }))
}

pub struct SmsHandler {
    name: String,
    sent: u64,
}

impl SmsHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sent: 0,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

#[async_trait]
impl EventHandler for SmsHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, envelope: &Envelope) -> Result<(), HandlerError> {
        match compose(envelope)? {
            Some(sms) => {
                info!(to = %sms.to, text = %sms.text, "Sending SMS");
                self.sent += 1;
            }
            None => warn!(event_type = %envelope.event_type, "Unhandled event type"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeFactory;
    use serde_json::json;

    #[test]
    fn test_shipment_text() {
        let envelope = EnvelopeFactory::new().build(
            ORDER_SHIPPED,
            json!({
                "orderId": "ORD-1",
                "trackingNumber": "TRK-42",
                "carrier": "FedEx",
                "address": "Calle 1",
                "status": "shipped",
                "shippedAt": "2024-01-01T00:00:00.000Z"
            }),
        );

        let sms = compose(&envelope).unwrap().unwrap();
        assert_eq!(sms.to, SMS_RECIPIENT);
        assert_eq!(sms.text, "Your order ORD-1 has shipped! Tracking: TRK-42 via FedEx");
    }

    #[test]
    fn test_payment_without_amount() {
        let envelope = EnvelopeFactory::new().build(
            PAYMENT_COMPLETED,
            json!({
                "orderId": "ORD-1",
                "paymentMethod": "credit_card",
                "status": "completed",
                "transactionId": "TXN-1",
                "paidAt": "2024-01-01T00:00:00.000Z"
            }),
        );

        let sms = compose(&envelope).unwrap().unwrap();
        assert_eq!(sms.text, "Payment confirmed for order ORD-1. Amount: $n/a. ID: TXN-1");
    }

    #[tokio::test]
    async fn test_sparse_order_is_sent() {
        let envelope = EnvelopeFactory::new().build(
            ORDER_CREATED,
            json!({ "orderId": "ORD-1", "totalAmount": "40" }),
        );
        let mut handler = SmsHandler::new("sms-service");

        handler.handle(&envelope).await.unwrap();
        assert_eq!(handler.sent(), 1);
        assert_eq!(
            compose(&envelope).unwrap().unwrap().text,
            "Your order ORD-1 was created. Total: $40. Thanks for your purchase!"
        );
    }

    #[tokio::test]
    async fn test_non_object_payload_fails_handler() {
        let envelope = EnvelopeFactory::new().build(ORDER_CREATED, json!("ORD-1"));
        let mut handler = SmsHandler::new("sms-service");

        let err = handler.handle(&envelope).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload { .. }));
        assert_eq!(handler.sent(), 0);
    }
}
