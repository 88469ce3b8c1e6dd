//! Email service: one notification per known event. Sending is simulated by
//! logging the composed message.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{amount, decode};
use crate::bus::{EventHandler, HandlerError};
use crate::envelope::Envelope;
use crate::events::{
    text, OrderCreated, OrderShipped, PaymentCompleted, ORDER_CREATED, ORDER_SHIPPED,
    PAYMENT_COMPLETED,
};

/// Recipient of payment and shipment notices.
pub const CUSTOMER_ADDRESS: &str = "customer@example.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Compose the notification for `envelope`. `None` for unknown event types.
pub fn compose(envelope: &Envelope) -> Result<Option<EmailMessage>, HandlerError> {
    let message = match envelope.event_type.as_str() {
        ORDER_CREATED => {
            let order: OrderCreated = decode(envelope)?;
            EmailMessage {
                to: format!("user-{}@example.com", text(&order.user_id)),
                subject: "Order confirmation".to_string(),
                body: format!(
                    "Hi! Your order {} was created successfully.\nProduct: {}\nQuantity: {}\nTotal: ${}\n\nThanks for your purchase!",
                    order.order_id,
                    text(&order.product_id),
                    text(&order.quantity),
                    amount(&order.total_amount)
                ),
            }
        }
        PAYMENT_COMPLETED => {
            let payment: PaymentCompleted = decode(envelope)?;
            EmailMessage {
                to: CUSTOMER_ADDRESS.to_string(),
                subject: "Payment confirmed".to_string(),
                body: format!(
                    "Your payment for order {} was processed.\nAmount: ${}\nTransaction ID: {}\nMethod: {}",
                    payment.order_id,
                    amount(&payment.amount),
                    payment.transaction_id,
                    text(&payment.payment_method)
                ),
            }
        }
        ORDER_SHIPPED => {
            let shipment: OrderShipped = decode(envelope)?;
            let address = match text(&shipment.address) {
                address if address.is_empty() => "not specified".to_string(),
                address => address,
            };
            EmailMessage {
                to: CUSTOMER_ADDRESS.to_string(),
                subject: "Order shipped".to_string(),
                body: format!(
                    "Your order {} has shipped!\nCarrier: {}\nTracking number: {}\nAddress: {}",
                    shipment.order_id,
                    text(&shipment.carrier),
                    shipment.tracking_number,
                    address
                ),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(message))
}

pub struct EmailHandler {
    name: String,
    sent: u64,
}

impl EmailHandler {
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
impl EventHandler for EmailHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, envelope: &Envelope) -> Result<(), HandlerError> {
        match compose(envelope)? {
            Some(email) => {
                info!(to = %email.to, subject = %email.subject, body = %email.body, "Sending email");
                self.sent += 1;
            }
            None => warn!(event_type = %envelope.event_type, "Unhandled event type"),
        }
        Ok(())
    }
}
