//! Analytics service: running order, revenue and event-type statistics.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::decode;
use crate::bus::{EventHandler, HandlerError};
use crate::envelope::Envelope;
use crate::events::{
    number, text, OrderCreated, OrderShipped, PaymentCompleted, ORDER_CREATED, ORDER_SHIPPED,
    PAYMENT_COMPLETED,
};

/// A report is logged after every this many events.
pub const REPORT_EVERY_EVENTS: u64 = 3;

/// Period of the background report.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Products listed in a report.
pub const TOP_PRODUCTS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductStats {
    pub orders: u64,
    pub units: u64,
    pub revenue: f64,
}

/// Snapshot of the metrics at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsReport {
    pub total_orders: u64,
    pub total_revenue: f64,
    pub total_payments: u64,
    pub total_shipments: u64,
    /// Best products by revenue, highest first.
    pub top_products: Vec<(String, ProductStats)>,
    pub events_by_type: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct AnalyticsMetrics {
    total_orders: u64,
    total_revenue: f64,
    total_payments: u64,
    total_shipments: u64,
    by_product: HashMap<String, ProductStats>,
    by_event_type: BTreeMap<String, u64>,
}

impl AnalyticsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one event. Unknown types are only counted.
    pub fn record(&mut self, envelope: &Envelope) -> Result<(), HandlerError> {
        match envelope.event_type.as_str() {
            ORDER_CREATED => {
                let order: OrderCreated = decode(envelope)?;
                // Non-numeric amounts and quantities count as zero.
                let revenue = number(&order.total_amount).unwrap_or(0.0);
                let units = number(&order.quantity)
                    .filter(|q| *q > 0.0)
                    .map_or(0, |q| q as u64);
                let product_id = text(&order.product_id);

                self.total_orders += 1;
                self.total_revenue += revenue;

                let stats = self.by_product.entry(product_id.clone()).or_default();
                stats.orders += 1;
                stats.units += units;
                stats.revenue += revenue;

                info!(
                    order_id = %order.order_id,
                    product_id = %product_id,
                    quantity = %text(&order.quantity),
                    total_amount = %text(&order.total_amount),
                    "Order recorded"
                );
            }
            PAYMENT_COMPLETED => {
                let payment: PaymentCompleted = decode(envelope)?;
                self.total_payments += 1;
                info!(
                    order_id = %payment.order_id,
                    amount = %text(&payment.amount),
                    payment_method = %text(&payment.payment_method),
                    "Payment recorded"
                );
            }
            ORDER_SHIPPED => {
                let shipment: OrderShipped = decode(envelope)?;
                self.total_shipments += 1;
                info!(
                    order_id = %shipment.order_id,
                    carrier = %text(&shipment.carrier),
                    "Shipment recorded"
                );
            }
            other => info!(event_type = %other, "Unhandled event type counted"),
        }

        *self
            .by_event_type
            .entry(envelope.event_type.clone())
            .or_insert(0) += 1;
        Ok(())
    }

    pub fn total_events(&self) -> u64 {
        self.by_event_type.values().sum()
    }

    pub fn report(&self) -> MetricsReport {
        let mut products: Vec<_> = self
            .by_product
            .iter()
            .map(|(id, stats)| (id.clone(), stats.clone()))
            .collect();
        products.sort_by(|a, b| {
            b.1.revenue
                .partial_cmp(&a.1.revenue)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        products.truncate(TOP_PRODUCTS);

        MetricsReport {
            total_orders: self.total_orders,
            total_revenue: self.total_revenue,
            total_payments: self.total_payments,
            total_shipments: self.total_shipments,
            top_products: products,
            events_by_type: self.by_event_type.clone(),
        }
    }
}

fn log_report(service: &str, report: &MetricsReport) {
    info!(
        service = %service,
        total_orders = report.total_orders,
        total_revenue = %format!("{:.2}", report.total_revenue),
        total_payments = report.total_payments,
        total_shipments = report.total_shipments,
        "Analytics report"
    );
    for (rank, (product_id, stats)) in report.top_products.iter().enumerate() {
        info!(
            rank = rank + 1,
            product_id = %product_id,
            orders = stats.orders,
            units = stats.units,
            revenue = %format!("{:.2}", stats.revenue),
            "Top product"
        );
    }
    for (event_type, count) in &report.events_by_type {
        info!(event_type = %event_type, count, "Events by type");
    }
}

pub struct AnalyticsHandler {
    name: String,
    metrics: AnalyticsMetrics,
}

impl AnalyticsHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metrics: AnalyticsMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &AnalyticsMetrics {
        &self.metrics
    }
}

#[async_trait]
impl EventHandler for AnalyticsHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, envelope: &Envelope) -> Result<(), HandlerError> {
        self.metrics.record(envelope)?;
        if self.metrics.total_events() % REPORT_EVERY_EVENTS == 0 {
            log_report(&self.name, &self.metrics.report());
        }
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(REPORT_INTERVAL)
    }

    async fn on_tick(&mut self) {
        if self.metrics.total_events() > 0 {
            log_report(&self.name, &self.metrics.report());
        }
    }

    async fn on_shutdown(&mut self) {
        log_report(&self.name, &self.metrics.report());
    }
}
