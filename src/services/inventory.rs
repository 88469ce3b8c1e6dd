//! Inventory service: decrements stock on every new order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use super::decode;
use crate::bus::{EventHandler, HandlerError};
use crate::envelope::Envelope;
use crate::events::{number, text, OrderCreated, ORDER_CREATED, ORDER_SHIPPED, PAYMENT_COMPLETED};

/// Stock below this raises a low-stock warning.
pub const LOW_STOCK_THRESHOLD: i64 = 10;

/// Stock below this (and not low) is reported as medium.
pub const MEDIUM_STOCK_THRESHOLD: i64 = 30;

/// Stock of a product seen for the first time.
pub const NEW_PRODUCT_STOCK: i64 = 100;

const CATALOGUE: [(&str, &str, i64); 5] = [
    ("prod456", "Laptop Pro", 50),
    ("laptop-pro", "Laptop Pro 15\"", 25),
    ("phone-x", "Phone X", 100),
    ("tablet-s", "Tablet S", 30),
    ("watch-3", "Smart Watch 3", 75),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockLevel {
    Low,
    Medium,
    High,
}

impl StockLevel {
    pub fn of(stock: i64) -> Self {
        if stock < LOW_STOCK_THRESHOLD {
            StockLevel::Low
        } else if stock < MEDIUM_STOCK_THRESHOLD {
            StockLevel::Medium
        } else {
            StockLevel::High
        }
    }
}

impl std::fmt::Display for StockLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StockLevel::Low => "LOW",
            StockLevel::Medium => "MEDIUM",
            StockLevel::High => "HIGH",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockItem {
    pub name: String,
    /// May go negative; orders are never refused.
    pub stock: i64,
}

/// Effect of one sale on the stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockChange {
    pub product_id: String,
    pub name: String,
    pub previous: i64,
    pub current: i64,
    /// The product was unknown and got created.
    pub created: bool,
}

impl StockChange {
    pub fn is_low(&self) -> bool {
        self.current < LOW_STOCK_THRESHOLD
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    items: BTreeMap<String, StockItem>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::seeded()
    }
}

impl Inventory {
    /// The starting catalogue.
    pub fn seeded() -> Self {
        let items = CATALOGUE
            .iter()
            .map(|(id, name, stock)| {
                (
                    id.to_string(),
                    StockItem {
                        name: name.to_string(),
                        stock: *stock,
                    },
                )
            })
            .collect();
        Self { items }
    }

    pub fn stock(&self, product_id: &str) -> Option<i64> {
        self.items.get(product_id).map(|item| item.stock)
    }

    pub fn apply_sale(&mut self, product_id: &str, quantity: i64) -> StockChange {
        let created = !self.items.contains_key(product_id);
        let item = self
            .items
            .entry(product_id.to_string())
            .or_insert_with(|| StockItem {
                name: format!("Product {}", product_id),
                stock: NEW_PRODUCT_STOCK,
            });

        let previous = item.stock;
        item.stock -= quantity;

        StockChange {
            product_id: product_id.to_string(),
            name: item.name.clone(),
            previous,
            current: item.stock,
            created,
        }
    }

    /// Every product with its stock level, ordered by id.
    pub fn status(&self) -> Vec<(&str, &StockItem, StockLevel)> {
        self.items
            .iter()
            .map(|(id, item)| (id.as_str(), item, StockLevel::of(item.stock)))
            .collect()
    }
}

pub struct InventoryHandler {
    name: String,
    inventory: Inventory,
}

impl InventoryHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inventory: Inventory::seeded(),
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    fn log_status(&self) {
        for (id, item, level) in self.inventory.status() {
            info!(product_id = %id, name = %item.name, stock = item.stock, level = %level, "Stock");
        }
    }
}

#[async_trait]
impl EventHandler for InventoryHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, envelope: &Envelope) -> Result<(), HandlerError> {
        match envelope.event_type.as_str() {
            ORDER_CREATED => {
                let order: OrderCreated = decode(envelope)?;
                // Fractions are truncated; a non-numeric quantity sells nothing.
                let quantity = number(&order.quantity).map_or(0, |q| q as i64);
                let change = self.inventory.apply_sale(&text(&order.product_id), quantity);
                if change.created {
                    warn!(product_id = %change.product_id, "Unknown product, inventory record created");
                }
                info!(
                    product_id = %change.product_id,
                    name = %change.name,
                    previous = change.previous,
                    sold = quantity,
                    current = change.current,
                    "Inventory updated"
                );
                if change.is_low() {
                    warn!(product_id = %change.product_id, current = change.current, "Low stock");
                }
                self.log_status();
            }
            PAYMENT_COMPLETED => {
                info!(event_id = %envelope.event_id, "Payment confirmed, no inventory action needed");
            }
            ORDER_SHIPPED => {
                info!(event_id = %envelope.event_id, "Order shipped, inventory already updated");
            }
            other => warn!(event_type = %other, "Unhandled event type"),
        }
        Ok(())
    }

    async fn on_start(&mut self) {
        self.log_status();
    }
}
