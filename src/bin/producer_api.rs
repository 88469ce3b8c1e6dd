//! producer-api: HTTP front door for order events
//!
//! Connects to the broker, declares the orders exchange and accepts
//! order, payment and shipment requests, publishing one event for each.
//!
//! ## Configuration
//! - RABBITMQ_URL: broker address (default amqp://localhost:5672)
//! - PORT: HTTP port (default 3000)
//! - ORDERBUS__*: any other setting, see `orderbus::config`

use std::process::ExitCode;

use orderbus::runtime;
use orderbus::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    runtime::exit_code(runtime::launch_producer().await)
}
