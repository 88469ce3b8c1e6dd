//! sms-service: sends a text message per event
//!
//! Consumes its own durable queue bound to the orders exchange.

use std::process::ExitCode;

use orderbus::runtime;
use orderbus::services::ServiceKind;
use orderbus::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    runtime::exit_code(runtime::launch_consumer(ServiceKind::Sms).await)
}
