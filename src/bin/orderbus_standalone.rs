//! orderbus-standalone: every service in one process
//!
//! Runs the producer API and the four consumers against the in-memory
//! broker. Useful for local development without RabbitMQ.

use std::process::ExitCode;

use orderbus::runtime;
use orderbus::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    runtime::exit_code(runtime::launch_standalone().await)
}
