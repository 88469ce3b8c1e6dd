//! orderbus - order events over a fanout broker
//!
//! An HTTP producer publishes order lifecycle events to one durable fanout
//! exchange. Four independent consumer services (analytics, email,
//! inventory, SMS) each drain their own durable queue with at-least-once
//! delivery.

pub mod bus;
pub mod config;
pub mod envelope;
pub mod events;
pub mod http;
pub mod lifecycle;
pub mod runtime;
pub mod services;
pub mod utils;
