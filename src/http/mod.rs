pub mod body;
pub mod client;
pub mod tracing_connector;
pub mod tracing_resolver;
