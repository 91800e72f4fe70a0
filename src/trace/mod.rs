pub mod info;
pub mod tracer;
