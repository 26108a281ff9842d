pub mod actor;
pub mod comm;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod interpreter;
pub mod logger;
pub mod magic;
pub mod multiplexer;
pub mod relay;
pub mod rhai_interpreter;
pub mod schema;
pub mod topology;
pub mod transformer;
pub mod transport;

pub use kernel_protocol;
