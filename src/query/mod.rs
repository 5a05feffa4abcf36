pub mod context;
pub mod pipeline;
pub mod session;
