pub mod ollama;
pub mod remote;
