//! Concrete model providers

pub mod anthropic;

pub use anthropic::AnthropicProvider;
