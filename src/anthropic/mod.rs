//! Cliente HTTP para a API Messages da Anthropic.

pub mod client;
pub mod types;

pub use client::AnthropicClient;
pub use types::{Message, MessagesRequest, MessagesResponse, Usage};
