pub mod embedding;
pub mod gateway;
pub mod salvage;

pub use embedding::{Embedder, HttpEmbedder, MAX_BATCH};
pub use gateway::{HttpLlmTransport, LlmGateway, LlmRequest, LlmTransport, TransportError};
pub use salvage::salvage_json;
