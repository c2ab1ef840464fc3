pub mod content_type;
pub mod rerank;

pub use content_type::classify;
pub use rerank::{RerankDoc, RerankedItem, Reranker};
