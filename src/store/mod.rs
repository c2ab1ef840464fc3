pub mod vector_store;

pub use vector_store::{cosine_f64, decode_blob, encode_blob, StoredChunk, VectorStore};
