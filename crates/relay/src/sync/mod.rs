pub mod doc_registry;

pub use doc_registry::{DocRegistry, DocState, SharedDoc};
