pub mod model;

pub use model::{AppConfig, DecayConfig, ConsolidationConfig, RetrievalConfig};
