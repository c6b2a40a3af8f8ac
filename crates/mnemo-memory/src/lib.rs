pub mod cluster;
pub mod consolidator;
pub mod decay;
pub mod extractor;
pub mod maintenance;
pub mod manager;
pub mod sentiment;

pub use consolidator::Consolidator;
pub use decay::DecayEngine;
pub use extractor::{ExtractedMemory, ExtractionContext, MemoryExtractor};
pub use maintenance::{MaintenanceScheduler, MaintenanceStats};
pub use manager::{MemoryManager, RetrieveParams, format_for_prompt};
pub use sentiment::{Sentiment, SentimentAnalyzer, ToneAdjustment};
