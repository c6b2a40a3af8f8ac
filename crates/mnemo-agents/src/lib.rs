pub mod cache;
pub mod embeddings;
pub mod gemini;
pub mod openai;
pub mod providers;
pub mod router;

pub use cache::ResponseCache;
pub use embeddings::{
    EmbeddingProvider, EmbeddingRouter, GeminiEmbeddingProvider, OpenAiEmbeddingProvider,
};
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use providers::{
    ChatRole, ChatTurn, GenerationOptions, GenerationRequest, ModelInfo, ModelProvider,
    RoleContext,
};
pub use router::ModelRouter;
