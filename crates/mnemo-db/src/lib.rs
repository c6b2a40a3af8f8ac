pub mod conversations;
pub mod memory_store;
pub mod migrations;
pub mod pool;
pub mod users;
pub mod vector_store;

pub use conversations::{ConversationStore, ConversationTurn};
pub use memory_store::{
    Direction, MemoryFilter, MemoryRecord, MemorySort, MemorySource, MemoryStore, NewMemory,
    RelatedMemory, Relationship,
};
pub use pool::{Database, PoolStats};
pub use users::{
    Formality, ResponseLength, Role, RoleStore, User, UserPreferences, UserStore,
};
pub use vector_store::{VectorStore, cosine_similarity};
