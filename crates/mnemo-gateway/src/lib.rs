pub mod bootstrap;
pub mod engine;
pub mod errors;
pub mod server;

pub use bootstrap::{AppContext, build};
pub use engine::{ChatEngine, EngineReply, IncomingMessage};
pub use errors::user_reply_for;
pub use server::serve;
