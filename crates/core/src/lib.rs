pub mod assistant;
pub mod conversation;
pub mod llm_client;
pub mod service;
pub mod session;
pub mod store;

pub use assistant::{Assistant, ChatPrompt};
pub use conversation::{ContactUpdate, TurnAction, TurnPlan, plan_turn};
pub use service::SessionService;
pub use session::{Session, SessionPatch, normalize_phone};
pub use store::{InMemorySessionStore, SessionStore};
