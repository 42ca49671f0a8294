pub mod model;
pub mod service;
pub mod store;

pub use model::{
    Conversation, ConversationId, ConversationKind, ConversationSummary, Message, MessageId,
    MessageKind, NewMessage, Participant, UserId,
};
pub use service::ChatService;
pub use store::{ChatStore, SqliteChatStore};
