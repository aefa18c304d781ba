pub mod context;
pub mod controller;
pub mod events;
pub mod exchange;
pub mod message;

pub use context::ContextWindow;
pub use controller::{ConversationController, PendingExchange, SendOutcome, ViewState};
pub use events::{Route, ViewEvent};
pub use exchange::{ExchangeClient, ExchangeError, ExchangeOptions, ExchangeResult};
pub use message::{
    APOLOGY_TEXT, ChatMessage, DEFAULT_GREETING, ExchangeTicket, LocalMessageId, MessageStatus,
    Role,
};
