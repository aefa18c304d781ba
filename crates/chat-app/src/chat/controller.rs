use std::sync::Arc;

use kindred_storage::{AccountId, MessageRecord, NewMessage, TranscriptStore};
use tokio::sync::mpsc;

use super::events::{Route, ViewEvent};
use super::exchange::{ExchangeClient, ExchangeResult};
use super::message::{
    APOLOGY_TEXT, ChatMessage, DEFAULT_GREETING, ExchangeTicket, LocalMessageId, MessageStatus,
    Role, unix_timestamp_millis,
};
use crate::session::{AuthState, AuthSubscription, SessionGate};

/// Lifecycle of one conversation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    CheckingAuth,
    /// Terminal: the view navigated away to the login route.
    Redirected,
    LoadingHistory,
    Ready,
    /// One exchange in flight. Doubles as the in-flight flag.
    Sending(ExchangeTicket),
}

/// An accepted submission whose exchange has not completed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExchange {
    pub ticket: ExchangeTicket,
    pub account_id: AccountId,
    pub utterance: String,
}

impl PendingExchange {
    pub async fn run(&self, client: &ExchangeClient) -> ExchangeResult<String> {
        client.exchange(self.account_id, &self.utterance).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank input, oversized input, or another exchange in flight. Nothing changed.
    Rejected,
    /// Completion for an exchange that is no longer in flight.
    Ignored,
    Replied,
    Apologized,
    /// The exchange reported a lost session; the view redirected.
    Redirected,
}

/// Drives the conversation view: session check, history load, and the
/// submit/reply cycle over an in-memory message list.
///
/// Only replies that came back from the answer backend are written to the
/// transcript, and only after the exchange succeeded. Greeting and apology
/// entries stay local.
pub struct ConversationController {
    gate: SessionGate,
    store: Arc<dyn TranscriptStore>,
    exchange: ExchangeClient,
    events: mpsc::UnboundedSender<ViewEvent>,
    greeting: String,
    state: ViewState,
    account_id: Option<AccountId>,
    auth_changes: Option<AuthSubscription>,
    messages: Vec<ChatMessage>,
    input: String,
    next_local_id: u64,
    next_ticket: u64,
}

impl ConversationController {
    pub fn new(
        gate: SessionGate,
        store: Arc<dyn TranscriptStore>,
        exchange: ExchangeClient,
        events: mpsc::UnboundedSender<ViewEvent>,
    ) -> Self {
        Self {
            gate,
            store,
            exchange,
            events,
            greeting: DEFAULT_GREETING.to_string(),
            state: ViewState::CheckingAuth,
            account_id: None,
            auth_changes: None,
            messages: Vec::new(),
            input: String::new(),
            next_local_id: 1,
            next_ticket: 1,
        }
    }

    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = greeting.into();
        self
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn account_id(&self) -> Option<AccountId> {
        self.account_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn exchange_client(&self) -> &ExchangeClient {
        &self.exchange
    }

    pub fn is_sending(&self) -> bool {
        matches!(self.state, ViewState::Sending(_))
    }

    /// Resolves the session, then loads history. Only acts from `CheckingAuth`.
    pub async fn activate(&mut self) {
        if self.state != ViewState::CheckingAuth {
            tracing::debug!(state = ?self.state, "conversation view already activated");
            return;
        }

        // Subscribe before resolving so a sign-out during resolution is not lost.
        self.auth_changes = Some(self.gate.on_auth_state_change());

        let Some(account_id) = self.gate.current_account().await else {
            self.redirect();
            return;
        };
        self.account_id = Some(account_id);
        self.state = ViewState::LoadingHistory;
        self.load_history(account_id).await;
    }

    async fn load_history(&mut self, account_id: AccountId) {
        match self.store.load_history(account_id).await {
            Ok(records) if records.is_empty() => {
                let id = self.next_local_id();
                self.messages.push(ChatMessage::new(
                    id,
                    Role::Assistant,
                    self.greeting.clone(),
                    unix_timestamp_millis(),
                    MessageStatus::Greeting,
                ));
            }
            Ok(records) => self.seed(records),
            Err(error) if error.is_unauthenticated() => {
                tracing::warn!(account_id = %account_id, error = %error, "history load rejected the session");
                self.redirect();
                return;
            }
            Err(error) => {
                tracing::warn!(account_id = %account_id, error = %error, "failed to load history");
            }
        }

        self.state = ViewState::Ready;
        self.emit_transcript_changed();
    }

    fn seed(&mut self, records: Vec<MessageRecord>) {
        self.messages.reserve(records.len());
        for record in records {
            let id = self.next_local_id();
            self.messages.push(ChatMessage::from_record(id, record));
        }
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    /// Accepts the current input as a submission, appends it optimistically and
    /// enters `Sending`. Returns `None` without touching anything when the
    /// submission is rejected.
    pub fn begin_send(&mut self) -> Option<PendingExchange> {
        if self.state != ViewState::Ready {
            tracing::debug!(state = ?self.state, "submission rejected outside the ready state");
            return None;
        }
        let account_id = self.account_id?;
        let utterance = self.input.trim();
        if utterance.is_empty() {
            return None;
        }
        if utterance.chars().count() > self.exchange.options().max_utterance_chars {
            tracing::debug!("submission rejected for length");
            return None;
        }
        let utterance = utterance.to_string();

        let ticket = ExchangeTicket::new(self.next_ticket);
        self.next_ticket += 1;
        let id = self.next_local_id();
        self.messages.push(ChatMessage::new(
            id,
            Role::User,
            utterance.clone(),
            unix_timestamp_millis(),
            MessageStatus::Pending(ticket),
        ));
        self.input.clear();
        self.state = ViewState::Sending(ticket);
        self.emit_transcript_changed();

        Some(PendingExchange {
            ticket,
            account_id,
            utterance,
        })
    }

    /// Applies the result of the exchange started by `begin_send`.
    pub async fn finish_send(
        &mut self,
        ticket: ExchangeTicket,
        result: ExchangeResult<String>,
    ) -> SendOutcome {
        if self.state != ViewState::Sending(ticket) {
            tracing::debug!(ticket = ticket.0, state = ?self.state, "ignoring stale exchange result");
            return SendOutcome::Ignored;
        }
        let Some(user_index) = self.pending_index(ticket) else {
            tracing::warn!(ticket = ticket.0, "pending message missing for exchange");
            self.state = ViewState::Ready;
            return SendOutcome::Ignored;
        };

        match result {
            Ok(reply) => {
                let id = self.next_local_id();
                self.messages.push(ChatMessage::new(
                    id,
                    Role::Assistant,
                    reply,
                    unix_timestamp_millis(),
                    MessageStatus::Pending(ticket),
                ));
                let reply_index = self.messages.len() - 1;
                self.state = ViewState::Ready;
                self.emit_transcript_changed();
                self.persist_pair(user_index, reply_index).await;
                SendOutcome::Replied
            }
            Err(error) => {
                tracing::error!(ticket = ticket.0, error = %error, "exchange failed");
                self.messages[user_index].status = MessageStatus::LocalOnly;
                let id = self.next_local_id();
                self.messages.push(ChatMessage::new(
                    id,
                    Role::Assistant,
                    APOLOGY_TEXT,
                    unix_timestamp_millis(),
                    MessageStatus::Apology,
                ));
                self.state = ViewState::Ready;
                self.emit_transcript_changed();

                if error.is_unauthenticated() {
                    self.redirect();
                    return SendOutcome::Redirected;
                }
                SendOutcome::Apologized
            }
        }
    }

    /// Submits the current input and waits for the reply.
    pub async fn send(&mut self) -> SendOutcome {
        let Some(pending) = self.begin_send() else {
            return SendOutcome::Rejected;
        };
        let result = pending.run(&self.exchange).await;
        self.finish_send(pending.ticket, result).await
    }

    /// Applies any auth change reported since the last call. Returns true when
    /// the view redirected.
    pub fn handle_auth_change(&mut self) -> bool {
        let Some(change) = self.auth_changes.as_mut().and_then(AuthSubscription::take_change)
        else {
            return false;
        };
        self.apply_auth_state(change)
    }

    /// Waits for the next auth change and applies it.
    pub async fn wait_auth_change(&mut self) -> bool {
        let Some(auth_changes) = self.auth_changes.as_mut() else {
            return false;
        };
        let change = auth_changes.changed().await;
        self.apply_auth_state(change)
    }

    fn apply_auth_state(&mut self, state: AuthState) -> bool {
        if self.state == ViewState::Redirected {
            return false;
        }
        match (state, self.account_id) {
            (AuthState::SignedIn(current), Some(owner)) if current == owner => false,
            (AuthState::SignedIn(_), None) => false,
            _ => {
                self.redirect();
                true
            }
        }
    }

    fn redirect(&mut self) {
        if self.state == ViewState::Redirected {
            return;
        }
        tracing::info!(account_id = ?self.account_id, "conversation view redirecting to login");
        self.state = ViewState::Redirected;
        self.emit(ViewEvent::Redirect {
            route: Route::Login,
        });
    }

    async fn persist_pair(&mut self, user_index: usize, reply_index: usize) {
        let Some(account_id) = self.account_id else {
            return;
        };

        for index in [user_index, reply_index] {
            let message = &self.messages[index];
            let input = NewMessage::new(
                message.role.into(),
                message.content.clone(),
                message.timestamp_unix_millis,
            );
            match self.store.append(account_id, input).await {
                Ok(record) => {
                    let message = &mut self.messages[index];
                    message.timestamp_unix_millis = record.created_at_unix_millis;
                    message.status = MessageStatus::Persisted(record.id);
                }
                Err(error) => {
                    tracing::warn!(account_id = %account_id, error = %error, "failed to persist exchange; keeping it local");
                    self.messages[index].status = MessageStatus::LocalOnly;
                    if index == user_index {
                        // A reply without its utterance would corrupt the transcript.
                        self.messages[reply_index].status = MessageStatus::LocalOnly;
                        return;
                    }
                }
            }
        }
    }

    fn pending_index(&self, ticket: ExchangeTicket) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|message| message.status == MessageStatus::Pending(ticket))
    }

    fn next_local_id(&mut self) -> LocalMessageId {
        let id = LocalMessageId::new(self.next_local_id);
        self.next_local_id += 1;
        id
    }

    fn emit_transcript_changed(&self) {
        self.emit(ViewEvent::TranscriptChanged {
            len: self.messages.len(),
        });
    }

    fn emit(&self, event: ViewEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("view event receiver dropped");
        }
    }
}
