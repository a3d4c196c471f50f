use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use xchange_db::messages::{MessageEffects, NewMessage};
use xchange_db::models::{ConversationRow, ProductRow};
use xchange_db::{Database, StoreError, StoreResult};
use xchange_gateway::relay::{Delivery, Relay};
use xchange_types::api::{ConversationSummary, OtherParty};
use xchange_types::events::RelayEvent;
use xchange_types::models::{
    Identity, Message, MessageKind, Participant, ProductContext, ProductSummary, Role,
};

use crate::error::MessagingError;
use crate::identity;

pub type MessagingResult<T> = Result<T, MessagingError>;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Upper bound on any single store call.
    pub store_timeout: Duration,
    pub preview_chars: usize,
    pub max_body_chars: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            preview_chars: 120,
            max_body_chars: 4000,
        }
    }
}

/// The authenticated caller, as established by the auth middleware.
#[derive(Debug, Clone)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedConversation {
    pub conversation_id: String,
    pub is_new: bool,
}

/// Orchestrates the conversation store, message store and realtime relay.
///
/// Each public operation is one logical transaction from the caller's point
/// of view. Store calls run on the blocking pool under `store_timeout`;
/// reads are retried once on backend failure, writes never are.
#[derive(Clone)]
pub struct MessagingService {
    db: Arc<Database>,
    relay: Relay,
    config: ServiceConfig,
}

impl MessagingService {
    pub fn new(db: Arc<Database>, relay: Relay, config: ServiceConfig) -> Self {
        Self { db, relay, config }
    }

    /// Resolve a member or admin by id or email.
    pub async fn resolve_identity(&self, key: &str) -> MessagingResult<Identity> {
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(MessagingError::InvalidArgument("identity id is required".into()));
        }
        self.read("resolve_identity", move |db| identity::resolve(db, &key))
            .await?
            .ok_or_else(|| MessagingError::NotFound("recipient not found".into()))
    }

    /// Find the conversation between the caller and `recipient_key` (scoped to
    /// `product_ref`), creating it if needed.
    pub async fn get_or_create_conversation(
        &self,
        caller: &Caller,
        recipient_key: &str,
        product_ref: Option<&str>,
    ) -> MessagingResult<OpenedConversation> {
        let product_ref = product_ref
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        if recipient_key.trim().is_empty() {
            return Err(MessagingError::InvalidArgument("recipient id is required".into()));
        }
        let recipient = self.resolve_identity(recipient_key).await?;
        if recipient.id == caller.id {
            return Err(MessagingError::InvalidArgument(
                "cannot start a conversation with yourself".into(),
            ));
        }

        if let Some(existing) = self
            .find_by_participants(&caller.id, &recipient.id, product_ref.clone())
            .await?
        {
            return Ok(OpenedConversation {
                conversation_id: existing.id,
                is_new: false,
            });
        }

        // The opening message is written in the conversation's own transaction.
        let product = match product_ref.clone() {
            Some(pid) => {
                let product = self.read("get_product", move |db| db.get_product(&pid)).await?;
                if product.is_none() {
                    warn!("Product {:?} not found, opening without a system message", product_ref);
                }
                product
            }
            None => None,
        };

        let caller_part = Participant {
            identity_id: caller.id.clone(),
            role: caller.role,
        };
        let recipient_part = Participant {
            identity_id: recipient.id.clone(),
            role: recipient.role,
        };
        let new_id = Uuid::new_v4().to_string();
        let pref = product_ref.clone();
        let opening = product.map(|p| opening_message(p, self.config.preview_chars));
        let sender = caller.id.clone();
        let created = self
            .write("create_conversation", move |db| match &opening {
                Some((text, context, preview)) => {
                    let msg = NewMessage {
                        conversation_id: &new_id,
                        sender_id: &sender,
                        kind: MessageKind::System,
                        body: text,
                        product_context: Some(context),
                    };
                    db.create_conversation_with_opening(
                        &new_id,
                        &caller_part,
                        &recipient_part,
                        pref.as_deref(),
                        &msg,
                        preview,
                        Utc::now(),
                    )
                    .map(|(row, _)| row)
                }
                None => db.create_conversation(
                    &new_id,
                    &caller_part,
                    &recipient_part,
                    pref.as_deref(),
                    Utc::now(),
                ),
            })
            .await;

        let conversation = match created {
            Ok(row) => row,
            Err(MessagingError::Conflict) => {
                // Someone else created it concurrently; use theirs.
                debug!("Concurrent create for {} <-> {}, refetching", caller.id, recipient.id);
                let existing = self
                    .find_by_participants(&caller.id, &recipient.id, product_ref.clone())
                    .await?
                    .ok_or_else(|| {
                        MessagingError::Unavailable("conversation vanished after conflict".into())
                    })?;
                return Ok(OpenedConversation {
                    conversation_id: existing.id,
                    is_new: false,
                });
            }
            Err(e) => return Err(e),
        };

        info!(
            "Conversation {} opened by {} with {} (product: {:?})",
            conversation.id, caller.id, recipient.id, product_ref
        );

        Ok(OpenedConversation {
            conversation_id: conversation.id,
            is_new: true,
        })
    }

    /// Append a message from `sender_id` and notify the other participant.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
        product_context: Option<ProductContext>,
    ) -> MessagingResult<Message> {
        let conversation = self.membership(conversation_id, sender_id).await?;
        let body = self.validate_body(body)?;

        let recipient = conversation
            .other_participant(sender_id)
            .map(|p| p.identity_id.clone())
            .ok_or(MessagingError::Forbidden)?;

        let preview = preview(&body, self.config.preview_chars);
        let conv_id = conversation.id.clone();
        let sender = sender_id.to_string();
        let notify = recipient.clone();
        let message = self
            .write("record_message", move |db| {
                let msg = NewMessage {
                    conversation_id: &conv_id,
                    sender_id: &sender,
                    kind: MessageKind::User,
                    body: &body,
                    product_context: product_context.as_ref(),
                };
                let effects = MessageEffects {
                    preview: &preview,
                    notify: Some(&notify),
                };
                db.record_message(&msg, &effects, Utc::now())
            })
            .await?;

        debug!(
            "{} -> {} in {} (seq {})",
            sender_id, recipient, conversation_id, message.sequence
        );
        self.publish(recipient, message.clone());
        Ok(message)
    }

    /// Summaries of the caller's conversations, most recent first.
    pub async fn list_conversations(
        &self,
        caller_id: &str,
    ) -> MessagingResult<Vec<ConversationSummary>> {
        let caller = caller_id.to_string();
        let rows = self
            .read("list_conversations", move |db| {
                let conversations = db.list_conversations_for(&caller)?;
                let mut out = Vec::with_capacity(conversations.len());
                for conv in conversations {
                    let other = match conv.other_participant(&caller) {
                        Some(p) => identity::resolve_with_role(db, &p.identity_id, p.role)?,
                        None => None,
                    };
                    let product = match conv.product_ref.as_deref() {
                        Some(id) => db.get_product(id)?,
                        None => None,
                    };
                    out.push((conv, other, product));
                }
                Ok(out)
            })
            .await?;

        let summaries = rows
            .into_iter()
            .filter_map(|(conv, other, product)| {
                let Some(other) = other else {
                    warn!(
                        "Skipping conversation {}: other participant no longer resolves",
                        conv.id
                    );
                    return None;
                };
                let unread_count = conv.unread_for(caller_id);
                Some(ConversationSummary {
                    conversation_id: conv.id,
                    other_party: OtherParty {
                        id: other.id,
                        display_name: other.display_name,
                        email: other.email,
                        role: other.role,
                    },
                    last_message_preview: conv.last_message_preview,
                    last_message_at: conv.last_message_at,
                    unread: unread_count > 0,
                    unread_count,
                    product: product.map(product_summary),
                })
            })
            .collect();

        Ok(summaries)
    }

    /// Ordered messages of a conversation. Marks what the caller just saw as
    /// read and reconciles their unread counter.
    pub async fn get_messages(
        &self,
        conversation_id: &str,
        caller_id: &str,
    ) -> MessagingResult<Vec<Message>> {
        let conversation = self.membership(conversation_id, caller_id).await?;

        let conv_id = conversation.id.clone();
        let mut messages = self
            .read("list_messages", move |db| db.list_messages(&conv_id))
            .await?;

        let has_unread = messages
            .iter()
            .any(|m| m.sender_id != caller_id && !m.read);
        if has_unread || conversation.unread_for(caller_id) > 0 {
            let through_seq = messages.last().map(|m| m.sequence).unwrap_or(0);
            let conv_id = conversation.id.clone();
            let reader = caller_id.to_string();
            let marked = self
                .write("acknowledge_read", move |db| {
                    db.acknowledge_read(&conv_id, &reader, through_seq)
                })
                .await?;
            debug!("{} read {} messages in {}", caller_id, marked, conversation_id);

            for m in messages.iter_mut().filter(|m| m.sender_id != caller_id) {
                m.read = true;
            }
        }

        Ok(messages)
    }

    /// Total unread messages across all of the caller's conversations.
    pub async fn unread_total(&self, caller_id: &str) -> MessagingResult<u64> {
        let caller = caller_id.to_string();
        self.read("total_unread", move |db| db.total_unread(&caller))
            .await
    }

    /// Account-deletion cascade: remove every conversation the identity is
    /// part of, with all their messages. Returns (conversations, messages).
    pub async fn delete_all_for_identity(
        &self,
        identity_id: &str,
    ) -> MessagingResult<(usize, usize)> {
        let id = identity_id.to_string();
        let (conversations, messages) = self
            .write("delete_all_for_identity", move |db| {
                db.delete_all_for_identity(&id)
            })
            .await?;
        info!(
            "Deleted {} conversations and {} messages for {}",
            conversations, messages, identity_id
        );
        Ok((conversations, messages))
    }

    // -- internals --

    async fn find_by_participants(
        &self,
        a: &str,
        b: &str,
        product_ref: Option<String>,
    ) -> MessagingResult<Option<ConversationRow>> {
        let a = a.to_string();
        let b = b.to_string();
        self.read("find_conversation_by_participants", move |db| {
            db.find_conversation_by_participants(&a, &b, product_ref.as_deref())
        })
        .await
    }

    /// The conversation, provided `identity_id` takes part in it.
    async fn membership(
        &self,
        conversation_id: &str,
        identity_id: &str,
    ) -> MessagingResult<ConversationRow> {
        let id = conversation_id.trim().to_string();
        if id.is_empty() {
            return Err(MessagingError::InvalidArgument("conversation id is required".into()));
        }
        let conversation = self
            .read("find_conversation", move |db| db.find_conversation(&id))
            .await?
            .ok_or_else(|| MessagingError::NotFound("conversation not found".into()))?;

        if !conversation.has_participant(identity_id) {
            return Err(MessagingError::Forbidden);
        }
        Ok(conversation)
    }

    fn validate_body(&self, body: &str) -> MessagingResult<String> {
        let body = body.trim();
        if body.is_empty() {
            return Err(MessagingError::InvalidArgument("message text is required".into()));
        }
        if body.chars().count() > self.config.max_body_chars {
            return Err(MessagingError::InvalidArgument(format!(
                "message text exceeds {} characters",
                self.config.max_body_chars
            )));
        }
        Ok(body.to_string())
    }

    /// Fire-and-forget: the message is already durable, so delivery
    /// problems are only logged.
    fn publish(&self, recipient: String, message: Message) {
        let relay = self.relay.clone();
        tokio::spawn(async move {
            match relay.publish(&recipient, RelayEvent::Message(message)).await {
                Delivery::Delivered => {}
                Delivery::Offline => debug!("{} offline, message waits for next fetch", recipient),
                Delivery::Stale => warn!("Dropped stale relay connection for {}", recipient),
            }
        });
    }

    async fn run_blocking<F, T>(&self, op: &'static str, f: F) -> MessagingResult<StoreResult<T>>
    where
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || f(&db));
        match tokio::time::timeout(self.config.store_timeout, task).await {
            Ok(Ok(res)) => Ok(res),
            Ok(Err(e)) => {
                error!("{}: spawn_blocking join error: {}", op, e);
                Err(MessagingError::Unavailable(format!("{} aborted", op)))
            }
            Err(_) => {
                error!("{}: store call timed out after {:?}", op, self.config.store_timeout);
                Err(MessagingError::Unavailable(format!("{} timed out", op)))
            }
        }
    }

    async fn read<F, T>(&self, op: &'static str, f: F) -> MessagingResult<T>
    where
        F: Fn(&Database) -> StoreResult<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        match self.run_blocking(op, f.clone()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_transient() => return Err(e.into()),
            Ok(Err(e)) => warn!("{} failed ({}), retrying once", op, e),
            Err(e) => warn!("{} failed ({}), retrying once", op, e),
        }
        self.run_blocking(op, f).await?.map_err(MessagingError::from)
    }

    async fn write<F, T>(&self, op: &'static str, f: F) -> MessagingResult<T>
    where
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run_blocking(op, f).await?.map_err(|e: StoreError| {
            if e.is_transient() {
                error!("{} failed: {}", op, e);
            }
            MessagingError::from(e)
        })
    }
}

/// Truncate to `max_chars` characters, marking the cut with an ellipsis.
pub fn preview(body: &str, max_chars: usize) -> String {
    let mut chars = body.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

/// Body, product context and preview of a product inquiry's first message.
fn opening_message(product: ProductRow, preview_chars: usize) -> (String, ProductContext, String) {
    let text = format!(
        "This is the beginning of your conversation about \"{}\".",
        product.name
    );
    let preview = preview(&text, preview_chars);
    let context = ProductContext {
        name: product.name,
        price: product.price,
        image_url: product.image_url,
    };
    (text, context, preview)
}

fn product_summary(row: ProductRow) -> ProductSummary {
    ProductSummary {
        id: row.id,
        name: row.name,
        price: row.price,
        image_url: row.image_url,
    }
}
