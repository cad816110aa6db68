use crate::HubError;
use crate::consumer::{Dispatcher, Messenger, Update};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// What a handler gets to see of an inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct CommandContext {
    pub chat_id: i64,
    pub text: String,
    /// Text after the command word, trimmed
    pub args: String,
    pub sender: Option<String>,
    pub is_channel: bool,
}

impl CommandContext {
    /// Sender's first name, escaped for an HTML reply
    fn sender_name(&self) -> String {
        escape_html(self.sender.as_deref().unwrap_or("there"))
    }
}

/// Escape text interpolated into a reply sent with HTML parse mode
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Reply text, or `None` to stay silent
    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<Option<String>>;
}

/// `/start`
pub struct WelcomeReply;

#[async_trait]
impl CommandHandler for WelcomeReply {
    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<Option<String>> {
        Ok(Some(format!(
            "Hello {}!\n\nI can fetch data, keep it in a spreadsheet and mail you a report.\nSend me a request to get started.",
            ctx.sender_name()
        )))
    }
}

/// Free text and unknown commands
pub struct HelpReply;

#[async_trait]
impl CommandHandler for HelpReply {
    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<Option<String>> {
        Ok(Some(format!(
            "Hi {}!\n\nI did not understand that. Send /start to see what I can do.",
            ctx.sender_name()
        )))
    }
}

/// Routes chat messages to handlers by their leading `/command`
pub struct CommandDispatcher {
    messenger: Arc<dyn Messenger>,
    commands: BTreeMap<String, Arc<dyn CommandHandler>>,
    fallback: Arc<dyn CommandHandler>,
}

impl CommandDispatcher {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            messenger,
            commands: BTreeMap::new(),
            fallback: Arc::new(HelpReply),
        }
    }

    /// `/start` registered, help text for everything else
    pub fn with_defaults(messenger: Arc<dyn Messenger>) -> Result<Self, HubError> {
        let mut dispatcher = Self::new(messenger);
        dispatcher.register("/start", WelcomeReply)?;
        Ok(dispatcher)
    }

    pub fn register(
        &mut self,
        command: &str,
        handler: impl CommandHandler + 'static,
    ) -> Result<&mut Self, HubError> {
        let valid = command.len() > 1
            && command.starts_with('/')
            && command[1..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(HubError::ConfigurationError(format!(
                "invalid command name: {command:?}"
            )));
        }
        if self.commands.contains_key(command) {
            return Err(HubError::ConfigurationError(format!(
                "command {command} registered twice"
            )));
        }

        self.commands.insert(command.to_string(), Arc::new(handler));
        Ok(self)
    }

    pub fn set_fallback(&mut self, handler: impl CommandHandler + 'static) -> &mut Self {
        self.fallback = Arc::new(handler);
        self
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    fn route(&self, text: &str) -> (Arc<dyn CommandHandler>, String) {
        let text = text.trim();
        if text.starts_with('/') {
            let (word, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
            // "/start@SomeBot" in group chats
            let command = word.split('@').next().unwrap_or(word);
            if let Some(handler) = self.commands.get(command) {
                return (handler.clone(), rest.trim().to_string());
            }
        }
        (self.fallback.clone(), text.to_string())
    }
}

#[async_trait]
impl Dispatcher for CommandDispatcher {
    async fn dispatch(&self, update: &Update) -> anyhow::Result<()> {
        let (Some(message), Some(text)) = (update.message(), update.text()) else {
            debug!(update_id = update.update_id, "Ignoring update without text");
            return Ok(());
        };

        let chat_id = message.chat.id;
        let ctx = CommandContext {
            chat_id,
            text: text.to_string(),
            args: String::new(),
            sender: message.from.as_ref().map(|u| u.first_name.clone()),
            is_channel: update.is_channel_post(),
        };
        info!(
            chat_id,
            channel = ctx.is_channel,
            sender = ctx.sender.as_deref().unwrap_or("unknown"),
            "Message received"
        );

        let (handler, args) = self.route(text);
        let ctx = CommandContext { args, ..ctx };

        // Best-effort hint: the result is dropped on purpose
        let _ = self.messenger.send_typing(chat_id).await;

        if let Some(reply) = handler.handle(&ctx).await? {
            self.messenger.send_text(chat_id, &reply).await?;
        }
        Ok(())
    }
}
