//! Delivers admission notices through the bot.

use crate::commands::CallbackAction;
use anyhow::Result;
use async_trait::async_trait;
use gate_core::{Notifier, NotifyError, OperatorNotice, UserNotice};
use gate_platform::{InlineButton, TelegramBot, UserId};
use std::sync::Arc;

/// Outbound side of the bot, split out so the gateway and notifier can be driven in tests.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str, buttons: &[Vec<InlineButton>]) -> Result<()>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;
}

#[async_trait]
impl ChatSender for TelegramBot {
    async fn send(&self, chat_id: i64, text: &str, buttons: &[Vec<InlineButton>]) -> Result<()> {
        self.send_message(chat_id, text, buttons).await
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        TelegramBot::answer_callback(self, callback_id, text).await
    }
}

pub fn review_buttons(notice: &OperatorNotice) -> Vec<Vec<InlineButton>> {
    match notice.review_target() {
        Some(id) => vec![vec![
            InlineButton::new("Approve", CallbackAction::Approve(id).encode()),
            InlineButton::new("Reject", CallbackAction::Reject(id).encode()),
        ]],
        None => Vec::new(),
    }
}

pub struct TelegramNotifier {
    sender: Arc<dyn ChatSender>,
    operators: Vec<UserId>,
}

impl TelegramNotifier {
    pub fn new(sender: Arc<dyn ChatSender>, operators: Vec<UserId>) -> Self {
        Self { sender, operators }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_user(&self, user_id: UserId, notice: UserNotice) -> Result<(), NotifyError> {
        // Private chats share the user's id.
        self.sender
            .send(user_id.get(), &notice.render(), &[])
            .await
            .map_err(|e| NotifyError(e.to_string()))
    }

    async fn notify_operators(&self, notice: OperatorNotice) -> Result<(), NotifyError> {
        let text = notice.render();
        let buttons = review_buttons(&notice);
        let mut failed = 0usize;
        for operator in &self.operators {
            if let Err(e) = self.sender.send(operator.get(), &text, &buttons).await {
                failed += 1;
                tracing::warn!(operator_id = %operator, error = %e, "operator notification failed");
            }
        }
        if failed > 0 {
            return Err(NotifyError(format!(
                "{failed} of {} operator deliveries failed",
                self.operators.len()
            )));
        }
        Ok(())
    }
}
