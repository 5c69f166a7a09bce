//! Bot gateway: turns chat updates into admission requests and operator triggers.

use crate::commands::{self, CallbackAction, Command, OPERATOR_HELP, USER_HELP};
use crate::notifier::{ChatSender, review_buttons};
use anyhow::Result;
use gate_core::{AdmissionEngine, AdmissionError, JoinRequest, OperatorNotice, RequestId};
use gate_platform::{BotUpdate, BotUser, InlineButton, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PENDING_LIST_LIMIT: usize = 20;

pub struct Gateway {
    engine: AdmissionEngine,
    sender: Arc<dyn ChatSender>,
    operators: HashSet<UserId>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<BotUpdate>>,
}

impl Gateway {
    pub fn new(
        engine: AdmissionEngine,
        sender: Arc<dyn ChatSender>,
        operators: impl IntoIterator<Item = UserId>,
        inbound_rx: mpsc::Receiver<BotUpdate>,
    ) -> Self {
        Self {
            engine,
            sender,
            operators: operators.into_iter().collect(),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let update = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    update = rx.recv() => update,
                }
            };
            let Some(update) = update else {
                return Ok(());
            };

            // Admission attempts can take several platform round trips; don't stall other chats.
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_update(update).await {
                    tracing::warn!(%e, "handle_update failed");
                }
            });
        }
    }

    fn is_operator(&self, user_id: UserId) -> bool {
        self.operators.contains(&user_id)
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn handle_update(&self, update: BotUpdate) -> Result<()> {
        match update {
            BotUpdate::Message {
                chat_id,
                is_private,
                from,
                text,
                ..
            } => {
                if !is_private {
                    tracing::debug!(chat_id, "ignoring group message");
                    return Ok(());
                }
                self.handle_message(chat_id, &from, &text).await
            }
            BotUpdate::Callback {
                callback_id,
                chat_id,
                from,
                data,
                ..
            } => {
                let chat_id = chat_id.unwrap_or(from.id.get());
                self.handle_callback(&callback_id, chat_id, &from, &data)
                    .await
            }
        }
    }

    async fn handle_message(&self, chat_id: i64, from: &BotUser, text: &str) -> Result<()> {
        let command = match commands::parse_command(text) {
            None => {
                return self
                    .reply(chat_id, "Send /start to see the spaces you can join.")
                    .await;
            }
            Some(Err(usage)) => return self.reply(chat_id, &usage).await,
            Some(Ok(command)) => command,
        };
        tracing::info!(user_id = %from.id, ?command, "command received");

        if command.requires_operator() && !self.is_operator(from.id) {
            return self
                .reply(chat_id, "This command is only available to administrators.")
                .await;
        }

        match command {
            Command::Start => self.send_menu(chat_id).await,
            Command::Help => {
                let mut text = USER_HELP.to_string();
                if self.is_operator(from.id) {
                    text.push_str("\n\n");
                    text.push_str(OPERATOR_HELP);
                }
                self.reply(chat_id, &text).await
            }
            Command::Join(index) => self.request_join(chat_id, from, index).await,
            Command::Pending => self.send_pending(chat_id).await,
            Command::Approve(id) => {
                let text = self.decide(id, true, from.id).await;
                self.reply(chat_id, &text).await
            }
            Command::Reject(id) => {
                let text = self.decide(id, false, from.id).await;
                self.reply(chat_id, &text).await
            }
            Command::Rotate => {
                let text = match self.engine.force_rotate_delegate().await {
                    Ok(account) => format!(
                        "Active delegate is now #{} ({}).",
                        account.id, account.external_ref
                    ),
                    Err(e) => format!("Rotation failed: {e}"),
                };
                self.reply(chat_id, &text).await
            }
            Command::AutoAdmit(None) => {
                let text = match self.engine.auto_admit().await {
                    Ok(enabled) => format!("Automatic admission is {}.", on_off(enabled)),
                    Err(e) => format!("Could not read the setting: {e}"),
                };
                self.reply(chat_id, &text).await
            }
            Command::AutoAdmit(Some(enabled)) => {
                let text = match self.engine.toggle_auto_admit(enabled).await {
                    Ok(()) => format!("Automatic admission turned {}.", on_off(enabled)),
                    Err(e) => format!("Could not change the setting: {e}"),
                };
                self.reply(chat_id, &text).await
            }
            Command::Unblock(user_id) => {
                let text = match self.engine.unblock_rate_limit(user_id).await {
                    Ok(true) => format!("User {user_id} unblocked."),
                    Ok(false) => format!("User {user_id} was not blocked."),
                    Err(e) => format!("Unblock failed: {e}"),
                };
                self.reply(chat_id, &text).await
            }
            Command::Status => {
                let text = match self.engine.pool().status().await {
                    Ok(status) => format!(
                        "Delegates: {} active of {}.\nBound: {}\nAdmissions on current delegate: {}",
                        status.active_accounts,
                        status.total_accounts,
                        status
                            .bound_external_ref
                            .as_deref()
                            .unwrap_or("none"),
                        status.admissions_served
                    ),
                    Err(e) => format!("Status unavailable: {e}"),
                };
                self.reply(chat_id, &text).await
            }
        }
    }

    async fn handle_callback(
        &self,
        callback_id: &str,
        chat_id: i64,
        from: &BotUser,
        data: &str,
    ) -> Result<()> {
        let Some(action) = CallbackAction::parse(data) else {
            tracing::debug!(data, "unrecognized callback data");
            return self.answer(callback_id, None).await;
        };
        if action.requires_operator() && !self.is_operator(from.id) {
            return self
                .answer(callback_id, Some("Only administrators can do that."))
                .await;
        }

        match action {
            CallbackAction::Menu => {
                self.answer(callback_id, None).await?;
                self.send_menu(chat_id).await
            }
            CallbackAction::Join(index) => {
                self.answer(callback_id, None).await?;
                self.request_join(chat_id, from, index).await
            }
            CallbackAction::Approve(id) | CallbackAction::Reject(id) => {
                let approved = matches!(action, CallbackAction::Approve(_));
                // Acknowledge first; approval may outlast the callback deadline.
                self.answer(callback_id, Some(if approved { "Approving…" } else { "Rejecting…" }))
                    .await?;
                let text = self.decide(id, approved, from.id).await;
                self.reply(chat_id, &text).await
            }
        }
    }

    async fn request_join(&self, chat_id: i64, from: &BotUser, index: usize) -> Result<()> {
        let Some(space) = index
            .checked_sub(1)
            .and_then(|i| self.engine.spaces().get(i))
        else {
            return self
                .reply(chat_id, "That space doesn't exist. Send /start to see the list.")
                .await;
        };
        match self
            .engine
            .request_admission(from.id, space.id, &from.display_name())
            .await
        {
            Ok(request) => {
                tracing::info!(request_id = %request.id, status = %request.status, "join handled");
                Ok(())
            }
            // The engine has already told the user about these.
            Err(
                AdmissionError::Blocked(_)
                | AdmissionError::DuplicateRequest(_)
                | AdmissionError::PoolExhausted
                | AdmissionError::NoDelegateAvailable
                | AdmissionError::AlreadyResolved { .. },
            ) => Ok(()),
            Err(e) => {
                tracing::error!(user_id = %from.id, space_id = %space.id, error = %e, "join request failed");
                self.reply(chat_id, "Something went wrong. Please try again later.")
                    .await
            }
        }
    }

    async fn decide(&self, id: RequestId, approved: bool, operator: UserId) -> String {
        match self.engine.decide(id, approved, operator).await {
            Ok(request) => format!("Request #{} is now {}.", request.id, request.status),
            Err(AdmissionError::AlreadyResolved { id, status }) => {
                format!("Request #{id} was already {status}.")
            }
            Err(AdmissionError::NotInReview(id)) => {
                format!("Request #{id} is still being processed; try again once it is in review.")
            }
            Err(AdmissionError::RequestNotFound(id)) => format!("Request #{id} not found."),
            Err(AdmissionError::PoolExhausted | AdmissionError::NoDelegateAvailable) => {
                format!("No delegate is available; request #{id} stays in review.")
            }
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "operator decision failed");
                format!("Decision on request #{id} failed: {e}")
            }
        }
    }

    async fn send_menu(&self, chat_id: i64) -> Result<()> {
        let spaces = self.engine.spaces();
        let mut text = String::from("Choose a space to join:");
        let mut buttons = Vec::with_capacity(spaces.len());
        for (i, space) in spaces.iter().enumerate() {
            let index = i + 1;
            text.push_str(&format!("\n{index}. {}", space.name));
            if !space.description.is_empty() {
                text.push_str(&format!(" - {}", space.description));
            }
            buttons.push(vec![InlineButton::new(
                space.name.clone(),
                CallbackAction::Join(index).encode(),
            )]);
        }
        self.sender.send(chat_id, &text, &buttons).await
    }

    async fn send_pending(&self, chat_id: i64) -> Result<()> {
        let pending = match self.engine.pending_reviews().await {
            Ok(pending) => pending,
            Err(e) => return self.reply(chat_id, &format!("Could not list requests: {e}")).await,
        };
        if pending.is_empty() {
            return self.reply(chat_id, "No requests are waiting for review.").await;
        }
        if pending.len() > PENDING_LIST_LIMIT {
            self.reply(
                chat_id,
                &format!(
                    "{} requests are waiting; showing the oldest {PENDING_LIST_LIMIT}.",
                    pending.len()
                ),
            )
            .await?;
        }
        for request in pending.into_iter().take(PENDING_LIST_LIMIT) {
            let notice = self.review_notice(request);
            self.sender
                .send(chat_id, &notice.render(), &review_buttons(&notice))
                .await?;
        }
        Ok(())
    }

    fn review_notice(&self, request: JoinRequest) -> OperatorNotice {
        let space_name = self
            .engine
            .spaces()
            .iter()
            .find(|space| space.id == request.space_id)
            .map(|space| space.name.clone())
            .unwrap_or_else(|| format!("space {}", request.space_id));
        OperatorNotice::StuckRequest {
            request,
            space_name,
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) -> Result<()> {
        self.sender.send(chat_id, text, &[]).await
    }

    async fn answer(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.sender.answer_callback(callback_id, text).await
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatekeepConfig;
    use crate::notifier::TelegramNotifier;
    use crate::notifier::testing::RecordingSender;
    use crate::server;
    use gate_core::{RequestStatus, Store};
    use gate_platform::HttpBridgeConnector;

    const OPERATOR: i64 = 42;
    const USER: i64 = 1001;

    const CONFIG: &str = r#"
[bot]
token = "123:abc"
operator_ids = [42]

[bridge]
base_url = "http://127.0.0.1:9"

[vault]
encryption_key = "0123456789abcdef0123"

[[spaces]]
id = -100
name = "Rust Club"
description = "systems chat"

[[spaces]]
id = -200
name = "Night Owls"

[admission]
auto_admit = false
"#;

    fn gateway() -> (Arc<Gateway>, Arc<RecordingSender>) {
        let cfg = GatekeepConfig::parse(CONFIG).expect("parse");
        cfg.validate().expect("valid");
        let sender = Arc::new(RecordingSender::default());
        let notifier = Arc::new(TelegramNotifier::new(sender.clone(), cfg.operator_ids()));
        let connector =
            Arc::new(HttpBridgeConnector::new(&cfg.bridge.base_url).expect("connector"));
        let store = Store::open_in_memory().expect("store");
        let engine = server::build_engine(&cfg, store, connector, notifier).expect("engine");
        let (_tx, rx) = mpsc::channel(1);
        let gateway = Arc::new(Gateway::new(engine, sender.clone(), cfg.operator_ids(), rx));
        (gateway, sender)
    }

    fn user(id: i64) -> BotUser {
        BotUser {
            id: UserId::new(id),
            username: None,
            first_name: "Ada".to_string(),
            last_name: None,
        }
    }

    fn message(from: i64, text: &str) -> BotUpdate {
        BotUpdate::Message {
            update_id: 1,
            chat_id: from,
            is_private: true,
            from: user(from),
            text: text.to_string(),
        }
    }

    fn callback(from: i64, data: &str) -> BotUpdate {
        BotUpdate::Callback {
            update_id: 2,
            callback_id: "cb-1".to_string(),
            chat_id: Some(from),
            from: user(from),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn start_lists_spaces_with_join_buttons() {
        let (gateway, sender) = gateway();
        gateway.handle_update(message(USER, "/start")).await.expect("handle");

        let sent = sender.sent_to(USER);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("1. Rust Club - systems chat"));
        assert_eq!(sent[0].buttons.len(), 2);
        assert_eq!(sent[0].buttons[1][0].callback_data, "join:2");
    }

    #[tokio::test]
    async fn join_goes_to_review_and_operator_button_rejects() {
        let (gateway, sender) = gateway();
        gateway
            .handle_update(callback(USER, "join:1"))
            .await
            .expect("join");

        assert!(sender.sent_to(USER)[0].text.contains("sent to the administrators"));
        let review = sender.sent_to(OPERATOR);
        assert_eq!(review.len(), 1);
        let reject_data = review[0].buttons[0][1].callback_data.clone();

        gateway
            .handle_update(callback(OPERATOR, &reject_data))
            .await
            .expect("reject");
        assert!(sender
            .sent_to(OPERATOR)
            .iter()
            .any(|sent| sent.text.contains("is now rejected")));
        assert!(sender
            .sent_to(USER)
            .iter()
            .any(|sent| sent.text.contains("could not be completed")));

        // A second tap on the same button is a no-op for the user.
        let user_messages = sender.sent_to(USER).len();
        gateway
            .handle_update(callback(OPERATOR, &reject_data))
            .await
            .expect("duplicate");
        assert_eq!(sender.sent_to(USER).len(), user_messages);
        assert!(sender
            .sent_to(OPERATOR)
            .iter()
            .any(|sent| sent.text.contains("was already rejected")));
    }

    #[tokio::test]
    async fn operator_commands_are_refused_for_users() {
        let (gateway, sender) = gateway();
        gateway
            .handle_update(message(USER, "/autoadmit on"))
            .await
            .expect("handle");
        assert!(sender.sent_to(USER)[0].text.contains("administrators"));
        assert!(!gateway.engine.auto_admit().await.expect("setting"));

        gateway
            .handle_update(callback(USER, "approve:1"))
            .await
            .expect("handle");
        assert_eq!(sender.answers().len(), 1);
    }

    #[tokio::test]
    async fn operator_toggles_auto_admit_and_lists_pending() {
        let (gateway, sender) = gateway();
        gateway
            .handle_update(message(OPERATOR, "/pending"))
            .await
            .expect("pending");
        assert!(sender.sent_to(OPERATOR)[0].text.contains("No requests"));

        gateway
            .handle_update(message(USER, "/join 2"))
            .await
            .expect("join");
        gateway
            .handle_update(message(OPERATOR, "/pending"))
            .await
            .expect("pending");
        let listed = sender.sent_to(OPERATOR);
        let last = listed.last().expect("listing");
        assert!(last.text.contains("Night Owls"));
        assert_eq!(last.buttons[0].len(), 2);

        gateway
            .handle_update(message(OPERATOR, "/autoadmit on"))
            .await
            .expect("toggle");
        assert!(gateway.engine.auto_admit().await.expect("setting"));
    }

    #[tokio::test]
    async fn group_messages_are_ignored() {
        let (gateway, sender) = gateway();
        gateway
            .handle_update(BotUpdate::Message {
                update_id: 3,
                chat_id: -100,
                is_private: false,
                from: user(USER),
                text: "/start".to_string(),
            })
            .await
            .expect("handle");
        assert!(sender.sent().is_empty());
        let requests = gateway
            .engine
            .store()
            .list_requests(&[RequestStatus::Pending])
            .await
            .expect("list");
        assert!(requests.is_empty());
    }
}
