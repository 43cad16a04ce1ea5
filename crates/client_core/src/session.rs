//! Logged-in session: wires the REST collaborator, the connection and the
//! reconciler together and publishes [`ClientEvent`]s for the front end.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use shared::{
    domain::{
        AuthSession, Chat, ChatId, ConnectionState, Message, MessageId, MessageStatus, User, UserId,
    },
    protocol::ClientFrame,
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    config::ClientSettings,
    connection::{ConnectionManager, Subscription},
    error::{ClientError, ClientResult},
    normalize::InboundEvent,
    reconciler::{InboundOutcome, StateReconciler},
    search::DirectorySearch,
    ClientEvent,
};

const EVENT_CAPACITY: usize = 1024;

pub struct ChatSession {
    api: Arc<dyn ChatApi>,
    auth: AuthSession,
    connection: Arc<ConnectionManager>,
    state: Mutex<StateReconciler>,
    directory: RwLock<Vec<User>>,
    search: DirectorySearch,
    events: broadcast::Sender<ClientEvent>,
    subscription: Mutex<Option<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatSession {
    pub async fn login(
        api: Arc<dyn ChatApi>,
        settings: &ClientSettings,
        username: &str,
        password: &str,
    ) -> ClientResult<Arc<Self>> {
        let auth = api.login(username.trim(), password).await?;
        Self::start(api, settings, auth).await
    }

    pub async fn register(
        api: Arc<dyn ChatApi>,
        settings: &ClientSettings,
        full_name: &str,
        username: &str,
        password: &str,
    ) -> ClientResult<Arc<Self>> {
        let auth = api
            .register(full_name.trim(), username.trim(), password)
            .await?;
        Self::start(api, settings, auth).await
    }

    /// Subscribes to the connection, opens it, and loads the chat list and
    /// directory. If the initial load fails the session is torn down again.
    pub async fn start(
        api: Arc<dyn ChatApi>,
        settings: &ClientSettings,
        auth: AuthSession,
    ) -> ClientResult<Arc<Self>> {
        let connection = ConnectionManager::new(&settings.ws_url, settings.reconnect)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let search = DirectorySearch::new(
            Arc::clone(&api),
            auth.token.clone(),
            auth.user.id.clone(),
            settings.search_debounce,
            events.clone(),
        );
        let session = Arc::new(Self {
            api,
            state: Mutex::new(StateReconciler::new(auth.user.id.clone())),
            auth,
            connection,
            directory: RwLock::new(Vec::new()),
            search,
            events,
            subscription: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let subscription = session.connection.subscribe(move |event| {
            let _ = inbound_tx.send(event.clone());
        });
        *session.subscription.lock().await = Some(subscription);

        let pump = tokio::spawn(Self::pump(Arc::downgrade(&session), inbound_rx));
        let watcher = tokio::spawn(Self::watch_connection(
            Arc::downgrade(&session),
            session.connection.watch_state(),
        ));
        let connection = Arc::clone(&session.connection);
        let token = session.auth.token.clone();
        let connector = tokio::spawn(async move {
            if connection.connect(&token).await {
                debug!("session: transport open");
            }
        });
        session
            .tasks
            .lock()
            .await
            .extend([pump, watcher, connector]);

        if let Err(err) = session.refresh().await {
            warn!(%err, "session: initial load failed");
            session.logout().await;
            return Err(err);
        }
        info!(user_id = %session.auth.user.id, "session: started");
        Ok(session)
    }

    pub fn local_user(&self) -> &User {
        &self.auth.user
    }

    pub fn token(&self) -> &str {
        &self.auth.token
    }

    pub fn search(&self) -> &DirectorySearch {
        &self.search
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Waits up to `timeout` for the transport to reach CONNECTED. Sends made
    /// before that are dropped, so callers that send right after `start`
    /// should wait here first.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.connection.watch_state();
        let connected = tokio::time::timeout(
            timeout,
            state.wait_for(|current| *current == ConnectionState::Connected),
        )
        .await;
        matches!(connected, Ok(Ok(_)))
    }

    pub async fn chats(&self) -> Vec<Chat> {
        self.state.lock().await.chats().to_vec()
    }

    pub async fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        self.state.lock().await.messages(chat_id).to_vec()
    }

    pub async fn active_chat(&self) -> Option<ChatId> {
        self.state.lock().await.active_chat().cloned()
    }

    pub async fn directory(&self) -> Vec<User> {
        self.directory.read().await.clone()
    }

    /// Reloads the chat list and the user directory concurrently.
    pub async fn refresh(&self) -> ClientResult<()> {
        let token = self.auth.token.as_str();
        let (chats, users) =
            tokio::try_join!(self.api.fetch_chats(token), self.api.fetch_users(token))?;
        debug!(chats = chats.len(), users = users.len(), "session: refreshed");

        self.state.lock().await.replace_chats(chats);
        *self.directory.write().await = users;
        self.emit(ClientEvent::ChatsUpdated);
        self.emit(ClientEvent::DirectoryUpdated);
        Ok(())
    }

    /// Focuses a chat, zeroes its unread count, then merges its history.
    pub async fn select_chat(&self, chat_id: &ChatId) -> ClientResult<()> {
        self.state.lock().await.select_chat(chat_id);
        self.emit(ClientEvent::ChatsUpdated);

        let history = self.api.fetch_messages(&self.auth.token, chat_id).await?;
        self.state.lock().await.merge_history(chat_id, history);
        self.emit(ClientEvent::MessagesUpdated {
            chat_id: chat_id.clone(),
        });
        Ok(())
    }

    /// Appends an optimistic entry and sends the frame. A frame the transport
    /// drops leaves the entry pending; nothing retries it. Repeating a send
    /// still awaiting its echo reuses that entry and sends its frame again.
    pub async fn send_message(&self, chat_id: &ChatId, text: &str) -> ClientResult<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::Validation("message text is empty".into()));
        }
        if chat_id.is_empty() {
            return Err(ClientError::Validation("no chat selected".into()));
        }

        let pending = self
            .state
            .lock()
            .await
            .apply_optimistic_send(chat_id, &self.auth.user.id, text);
        self.emit(ClientEvent::MessagesUpdated {
            chat_id: chat_id.clone(),
        });

        let frame = ClientFrame::message(
            chat_id.clone(),
            text,
            pending.timestamp,
            Some(pending.id.clone()),
        );
        if !self.connection.send(&frame).await {
            warn!(%chat_id, temp_id = %pending.id, "session: message left pending, transport not connected");
        }
        Ok(pending)
    }

    pub async fn send_typing(&self, chat_id: &ChatId) -> bool {
        self.connection
            .send(&ClientFrame::typing(chat_id.clone()))
            .await
    }

    /// Selects the private chat with `user_id`, creating it first if needed.
    pub async fn open_private_chat(&self, user_id: &UserId) -> ClientResult<ChatId> {
        let existing = self
            .state
            .lock()
            .await
            .find_private_chat_with(user_id)
            .map(|chat| chat.id.clone());

        let chat_id = match existing {
            Some(chat_id) => chat_id,
            None => {
                let chat_id = self
                    .api
                    .create_private_chat(&self.auth.token, user_id)
                    .await?;
                self.refresh().await?;
                chat_id
            }
        };
        self.search.clear().await;
        self.select_chat(&chat_id).await?;
        Ok(chat_id)
    }

    pub async fn update_search(&self, query: &str) {
        self.search.update_query(query).await;
    }

    /// Disconnects, stops background work and discards all session state.
    pub async fn logout(&self) {
        self.connection.disconnect().await;
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.unsubscribe();
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.state.lock().await.clear();
        self.directory.write().await.clear();
        self.search.reset().await;
        info!(user_id = %self.auth.user.id, "session: logged out");
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn pump(session: Weak<Self>, mut inbound: mpsc::UnboundedReceiver<InboundEvent>) {
        while let Some(event) = inbound.recv().await {
            let Some(session) = session.upgrade() else {
                return;
            };
            session.apply_event(event).await;
        }
    }

    async fn watch_connection(
        session: Weak<Self>,
        mut state: watch::Receiver<ConnectionState>,
    ) {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            let Some(session) = session.upgrade() else {
                return;
            };
            session.emit(ClientEvent::ConnectionStateChanged(current));
        }
    }

    pub(crate) async fn apply_event(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => {
                let chat_id = message.chat_id.clone();
                let outcome = self.state.lock().await.apply_inbound_message(message);
                match outcome {
                    InboundOutcome::Applied => {
                        self.emit(ClientEvent::MessagesUpdated { chat_id });
                        self.emit(ClientEvent::ChatsUpdated);
                    }
                    InboundOutcome::UnknownChat => {
                        info!(%chat_id, "session: message for unknown chat, refreshing");
                        self.emit(ClientEvent::MessagesUpdated { chat_id });
                        self.spawn_refresh().await;
                    }
                    InboundOutcome::Duplicate | InboundOutcome::Rejected => {}
                }
            }
            InboundEvent::Delivered {
                chat_id,
                message_id,
            } => self.apply_receipt(chat_id, &message_id, MessageStatus::Delivered).await,
            InboundEvent::ReadReceipt {
                chat_id,
                message_id,
            } => self.apply_receipt(chat_id, &message_id, MessageStatus::Read).await,
            InboundEvent::UserStatus { user_id, is_online } => {
                let mut directory_changed = false;
                for user in self
                    .directory
                    .write()
                    .await
                    .iter_mut()
                    .filter(|user| user.id == user_id)
                {
                    directory_changed |= user.is_online != is_online;
                    user.is_online = is_online;
                }
                let chats_changed = self.state.lock().await.set_user_online(&user_id, is_online);
                if directory_changed {
                    self.emit(ClientEvent::DirectoryUpdated);
                }
                if chats_changed {
                    self.emit(ClientEvent::ChatsUpdated);
                }
            }
            InboundEvent::Typing { chat_id, user_id } => {
                if user_id.as_ref() != Some(&self.auth.user.id) {
                    self.emit(ClientEvent::Typing { chat_id, user_id });
                }
            }
            InboundEvent::Authenticated { user_id, username } => {
                info!(?user_id, ?username, "session: server acknowledged auth");
                self.emit(ClientEvent::Authenticated { user_id, username });
            }
            InboundEvent::ServerError { message } => {
                warn!(%message, "session: server reported an error");
                self.emit(ClientEvent::ServerError(message));
            }
            InboundEvent::Ignored => {}
        }
    }

    async fn apply_receipt(&self, chat_id: ChatId, message_id: &MessageId, status: MessageStatus) {
        let changed = self
            .state
            .lock()
            .await
            .apply_status(&chat_id, message_id, status);
        if changed {
            self.emit(ClientEvent::MessagesUpdated { chat_id });
            self.emit(ClientEvent::ChatsUpdated);
        }
    }

    async fn spawn_refresh(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let Some(session) = session.upgrade() else {
                return;
            };
            if let Err(err) = session.refresh().await {
                warn!(%err, "session: refresh after unknown chat failed");
                session.emit(ClientEvent::Error(err.to_string()));
            }
        });
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.unsubscribe();
        }
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if self.connection.try_disconnect() {
            return;
        }
        let connection = Arc::clone(&self.connection);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { connection.disconnect().await });
            }
            Err(_) => warn!("session: dropped outside a runtime with the link busy"),
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
