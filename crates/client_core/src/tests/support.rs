use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::{
    domain::{
        AuthSession, Chat, ChatId, ChatKind, Message, MessageId, MessageKind, MessageStatus, User,
        UserId,
    },
    error::ApiError,
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, Mutex},
};

use crate::{api::ChatApi, error::ClientResult, ClientEvent};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn user(id: &str) -> User {
    User {
        id: UserId::from(id),
        name: id.to_uppercase(),
        username: id.to_lowercase(),
        avatar_url: None,
        is_online: false,
        last_seen: None,
    }
}

pub fn chat(id: &str, participants: &[&str]) -> Chat {
    Chat {
        id: ChatId::from(id),
        kind: ChatKind::Private,
        name: format!("chat {id}"),
        avatar_url: None,
        participants: participants.iter().map(|p| user(p)).collect(),
        last_message: None,
        unread_count: 0,
    }
}

pub fn message(id: &str, chat_id: &str, sender: &str, text: &str, timestamp: i64) -> Message {
    Message {
        id: MessageId::from(id),
        chat_id: ChatId::from(chat_id),
        sender_id: UserId::from(sender),
        text: text.to_string(),
        timestamp,
        status: MessageStatus::Sent,
        kind: MessageKind::Text,
        client_message_id: None,
    }
}

/// In-memory REST collaborator.
pub struct FakeApi {
    pub local_user: User,
    pub chats: Mutex<Vec<Chat>>,
    pub users: Mutex<Vec<User>>,
    pub history: Mutex<HashMap<ChatId, Vec<Message>>>,
    pub search_delays: Mutex<HashMap<String, Duration>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_chats: AtomicBool,
    pub fail_history: AtomicBool,
}

impl FakeApi {
    pub fn new(local_user: &str) -> Self {
        Self {
            local_user: user(local_user),
            chats: Mutex::new(Vec::new()),
            users: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            search_delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_chats: AtomicBool::new(false),
            fail_history: AtomicBool::new(false),
        }
    }

    pub fn auth(&self) -> AuthSession {
        AuthSession {
            user: self.local_user.clone(),
            token: "token-1".to_string(),
        }
    }

    pub async fn calls_to(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn login(&self, username: &str, _password: &str) -> ClientResult<AuthSession> {
        self.record(format!("login:{username}")).await;
        Ok(self.auth())
    }

    async fn register(
        &self,
        _full_name: &str,
        username: &str,
        _password: &str,
    ) -> ClientResult<AuthSession> {
        self.record(format!("register:{username}")).await;
        Ok(self.auth())
    }

    async fn fetch_chats(&self, _token: &str) -> ClientResult<Vec<Chat>> {
        self.record("chats".to_string()).await;
        if self.fail_chats.load(Ordering::SeqCst) {
            return Err(ApiError::from_response(500, None).into());
        }
        Ok(self.chats.lock().await.clone())
    }

    async fn fetch_messages(&self, _token: &str, chat_id: &ChatId) -> ClientResult<Vec<Message>> {
        self.record(format!("history:{chat_id}")).await;
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(ApiError::from_response(503, Some("history unavailable".into())).into());
        }
        Ok(self
            .history
            .lock()
            .await
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn search_users(&self, _token: &str, query: &str) -> ClientResult<Vec<User>> {
        self.record(format!("search:{query}")).await;
        let delay = self.search_delays.lock().await.get(query).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let needle = query.to_lowercase();
        Ok(self
            .users
            .lock()
            .await
            .iter()
            .filter(|u| u.username.contains(&needle) || u.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn create_private_chat(&self, _token: &str, user_id: &UserId) -> ClientResult<ChatId> {
        self.record(format!("create:{user_id}")).await;
        let chat_id = format!("c-{user_id}");
        self.chats
            .lock()
            .await
            .push(chat(&chat_id, &[self.local_user.id.as_str(), user_id.as_str()]));
        Ok(ChatId::from(chat_id))
    }
}

#[derive(Clone)]
struct WsState {
    received: mpsc::UnboundedSender<String>,
    outgoing: broadcast::Sender<String>,
    connections: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
    close_after_first_frame: bool,
}

/// Chat websocket endpoint served by axum on an ephemeral port.
pub struct MockWs {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
    pub tokens: Arc<Mutex<Vec<String>>>,
    received: mpsc::UnboundedReceiver<String>,
    outgoing: broadcast::Sender<String>,
}

impl MockWs {
    pub async fn next_frame(&mut self) -> Value {
        let text = tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("frame before timeout")
            .expect("server running");
        serde_json::from_str(&text).expect("client frames are json")
    }

    pub fn push(&self, frame: Value) {
        self.outgoing
            .send(frame.to_string())
            .expect("a connected socket");
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn ws_route(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    state.connections.fetch_add(1, Ordering::SeqCst);
    if let Some(token) = query.get("token") {
        state.tokens.lock().await.push(token.clone());
    }
    ws.on_upgrade(move |socket| serve_socket(state, socket))
}

async fn serve_socket(state: WsState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut outgoing = state.outgoing.subscribe();

    if state.close_after_first_frame {
        if let Some(Ok(AxumWsMessage::Text(text))) = receiver.next().await {
            let _ = state.received.send(text);
        }
        let _ = sender.send(AxumWsMessage::Close(None)).await;
        return;
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(AxumWsMessage::Text(text))) => {
                    let _ = state.received.send(text);
                }
                Some(Ok(AxumWsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            frame = outgoing.recv() => match frame {
                Ok(text) => {
                    if sender.send(AxumWsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}

pub async fn spawn_ws_server(close_after_first_frame: bool) -> Result<MockWs> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (received_tx, received_rx) = mpsc::unbounded_channel();
    let (outgoing, _) = broadcast::channel(64);
    let connections = Arc::new(AtomicUsize::new(0));
    let tokens = Arc::new(Mutex::new(Vec::new()));
    let state = WsState {
        received: received_tx,
        outgoing: outgoing.clone(),
        connections: Arc::clone(&connections),
        tokens: Arc::clone(&tokens),
        close_after_first_frame,
    };
    let app = Router::new()
        .route("/ws/chat", get(ws_route))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(MockWs {
        url: format!("ws://{addr}/ws/chat"),
        connections,
        tokens,
        received: received_rx,
        outgoing,
    })
}

/// Waits for the first event matching `matches`, skipping the rest.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut matches: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event before timeout")
}
