//! Server core: shared state, WebSocket handler, and request dispatch.
//!
//! Each WebSocket connection carries at most one signed-in identity. Requests
//! are answered in order on the connection's outbound channel, and live query
//! snapshots are pushed on the same channel, so a client always sees a
//! write's snapshot before the write's acknowledgment.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, RwLock, mpsc};

use tasklist_proto::task::Identity;
use tasklist_proto::wire::{self, ClientMessage, Fault, ServerMessage};

use crate::accounts::{Account, AccountRegistry};
use crate::config::ServerConfig;
use crate::documents::{Outbound, TaskCollection};

/// Shared server state: accounts, documents, and open connections.
pub struct ServerState {
    /// Close signal per open connection.
    connections: RwLock<HashMap<u64, Arc<Notify>>>,
    next_connection: AtomicU64,
    /// Email/password and federated accounts.
    pub accounts: AccountRegistry,
    /// Task documents and live queries.
    pub documents: TaskCollection,
    /// Frames above this size are refused.
    max_frame_size: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    /// Creates a state with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&ServerConfig::default())
    }

    /// Creates a state from a resolved [`ServerConfig`].
    #[must_use]
    pub fn with_config(config: &ServerConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            accounts: AccountRegistry::new(
                config.min_password_length,
                config.federated_providers.clone(),
            ),
            documents: TaskCollection::new(),
            max_frame_size: config.max_frame_size,
        }
    }

    async fn register(&self, close: Arc<Notify>) -> u64 {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(connection, close);
        connection
    }

    async fn unregister(&self, connection: u64) {
        self.connections.write().await.remove(&connection);
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Sends a WebSocket Close frame on every open connection.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (connection, close) in conns.iter() {
            tracing::info!(connection, "closing connection");
            close.notify_one();
        }
    }
}

/// Per-connection session.
struct Session {
    connection: u64,
    identity: Option<Identity>,
    tx: Outbound,
}

impl Session {
    fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(msg);
    }

    /// Binds `identity` to the connection. Live queries opened under another
    /// identity are closed.
    async fn bind(&mut self, identity: Identity, state: &ServerState) {
        if self.identity.as_ref().is_some_and(|current| *current != identity) {
            state.documents.drop_connection(self.connection).await;
        }
        tracing::info!(connection = self.connection, identity = %identity, "signed in");
        self.identity = Some(identity);
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Register a close signal and allocate a connection id.
/// 2. Spawn a writer task draining the outbound channel to the socket.
/// 3. Dispatch incoming frames until the client goes away.
/// 4. Drop the connection's live queries and unregister it.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let close = Arc::new(Notify::new());
    let connection = state.register(Arc::clone(&close)).await;
    tracing::info!(connection, "client connected");

    let mut write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let bytes = match wire::encode_server(&msg) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::error!(connection, error = %e, "failed to encode server message");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                        tracing::warn!(connection, "WebSocket write failed");
                        break;
                    }
                }
                () = close.notified() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        let mut session = Session {
            connection,
            identity: None,
            tx,
        };
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_frame(&mut session, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(connection, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    let dropped = state.documents.drop_connection(connection).await;
    state.unregister(connection).await;
    tracing::info!(connection, live_queries = dropped, "client disconnected");
}

/// Decodes one binary frame and answers it.
async fn handle_frame(session: &mut Session, data: &[u8], state: &ServerState) {
    if data.len() > state.max_frame_size {
        tracing::warn!(
            connection = session.connection,
            size = data.len(),
            max = state.max_frame_size,
            "frame exceeds size limit"
        );
        session.send(ServerMessage::Error {
            reason: format!(
                "frame too large: {} bytes (max {})",
                data.len(),
                state.max_frame_size
            ),
        });
        return;
    }

    let msg = match wire::decode_client(data) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(connection = session.connection, error = %e, "failed to decode frame");
            session.send(ServerMessage::Error {
                reason: format!("malformed frame: {e}"),
            });
            return;
        }
    };

    if let Some(reply) = dispatch(session, msg, state).await {
        session.send(reply);
    }
}

const fn rejected(request_id: u64, fault: Fault) -> ServerMessage {
    ServerMessage::Rejected { request_id, fault }
}

/// Binds the session to `account` and builds the `SignedIn` reply.
async fn signed_in(
    session: &mut Session,
    request_id: u64,
    account: Account,
    state: &ServerState,
) -> ServerMessage {
    session.bind(account.identity.clone(), state).await;
    ServerMessage::SignedIn {
        request_id,
        identity: account.identity,
        account: account.label,
    }
}

/// Executes one request. Returns the response, if the request has one.
async fn dispatch(session: &mut Session, msg: ClientMessage, state: &ServerState) -> Option<ServerMessage> {
    let reply = match msg {
        ClientMessage::SignUp {
            request_id,
            email,
            password,
        } => match state.accounts.sign_up(&email, &password).await {
            Ok(account) => signed_in(session, request_id, account, state).await,
            Err(e) => {
                tracing::info!(connection = session.connection, error = %e, "sign-up refused");
                rejected(request_id, e.fault())
            }
        },
        ClientMessage::SignIn {
            request_id,
            email,
            password,
        } => match state.accounts.sign_in(&email, &password).await {
            Ok(account) => signed_in(session, request_id, account, state).await,
            Err(e) => {
                tracing::info!(connection = session.connection, error = %e, "sign-in refused");
                rejected(request_id, e.fault())
            }
        },
        ClientMessage::SignInFederated {
            request_id,
            provider,
            subject,
        } => match state.accounts.sign_in_federated(provider, &subject).await {
            Ok(account) => signed_in(session, request_id, account, state).await,
            Err(e) => {
                tracing::info!(connection = session.connection, error = %e, "federated sign-in refused");
                rejected(request_id, e.fault())
            }
        },
        ClientMessage::SignOut { request_id } => {
            let dropped = state.documents.drop_connection(session.connection).await;
            if let Some(identity) = session.identity.take() {
                tracing::info!(connection = session.connection, identity = %identity, live_queries = dropped, "signed out");
            }
            ServerMessage::SignedOut { request_id }
        }
        ClientMessage::Unsubscribe { subscription_id } => {
            state
                .documents
                .unsubscribe(session.connection, subscription_id)
                .await;
            return None;
        }
        ClientMessage::Subscribe {
            request_id,
            subscription_id,
            owner,
        } => {
            let Some(caller) = session.identity.clone() else {
                return Some(rejected(request_id, Fault::Unauthenticated));
            };
            match state
                .documents
                .subscribe(session.connection, subscription_id, &caller, &owner, session.tx.clone())
                .await
            {
                Ok(()) => ServerMessage::Ack { request_id },
                Err(e) => rejected(request_id, e.fault()),
            }
        }
        ClientMessage::Create { request_id, task } => {
            let Some(caller) = session.identity.clone() else {
                return Some(rejected(request_id, Fault::Unauthenticated));
            };
            match state.documents.create(&caller, task).await {
                Ok(id) => ServerMessage::Created { request_id, id },
                Err(e) => rejected(request_id, e.fault()),
            }
        }
        ClientMessage::Update {
            request_id,
            id,
            patch,
        } => {
            let Some(caller) = session.identity.clone() else {
                return Some(rejected(request_id, Fault::Unauthenticated));
            };
            match state.documents.update(&caller, &id, &patch).await {
                Ok(()) => ServerMessage::Ack { request_id },
                Err(e) => rejected(request_id, e.fault()),
            }
        }
        ClientMessage::Delete { request_id, id } => {
            let Some(caller) = session.identity.clone() else {
                return Some(rejected(request_id, Fault::Unauthenticated));
            };
            match state.documents.delete(&caller, &id).await {
                Ok(()) => ServerMessage::Ack { request_id },
                Err(e) => rejected(request_id, e.fault()),
            }
        }
    };
    Some(reply)
}

/// Starts the server on the given address with default state and returns the
/// bound address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::new())).await
}

/// Starts the server with a pre-configured [`ServerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
