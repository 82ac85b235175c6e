//! WebSocket client of `tasklist-server`.
//!
//! [`RemoteBackend`] implements both [`SessionProvider`] and [`TaskStore`]
//! over a single WebSocket connection. Requests are correlated with their
//! responses by `request_id`; live query pushes are routed to the matching
//! [`Subscription`] by `subscription_id`. A background reader task owns the
//! read half of the socket and dispatches every incoming frame.
//!
//! The server binds the session to the connection, so signing in on one
//! `RemoteBackend` authorizes every store call made through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use tasklist_proto::task::{Identity, NewTask, TaskId, TaskPatch};
use tasklist_proto::wire::{self, ClientMessage, CodecError, FederatedProvider, Fault, ServerMessage};

use crate::session::{AuthError, SessionProvider};
use crate::store::{SnapshotSender, StoreError, Subscription, TaskStore};

type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Errors from the remote backend, before they are mapped to
/// [`StoreError`] or [`AuthError`].
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Connecting took longer than the configured timeout.
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),
    /// The server could not be reached.
    #[error("cannot connect to {url}: {reason}")]
    Connect {
        /// Server URL.
        url: String,
        /// Transport-level detail.
        reason: String,
    },
    /// No response arrived within the request timeout.
    #[error("request timed out")]
    Timeout,
    /// The connection is gone.
    #[error("connection closed")]
    ConnectionClosed,
    /// A frame could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The server refused the request.
    #[error("rejected: {0}")]
    Rejected(Fault),
    /// The server answered with a message that does not fit the request.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RemoteError {
    fn into_store(self, id: Option<&TaskId>) -> StoreError {
        match self {
            Self::Rejected(fault) => StoreError::from_fault(fault, id),
            Self::ConnectionClosed => StoreError::Closed,
            other => StoreError::Unavailable(other.to_string()),
        }
    }

    fn into_auth(self) -> AuthError {
        match self {
            Self::Rejected(fault) => AuthError::from_fault(fault),
            other => AuthError::Unavailable(other.to_string()),
        }
    }
}

/// State shared with the reader task.
struct Shared {
    /// In-flight requests awaiting their response.
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>,
    /// Open live queries by subscription id.
    routes: parking_lot::Mutex<HashMap<u64, SnapshotSender>>,
    identity: watch::Sender<Option<Identity>>,
    /// Account label from the last `SignedIn`, cleared on sign-out.
    account: parking_lot::Mutex<Option<String>>,
    connected: AtomicBool,
}

/// [`SessionProvider`] and [`TaskStore`] backed by a `tasklist-server`.
pub struct RemoteBackend {
    server_url: String,
    request_timeout: Duration,
    ws_sender: Arc<Mutex<WsSender>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl RemoteBackend {
    /// Connects to a server at `server_url` (`ws://` or `wss://`).
    ///
    /// # Errors
    ///
    /// - [`RemoteError::ConnectTimeout`] if the handshake does not finish in
    ///   `connect_timeout`.
    /// - [`RemoteError::Connect`] if the server cannot be reached.
    pub async fn connect(
        server_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let (ws_stream, _response) = tokio::time::timeout(connect_timeout, connect_async(server_url))
            .await
            .map_err(|_| {
                tracing::warn!(url = server_url, "WebSocket connect timed out");
                RemoteError::ConnectTimeout(server_url.to_string())
            })?
            .map_err(|e| {
                tracing::warn!(url = server_url, err = %e, "WebSocket connect failed");
                RemoteError::Connect {
                    url: server_url.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let ws_sender = Arc::new(Mutex::new(ws_sender));
        let (identity, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            pending: parking_lot::Mutex::new(HashMap::new()),
            routes: parking_lot::Mutex::new(HashMap::new()),
            identity,
            account: parking_lot::Mutex::new(None),
            connected: AtomicBool::new(true),
        });

        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            Arc::clone(&ws_sender),
            Arc::clone(&shared),
        ));
        tracing::info!(url = server_url, "connected to task server");

        Ok(Self {
            server_url: server_url.to_string(),
            request_timeout,
            ws_sender,
            shared,
            next_id: AtomicU64::new(1),
            reader_handle,
        })
    }

    /// The server URL this backend is connected to.
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Whether the WebSocket connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `msg` and waits for the response carrying `request_id`.
    ///
    /// A [`ServerMessage::Rejected`] response is turned into
    /// [`RemoteError::Rejected`].
    async fn request(&self, request_id: u64, msg: ClientMessage) -> Result<ServerMessage, RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id, tx);
        // The reader clears `pending` after dropping `connected`; an entry
        // inserted past that clear would otherwise wait out the full timeout.
        if !self.is_connected() {
            self.shared.pending.lock().remove(&request_id);
            return Err(RemoteError::ConnectionClosed);
        }

        if let Err(e) = send_frame(&self.ws_sender, &msg).await {
            self.shared.pending.lock().remove(&request_id);
            if matches!(e, RemoteError::ConnectionClosed) {
                self.shared.connected.store(false, Ordering::Relaxed);
            }
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(ServerMessage::Rejected { fault, .. })) => Err(RemoteError::Rejected(fault)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RemoteError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.lock().remove(&request_id);
                tracing::warn!(request_id, "request timed out");
                Err(RemoteError::Timeout)
            }
        }
    }

    /// Sends a sign-in style request and publishes the identity it yields.
    async fn authenticate(&self, request_id: u64, msg: ClientMessage) -> Result<Identity, RemoteError> {
        match self.request(request_id, msg).await? {
            ServerMessage::SignedIn {
                identity, account, ..
            } => {
                tracing::info!(identity = %identity, "signed in");
                *self.shared.account.lock() = Some(account);
                self.shared.identity.send_replace(Some(identity.clone()));
                Ok(identity)
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn acknowledge(&self, request_id: u64, msg: ClientMessage) -> Result<(), RemoteError> {
        match self.request(request_id, msg).await? {
            ServerMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

impl SessionProvider for RemoteBackend {
    fn current_identity(&self) -> Option<Identity> {
        self.shared.identity.borrow().clone()
    }

    fn current_account(&self) -> Option<String> {
        self.shared.account.lock().clone()
    }

    fn watch_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.shared.identity.subscribe()
    }

    async fn sign_in_password(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let request_id = self.next_id();
        let msg = ClientMessage::SignIn {
            request_id,
            email: email.to_string(),
            password: password.to_string(),
        };
        self.authenticate(request_id, msg).await.map_err(|e| {
            tracing::warn!(err = %e, "password sign-in failed");
            e.into_auth()
        })
    }

    async fn sign_up_password(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let request_id = self.next_id();
        let msg = ClientMessage::SignUp {
            request_id,
            email: email.to_string(),
            password: password.to_string(),
        };
        self.authenticate(request_id, msg).await.map_err(|e| {
            tracing::warn!(err = %e, "sign-up failed");
            e.into_auth()
        })
    }

    async fn sign_in_federated(
        &self,
        provider: FederatedProvider,
        subject: &str,
    ) -> Result<Identity, AuthError> {
        let request_id = self.next_id();
        let msg = ClientMessage::SignInFederated {
            request_id,
            provider,
            subject: subject.to_string(),
        };
        self.authenticate(request_id, msg).await.map_err(|e| {
            tracing::warn!(%provider, err = %e, "federated sign-in failed");
            AuthError::Federated {
                provider,
                reason: e.to_string(),
            }
        })
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let request_id = self.next_id();
        let result = self
            .request(request_id, ClientMessage::SignOut { request_id })
            .await;
        // The local session ends whatever the server said.
        *self.shared.account.lock() = None;
        if let Some(previous) = self.shared.identity.send_replace(None) {
            tracing::info!(identity = %previous, "signed out");
        }
        match result {
            Ok(ServerMessage::SignedOut { .. }) => Ok(()),
            Ok(other) => Err(unexpected(&other).into_auth()),
            Err(e) => Err(e.into_auth()),
        }
    }
}

impl TaskStore for RemoteBackend {
    async fn subscribe(&self, owner: &Identity) -> Result<Subscription, StoreError> {
        let subscription_id = self.next_id();
        let (tx, subscription) = Subscription::channel();
        {
            let mut routes = self.shared.routes.lock();
            routes.retain(|_, route| !route.is_closed());
            routes.insert(subscription_id, tx);
        }

        let request_id = self.next_id();
        let msg = ClientMessage::Subscribe {
            request_id,
            subscription_id,
            owner: owner.clone(),
        };
        match self.acknowledge(request_id, msg).await {
            Ok(()) => {
                tracing::debug!(subscription_id, owner = %owner, "live query opened");
                Ok(subscription)
            }
            Err(e) => {
                self.shared.routes.lock().remove(&subscription_id);
                tracing::warn!(owner = %owner, err = %e, "subscribe failed");
                Err(e.into_store(None))
            }
        }
    }

    async fn create(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let request_id = self.next_id();
        match self.request(request_id, ClientMessage::Create { request_id, task }).await {
            Ok(ServerMessage::Created { id, .. }) => Ok(id),
            Ok(other) => Err(unexpected(&other).into_store(None)),
            Err(e) => Err(e.into_store(None)),
        }
    }

    async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<(), StoreError> {
        let request_id = self.next_id();
        let msg = ClientMessage::Update {
            request_id,
            id: id.clone(),
            patch,
        };
        self.acknowledge(request_id, msg)
            .await
            .map_err(|e| e.into_store(Some(id)))
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        let request_id = self.next_id();
        let msg = ClientMessage::Delete {
            request_id,
            id: id.clone(),
        };
        self.acknowledge(request_id, msg)
            .await
            .map_err(|e| e.into_store(Some(id)))
    }
}

fn unexpected(msg: &ServerMessage) -> RemoteError {
    tracing::warn!(?msg, "unexpected response");
    RemoteError::UnexpectedResponse(format!("{msg:?}"))
}

async fn send_frame(ws_sender: &Mutex<WsSender>, msg: &ClientMessage) -> Result<(), RemoteError> {
    let bytes = wire::encode_client(msg)?;
    let mut sender = ws_sender.lock().await;
    sender.send(Message::Binary(bytes.into())).await.map_err(|e| {
        tracing::warn!(err = %e, "WebSocket send failed");
        RemoteError::ConnectionClosed
    })
}

/// Background task that reads server frames and dispatches them.
///
/// Responses complete their pending request; snapshots are forwarded to the
/// subscription they belong to. A snapshot whose subscription has been
/// dropped closes that query on the server. Malformed frames are logged and
/// skipped.
///
/// On exit every pending request fails and every live query ends with
/// [`StoreError::Closed`].
async fn reader_loop(mut ws_reader: WsReader, ws_sender: Arc<Mutex<WsSender>>, shared: Arc<Shared>) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => match wire::decode_server(&data) {
                Ok(msg) => dispatch(msg, &ws_sender, &shared).await,
                Err(e) => tracing::warn!(err = %e, "malformed server frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::Relaxed);
    shared.pending.lock().clear();
    for (_, route) in shared.routes.lock().drain() {
        let _ = route.send(Err(StoreError::Closed));
    }
    tracing::info!("reader task exiting");
}

async fn dispatch(msg: ServerMessage, ws_sender: &Mutex<WsSender>, shared: &Shared) {
    if let Some(request_id) = msg.request_id() {
        let waiter = shared.pending.lock().remove(&request_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(msg);
            }
            None => tracing::debug!(request_id, "response for abandoned request"),
        }
        return;
    }

    match msg {
        ServerMessage::Snapshot {
            subscription_id,
            tasks,
        } => {
            let delivered = {
                let mut routes = shared.routes.lock();
                match routes.get(&subscription_id) {
                    Some(route) if route.send(Ok(tasks)).is_ok() => true,
                    Some(_) => {
                        routes.remove(&subscription_id);
                        false
                    }
                    None => false,
                }
            };
            if !delivered {
                tracing::debug!(subscription_id, "subscription gone, closing live query");
                let unsubscribe = ClientMessage::Unsubscribe { subscription_id };
                if let Err(e) = send_frame(ws_sender, &unsubscribe).await {
                    tracing::debug!(err = %e, "unsubscribe not sent");
                }
            }
        }
        ServerMessage::Error { reason } => {
            tracing::warn!(reason = %reason, "server error");
        }
        other => tracing::debug!(?other, "unexpected server message"),
    }
}
