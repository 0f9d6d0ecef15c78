//! Connection handle and dispatcher.
//!
//! A [`Connection`] is the client-facing surface of one live session. Two
//! background tasks do the work: a reader task that owns the transport's
//! receive path (the single reader), and a dispatcher task that owns the
//! sink, the pending-request map, the capability snapshot and the state
//! watch. Callers talk to the dispatcher over a command channel; each
//! waits only on its own completion slot, so concurrent calls never block
//! each other and responses match by id, not arrival order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, Message};
use crate::correlator::{Outcome, PendingRequests};
use crate::error::{ClientError, NegotiationError, Result, ToolError};
use crate::protocol::{
    CallToolParams, CallToolResult, CancelledParams, InitializeParams, InitializeResult,
    ListToolsResult, Notification, Request, RequestId, Response, RpcError, ToolDescriptor,
};
use crate::session::{check_protocol_version, CapabilitySet, SessionState};
use crate::transport::{FrameSink, FrameSource, StdioTransport, Transport};
use crate::validate::validate_args;

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a spawned tool server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique server name, used in logs.
    pub name: String,
    /// Command to execute.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Environment variables for the child process.
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    pub working_dir: Option<PathBuf>,
    /// Per-request deadline.
    pub request_timeout: Duration,
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add a single argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Options for establishing a connection over an existing transport.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Name used in logs.
    pub name: String,
    /// Per-request deadline.
    pub request_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            name: "server".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ConnectOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Commands funneled into the dispatcher. All mutation of dispatcher-owned
/// state goes through here.
enum Command {
    Call {
        id: RequestId,
        method: String,
        params: Option<Value>,
        reply: oneshot::Sender<Outcome>,
    },
    Notify {
        method: String,
        params: Option<Value>,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        id: RequestId,
        reason: &'static str,
    },
    Snapshot {
        reply: oneshot::Sender<Option<Arc<CapabilitySet>>>,
    },
    ReplaceTools {
        tools: Vec<ToolDescriptor>,
        reply: oneshot::Sender<Option<Arc<CapabilitySet>>>,
    },
    HandshakeDone {
        capabilities: CapabilitySet,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A connection to a single tool server.
#[derive(Debug)]
pub struct Connection {
    name: String,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    next_id: AtomicU64,
    request_timeout: Duration,
    notifications: Mutex<Option<mpsc::Receiver<Notification>>>,
}

impl Connection {
    /// Spawn a tool server process and establish a session over its
    /// stdin/stdout. Returns only once the handshake has completed and the
    /// session is `Ready`.
    pub async fn spawn(config: ServerConfig) -> Result<Self> {
        let transport = StdioTransport::spawn(
            &config.command,
            &config.args,
            &config.env,
            config.working_dir.as_ref(),
        )
        .await?;

        info!(
            server = %config.name,
            command = %config.command,
            "connected to tool server via stdio"
        );

        let options = ConnectOptions::new(config.name).with_request_timeout(config.request_timeout);
        Self::establish(transport, options).await
    }

    /// Establish a session over an already-open transport.
    pub async fn establish(transport: impl Transport + 'static, options: ConnectOptions) -> Result<Self> {
        let (sink, source) = (Box::new(transport) as Box<dyn Transport>).split();

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (notif_tx, notif_rx) = mpsc::channel(64);

        let reader = spawn_reader(source, frame_tx);
        let _ = state_tx.send(SessionState::Handshaking);

        let dispatcher = Dispatcher {
            server: options.name.clone(),
            sink,
            pending: PendingRequests::new(),
            capabilities: None,
            state: state_tx,
            commands: command_rx,
            frames: frame_rx,
            notifications: notif_tx,
            reader,
        };
        tokio::spawn(dispatcher.run());

        let connection = Self {
            name: options.name,
            commands: command_tx,
            state: state_rx,
            next_id: AtomicU64::new(1),
            request_timeout: options.request_timeout,
            notifications: Mutex::new(Some(notif_rx)),
        };

        match connection.handshake().await {
            Ok(()) => Ok(connection),
            Err(err) => {
                let _ = connection.close().await;
                Err(err)
            }
        }
    }

    /// Server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Take the receiver for server-initiated notifications. Yields `None`
    /// after the first call.
    pub fn notifications(&self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications.lock().ok().and_then(|mut slot| slot.take())
    }

    /// The negotiated capability snapshot. Valid only in `Ready`.
    pub async fn capabilities(&self) -> Result<Arc<CapabilitySet>> {
        self.ensure_ready()?;
        self.snapshot().await
    }

    /// List the tools available on this connection. Valid only in `Ready`;
    /// answers from the negotiated snapshot without a wire round-trip.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.capabilities().await?.tools.to_vec())
    }

    /// Re-fetch the tool list from the server and atomically replace the
    /// capability snapshot with it.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.ensure_ready()?;

        let value = self.request("tools/list", None).await?;
        let listed: ListToolsResult = serde_json::from_value(value)?;

        debug!(
            server = %self.name,
            tool_count = listed.tools.len(),
            "refreshed tool list"
        );

        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ReplaceTools {
                tools: listed.tools.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?;

        Ok(listed.tools)
    }

    /// Call a tool by name with the default deadline.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        self.call_tool_with_timeout(name, arguments, self.request_timeout)
            .await
    }

    /// Call a tool by name.
    ///
    /// Arguments are checked against the tool's declared schema before
    /// anything goes over the wire; a mismatch fails fast with a
    /// validation error. Remote failures come back as [`ToolError`],
    /// distinct from transport and protocol errors.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        self.ensure_ready()?;

        let capabilities = self.snapshot().await?;
        let tool = capabilities
            .tool(name)
            .ok_or_else(|| ClientError::ToolNotFound(name.to_string()))?;

        let args_to_check = arguments
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));
        validate_args(&tool.input_schema, &args_to_check)?;

        debug!(server = %self.name, tool = name, "calling tool");

        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;

        let value = self
            .request_with_timeout("tools/call", Some(params), timeout)
            .await
            .map_err(|err| match err {
                ClientError::Server { code, message, data } => ClientError::Tool(ToolError {
                    code: Some(code),
                    message,
                    data,
                }),
                other => other,
            })?;

        let result: CallToolResult = serde_json::from_value(value)?;
        if result.is_error {
            warn!(server = %self.name, tool = name, "tool call returned error");
            return Err(ClientError::Tool(ToolError {
                code: None,
                message: result.text(),
                data: None,
            }));
        }

        debug!(server = %self.name, tool = name, "tool call succeeded");
        Ok(result)
    }

    /// Send a one-way notification to the server.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Notify {
                method: method.to_string(),
                params,
                reply: tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Number of requests currently awaiting responses.
    pub async fn pending_requests(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::PendingCount { reply: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Close the connection. Every pending call fails with
    /// `ConnectionClosed` immediately rather than being left to time out,
    /// and the spawned server (if any) is terminated and reaped.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close { reply: tx })
            .await
            .is_err()
        {
            return Ok(()); // already closed
        }
        rx.await.unwrap_or(Ok(()))
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Closing | SessionState::Closed => Err(ClientError::ConnectionClosed),
            other => Err(ClientError::InvalidState {
                expected: "ready",
                actual: other,
            }),
        }
    }

    /// Perform the initialize exchange, acknowledge it, and fetch the
    /// initial tool list. Only after this does the session enter `Ready`.
    async fn handshake(&self) -> Result<()> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let value = self
            .request("initialize", Some(params))
            .await
            .map_err(|err| match err {
                ClientError::Server { code, message, .. } => {
                    ClientError::Negotiation(NegotiationError::Rejected { code, message })
                }
                other => other,
            })?;

        let init: InitializeResult = serde_json::from_value(value).map_err(|e| {
            ClientError::Negotiation(NegotiationError::MalformedResponse(e.to_string()))
        })?;

        check_protocol_version(&init.protocol_version)?;

        self.notify("notifications/initialized", None).await?;

        let value = self.request("tools/list", None).await?;
        let listed: ListToolsResult = serde_json::from_value(value).map_err(|e| {
            ClientError::Negotiation(NegotiationError::MalformedResponse(e.to_string()))
        })?;

        info!(
            server = %self.name,
            server_name = %init.server_info.name,
            protocol = %init.protocol_version,
            tool_count = listed.tools.len(),
            "session ready"
        );

        self.commands
            .send(Command::HandshakeDone {
                capabilities: CapabilitySet::new(init, listed.tools),
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        Ok(())
    }

    async fn snapshot(&self) -> Result<Arc<CapabilitySet>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply: tx })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        rx.await
            .map_err(|_| ClientError::ConnectionClosed)?
            .ok_or(ClientError::ConnectionClosed)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Issue a request and wait for its correlated response. On timeout
    /// the pending entry is removed and a cancellation notification goes
    /// out, so a late response is discarded rather than leaked.
    async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst) as i64);
        let (tx, rx) = oneshot::channel();

        self.commands
            .send(Command::Call {
                id: id.clone(),
                method: method.to_string(),
                params,
                reply: tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Dispatcher dropped the slot without completing it.
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                let _ = self
                    .commands
                    .send(Command::Cancel {
                        id,
                        reason: "deadline exceeded",
                    })
                    .await;
                Err(ClientError::Timeout(timeout))
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.commands.try_send(Command::Close { reply: tx });
    }
}

/// Spawn the single reader of the transport's receive path. Decoded
/// frames flow to the dispatcher; a decode failure or transport error is
/// fatal, so the task forwards it and stops.
fn spawn_reader(
    mut source: Box<dyn FrameSource>,
    frames: mpsc::Sender<std::result::Result<Message, ClientError>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.receive().await {
                Ok(Some(raw)) => {
                    let decoded = codec::decode(&raw).map_err(ClientError::from);
                    let fatal = decoded.is_err();
                    if frames.send(decoded).await.is_err() || fatal {
                        break;
                    }
                }
                Ok(None) => break, // EOF; the dropped channel tells the dispatcher
                Err(err) => {
                    let _ = frames.send(Err(err.into())).await;
                    break;
                }
            }
        }
    })
}

/// Owns the sink, the pending map, the capability snapshot and the state
/// watch. The only place any of them is touched.
struct Dispatcher {
    server: String,
    sink: Box<dyn FrameSink>,
    pending: PendingRequests,
    capabilities: Option<Arc<CapabilitySet>>,
    state: watch::Sender<SessionState>,
    commands: mpsc::Receiver<Command>,
    frames: mpsc::Receiver<std::result::Result<Message, ClientError>>,
    notifications: mpsc::Sender<Notification>,
    reader: JoinHandle<()>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        let result = self.shutdown().await;
                        let _ = reply.send(result);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Every handle is gone; tear down quietly.
                        let _ = self.shutdown().await;
                        break;
                    }
                },
                frame = self.frames.recv() => match frame {
                    Some(Ok(message)) => self.handle_message(message).await,
                    Some(Err(err)) => {
                        warn!(server = %self.server, error = %err, "fatal error on receive path");
                        let _ = self.shutdown().await;
                        break;
                    }
                    None => {
                        info!(server = %self.server, "transport reached EOF");
                        let _ = self.shutdown().await;
                        break;
                    }
                },
            }
        }
        self.reader.abort();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call {
                id,
                method,
                params,
                reply,
            } => {
                let request = Request::new(id.clone(), method.clone(), params);
                match codec::encode(&Message::Request(request)) {
                    Ok(frame) => match self.sink.send(&frame).await {
                        Ok(()) => self.pending.register(id, &method, reply),
                        Err(err) => {
                            let _ = reply.send(Err(err.into()));
                        }
                    },
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                    }
                }
            }
            Command::Notify {
                method,
                params,
                reply,
            } => {
                let notification = Notification::new(method, params);
                let result = match codec::encode(&Message::Notification(notification)) {
                    Ok(frame) => self.sink.send(&frame).await.map_err(ClientError::from),
                    Err(err) => Err(err.into()),
                };
                let _ = reply.send(result);
            }
            Command::Cancel { id, reason } => {
                if self.pending.cancel(&id) {
                    self.send_cancelled(id, reason).await;
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.capabilities.clone());
            }
            Command::ReplaceTools { tools, reply } => {
                let next = self
                    .capabilities
                    .as_ref()
                    .map(|caps| Arc::new(caps.with_tools(tools)));
                self.capabilities.clone_from(&next);
                let _ = reply.send(next);
            }
            Command::HandshakeDone { capabilities } => {
                self.capabilities = Some(Arc::new(capabilities));
                let _ = self.state.send(SessionState::Ready);
            }
            Command::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
            // Close is handled in the run loop so it can break out.
            Command::Close { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Response(response) => {
                let Response {
                    id, result, error, ..
                } = response;
                let outcome = match (result, error) {
                    (Some(value), None) => Ok(value),
                    (None, Some(err)) => Err(ClientError::server(err.code, err.message, err.data)),
                    // "result": null decodes with neither side populated.
                    (result, _) => Ok(result.unwrap_or(Value::Null)),
                };
                self.pending.complete(&id, outcome);
            }
            Message::Notification(notification) => {
                debug!(
                    server = %self.server,
                    method = %notification.method,
                    "server notification"
                );
                if self.notifications.try_send(notification).is_err() {
                    debug!(server = %self.server, "no listener, dropping notification");
                }
            }
            Message::Request(request) => {
                // This client serves nothing; answer rather than stall the peer.
                warn!(
                    server = %self.server,
                    method = %request.method,
                    "unsupported server-initiated request"
                );
                let response =
                    Response::error(request.id, RpcError::method_not_found(&request.method));
                if let Ok(frame) = codec::encode(&Message::Response(response)) {
                    let _ = self.sink.send(&frame).await;
                }
            }
        }
    }

    /// Tell the server a request was abandoned.
    async fn send_cancelled(&mut self, id: RequestId, reason: &str) {
        let params = CancelledParams {
            request_id: id,
            reason: Some(reason.to_string()),
        };
        let Ok(params) = serde_json::to_value(params) else {
            return;
        };
        let notification = Notification::new("notifications/cancelled", Some(params));
        if let Ok(frame) = codec::encode(&Message::Notification(notification)) {
            let _ = self.sink.send(&frame).await;
        }
    }

    /// Fail everything in flight, close the transport, reach `Closed`.
    async fn shutdown(&mut self) -> Result<()> {
        let _ = self.state.send(SessionState::Closing);
        self.pending.fail_all(|| ClientError::ConnectionClosed);

        let result = self.sink.close().await;
        let _ = self.state.send(SessionState::Closed);

        info!(server = %self.server, "connection closed");
        result.map_err(ClientError::from)
    }
}
