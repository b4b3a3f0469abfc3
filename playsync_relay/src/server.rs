// TCP server and main event loop for the relay.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main thread.
// - **Reader threads** (one per connection): call `framing::read_frame()` in
//   a loop, deserialize `ClientMessage`, and send `InternalEvent::MessageFrom`
//   to the main thread. A frame that isn't a valid message is reported as
//   `Malformed` (with its `request_id` when it still has the shape of a
//   request) and reading continues; a read error or EOF ends the
//   connection with `Disconnected`.
// - **Writer threads** (one per connection): drain the connection's bounded
//   outbox onto the socket. The main thread never writes to a socket, so a
//   slow peer cannot stall the tick path.
// - **Main thread**: owns the `Registry` and every `Connection`, receives
//   events from the channel, and dispatches them through `rpc::dispatch`.
//   Lifecycle calls from the embedding process arrive on the same channel
//   as `InternalEvent::Control` and are answered over a one-shot reply
//   channel.
//
// Shutdown: the main thread checks a `keep_running` flag (set to false by
// `RelayHandle::stop`) every `POLL_INTERVAL`, then ends every live play with
// `InternalError` and closes all connections.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use playsync_protocol::error::AmflowError;
use playsync_protocol::framing::{FramingError, read_frame, write_json};
use playsync_protocol::message::{ClientMessage, RequestId};
use playsync_protocol::types::{PermissionKind, PlayEndReason, PlayId};

use crate::backend::{KvBackend, MemoryBackend};
use crate::registry::{ClientId, Registry};
use crate::rpc::{self, Connection, ConnectionHandle, Outgoing};

/// How often the main loop and the listener look at `keep_running`.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

type Reply<T> = Sender<Result<T, AmflowError>>;

/// Lifecycle requests from the embedding process.
enum Control {
    StartPlay {
        play_id: PlayId,
        reply: Reply<()>,
    },
    EndPlay {
        play_id: PlayId,
        reason: PlayEndReason,
        reply: Reply<()>,
    },
    ExtendPlay {
        play_id: PlayId,
        expires_at: i64,
        remaining_ms: u64,
        reply: Reply<()>,
    },
    CreateToken {
        play_id: PlayId,
        kind: PermissionKind,
        reply: Reply<String>,
    },
}

/// Events sent to the main thread.
enum InternalEvent {
    NewConnection {
        stream: TcpStream,
    },
    MessageFrom {
        client_id: ClientId,
        message: ClientMessage,
    },
    Malformed {
        client_id: ClientId,
        /// Set when the frame still looks like a request.
        request_id: Option<RequestId>,
        reason: String,
    },
    Disconnected {
        client_id: ClientId,
    },
    Control(Control),
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Create a play so clients can open it.
    pub fn start_play(&self, play_id: PlayId) -> Result<(), AmflowError> {
        self.request(|reply| Control::StartPlay { play_id, reply })
    }

    /// Terminate a play. Its subscribers receive `PlayEnd` and are
    /// disconnected; everything the play stored is deleted.
    pub fn end_play(&self, play_id: PlayId, reason: PlayEndReason) -> Result<(), AmflowError> {
        self.request(|reply| Control::EndPlay {
            play_id,
            reason,
            reply,
        })
    }

    /// Announce a new expiry to every subscriber of a play.
    pub fn extend_play(
        &self,
        play_id: PlayId,
        expires_at: i64,
        remaining_ms: u64,
    ) -> Result<(), AmflowError> {
        self.request(|reply| Control::ExtendPlay {
            play_id,
            expires_at,
            remaining_ms,
            reply,
        })
    }

    /// Mint an access token for a play.
    pub fn create_play_token(
        &self,
        play_id: PlayId,
        kind: PermissionKind,
    ) -> Result<String, AmflowError> {
        self.request(|reply| Control::CreateToken {
            play_id,
            kind,
            reply,
        })
    }

    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        self.join();
    }

    /// Block until the relay exits.
    pub fn wait(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Control) -> Result<T, AmflowError> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(InternalEvent::Control(make(reply)))
            .map_err(|_| not_running())?;
        rx.recv().map_err(|_| not_running())?
    }
}

fn not_running() -> AmflowError {
    AmflowError::runtime("relay is not running")
}

/// Configuration for starting a relay server.
pub struct RelayConfig {
    pub host: String,
    /// 0 lets the OS pick a free port.
    pub port: u16,
    /// Messages a connection may have queued before it is dropped as too
    /// slow.
    pub outbox_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7878,
            outbox_depth: 1024,
        }
    }
}

/// Start the relay with an in-memory backend. Returns a handle for
/// controlling it and the actual bound address.
pub fn start_relay(config: RelayConfig) -> std::io::Result<(RelayHandle, SocketAddr)> {
    start_relay_with_backend(config, Arc::new(MemoryBackend::new()))
}

/// Start the relay on a background thread, storing plays in `backend`.
pub fn start_relay_with_backend(
    config: RelayConfig,
    backend: Arc<dyn KvBackend>,
) -> std::io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    // Non-blocking so the accept thread can check keep_running periodically.
    listener.set_nonblocking(true)?;
    info!("relay listening on {addr}");

    let keep_running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel();

    spawn_listener(listener, tx.clone(), keep_running.clone());

    let state = RelayState {
        registry: Registry::new(backend),
        connections: HashMap::new(),
        next_client_id: 1,
        outbox_depth: config.outbox_depth.max(1),
    };
    let keep_running_loop = keep_running.clone();
    let tx_loop = tx.clone();
    let thread = thread::spawn(move || {
        run_relay(state, rx, tx_loop, keep_running_loop);
    });

    Ok((
        RelayHandle {
            tx,
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

fn spawn_listener(listener: TcpListener, tx: Sender<InternalEvent>, keep_running: Arc<AtomicBool>) {
    thread::spawn(move || {
        while keep_running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    if stream.set_nonblocking(false).is_err() {
                        continue;
                    }
                    if tx.send(InternalEvent::NewConnection { stream }).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    error!("accept failed, listener stopping: {e}");
                    break;
                }
            }
        }
    });
}

/// Everything the main thread owns.
struct RelayState {
    registry: Registry,
    connections: HashMap<ClientId, Connection>,
    next_client_id: ClientId,
    outbox_depth: usize,
}

/// Main relay loop. Runs until `keep_running` is set to false.
fn run_relay(
    mut state: RelayState,
    rx: Receiver<InternalEvent>,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                handle_event(&mut state, event, &tx);
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut state, event, &tx);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("relay shutting down");
    state.registry.destroy();
    for conn in state.connections.values() {
        conn.close();
    }
}

/// Dispatch a single event.
fn handle_event(state: &mut RelayState, event: InternalEvent, tx: &Sender<InternalEvent>) {
    match event {
        InternalEvent::NewConnection { stream } => {
            handle_new_connection(state, stream, tx);
        }
        InternalEvent::MessageFrom { client_id, message } => {
            if let Some(conn) = state.connections.get_mut(&client_id) {
                rpc::dispatch(&mut state.registry, conn, message);
            }
        }
        InternalEvent::Malformed {
            client_id,
            request_id,
            reason,
        } => {
            if let Some(conn) = state.connections.get(&client_id) {
                debug!("connection {client_id}: malformed message: {reason}");
                rpc::reject_malformed(conn, request_id, &reason);
            }
        }
        InternalEvent::Disconnected { client_id } => {
            if let Some(conn) = state.connections.remove(&client_id) {
                debug!("connection {client_id}: disconnected");
                if let Some(play_id) = conn.play_id() {
                    state.registry.leave(play_id, client_id);
                }
                conn.close();
            }
        }
        InternalEvent::Control(control) => handle_control(&mut state.registry, control),
    }
}

fn handle_control(registry: &mut Registry, control: Control) {
    // A dropped reply receiver means the caller gave up waiting.
    match control {
        Control::StartPlay { play_id, reply } => {
            let _ = reply.send(registry.start(play_id));
        }
        Control::EndPlay {
            play_id,
            reason,
            reply,
        } => {
            let _ = reply.send(registry.end(&play_id, reason));
        }
        Control::ExtendPlay {
            play_id,
            expires_at,
            remaining_ms,
            reply,
        } => {
            let _ = reply.send(registry.extend(&play_id, expires_at, remaining_ms));
        }
        Control::CreateToken {
            play_id,
            kind,
            reply,
        } => {
            let _ = reply.send(registry.create_play_token(&play_id, kind));
        }
    }
}

/// Register a new connection and spawn its reader and writer threads.
fn handle_new_connection(state: &mut RelayState, stream: TcpStream, tx: &Sender<InternalEvent>) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = match (stream.try_clone(), stream.try_clone()) {
        (Ok(read_half), Ok(write_half)) => (read_half, write_half),
        (Err(e), _) | (_, Err(e)) => {
            warn!("dropping connection, cannot clone stream: {e}");
            return;
        }
    };

    let client_id = state.next_client_id;
    state.next_client_id += 1;

    let (outbox, outbox_rx) = mpsc::sync_channel(state.outbox_depth);
    spawn_writer(client_id, write_half, outbox_rx);

    let tx_reader = tx.clone();
    thread::spawn(move || {
        reader_loop(BufReader::new(read_half), client_id, tx_reader);
    });

    let handle = ConnectionHandle::new(client_id, outbox, Some(stream));
    state.connections.insert(client_id, Connection::new(handle));
    debug!("connection {client_id}: registered");
}

fn spawn_writer(client_id: ClientId, stream: TcpStream, outbox: Receiver<Outgoing>) {
    thread::spawn(move || {
        let mut writer = BufWriter::new(stream);
        // Ends on `Close`, on a write error, or once every sender is gone.
        while let Ok(Outgoing::Message(message)) = outbox.recv() {
            if let Err(e) = write_json(&mut writer, &message) {
                debug!("connection {client_id}: write failed: {e}");
                break;
            }
        }
        let _ = writer.get_ref().shutdown(Shutdown::Both);
    });
}

/// Reader loop for a single connection. Runs in its own thread.
fn reader_loop(mut reader: BufReader<TcpStream>, client_id: ClientId, tx: Sender<InternalEvent>) {
    loop {
        let event = match read_frame(&mut reader) {
            Ok(bytes) => match serde_json::from_slice::<ClientMessage>(&bytes) {
                Ok(message) => InternalEvent::MessageFrom { client_id, message },
                Err(e) => InternalEvent::Malformed {
                    client_id,
                    request_id: serde_json::from_slice::<serde_json::Value>(&bytes)
                        .ok()
                        .and_then(|value| ClientMessage::recover_request_id(&value)),
                    reason: e.to_string(),
                },
            },
            Err(e) => {
                if !matches!(e, FramingError::Io(_)) {
                    debug!("connection {client_id}: unreadable stream: {e}");
                }
                let _ = tx.send(InternalEvent::Disconnected { client_id });
                break;
            }
        };
        if tx.send(event).is_err() {
            break;
        }
    }
}
