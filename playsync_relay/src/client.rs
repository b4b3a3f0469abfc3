// TCP client for talking to the relay.
//
// Architecture:
// - `connect()` opens the TCP connection and spawns a background reader
//   thread. The caller's thread holds a `BufWriter<TcpStream>` for sending.
// - The reader thread calls `read_json()` in a loop. A `Response` is routed
//   to the `PendingResponse` registered under its `request_id`; everything
//   else (pushes and `NotificationFailed`) goes to the inbox.
// - `poll()` drains the inbox non-blocking; `next_push()` waits for one.
//
// Requests can be pipelined: `request()` returns a `PendingResponse` as soon
// as the message is written, and responses are matched by id regardless of
// arrival order. The convenience methods (`open`, `get_tick_list`, ...)
// send and wait in one call.
//
// A `NetClient` is bound to one play id at connect time; every message it
// sends names that play. Tests that need to send mismatched ids use raw
// framing instead.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::debug;
use thiserror::Error;

use playsync_protocol::codec::{pack, unpack_all};
use playsync_protocol::error::{AmflowError, ErrorPayload};
use playsync_protocol::framing::{FramingError, read_json, write_json};
use playsync_protocol::message::{ClientMessage, RequestId, ResponseBody, ServerMessage};
use playsync_protocol::types::{
    Event, GetStartPointOptions, GetTickListOptions, Permission, PlayId, StartPoint, Tick,
    TickPack,
};

/// How long the convenience methods wait for a response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    /// The relay answered with an error.
    #[error(transparent)]
    Remote(#[from] AmflowError),
    #[error("connection to the relay was lost")]
    Disconnected,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(ResponseBody),
}

type ResponseResult = Result<ResponseBody, ErrorPayload>;
type PendingMap = Arc<Mutex<HashMap<RequestId, Sender<ResponseResult>>>>;

/// A request that has been sent and whose response has not been read yet.
pub struct PendingResponse {
    request_id: RequestId,
    rx: Receiver<ResponseResult>,
}

impl PendingResponse {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Block until the response arrives or `timeout` passes.
    pub fn wait(self, timeout: Duration) -> Result<ResponseBody, ClientError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(payload)) => Err(ClientError::Remote(payload.into())),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Disconnected),
        }
    }
}

/// TCP client for relay communication.
pub struct NetClient {
    play_id: PlayId,
    writer: BufWriter<TcpStream>,
    pending: PendingMap,
    inbox: Receiver<ServerMessage>,
    next_request_id: RequestId,
}

impl NetClient {
    /// Connect to a relay and spawn the reader thread. Nothing is sent until
    /// the first call.
    pub fn connect(addr: impl ToSocketAddrs, play_id: PlayId) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);

        let pending = PendingMap::default();
        let (inbox_tx, inbox) = mpsc::channel();
        let pending_reader = pending.clone();
        thread::spawn(move || {
            reader_loop(reader, pending_reader, inbox_tx);
        });

        Ok(Self {
            play_id,
            writer: BufWriter::new(stream),
            pending,
            inbox,
            next_request_id: 1,
        })
    }

    pub fn play_id(&self) -> &PlayId {
        &self.play_id
    }

    /// Send a request built from a fresh id and return its pending response.
    pub fn request(
        &mut self,
        build: impl FnOnce(RequestId, PlayId) -> ClientMessage,
    ) -> Result<PendingResponse, ClientError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let (tx, rx) = mpsc::channel();
        lock(&self.pending).insert(request_id, tx);
        let message = build(request_id, self.play_id.clone());
        if let Err(e) = write_json(&mut self.writer, &message) {
            lock(&self.pending).remove(&request_id);
            return Err(e.into());
        }
        Ok(PendingResponse { request_id, rx })
    }

    /// Send a notification (no response expected).
    pub fn notify(&mut self, message: ClientMessage) -> Result<(), ClientError> {
        write_json(&mut self.writer, &message)?;
        Ok(())
    }

    fn call(
        &mut self,
        build: impl FnOnce(RequestId, PlayId) -> ClientMessage,
    ) -> Result<ResponseBody, ClientError> {
        self.request(build)?.wait(RESPONSE_TIMEOUT)
    }

    fn call_ack(
        &mut self,
        build: impl FnOnce(RequestId, PlayId) -> ClientMessage,
    ) -> Result<(), ClientError> {
        match self.call(build)? {
            ResponseBody::Ack => Ok(()),
            other => Err(ClientError::UnexpectedResponse(other)),
        }
    }

    pub fn open(&mut self) -> Result<(), ClientError> {
        self.call_ack(|request_id, play_id| ClientMessage::Open {
            request_id,
            play_id,
        })
    }

    pub fn close(&mut self) -> Result<(), ClientError> {
        self.call_ack(|request_id, play_id| ClientMessage::Close {
            request_id,
            play_id,
        })
    }

    pub fn authenticate(&mut self, token: &str) -> Result<Permission, ClientError> {
        let token = token.to_string();
        match self.call(|request_id, play_id| ClientMessage::Authenticate {
            request_id,
            play_id,
            token,
        })? {
            ResponseBody::Permission(permission) => Ok(permission),
            other => Err(ClientError::UnexpectedResponse(other)),
        }
    }

    /// Send ticks in their packed form, one `SendTickPack` per pack.
    pub fn send_ticks(&mut self, ticks: &[Tick]) -> Result<(), ClientError> {
        for tick_pack in pack(ticks) {
            let value = serde_json::to_value(&tick_pack).map_err(FramingError::from)?;
            self.notify(ClientMessage::SendTickPack {
                play_id: self.play_id.clone(),
                pack: value,
            })?;
        }
        Ok(())
    }

    pub fn send_event(&mut self, event: Event) -> Result<(), ClientError> {
        self.notify(ClientMessage::SendEvent {
            play_id: self.play_id.clone(),
            event,
        })
    }

    pub fn subscribe_tick(&mut self) -> Result<(), ClientError> {
        self.notify(ClientMessage::SubscribeTick {
            play_id: self.play_id.clone(),
        })
    }

    pub fn unsubscribe_tick(&mut self) -> Result<(), ClientError> {
        self.notify(ClientMessage::UnsubscribeTick {
            play_id: self.play_id.clone(),
        })
    }

    pub fn subscribe_event(&mut self) -> Result<(), ClientError> {
        self.notify(ClientMessage::SubscribeEvent {
            play_id: self.play_id.clone(),
        })
    }

    pub fn unsubscribe_event(&mut self) -> Result<(), ClientError> {
        self.notify(ClientMessage::UnsubscribeEvent {
            play_id: self.play_id.clone(),
        })
    }

    /// Fetch a tick range in the packed form the relay sent it. `None` means
    /// no data yet.
    pub fn get_tick_packs(
        &mut self,
        options: GetTickListOptions,
    ) -> Result<Option<Vec<TickPack>>, ClientError> {
        match self.call(|request_id, play_id| ClientMessage::GetTickList {
            request_id,
            play_id,
            options,
        })? {
            ResponseBody::TickList(packs) => Ok(packs),
            other => Err(ClientError::UnexpectedResponse(other)),
        }
    }

    /// Fetch and unpack a tick range. Ranges wider than
    /// `codec::MAX_RANGE_FRAMES` fail to unpack; use `get_tick_packs` for
    /// those.
    pub fn get_tick_list(
        &mut self,
        options: GetTickListOptions,
    ) -> Result<Option<Vec<Tick>>, ClientError> {
        match self.get_tick_packs(options)? {
            Some(packs) => Ok(Some(unpack_all(&packs)?)),
            None => Ok(None),
        }
    }

    pub fn put_start_point(&mut self, start_point: StartPoint) -> Result<(), ClientError> {
        self.call_ack(|request_id, play_id| ClientMessage::PutStartPoint {
            request_id,
            play_id,
            start_point,
        })
    }

    pub fn get_start_point(
        &mut self,
        options: GetStartPointOptions,
    ) -> Result<Option<StartPoint>, ClientError> {
        match self.call(|request_id, play_id| ClientMessage::GetStartPoint {
            request_id,
            play_id,
            options,
        })? {
            ResponseBody::StartPoint(start_point) => Ok(start_point),
            other => Err(ClientError::UnexpectedResponse(other)),
        }
    }

    /// Drain all queued pushes (non-blocking).
    pub fn poll(&self) -> Vec<ServerMessage> {
        self.inbox.try_iter().collect()
    }

    /// Wait up to `timeout` for the next push.
    pub fn next_push(&self, timeout: Duration) -> Option<ServerMessage> {
        self.inbox.recv_timeout(timeout).ok()
    }

    /// Close the socket. The reader thread exits on the resulting EOF.
    pub fn disconnect(&mut self) {
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<RequestId, Sender<ResponseResult>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reader thread: route responses to their waiters, queue everything else.
fn reader_loop(mut reader: BufReader<TcpStream>, pending: PendingMap, inbox: Sender<ServerMessage>) {
    loop {
        match read_json::<_, ServerMessage>(&mut reader) {
            Ok(ServerMessage::Response { request_id, result }) => {
                match lock(&pending).remove(&request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => debug!("response to unknown request {request_id}"),
                }
            }
            Ok(push) => {
                if inbox.send(push).is_err() {
                    break;
                }
            }
            Err(e) => {
                if !e.is_eof() {
                    debug!("relay connection closed: {e}");
                }
                break;
            }
        }
    }
    // Dropping the senders wakes every waiter with `Disconnected`.
    lock(&pending).clear();
}
