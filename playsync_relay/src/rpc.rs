// Per-connection request handling.
//
// Translates one connection's `ClientMessage`s into `Registry` calls and
// turns every outcome into `ServerMessage`s on the connection's outbox.
//
// Scoping: `Open` binds the connection to one play. Every later message must
// name the same play; before `Open` (or after `Close`) anything else fails
// with "this session isn't opened", and a different play id fails with
// "invalid playId". Both are `BadRequest`.
//
// Replies: a request always produces exactly one `Response` carrying its
// `request_id`, success or not. That includes a request frame that fails to
// parse but still names a request kind and a `request_id`. A failing
// notification produces a `NotificationFailed`. Nothing a peer sends can take down the event loop
// or another connection.
//
// Permissions are recorded on `authenticate` but not enforced here; the
// simulation client is expected to respect them.
//
// `ConnectionHandle` is the connection's `Subscriber` in the registry. It
// owns the tick/event subscription flags and filters pushes with them
// before queueing. The outbox is bounded; a peer too slow to drain it is
// disconnected rather than allowed to stall the tick path, and can catch up
// with `GetTickList` after reconnecting.

use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};

use log::{debug, warn};

use playsync_protocol::codec::{pack, unpack_value};
use playsync_protocol::error::{AmflowError, ErrorPayload};
use playsync_protocol::message::{ClientMessage, RequestId, ResponseBody, ServerMessage};
use playsync_protocol::types::{Permission, PlayId};

use crate::registry::{ClientId, Push, Registry, Subscriber};

/// What the writer thread of a connection is told to do next.
#[derive(Debug)]
pub enum Outgoing {
    Message(ServerMessage),
    /// Flush and shut the socket down.
    Close,
}

/// Which push kinds a connection currently wants.
#[derive(Debug, Default)]
pub struct Subscriptions {
    tick: AtomicBool,
    event: AtomicBool,
}

impl Subscriptions {
    pub fn ticks(&self) -> bool {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> bool {
        self.event.load(Ordering::Relaxed)
    }

    fn set_ticks(&self, on: bool) {
        self.tick.store(on, Ordering::Relaxed);
    }

    fn set_events(&self, on: bool) {
        self.event.store(on, Ordering::Relaxed);
    }
}

/// The registry's view of one connection.
pub struct ConnectionHandle {
    id: ClientId,
    outbox: SyncSender<Outgoing>,
    subscriptions: Subscriptions,
    /// Socket to shut down when the outbox cannot take a `Close`.
    stream: Option<TcpStream>,
}

impl ConnectionHandle {
    pub fn new(id: ClientId, outbox: SyncSender<Outgoing>, stream: Option<TcpStream>) -> Self {
        Self {
            id,
            outbox,
            subscriptions: Subscriptions::default(),
            stream,
        }
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// Queue a message. Returns `false` if the connection is gone or hopelessly
    /// behind (in which case it is disconnected).
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.outbox.try_send(Outgoing::Message(message)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("connection {}: outbox full, disconnecting", self.id);
                self.shutdown_socket();
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn shutdown_socket(&self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Subscriber for ConnectionHandle {
    fn id(&self) -> ClientId {
        self.id
    }

    fn deliver(&self, push: &Push) -> bool {
        let message = match push {
            Push::Ticks(ticks) => {
                if !self.subscriptions.ticks() {
                    return true;
                }
                // A contiguous run of bare ticks repacks to a single range.
                return pack(ticks)
                    .into_iter()
                    .all(|pack| self.send(ServerMessage::TickPack { pack }));
            }
            Push::Event(event) => {
                if !self.subscriptions.events() {
                    return true;
                }
                ServerMessage::Event {
                    event: event.clone(),
                }
            }
            Push::PlayEnd(reason) => ServerMessage::PlayEnd { reason: *reason },
            Push::PlayExtend {
                expires_at,
                remaining_ms,
            } => ServerMessage::PlayExtend {
                expires_at: *expires_at,
                remaining_ms: *remaining_ms,
            },
        };
        self.send(message)
    }

    fn disconnect(&self) {
        if self.outbox.try_send(Outgoing::Close).is_err() {
            self.shutdown_socket();
        }
    }
}

/// Protocol state of one connection, owned by the event loop.
pub struct Connection {
    handle: Arc<ConnectionHandle>,
    play_id: Option<PlayId>,
    permission: Option<Permission>,
}

impl Connection {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle: Arc::new(handle),
            play_id: None,
            permission: None,
        }
    }

    pub fn id(&self) -> ClientId {
        self.handle.id
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// The play this connection has opened, if any.
    pub fn play_id(&self) -> Option<&PlayId> {
        self.play_id.as_ref()
    }

    pub fn permission(&self) -> Option<Permission> {
        self.permission
    }

    /// Tell the writer to flush and close.
    pub fn close(&self) {
        self.handle.disconnect();
    }

    fn check_scope(&self, play_id: &PlayId) -> Result<(), AmflowError> {
        match &self.play_id {
            None => Err(AmflowError::bad_request("this session isn't opened")),
            Some(opened) if opened != play_id => {
                Err(AmflowError::bad_request(format!("invalid playId: {play_id}")))
            }
            Some(_) => Ok(()),
        }
    }

    fn reset(&mut self) {
        self.play_id = None;
        self.permission = None;
        self.handle.subscriptions.set_ticks(false);
        self.handle.subscriptions.set_events(false);
    }
}

/// Handle one inbound message and queue whatever it produces.
pub fn dispatch(registry: &mut Registry, conn: &mut Connection, message: ClientMessage) {
    let request_id = message.request_id();
    let result = handle_message(registry, conn, message);
    match (request_id, result) {
        (Some(request_id), result) => reply(conn, request_id, result),
        (None, Ok(_)) => {}
        (None, Err(e)) => {
            debug!("connection {}: notification failed: {e}", conn.id());
            conn.handle.send(ServerMessage::NotificationFailed { error: e.into() });
        }
    }
}

/// Report a frame that could not be parsed as a `ClientMessage`. A frame
/// that still carried a `request_id` gets its `Response`; anything else gets
/// a `NotificationFailed`.
pub fn reject_malformed(conn: &Connection, request_id: Option<RequestId>, reason: &str) {
    let error = AmflowError::bad_request(format!("malformed message: {reason}"));
    match request_id {
        Some(request_id) => reply(conn, request_id, Err(error)),
        None => {
            conn.handle.send(ServerMessage::NotificationFailed {
                error: error.into(),
            });
        }
    }
}

fn reply(conn: &Connection, request_id: RequestId, result: Result<ResponseBody, AmflowError>) {
    conn.handle.send(ServerMessage::Response {
        request_id,
        result: result.map_err(ErrorPayload::from),
    });
}

fn handle_message(
    registry: &mut Registry,
    conn: &mut Connection,
    message: ClientMessage,
) -> Result<ResponseBody, AmflowError> {
    match message {
        ClientMessage::Open { play_id, .. } => {
            if conn.play_id.is_some() {
                return Err(AmflowError::invalid_status("this session is already opened"));
            }
            let subscriber: Arc<dyn Subscriber> = conn.handle.clone();
            registry.join(&play_id, subscriber)?;
            debug!("connection {}: opened play {play_id}", conn.id());
            conn.play_id = Some(play_id);
            Ok(ResponseBody::Ack)
        }
        ClientMessage::Close { play_id, .. } => {
            conn.check_scope(&play_id)?;
            registry.leave(&play_id, conn.id());
            conn.reset();
            Ok(ResponseBody::Ack)
        }
        ClientMessage::Authenticate { play_id, token, .. } => {
            conn.check_scope(&play_id)?;
            let permission = registry.authenticate(&play_id, &token)?;
            conn.permission = Some(permission);
            Ok(ResponseBody::Permission(permission))
        }
        ClientMessage::SendTickPack { play_id, pack } => {
            conn.check_scope(&play_id)?;
            registry.send_ticks(&play_id, unpack_value(&pack)?)?;
            Ok(ResponseBody::Ack)
        }
        ClientMessage::SendEvent { play_id, event } => {
            conn.check_scope(&play_id)?;
            registry.send_event(&play_id, event)?;
            Ok(ResponseBody::Ack)
        }
        ClientMessage::SubscribeTick { play_id } => {
            conn.check_scope(&play_id)?;
            conn.handle.subscriptions.set_ticks(true);
            Ok(ResponseBody::Ack)
        }
        ClientMessage::UnsubscribeTick { play_id } => {
            conn.check_scope(&play_id)?;
            conn.handle.subscriptions.set_ticks(false);
            Ok(ResponseBody::Ack)
        }
        ClientMessage::SubscribeEvent { play_id } => {
            conn.check_scope(&play_id)?;
            conn.handle.subscriptions.set_events(true);
            Ok(ResponseBody::Ack)
        }
        ClientMessage::UnsubscribeEvent { play_id } => {
            conn.check_scope(&play_id)?;
            conn.handle.subscriptions.set_events(false);
            Ok(ResponseBody::Ack)
        }
        ClientMessage::GetTickList {
            play_id, options, ..
        } => {
            conn.check_scope(&play_id)?;
            Ok(ResponseBody::TickList(registry.get_tick_list(&play_id, &options)?))
        }
        ClientMessage::PutStartPoint {
            play_id,
            start_point,
            ..
        } => {
            conn.check_scope(&play_id)?;
            registry.put_start_point(&play_id, &start_point)?;
            Ok(ResponseBody::Ack)
        }
        ClientMessage::GetStartPoint {
            play_id, options, ..
        } => {
            conn.check_scope(&play_id)?;
            let start_point = registry.get_start_point(&play_id, &options)?;
            Ok(ResponseBody::StartPoint(start_point))
        }
        ClientMessage::GetStorageData { play_id, .. }
        | ClientMessage::PutStorageData { play_id, .. } => {
            conn.check_scope(&play_id)?;
            Err(AmflowError::not_implemented("storage data is not supported"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{Receiver, sync_channel};

    use playsync_protocol::error::ErrorKind;
    use playsync_protocol::types::{
        Event, EventFlags, GetStartPointOptions, GetTickListOptions, PermissionKind, StartPoint,
        Tick, TickFrame, TickPack,
    };

    use super::*;
    use crate::backend::MemoryBackend;

    struct Peer {
        conn: Connection,
        rx: Receiver<Outgoing>,
    }

    impl Peer {
        fn new(id: ClientId) -> Self {
            let (tx, rx) = sync_channel(64);
            Self {
                conn: Connection::new(ConnectionHandle::new(id, tx, None)),
                rx,
            }
        }

        fn send(&mut self, registry: &mut Registry, message: ClientMessage) {
            dispatch(registry, &mut self.conn, message);
        }

        fn drain(&self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(outgoing) = self.rx.try_recv() {
                if let Outgoing::Message(msg) = outgoing {
                    out.push(msg);
                }
            }
            out
        }

        /// The single response in the outbox.
        fn response(&self) -> Result<ResponseBody, ErrorPayload> {
            let mut messages = self.drain();
            assert_eq!(messages.len(), 1, "expected one message, got {messages:?}");
            match messages.remove(0) {
                ServerMessage::Response { result, .. } => result,
                other => panic!("expected Response, got {other:?}"),
            }
        }

        fn open(&mut self, registry: &mut Registry, play_id: &PlayId) {
            self.send(
                registry,
                ClientMessage::Open {
                    request_id: 0,
                    play_id: play_id.clone(),
                },
            );
            assert_eq!(self.response(), Ok(ResponseBody::Ack));
        }
    }

    fn play(id: &str) -> PlayId {
        PlayId::new(id).unwrap()
    }

    fn started(id: &str) -> (Registry, PlayId) {
        let mut registry = Registry::new(Arc::new(MemoryBackend::new()));
        let play_id = play(id);
        registry.start(play_id.clone()).unwrap();
        (registry, play_id)
    }

    #[test]
    fn operations_before_open_are_rejected() {
        let (mut registry, p) = started("1");
        let mut peer = Peer::new(1);
        peer.send(
            &mut registry,
            ClientMessage::GetStartPoint {
                request_id: 7,
                play_id: p.clone(),
                options: GetStartPointOptions::default(),
            },
        );
        match peer.drain().as_slice() {
            [ServerMessage::Response { request_id: 7, result: Err(e) }] => {
                assert_eq!(e.kind(), ErrorKind::BadRequest);
                assert_eq!(e.message, "this session isn't opened");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mismatched_play_id_is_rejected() {
        let (mut registry, p) = started("1");
        registry.start(play("2")).unwrap();
        let mut peer = Peer::new(1);
        peer.open(&mut registry, &p);

        peer.send(
            &mut registry,
            ClientMessage::Authenticate {
                request_id: 1,
                play_id: play("2"),
                token: "x".into(),
            },
        );
        let err = peer.response().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(err.message.starts_with("invalid playId"));
    }

    #[test]
    fn double_open_is_invalid_status() {
        let (mut registry, p) = started("1");
        let mut peer = Peer::new(1);
        peer.open(&mut registry, &p);
        peer.send(
            &mut registry,
            ClientMessage::Open {
                request_id: 1,
                play_id: p.clone(),
            },
        );
        assert_eq!(
            peer.response().unwrap_err().kind(),
            ErrorKind::InvalidStatus
        );
    }

    #[test]
    fn open_unknown_play_is_bad_request() {
        let (mut registry, _p) = started("1");
        let mut peer = Peer::new(1);
        peer.send(
            &mut registry,
            ClientMessage::Open {
                request_id: 1,
                play_id: play("404"),
            },
        );
        assert_eq!(peer.response().unwrap_err().kind(), ErrorKind::BadRequest);
        assert!(peer.conn.play_id().is_none());
    }

    #[test]
    fn authenticate_records_permission() {
        let (mut registry, p) = started("1");
        let token = registry
            .create_play_token(&p, PermissionKind::Passive)
            .unwrap();
        let mut peer = Peer::new(1);
        peer.open(&mut registry, &p);

        peer.send(
            &mut registry,
            ClientMessage::Authenticate {
                request_id: 3,
                play_id: p.clone(),
                token,
            },
        );
        let passive = PermissionKind::Passive.permission();
        assert_eq!(peer.response(), Ok(ResponseBody::Permission(passive)));
        assert_eq!(peer.conn.permission(), Some(passive));

        peer.send(
            &mut registry,
            ClientMessage::Authenticate {
                request_id: 4,
                play_id: p.clone(),
                token: "wrong".into(),
            },
        );
        assert_eq!(peer.response().unwrap_err().kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn pushes_follow_subscription_flags() {
        let (mut registry, p) = started("1");
        let mut writer = Peer::new(1);
        let mut watcher = Peer::new(2);
        writer.open(&mut registry, &p);
        watcher.open(&mut registry, &p);

        // Not subscribed yet: nothing arrives.
        writer.send(
            &mut registry,
            ClientMessage::SendTickPack {
                play_id: p.clone(),
                pack: serde_json::json!(0),
            },
        );
        assert!(watcher.drain().is_empty());

        watcher.send(&mut registry, ClientMessage::SubscribeTick { play_id: p.clone() });
        writer.send(
            &mut registry,
            ClientMessage::SendTickPack {
                play_id: p.clone(),
                pack: serde_json::json!({"from": 1, "to": 3}),
            },
        );
        let frames: Vec<TickPack> = watcher
            .drain()
            .into_iter()
            .map(|msg| match msg {
                ServerMessage::TickPack { pack } => pack,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(frames, vec![TickPack::Range(TickFrame { from: 1, to: 3 })]);

        // Events need their own subscription.
        writer.send(
            &mut registry,
            ClientMessage::SendEvent {
                play_id: p.clone(),
                event: Event::new(1, 0),
            },
        );
        assert!(watcher.drain().is_empty());
        watcher.send(&mut registry, ClientMessage::SubscribeEvent { play_id: p.clone() });
        writer.send(
            &mut registry,
            ClientMessage::SendEvent {
                play_id: p.clone(),
                event: Event::new(2, 0),
            },
        );
        assert_eq!(
            watcher.drain(),
            vec![ServerMessage::Event {
                event: Event::new(2, 0)
            }]
        );

        watcher.send(&mut registry, ClientMessage::UnsubscribeTick { play_id: p.clone() });
        writer.send(
            &mut registry,
            ClientMessage::SendTickPack {
                play_id: p.clone(),
                pack: serde_json::json!(4),
            },
        );
        assert!(watcher.drain().is_empty());
    }

    #[test]
    fn bad_tick_pack_fails_without_closing() {
        let (mut registry, p) = started("1");
        let mut peer = Peer::new(1);
        peer.open(&mut registry, &p);

        peer.send(
            &mut registry,
            ClientMessage::SendTickPack {
                play_id: p.clone(),
                pack: serde_json::json!("not a pack"),
            },
        );
        match peer.drain().as_slice() {
            [ServerMessage::NotificationFailed { error }] => {
                assert_eq!(error.kind(), ErrorKind::BadRequest);
            }
            other => panic!("unexpected {other:?}"),
        }

        // The next pack in the stream is still processed.
        peer.send(
            &mut registry,
            ClientMessage::SendTickPack {
                play_id: p.clone(),
                pack: serde_json::json!({"from": 0, "to": 1}),
            },
        );
        assert!(peer.drain().is_empty());
        assert_eq!(
            registry.session(&p).unwrap().store().latest_frame(),
            1
        );
    }

    #[test]
    fn malformed_requests_still_get_a_response() {
        let peer = Peer::new(1);
        reject_malformed(&peer.conn, Some(8), "invalid play id");
        match peer.drain().as_slice() {
            [ServerMessage::Response { request_id: 8, result: Err(e) }] => {
                assert_eq!(e.kind(), ErrorKind::BadRequest);
                assert!(e.message.contains("invalid play id"), "{}", e.message);
            }
            other => panic!("unexpected {other:?}"),
        }

        reject_malformed(&peer.conn, None, "expected value");
        match peer.drain().as_slice() {
            [ServerMessage::NotificationFailed { error }] => {
                assert_eq!(error.kind(), ErrorKind::BadRequest);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tick_list_is_packed() {
        let (mut registry, p) = started("1");
        let mut peer = Peer::new(1);
        peer.open(&mut registry, &p);
        let event = Event::new(9, EventFlags::IGNORABLE);
        for pack in [
            serde_json::json!({"from": 0, "to": 2}),
            serde_json::to_value(Tick::with_events(3, vec![event.clone()])).unwrap(),
            serde_json::json!(4),
        ] {
            peer.send(
                &mut registry,
                ClientMessage::SendTickPack {
                    play_id: p.clone(),
                    pack,
                },
            );
        }

        let request = |exclude_ignorable| ClientMessage::GetTickList {
            request_id: 5,
            play_id: p.clone(),
            options: GetTickListOptions {
                begin: 0,
                end: 10,
                exclude_ignorable,
            },
        };

        peer.send(&mut registry, request(false));
        assert_eq!(
            peer.response(),
            Ok(ResponseBody::TickList(Some(vec![
                TickPack::Range(TickFrame { from: 0, to: 2 }),
                TickPack::Tick(Tick::with_events(3, vec![event])),
                TickPack::Frame(4),
            ])))
        );

        peer.send(&mut registry, request(true));
        assert_eq!(
            peer.response(),
            Ok(ResponseBody::TickList(Some(vec![TickPack::Range(
                TickFrame { from: 0, to: 4 }
            )])))
        );
    }

    #[test]
    fn start_points_round_trip() {
        let (mut registry, p) = started("1");
        let mut peer = Peer::new(1);
        peer.open(&mut registry, &p);
        let start_point = StartPoint {
            frame: 0,
            timestamp: 50,
            data: serde_json::json!({"seed": 1}),
        };
        peer.send(
            &mut registry,
            ClientMessage::PutStartPoint {
                request_id: 1,
                play_id: p.clone(),
                start_point: start_point.clone(),
            },
        );
        assert_eq!(peer.response(), Ok(ResponseBody::Ack));

        peer.send(
            &mut registry,
            ClientMessage::GetStartPoint {
                request_id: 2,
                play_id: p.clone(),
                options: GetStartPointOptions {
                    frame: None,
                    timestamp: Some(40),
                },
            },
        );
        assert_eq!(peer.response(), Ok(ResponseBody::StartPoint(None)));

        peer.send(
            &mut registry,
            ClientMessage::GetStartPoint {
                request_id: 3,
                play_id: p.clone(),
                options: GetStartPointOptions::default(),
            },
        );
        assert_eq!(
            peer.response(),
            Ok(ResponseBody::StartPoint(Some(start_point)))
        );
    }

    #[test]
    fn storage_data_is_not_implemented() {
        let (mut registry, p) = started("1");
        let mut peer = Peer::new(1);
        peer.open(&mut registry, &p);
        peer.send(
            &mut registry,
            ClientMessage::PutStorageData {
                request_id: 1,
                play_id: p.clone(),
                key: serde_json::json!({"region": 1}),
                value: serde_json::json!([1, 2]),
            },
        );
        assert_eq!(
            peer.response().unwrap_err().kind(),
            ErrorKind::NotImplemented
        );
    }

    #[test]
    fn close_unbinds_and_allows_reopen() {
        let (mut registry, p) = started("1");
        let mut peer = Peer::new(1);
        peer.open(&mut registry, &p);
        peer.send(&mut registry, ClientMessage::SubscribeTick { play_id: p.clone() });
        peer.send(
            &mut registry,
            ClientMessage::Close {
                request_id: 1,
                play_id: p.clone(),
            },
        );
        assert_eq!(peer.response(), Ok(ResponseBody::Ack));
        assert!(peer.conn.play_id().is_none());
        assert!(!peer.conn.handle().subscriptions().ticks());
        assert_eq!(registry.session(&p).unwrap().subscriber_count(), 0);

        peer.open(&mut registry, &p);
        assert_eq!(registry.session(&p).unwrap().subscriber_count(), 1);
    }

    #[test]
    fn every_request_gets_its_own_response() {
        let (mut registry, p) = started("1");
        let mut peer = Peer::new(1);
        peer.open(&mut registry, &p);
        for request_id in [10, 11, 12] {
            peer.send(
                &mut registry,
                ClientMessage::GetTickList {
                    request_id,
                    play_id: p.clone(),
                    options: GetTickListOptions {
                        begin: 0,
                        end: 1,
                        exclude_ignorable: false,
                    },
                },
            );
        }
        let ids: Vec<RequestId> = peer
            .drain()
            .into_iter()
            .map(|msg| match msg {
                ServerMessage::Response {
                    request_id,
                    result: Ok(ResponseBody::TickList(None)),
                } => request_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn long_range_is_one_push() {
        let (mut registry, p) = started("1");
        let mut writer = Peer::new(1);
        let mut watcher = Peer::new(2);
        writer.open(&mut registry, &p);
        watcher.open(&mut registry, &p);
        watcher.send(&mut registry, ClientMessage::SubscribeTick { play_id: p.clone() });

        // Far more ticks than the 64-slot outbox could hold one by one.
        writer.send(
            &mut registry,
            ClientMessage::SendTickPack {
                play_id: p.clone(),
                pack: serde_json::json!({"from": 0, "to": 19999}),
            },
        );
        assert_eq!(
            watcher.drain(),
            vec![ServerMessage::TickPack {
                pack: TickPack::Range(TickFrame { from: 0, to: 19999 })
            }]
        );
        assert_eq!(registry.session(&p).unwrap().subscriber_count(), 2);
    }

    #[test]
    fn full_outbox_drops_the_subscriber() {
        let (mut registry, p) = started("1");
        let (tx, _rx) = sync_channel(1);
        let mut conn = Connection::new(ConnectionHandle::new(1, tx, None));
        dispatch(
            &mut registry,
            &mut conn,
            ClientMessage::Open {
                request_id: 0,
                play_id: p.clone(),
            },
        );
        // The Ack fills the single slot.
        dispatch(
            &mut registry,
            &mut conn,
            ClientMessage::SubscribeTick { play_id: p.clone() },
        );
        registry.send_tick(&p, Tick::bare(0)).unwrap();
        assert_eq!(registry.session(&p).unwrap().subscriber_count(), 0);
    }
}
