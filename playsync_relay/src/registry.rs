// Live plays and their subscribers.
//
// `Registry` maps each live `PlayId` to a `PlaySession`: the play's
// `PlayStore` plus the subscribers currently joined to it. The server's
// event loop owns the one `Registry` of the process and drives it from a
// single thread, so none of this needs locking. The embedding process
// reaches it through `RelayHandle` (see `server.rs`).
//
// Fan-out: whenever a play accepts ticks or an event, every joined
// subscriber gets a `Push`. The ticks accepted from one batch travel as a
// single `Push::Ticks`, so a long range costs one queue slot per subscriber. The registry does not look at subscription
// flags; a subscriber decides itself which pushes it forwards (the
// connection handle in `rpc.rs` filters by its per-connection flags).
// `Subscriber::deliver` must not block. A subscriber that reports itself
// gone is dropped from the play.
//
// Lifecycle: `start` creates a fresh store, `end` pushes `PlayEnd` to every
// subscriber, disconnects them, and destroys the store. If destroying fails
// the store is put back (without subscribers) so `end` can be retried
// instead of leaking the play's keys.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, error, info, warn};

use playsync_protocol::error::AmflowError;
use playsync_protocol::types::{
    Event, GetStartPointOptions, GetTickListOptions, Permission, PermissionKind, PlayEndReason,
    PlayId, StartPoint, Tick, TickPack,
};

use crate::backend::KvBackend;
use crate::store::{PlayStore, TickOutcome};

/// Identity of a subscriber, unique within the process.
pub type ClientId = u64;

/// A notification fanned out to the subscribers of a play.
#[derive(Clone, Debug, PartialEq)]
pub enum Push {
    /// Ticks accepted together, in frame order.
    Ticks(Vec<Tick>),
    Event(Event),
    PlayEnd(PlayEndReason),
    PlayExtend { expires_at: i64, remaining_ms: u64 },
}

/// Receiver of pushes for one play.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> ClientId;

    /// Queue `push` without blocking. Returns `false` once the subscriber is
    /// gone for good.
    fn deliver(&self, push: &Push) -> bool;

    /// Close the subscriber's connection.
    fn disconnect(&self);
}

/// A live play: its log and who is listening.
pub struct PlaySession {
    store: PlayStore,
    subscribers: BTreeMap<ClientId, Arc<dyn Subscriber>>,
}

impl PlaySession {
    fn new(store: PlayStore) -> Self {
        Self {
            store,
            subscribers: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &PlayStore {
        &self.store
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn broadcast(&mut self, push: &Push) {
        let play_id = self.store.play_id().clone();
        self.subscribers.retain(|id, subscriber| {
            let alive = subscriber.deliver(push);
            if !alive {
                debug!("play {play_id}: dropping subscriber {id}");
            }
            alive
        });
    }
}

/// All live plays of the process.
pub struct Registry {
    backend: Arc<dyn KvBackend>,
    sessions: HashMap<PlayId, PlaySession>,
}

impl Registry {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            sessions: HashMap::new(),
        }
    }

    pub fn contains(&self, play_id: &PlayId) -> bool {
        self.sessions.contains_key(play_id)
    }

    pub fn play_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, play_id: &PlayId) -> Option<&PlaySession> {
        self.sessions.get(play_id)
    }

    /// Create a play. Fails if it already exists.
    pub fn start(&mut self, play_id: PlayId) -> Result<(), AmflowError> {
        if self.sessions.contains_key(&play_id) {
            return Err(AmflowError::invalid_status(format!(
                "play {play_id} is already started"
            )));
        }
        let store = PlayStore::new(play_id.clone(), self.backend.clone());
        info!("play {play_id}: started");
        self.sessions.insert(play_id, PlaySession::new(store));
        Ok(())
    }

    /// Terminate a play: notify and disconnect its subscribers, then delete
    /// everything it stored.
    pub fn end(&mut self, play_id: &PlayId, reason: PlayEndReason) -> Result<(), AmflowError> {
        let mut session = self.sessions.remove(play_id).ok_or_else(|| unknown_play(play_id))?;

        let push = Push::PlayEnd(reason);
        for subscriber in std::mem::take(&mut session.subscribers).into_values() {
            subscriber.deliver(&push);
            subscriber.disconnect();
        }

        if let Err(e) = session.store.destroy() {
            error!("play {play_id}: cleanup failed, keeping it for retry: {e}");
            self.sessions.insert(play_id.clone(), session);
            return Err(e.into());
        }
        info!("play {play_id}: ended ({reason:?})");
        Ok(())
    }

    /// Announce a new expiry to every subscriber of a play.
    pub fn extend(
        &mut self,
        play_id: &PlayId,
        expires_at: i64,
        remaining_ms: u64,
    ) -> Result<(), AmflowError> {
        let session = self.session_mut(play_id)?;
        session.broadcast(&Push::PlayExtend {
            expires_at,
            remaining_ms,
        });
        Ok(())
    }

    /// Add a subscriber to a play's fan-out set.
    pub fn join(
        &mut self,
        play_id: &PlayId,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<(), AmflowError> {
        let session = self.session_mut(play_id)?;
        debug!("play {play_id}: subscriber {} joined", subscriber.id());
        session.subscribers.insert(subscriber.id(), subscriber);
        Ok(())
    }

    /// Remove a subscriber. Unknown plays and absent subscribers are ignored.
    pub fn leave(&mut self, play_id: &PlayId, client_id: ClientId) {
        if let Some(session) = self.sessions.get_mut(play_id) {
            if session.subscribers.remove(&client_id).is_some() {
                debug!("play {play_id}: subscriber {client_id} left");
            }
        }
    }

    /// Offer a tick to the play's log; broadcast it if accepted.
    pub fn send_tick(&mut self, play_id: &PlayId, tick: Tick) -> Result<TickOutcome, AmflowError> {
        let session = self.session_mut(play_id)?;
        let outcome = session.store.send_tick(&tick)?;
        if outcome == TickOutcome::Accepted {
            session.broadcast(&Push::Ticks(vec![tick]));
        }
        Ok(outcome)
    }

    /// Offer a batch of ticks in order and broadcast the accepted ones as one
    /// push. Returns how many were accepted. If the store fails part way, the
    /// ticks accepted before the failure are still broadcast.
    pub fn send_ticks(&mut self, play_id: &PlayId, ticks: Vec<Tick>) -> Result<usize, AmflowError> {
        let session = self.session_mut(play_id)?;
        let mut accepted = Vec::new();
        let mut failure = None;
        for tick in ticks {
            match session.store.send_tick(&tick) {
                Ok(TickOutcome::Accepted) => accepted.push(tick),
                Ok(TickOutcome::Ignored) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let count = accepted.len();
        if count > 0 {
            session.broadcast(&Push::Ticks(accepted));
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(count),
        }
    }

    /// Broadcast a standalone event. Events sent this way are not persisted;
    /// they reach the log when the active instance folds them into a tick.
    pub fn send_event(&mut self, play_id: &PlayId, event: Event) -> Result<(), AmflowError> {
        let session = self.session_mut(play_id)?;
        session.broadcast(&Push::Event(event));
        Ok(())
    }

    pub fn get_tick_list(
        &self,
        play_id: &PlayId,
        opts: &GetTickListOptions,
    ) -> Result<Option<Vec<TickPack>>, AmflowError> {
        Ok(self.session_ref(play_id)?.store.get_tick_list(opts)?)
    }

    pub fn put_start_point(
        &mut self,
        play_id: &PlayId,
        start_point: &StartPoint,
    ) -> Result<(), AmflowError> {
        Ok(self.session_mut(play_id)?.store.put_start_point(start_point)?)
    }

    pub fn get_start_point(
        &self,
        play_id: &PlayId,
        opts: &GetStartPointOptions,
    ) -> Result<Option<StartPoint>, AmflowError> {
        Ok(self.session_ref(play_id)?.store.get_start_point(opts)?)
    }

    pub fn create_play_token(
        &self,
        play_id: &PlayId,
        kind: PermissionKind,
    ) -> Result<String, AmflowError> {
        Ok(self.session_ref(play_id)?.store.create_play_token(kind)?)
    }

    pub fn authenticate(&self, play_id: &PlayId, token: &str) -> Result<Permission, AmflowError> {
        Ok(self.session_ref(play_id)?.store.authenticate(token)?)
    }

    /// Process shutdown: end every play and disconnect everyone.
    pub fn destroy(&mut self) {
        let play_ids: Vec<PlayId> = self.sessions.keys().cloned().collect();
        for play_id in play_ids {
            if let Err(e) = self.end(&play_id, PlayEndReason::InternalError) {
                warn!("play {play_id}: not cleaned up on shutdown: {e}");
            }
        }
        self.sessions.clear();
    }

    fn session_ref(&self, play_id: &PlayId) -> Result<&PlaySession, AmflowError> {
        self.sessions.get(play_id).ok_or_else(|| unknown_play(play_id))
    }

    fn session_mut(&mut self, play_id: &PlayId) -> Result<&mut PlaySession, AmflowError> {
        self.sessions
            .get_mut(play_id)
            .ok_or_else(|| unknown_play(play_id))
    }
}

fn unknown_play(play_id: &PlayId) -> AmflowError {
    AmflowError::bad_request(format!("invalid playId: {play_id}"))
}
