// Persistent tick/event log of one play.
//
// `PlayStore` is the only code that reads or writes a play's keys in the
// backend. The server's event loop owns one per live play (through
// `registry.rs`) and calls it without any locking of its own; the monotonic
// frame check in `send_tick` is what keeps concurrent writers safe.
//
// Key layout, all under `play:{id}:` (see `KeySpace`):
//
//   token:{sha256}          permission label for a token hash
//   event:{padded id}       event body (JSON)
//   index:all               ordered set, score = frame, member = event id
//   index:filtered          same, without ignorable events
//   snapshot:{id}           start point (JSON)
//   snapshots:frame         ordered set, score = frame, member = snapshot id
//   snapshots:timestamp     ordered set, score = timestamp, member = snapshot id
//
// Event ids: the counter is global to the play and strictly increasing.
// Every id assigned in one `send_tick` call is zero-padded to the width of
// the largest id of that call. Members sharing a score are ordered by their
// bytes, and only events of the same tick share a score, so equal width
// inside a call is enough for index order to equal numeric order.
//
// Counters live in memory only. A relay restart starts a play over from
// frame -1 and id 1.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use log::{debug, warn};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use thiserror::Error;

use playsync_protocol::error::{AmflowError, ErrorKind};
use playsync_protocol::types::{
    Event, Frame, GetStartPointOptions, GetTickListOptions, Permission, PermissionKind, PlayId,
    StartPoint, Tick, TickFrame, TickPack,
};

use crate::backend::{BackendError, KvBackend, Order};

/// Length of a generated play token.
pub const TOKEN_LEN: usize = 16;

/// Width of snapshot ids. Fixed, so snapshots sharing a frame or timestamp
/// still order by id.
const SNAPSHOT_ID_WIDTH: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid token")]
    InvalidToken,
    #[error("stored permission label {0:?} is unknown")]
    CorruptPermission(String),
    #[error("play {0} has been destroyed")]
    Destroyed(PlayId),
}

impl From<StoreError> for AmflowError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::InvalidToken => ErrorKind::BadRequest,
            StoreError::Destroyed(_) => ErrorKind::InvalidStatus,
            StoreError::Backend(_)
            | StoreError::Encode(_)
            | StoreError::CorruptPermission(_) => ErrorKind::RuntimeError,
        };
        AmflowError::new(kind, err.to_string())
    }
}

/// Result of offering a tick to the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Newer than every tick before it; persisted and to be broadcast.
    Accepted,
    /// At or below the latest accepted frame; dropped without effect.
    Ignored,
}

/// Key names of one play.
#[derive(Clone, Debug)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(play_id: &PlayId) -> Self {
        Self {
            prefix: format!("play:{play_id}:"),
        }
    }

    pub fn token(&self, hash: &str) -> String {
        format!("{}token:{hash}", self.prefix)
    }

    pub fn event(&self, id: &str) -> String {
        format!("{}event:{id}", self.prefix)
    }

    pub fn unfiltered_index(&self) -> String {
        format!("{}index:all", self.prefix)
    }

    pub fn filtered_index(&self) -> String {
        format!("{}index:filtered", self.prefix)
    }

    pub fn snapshot(&self, id: &str) -> String {
        format!("{}snapshot:{id}", self.prefix)
    }

    pub fn snapshots_by_frame(&self) -> String {
        format!("{}snapshots:frame", self.prefix)
    }

    pub fn snapshots_by_timestamp(&self) -> String {
        format!("{}snapshots:timestamp", self.prefix)
    }

    /// One scan prefix per namespace. Together they cover every key the
    /// play can create.
    pub fn namespaces(&self) -> [String; 7] {
        [
            self.token(""),
            self.event(""),
            self.unfiltered_index(),
            self.filtered_index(),
            self.snapshot(""),
            self.snapshots_by_frame(),
            self.snapshots_by_timestamp(),
        ]
    }
}

/// The ordered log of one play.
pub struct PlayStore {
    play_id: PlayId,
    keys: KeySpace,
    backend: Arc<dyn KvBackend>,
    latest_frame: Frame,
    next_event_id: u64,
    next_snapshot_id: u64,
    destroyed: bool,
}

impl PlayStore {
    pub fn new(play_id: PlayId, backend: Arc<dyn KvBackend>) -> Self {
        Self {
            keys: KeySpace::new(&play_id),
            play_id,
            backend,
            latest_frame: -1,
            next_event_id: 1,
            next_snapshot_id: 1,
            destroyed: false,
        }
    }

    pub fn play_id(&self) -> &PlayId {
        &self.play_id
    }

    /// Highest accepted frame, or -1 before the first tick.
    pub fn latest_frame(&self) -> Frame {
        self.latest_frame
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Offer a tick to the log.
    ///
    /// A tick at or below the latest accepted frame is ignored: no error, no
    /// write, and the caller must not broadcast it. Otherwise every
    /// non-transient event is persisted and indexed, and ignorable events are
    /// kept out of the filtered index.
    pub fn send_tick(&mut self, tick: &Tick) -> Result<TickOutcome, StoreError> {
        self.ensure_live()?;
        if tick.frame <= self.latest_frame {
            debug!(
                "play {}: ignoring stale tick {} (latest {})",
                self.play_id, tick.frame, self.latest_frame
            );
            return Ok(TickOutcome::Ignored);
        }

        let persisted: Vec<&Event> = tick
            .events
            .iter()
            .filter(|event| !event.flags.is_transient())
            .collect();
        if persisted.is_empty() {
            self.latest_frame = tick.frame;
            return Ok(TickOutcome::Accepted);
        }

        let first_id = self.next_event_id;
        self.next_event_id += persisted.len() as u64;
        let ids = padded_ids(first_id, persisted.len());

        for (id, event) in ids.iter().zip(persisted) {
            let body = serde_json::to_string(event)?;
            self.backend.set(&self.keys.event(id), &body)?;
            self.backend
                .zadd(&self.keys.unfiltered_index(), tick.frame, id)?;
            if !event.flags.is_ignorable() {
                self.backend.zadd(&self.keys.filtered_index(), tick.frame, id)?;
            }
        }
        // The frame only moves on once every write has succeeded.
        self.latest_frame = tick.frame;
        Ok(TickOutcome::Accepted)
    }

    /// Frames `begin..end`, clipped to the latest accepted frame, in packed
    /// form.
    ///
    /// `Ok(None)` means nothing has been accepted in the range yet. Otherwise
    /// every frame of the clipped range is covered exactly once. The packs are
    /// built straight from the index, so the work is proportional to the
    /// number of stored events, not to the length of the range. An index
    /// entry whose event body is missing or unreadable is logged and skipped.
    pub fn get_tick_list(
        &self,
        opts: &GetTickListOptions,
    ) -> Result<Option<Vec<TickPack>>, StoreError> {
        let from = opts.begin;
        let to = opts.end.saturating_sub(1).min(self.latest_frame);
        if to < from {
            return Ok(None);
        }

        let index = if opts.exclude_ignorable {
            self.keys.filtered_index()
        } else {
            self.keys.unfiltered_index()
        };
        let entries = self.backend.zrange_by_score(
            &index,
            Bound::Included(from),
            Bound::Included(to),
            Order::Ascending,
            None,
        )?;

        // Entries come sorted by frame, so events of one frame are adjacent.
        let mut frames: Vec<(Frame, Vec<Event>)> = Vec::new();
        for (frame, id) in entries {
            let Some(event) = self.load_event(&id)? else {
                continue;
            };
            match frames.last_mut() {
                Some((last, events)) if *last == frame => events.push(event),
                _ => frames.push((frame, vec![event])),
            }
        }

        let mut packs = Vec::with_capacity(2 * frames.len() + 1);
        let mut next = Some(from);
        for (frame, events) in frames {
            if let Some(first) = next.filter(|first| *first < frame) {
                push_gap(&mut packs, first, frame - 1);
            }
            packs.push(TickPack::Tick(Tick::with_events(frame, events)));
            next = frame.checked_add(1);
        }
        if let Some(first) = next {
            push_gap(&mut packs, first, to);
        }
        Ok(Some(packs))
    }

    fn load_event(&self, id: &str) -> Result<Option<Event>, StoreError> {
        let Some(body) = self.backend.get(&self.keys.event(id))? else {
            warn!("play {}: index references missing event {id}", self.play_id);
            return Ok(None);
        };
        match serde_json::from_str(&body) {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                warn!("play {}: event {id} is unreadable: {e}", self.play_id);
                Ok(None)
            }
        }
    }

    /// Store a snapshot under a fresh id and index it by frame and by
    /// timestamp.
    pub fn put_start_point(&mut self, start_point: &StartPoint) -> Result<(), StoreError> {
        self.ensure_live()?;
        let id = format!("{:0width$}", self.next_snapshot_id, width = SNAPSHOT_ID_WIDTH);
        self.next_snapshot_id += 1;

        let body = serde_json::to_string(start_point)?;
        self.backend.set(&self.keys.snapshot(&id), &body)?;
        self.backend
            .zadd(&self.keys.snapshots_by_frame(), start_point.frame, &id)?;
        self.backend
            .zadd(&self.keys.snapshots_by_timestamp(), start_point.timestamp, &id)?;
        Ok(())
    }

    /// Select a snapshot.
    ///
    /// - no selector, or `frame == 0`: the earliest snapshot by frame;
    /// - `timestamp`: the latest snapshot taken strictly before it;
    /// - `frame`: the latest snapshot strictly before that frame.
    ///
    /// `Ok(None)` when nothing qualifies or the stored payload is corrupt.
    pub fn get_start_point(
        &self,
        opts: &GetStartPointOptions,
    ) -> Result<Option<StartPoint>, StoreError> {
        let hit = match (opts.frame, opts.timestamp) {
            (None, None) | (Some(0), _) => self.backend.zrange_by_score(
                &self.keys.snapshots_by_frame(),
                Bound::Unbounded,
                Bound::Unbounded,
                Order::Ascending,
                Some(1),
            )?,
            (_, Some(timestamp)) => self.backend.zrange_by_score(
                &self.keys.snapshots_by_timestamp(),
                Bound::Unbounded,
                Bound::Excluded(timestamp),
                Order::Descending,
                Some(1),
            )?,
            (Some(frame), None) => self.backend.zrange_by_score(
                &self.keys.snapshots_by_frame(),
                Bound::Unbounded,
                Bound::Excluded(frame),
                Order::Descending,
                Some(1),
            )?,
        };
        let Some((_, id)) = hit.into_iter().next() else {
            return Ok(None);
        };

        let Some(body) = self.backend.get(&self.keys.snapshot(&id))? else {
            warn!("play {}: index references missing snapshot {id}", self.play_id);
            return Ok(None);
        };
        match serde_json::from_str(&body) {
            Ok(start_point) => Ok(Some(start_point)),
            Err(e) => {
                warn!("play {}: snapshot {id} is unreadable: {e}", self.play_id);
                Ok(None)
            }
        }
    }

    /// Mint a token bound to `kind`. Only the token's hash is stored.
    pub fn create_play_token(&self, kind: PermissionKind) -> Result<String, StoreError> {
        self.ensure_live()?;
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        self.backend
            .set(&self.keys.token(&hash_token(&token)), kind.label())?;
        Ok(token)
    }

    /// Permission bound to `token`.
    pub fn authenticate(&self, token: &str) -> Result<Permission, StoreError> {
        let label = self
            .backend
            .get(&self.keys.token(&hash_token(token)))?
            .ok_or(StoreError::InvalidToken)?;
        let kind =
            PermissionKind::from_label(&label).ok_or(StoreError::CorruptPermission(label))?;
        Ok(kind.permission())
    }

    /// Delete every key of this play. Safe to call again afterwards.
    ///
    /// On a backend failure the store stays live so the call can be retried.
    pub fn destroy(&mut self) -> Result<(), StoreError> {
        if self.destroyed {
            return Ok(());
        }
        let mut removed = 0usize;
        for prefix in self.keys.namespaces() {
            for key in self.backend.scan_prefix(&prefix)? {
                if self.backend.delete(&key)? {
                    removed += 1;
                }
            }
        }
        self.destroyed = true;
        self.latest_frame = -1;
        self.next_event_id = 1;
        self.next_snapshot_id = 1;
        debug!("play {}: destroyed, {removed} keys removed", self.play_id);
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.destroyed {
            return Err(StoreError::Destroyed(self.play_id.clone()));
        }
        Ok(())
    }
}

/// Event-free frames `first..=last` in the same shape `codec::pack` gives
/// them. Nothing when the gap is empty.
fn push_gap(packs: &mut Vec<TickPack>, first: Frame, last: Frame) {
    match first.cmp(&last) {
        Ordering::Less => packs.push(TickPack::Range(TickFrame {
            from: first,
            to: last,
        })),
        Ordering::Equal => packs.push(TickPack::Frame(first)),
        Ordering::Greater => {}
    }
}

/// Ids `first..first + count`, zero-padded to the width of the largest.
fn padded_ids(first: u64, count: usize) -> Vec<String> {
    let last = first + count as u64 - 1;
    let width = last.to_string().len();
    (first..=last)
        .map(|id| format!("{id:0width$}"))
        .collect()
}

fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}
