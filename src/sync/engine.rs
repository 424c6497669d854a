//! Client reconciliation engine — optimistic local board and snapshot merge.
//!
//! DESIGN
//! ======
//! The engine holds two boards: the local working copy the UI renders, and
//! the last authoritative snapshot. Local edits land on the working copy at
//! once, are buffered in a coalescing scheduler, and leave as `Mutation`s
//! through the outbox when their quiet period ends. The engine never does
//! I/O and never reads a clock; callers pass `now` and drain the outbox.
//!
//! OWNERSHIP
//! =========
//! An id the client has edited is *owned*. While its write is buffered it is
//! `Pending` and snapshots never override it. Once flushed it is
//! `AwaitingEcho`: a snapshot whose value matches within tolerance releases
//! it, anything else is treated as not caught up and the local value stays.
//! Awaiting-echo ownership lapses after the ownership TTL and the id falls
//! back to the authoritative value, so every client converges even when a
//! later writer legitimately won.
//!
//! DELETES
//! =======
//! Deleted ids are remembered for a grace period and suppressed from every
//! snapshot during it. Deleting cancels buffered writes for the id and
//! sends the removal immediately. Ids that appear in a snapshot's server
//! tombstones lose their local ownership and buffered writes. Objects and
//! positions keep separate deleted sets, so an entity may share an id with
//! an object.
//!
//! A zone that disappears in a snapshot takes its pin with it: locally
//! owned entities still pinned to it are converted to absolute coordinates
//! before the merge, the same way the server unpins its own copy.
//!
//! FAILURES
//! ========
//! A rejected write is re-buffered, newer buffered values winning, until it
//! has failed `max_retries` times. After that, or on a non-retryable error,
//! the id is rolled back to the authoritative value and a `Notice` is queued
//! for the UI. A write refused because the id was deleted elsewhere simply
//! drops the id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::env_parse;
use crate::doc::{self, Board, BoardObject, DocError, EntryKind, Point, Position};
use crate::frame::{FRAME_MESSAGE, Frame};
use crate::protocol::Mutation;
use crate::sync::scheduler::{CoalescingScheduler, Due};

const DEFAULT_QUIET_PERIOD_MS: u64 = 500;
const DEFAULT_COALESCE_SLACK_MS: u64 = 100;
const DEFAULT_TOMBSTONE_GRACE_MS: u64 = 3_000;
const DEFAULT_RECONCILE_SETTLE_MS: u64 = 50;
const DEFAULT_POSITION_TOLERANCE: f64 = 0.5;
const DEFAULT_OWNERSHIP_TTL_MS: u64 = 5_000;
const DEFAULT_MAX_RETRIES: u32 = 3;

const CODE_OBJECT_DELETED: &str = "E_OBJECT_DELETED";

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub quiet_period: Duration,
    pub coalesce_slack: Duration,
    pub tombstone_grace: Duration,
    pub reconcile_settle: Duration,
    /// Largest per-axis delta at which a snapshot counts as caught up.
    pub position_tolerance: f64,
    pub ownership_ttl: Duration,
    pub max_retries: u32,
}

impl EngineConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let ms = |key: &str, default: u64| Duration::from_millis(env_parse(key, default));
        Self {
            quiet_period: ms("SYNC_QUIET_PERIOD_MS", DEFAULT_QUIET_PERIOD_MS),
            coalesce_slack: ms("SYNC_COALESCE_SLACK_MS", DEFAULT_COALESCE_SLACK_MS),
            tombstone_grace: ms("SYNC_TOMBSTONE_GRACE_MS", DEFAULT_TOMBSTONE_GRACE_MS),
            reconcile_settle: ms("SYNC_RECONCILE_SETTLE_MS", DEFAULT_RECONCILE_SETTLE_MS),
            position_tolerance: env_parse("SYNC_POSITION_TOLERANCE", DEFAULT_POSITION_TOLERANCE),
            ownership_ttl: ms("SYNC_OWNERSHIP_TTL_MS", DEFAULT_OWNERSHIP_TTL_MS),
            max_retries: env_parse("SYNC_MAX_RETRIES", DEFAULT_MAX_RETRIES),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(DEFAULT_QUIET_PERIOD_MS),
            coalesce_slack: Duration::from_millis(DEFAULT_COALESCE_SLACK_MS),
            tombstone_grace: Duration::from_millis(DEFAULT_TOMBSTONE_GRACE_MS),
            reconcile_settle: Duration::from_millis(DEFAULT_RECONCILE_SETTLE_MS),
            position_tolerance: DEFAULT_POSITION_TOLERANCE,
            ownership_ttl: Duration::from_millis(DEFAULT_OWNERSHIP_TTL_MS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("no snapshot received yet")]
    NotSynced,
    #[error("unknown object: {0}")]
    UnknownObject(String),
    #[error("object cannot be resized: {0}")]
    NotResizable(String),
    #[error("id was deleted: {0}")]
    Deleted(String),
    #[error(transparent)]
    Doc(#[from] DocError),
}

/// Effect of a local edit on the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edit {
    Applied,
    /// Already at that value; nothing buffered.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Pending,
    AwaitingEcho { since: Instant },
}

/// What one snapshot merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconcile {
    pub adopted: usize,
    pub kept_local: usize,
    pub suppressed: usize,
    pub removed: usize,
    /// The snapshot was older than the last one applied and was ignored.
    pub stale: bool,
}

/// Server refusal of a flushed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: Option<String>,
    pub message: String,
    pub retryable: bool,
}

impl Rejection {
    #[must_use]
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            code: frame.error_code().map(str::to_owned),
            message: frame
                .data
                .get(FRAME_MESSAGE)
                .and_then(|v| v.as_str())
                .unwrap_or("request failed")
                .to_owned(),
            retryable: frame.is_retryable(),
        }
    }

    fn is_deleted(&self) -> bool {
        self.code.as_deref() == Some(CODE_OBJECT_DELETED)
    }
}

/// Non-blocking failure report for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub action: &'static str,
    pub ids: Vec<String>,
    pub message: String,
}

/// A user-level edit, as sent by the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateObject { object_id: String, object: BoardObject },
    UpdateObject { object_id: String, object: BoardObject },
    MoveObject { object_id: String, to: Point },
    ResizeObject { object_id: String, width: f64, height: f64 },
    DeleteObject { object_id: String },
    PlaceEntity { entity_id: String, position: Position },
    MoveEntity { entity_id: String, to: Point },
    PinEntity { entity_id: String, zone_id: String },
    UnpinEntity { entity_id: String },
    RemoveEntity { entity_id: String },
    Select { id: String },
    Deselect { id: String },
    EndGesture,
}

#[derive(Debug, Clone)]
struct RetryRemoval {
    mutation: Mutation,
    not_before: Instant,
}

// =============================================================================
// LANE
// =============================================================================

/// Buffered writes and ownership for one kind of entry.
#[derive(Debug)]
struct Lane<V> {
    writes: CoalescingScheduler<String, V>,
    owned: HashMap<String, Ownership>,
    /// Attempt count of each flushed write still awaiting an answer.
    in_flight: HashMap<String, u32>,
    /// Locally deleted ids and when.
    deleted: HashMap<String, Instant>,
    removal_attempts: HashMap<String, u32>,
}

/// Ids sorted by how a rejection was resolved.
#[derive(Debug, Default)]
struct Resolution {
    requeued: Vec<String>,
    gone: Vec<String>,
    rolled_back: Vec<String>,
}

impl<V: Clone> Lane<V> {
    fn new(config: &EngineConfig) -> Self {
        Self {
            writes: CoalescingScheduler::new(config.quiet_period, config.coalesce_slack),
            owned: HashMap::new(),
            in_flight: HashMap::new(),
            deleted: HashMap::new(),
            removal_attempts: HashMap::new(),
        }
    }

    fn stage(&mut self, id: String, value: V, now: Instant) {
        self.owned.insert(id.clone(), Ownership::Pending);
        self.writes.schedule(id, value, now);
    }

    fn owns(&self, id: &str) -> bool {
        self.owned.contains_key(id)
    }

    /// Drop every trace of local intent for `id`. Returns whether any existed.
    fn forget(&mut self, id: &str) -> bool {
        let key = id.to_owned();
        let had_write = self.writes.cancel(&key).is_some();
        let had_owner = self.owned.remove(id).is_some();
        self.in_flight.remove(id);
        had_write || had_owner
    }

    fn bury(&mut self, id: &str, now: Instant) {
        self.deleted.insert(id.to_owned(), now);
        self.removal_attempts.insert(id.to_owned(), 0);
    }

    fn unbury(&mut self, id: &str) {
        self.deleted.remove(id);
        self.removal_attempts.remove(id);
    }

    fn is_deleted(&self, id: &str) -> bool {
        self.deleted.contains_key(id)
    }

    fn expire_deleted(&mut self, now: Instant, grace: Duration) {
        self.deleted.retain(|_, at| now.duration_since(*at) < grace);
        let deleted = &self.deleted;
        self.removal_attempts.retain(|id, _| deleted.contains_key(id));
    }

    /// Count one more failed removal of `id`. False once `max_retries` is spent.
    fn retry_removal(&mut self, id: &str, max_retries: u32) -> bool {
        let attempts = self.removal_attempts.get(id).copied().unwrap_or(0);
        if attempts >= max_retries {
            return false;
        }
        self.removal_attempts.insert(id.to_owned(), attempts + 1);
        true
    }

    fn await_echo(&mut self, id: String, now: Instant) {
        self.owned.insert(id, Ownership::AwaitingEcho { since: now });
    }

    fn mark_flushed(&mut self, due: &[Due<String, V>], now: Instant) {
        for d in due {
            self.owned.insert(d.key.clone(), Ownership::AwaitingEcho { since: now });
            self.in_flight.insert(d.key.clone(), d.attempts);
        }
    }

    /// Release awaiting-echo ownership older than `ttl`, restoring the
    /// authoritative value for each released id.
    fn lapse(
        &mut self,
        now: Instant,
        ttl: Duration,
        local: &mut BTreeMap<String, V>,
        authoritative: Option<&BTreeMap<String, V>>,
    ) -> Vec<String> {
        let expired: Vec<String> = self
            .owned
            .iter()
            .filter_map(|(id, o)| match o {
                Ownership::AwaitingEcho { since } if now.duration_since(*since) >= ttl => Some(id.clone()),
                _ => None,
            })
            .collect();
        for id in &expired {
            self.owned.remove(id);
            self.in_flight.remove(id);
            restore(id, local, authoritative);
        }
        expired
    }

    /// Merge `incoming` into `local` following the ownership rules.
    fn merge(
        &mut self,
        local: &mut BTreeMap<String, V>,
        incoming: &BTreeMap<String, V>,
        same: impl Fn(&V, &V) -> bool,
        stats: &mut Reconcile,
    ) {
        let mut previous = std::mem::take(local);

        for (id, theirs) in incoming {
            if self.is_deleted(id) {
                stats.suppressed += 1;
                continue;
            }
            let mine = previous.remove(id);
            let keep = match (self.owned.get(id), &mine) {
                (Some(Ownership::Pending), Some(_)) => true,
                (Some(Ownership::AwaitingEcho { .. }), Some(m)) => !same(m, theirs),
                _ => false,
            };
            match mine {
                Some(m) if keep => {
                    stats.kept_local += 1;
                    local.insert(id.clone(), m);
                }
                _ => {
                    self.owned.remove(id);
                    self.in_flight.remove(id);
                    stats.adopted += 1;
                    local.insert(id.clone(), theirs.clone());
                }
            }
        }

        // Whatever is left was absent from the snapshot.
        for (id, mine) in previous {
            if self.owns(&id) {
                stats.kept_local += 1;
                local.insert(id, mine);
            } else {
                stats.removed += 1;
            }
        }
    }

    /// Sort the ids of a rejected write into requeued, gone and rolled back.
    fn reject(&mut self, entries: Vec<(String, V)>, rejection: &Rejection, max_retries: u32, now: Instant) -> Resolution {
        let mut out = Resolution::default();
        for (id, value) in entries {
            let attempts = self.in_flight.remove(&id).unwrap_or(0);
            if rejection.is_deleted() {
                self.forget(&id);
                out.gone.push(id);
            } else if rejection.retryable && attempts < max_retries {
                self.writes.requeue(id.clone(), value, attempts + 1, now);
                self.owned.insert(id.clone(), Ownership::Pending);
                out.requeued.push(id);
            } else {
                self.forget(&id);
                out.rolled_back.push(id);
            }
        }
        out
    }

    fn clear(&mut self) {
        self.writes.clear();
        self.owned.clear();
        self.in_flight.clear();
        self.deleted.clear();
        self.removal_attempts.clear();
    }
}

/// Put the authoritative value for `id` back into `local`, or remove it.
fn restore<V: Clone>(id: &str, local: &mut BTreeMap<String, V>, authoritative: Option<&BTreeMap<String, V>>) {
    match authoritative.and_then(|a| a.get(id)) {
        Some(value) => {
            local.insert(id.to_owned(), value.clone());
        }
        None => {
            local.remove(id);
        }
    }
}

/// One mutation for a flushed group: the single form for one entry, the
/// batch form otherwise.
fn group_mutation<V>(
    mut due: Vec<Due<String, V>>,
    single: impl FnOnce(String, V) -> Mutation,
    batch: impl FnOnce(BTreeMap<String, V>) -> Mutation,
) -> Option<Mutation> {
    match due.len() {
        0 => None,
        1 => due.pop().map(|d| single(d.key, d.value)),
        _ => Some(batch(due.into_iter().map(|d| (d.key, d.value)).collect())),
    }
}

// =============================================================================
// ENGINE
// =============================================================================

#[derive(Debug)]
pub struct SyncEngine {
    board_id: Uuid,
    config: EngineConfig,
    local: Option<Board>,
    authoritative: Option<Board>,
    objects: Lane<BoardObject>,
    positions: Lane<Position>,
    retry_removals: Vec<RetryRemoval>,
    reconciling_until: Option<Instant>,
    /// Set by a reconnect: the next snapshot is taken whatever its version.
    accept_any_version: bool,
    selection: HashSet<String>,
    outbox: Vec<Mutation>,
    notices: Vec<Notice>,
    resync_requested: bool,
}

impl SyncEngine {
    #[must_use]
    pub fn new(board_id: Uuid, config: EngineConfig) -> Self {
        Self {
            board_id,
            objects: Lane::new(&config),
            positions: Lane::new(&config),
            config,
            local: None,
            authoritative: None,
            retry_removals: Vec::new(),
            reconciling_until: None,
            accept_any_version: false,
            selection: HashSet::new(),
            outbox: Vec::new(),
            notices: Vec::new(),
            resync_requested: true,
        }
    }

    #[must_use]
    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The working copy the UI renders.
    #[must_use]
    pub fn board(&self) -> Option<&Board> {
        self.local.as_ref()
    }

    #[must_use]
    pub fn authoritative(&self) -> Option<&Board> {
        self.authoritative.as_ref()
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.local.is_some()
    }

    #[must_use]
    pub fn is_reconciling(&self, now: Instant) -> bool {
        self.reconciling_until.is_some_and(|until| now < until)
    }

    #[must_use]
    pub fn owns(&self, id: &str) -> bool {
        self.objects.owns(id) || self.positions.owns(id)
    }

    /// Whether `id` was deleted here, as an object or as an entity position.
    #[must_use]
    pub fn is_locally_deleted(&self, id: &str) -> bool {
        self.objects.is_deleted(id) || self.positions.is_deleted(id)
    }

    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.objects.writes.is_empty() || !self.positions.writes.is_empty() || !self.retry_removals.is_empty()
    }

    /// When `tick` next has something to release.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.objects.writes.next_deadline(),
            self.positions.writes.next_deadline(),
            self.retry_removals.iter().map(|r| r.not_before).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    #[must_use]
    pub fn absolute_position(&self, entity_id: &str) -> Option<Point> {
        self.local.as_ref()?.absolute_position(entity_id)
    }

    #[must_use]
    pub fn selection(&self) -> &HashSet<String> {
        &self.selection
    }

    // =========================================================================
    // OUTPUTS
    // =========================================================================

    /// Mutations ready to send, in order.
    pub fn drain_outbox(&mut self) -> Vec<Mutation> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Ask for a full snapshot on the next opportunity.
    pub fn request_resync(&mut self) {
        self.resync_requested = true;
    }

    /// Whether a resync was requested since the last call.
    pub fn take_resync_request(&mut self) -> bool {
        std::mem::take(&mut self.resync_requested)
    }

    // =========================================================================
    // SNAPSHOTS
    // =========================================================================

    /// Merge an authoritative board into the working copy.
    pub fn apply_snapshot(&mut self, snapshot: Board, now: Instant) -> Reconcile {
        if snapshot.id != self.board_id {
            warn!(board_id = %self.board_id, other = %snapshot.id, "sync: ignoring snapshot for another board");
            return Reconcile { stale: true, ..Reconcile::default() };
        }
        if !self.accept_any_version
            && let Some(current) = &self.authoritative
            && snapshot.version < current.version
        {
            debug!(board_id = %self.board_id, version = snapshot.version, current = current.version, "sync: ignoring stale snapshot");
            return Reconcile { stale: true, ..Reconcile::default() };
        }

        self.reconciling_until = Some(now + self.config.reconcile_settle);
        self.expire(now);
        self.release_server_deleted(&snapshot);
        self.unpin_orphaned_children(&snapshot, now);

        let mut stats = Reconcile::default();
        let tolerance = self.config.position_tolerance;
        let mut local = match self.local.take() {
            Some(local) => local,
            None => Board::new(snapshot.id, snapshot.name.clone(), snapshot.owner_id),
        };
        self.objects.merge(
            &mut local.objects,
            &snapshot.objects,
            |a, b| a.approx_eq(b, tolerance),
            &mut stats,
        );
        self.positions.merge(
            &mut local.positions,
            &snapshot.positions,
            |a, b| a.approx_eq(b, tolerance),
            &mut stats,
        );
        local.name.clone_from(&snapshot.name);
        local.owner_id = snapshot.owner_id;
        local.tombstones.clone_from(&snapshot.tombstones);
        local.version = snapshot.version;
        local.created_at.clone_from(&snapshot.created_at);
        local.updated_at.clone_from(&snapshot.updated_at);

        self.selection
            .retain(|id| local.objects.contains_key(id) || local.positions.contains_key(id));
        self.local = Some(local);
        self.authoritative = Some(snapshot);
        self.accept_any_version = false;

        debug!(
            board_id = %self.board_id,
            adopted = stats.adopted,
            kept_local = stats.kept_local,
            suppressed = stats.suppressed,
            removed = stats.removed,
            "sync: snapshot applied"
        );
        stats
    }

    /// Ids the server reports deleted carry no local intent worth keeping.
    fn release_server_deleted(&mut self, snapshot: &Board) {
        for id in snapshot.buried(EntryKind::Object) {
            if self.objects.forget(id) {
                info!(board_id = %self.board_id, object_id = id, "sync: dropping local edits for object deleted on server");
            }
        }
        for id in snapshot.buried(EntryKind::Position) {
            if self.positions.forget(id) {
                info!(board_id = %self.board_id, entity_id = id, "sync: dropping local edits for entity removed on server");
            }
        }
    }

    /// Convert owned entities pinned to a zone that `snapshot` no longer has
    /// to absolute coordinates, measured from the zone's local origin.
    /// Buffered writes for them are rewritten to the absolute value.
    fn unpin_orphaned_children(&mut self, snapshot: &Board, now: Instant) {
        let Some(board) = self.local.as_mut() else {
            return;
        };
        let vanishing: Vec<String> = board
            .objects
            .iter()
            .filter(|(id, object)| {
                object.is_zone()
                    && !self.objects.owns(id)
                    && !snapshot.objects.get(*id).is_some_and(BoardObject::is_zone)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for zone_id in vanishing {
            let orphans: Vec<String> = board
                .positions
                .iter()
                .filter(|(id, p)| p.parent_id.as_deref() == Some(zone_id.as_str()) && self.positions.owns(id))
                .map(|(id, _)| id.clone())
                .collect();
            for entity_id in orphans {
                let Ok(position) = board.unpinned_position(&entity_id) else {
                    continue;
                };
                board.positions.insert(entity_id.clone(), position.clone());
                debug!(board_id = %self.board_id, %zone_id, %entity_id, "sync: unpinning entity from vanished zone");
                if self.positions.writes.contains(&entity_id) {
                    self.positions.stage(entity_id, position, now);
                }
            }
        }
    }

    // =========================================================================
    // TIME
    // =========================================================================

    /// Advance time: expire deleted ids and lapsed ownership, release due
    /// retries, and flush due writes. Returns how many mutations were queued.
    pub fn tick(&mut self, now: Instant) -> usize {
        self.expire(now);
        let queued = self.outbox.len();
        self.release_retry_removals(now);
        self.flush(now, false);
        self.outbox.len() - queued
    }

    /// Flush every buffered write immediately, e.g. when a gesture ends.
    pub fn flush_all(&mut self, now: Instant) -> usize {
        let queued = self.outbox.len();
        self.flush(now, true);
        self.outbox.len() - queued
    }

    fn expire(&mut self, now: Instant) {
        let grace = self.config.tombstone_grace;
        self.objects.expire_deleted(now, grace);
        self.positions.expire_deleted(now, grace);

        let ttl = self.config.ownership_ttl;
        let Some(local) = self.local.as_mut() else {
            return;
        };
        let auth = self.authoritative.as_ref();
        let mut lapsed = self
            .objects
            .lapse(now, ttl, &mut local.objects, auth.map(|a| &a.objects));
        lapsed.extend(
            self.positions
                .lapse(now, ttl, &mut local.positions, auth.map(|a| &a.positions)),
        );
        if !lapsed.is_empty() {
            info!(board_id = %self.board_id, count = lapsed.len(), "sync: ownership lapsed, adopting server values");
        }
    }

    fn release_retry_removals(&mut self, now: Instant) {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retry_removals)
            .into_iter()
            .partition(|r| r.not_before <= now);
        self.retry_removals = waiting;
        self.outbox.extend(ready.into_iter().map(|r| r.mutation));
    }

    fn flush(&mut self, now: Instant, everything: bool) {
        let mut objects = Vec::new();
        let mut positions = Vec::new();
        if everything {
            objects = self.objects.writes.take_all();
            positions = self.positions.writes.take_all();
        } else {
            self.objects.writes.flush_due(now, |due| objects = due);
            self.positions.writes.flush_due(now, |due| positions = due);
        }

        // A zone must reach the server before positions pinned to it.
        for due in &positions {
            if let Some(zone_id) = &due.value.parent_id
                && let Some(zone) = self.objects.writes.take(zone_id)
            {
                objects.push(zone);
            }
        }

        self.objects.mark_flushed(&objects, now);
        self.positions.mark_flushed(&positions, now);

        let object_count = objects.len();
        let position_count = positions.len();
        let flushed = [
            group_mutation(
                objects,
                |object_id, object| Mutation::UpsertObject { object_id, object },
                |objects| Mutation::BatchUpsertObjects { objects },
            ),
            group_mutation(
                positions,
                |entity_id, position| Mutation::UpsertPosition { entity_id, position },
                |positions| Mutation::BatchUpsertPositions { positions },
            ),
        ];
        for mutation in flushed.into_iter().flatten() {
            self.outbox.push(mutation);
        }
        if object_count + position_count > 0 {
            info!(
                board_id = %self.board_id,
                objects = object_count,
                positions = position_count,
                "sync: flushing buffered writes"
            );
        }
    }

    // =========================================================================
    // LOCAL EDITS: OBJECTS
    // =========================================================================

    fn writable(&self, kind: EntryKind, id: &str) -> Result<(), EngineError> {
        if self.local.is_none() {
            return Err(EngineError::NotSynced);
        }
        let deleted = match kind {
            EntryKind::Object => self.objects.is_deleted(id),
            EntryKind::Position => self.positions.is_deleted(id),
        };
        if deleted {
            return Err(EngineError::Deleted(id.to_owned()));
        }
        Ok(())
    }

    /// Add a new object to the board.
    ///
    /// # Errors
    ///
    /// `NotSynced` before the first snapshot, `Deleted` for a deleted id.
    pub fn create_object(&mut self, object_id: &str, object: BoardObject, now: Instant) -> Result<Edit, EngineError> {
        self.put_object(object_id, object, now)
    }

    /// Replace an object's content (label, color, text, status).
    ///
    /// # Errors
    ///
    /// `UnknownObject` if it is not on the board, plus the create errors.
    pub fn update_object(&mut self, object_id: &str, object: BoardObject, now: Instant) -> Result<Edit, EngineError> {
        let Some(board) = self.local.as_ref() else {
            return Err(EngineError::NotSynced);
        };
        match board.objects.get(object_id) {
            None => return Err(EngineError::UnknownObject(object_id.to_owned())),
            Some(existing) if *existing == object => return Ok(Edit::Unchanged),
            Some(_) => {}
        }
        self.put_object(object_id, object, now)
    }

    fn put_object(&mut self, object_id: &str, object: BoardObject, now: Instant) -> Result<Edit, EngineError> {
        self.writable(EntryKind::Object, object_id)?;
        let Some(board) = self.local.as_mut() else {
            return Err(EngineError::NotSynced);
        };
        let loses_zone = board.objects.get(object_id).is_some_and(BoardObject::is_zone) && !object.is_zone();
        if loses_zone {
            self.unpin_local_children(object_id, now);
        }
        if let Some(board) = self.local.as_mut() {
            board.objects.insert(object_id.to_owned(), object.clone());
        }
        self.objects.stage(object_id.to_owned(), object, now);
        Ok(Edit::Applied)
    }

    /// Drag an object to a new absolute origin. Entities pinned to a zone
    /// follow it without being rewritten.
    ///
    /// # Errors
    ///
    /// `UnknownObject`, `Deleted`, or `NotSynced`.
    pub fn move_object(&mut self, object_id: &str, to: Point, now: Instant) -> Result<Edit, EngineError> {
        self.geometry_edit(object_id, now, |object| {
            if object.origin() == to {
                return Ok(false);
            }
            object.set_origin(to);
            Ok(true)
        })
    }

    /// Resize a zone.
    ///
    /// # Errors
    ///
    /// `NotResizable` for text, otherwise as [`SyncEngine::move_object`].
    pub fn resize_object(&mut self, object_id: &str, width: f64, height: f64, now: Instant) -> Result<Edit, EngineError> {
        self.geometry_edit(object_id, now, |object| {
            if object.size() == Some((width, height)) {
                return Ok(false);
            }
            if object.resize(width, height) {
                Ok(true)
            } else {
                Err(EngineError::NotResizable(object_id.to_owned()))
            }
        })
    }

    fn geometry_edit<F>(&mut self, object_id: &str, now: Instant, change: F) -> Result<Edit, EngineError>
    where
        F: FnOnce(&mut BoardObject) -> Result<bool, EngineError>,
    {
        self.writable(EntryKind::Object, object_id)?;
        let object = self
            .local
            .as_mut()
            .and_then(|b| b.objects.get_mut(object_id))
            .ok_or_else(|| EngineError::UnknownObject(object_id.to_owned()))?;
        if !change(object)? {
            return Ok(Edit::Unchanged);
        }
        let value = object.clone();
        self.objects.stage(object_id.to_owned(), value, now);
        Ok(Edit::Applied)
    }

    /// Delete an object locally and send the removal at once.
    ///
    /// Entities pinned to a deleted zone are converted to absolute
    /// coordinates here, as the server does on its side.
    ///
    /// # Errors
    ///
    /// `UnknownObject` if it is not on the board.
    pub fn delete_object(&mut self, object_id: &str, now: Instant) -> Result<Edit, EngineError> {
        self.writable(EntryKind::Object, object_id)?;
        let exists = self.local.as_ref().is_some_and(|b| b.objects.contains_key(object_id));
        if !exists {
            return Err(EngineError::UnknownObject(object_id.to_owned()));
        }
        self.unpin_local_children(object_id, now);
        if let Some(board) = self.local.as_mut() {
            board.objects.remove(object_id);
        }
        self.objects.forget(object_id);
        self.objects.bury(object_id, now);
        self.selection.remove(object_id);
        self.outbox.push(Mutation::RemoveObject { object_id: object_id.to_owned() });
        info!(board_id = %self.board_id, object_id, "sync: object deleted locally");
        Ok(Edit::Applied)
    }

    /// Convert the entities pinned to `zone_id` to absolute coordinates.
    ///
    /// Buffered writes for those entities are rewritten to the absolute
    /// value; the rest wait for the server's matching echo.
    fn unpin_local_children(&mut self, zone_id: &str, now: Instant) {
        let Some(board) = self.local.as_mut() else {
            return;
        };
        for entity_id in board.unpin_children(zone_id) {
            let Some(position) = board.positions.get(&entity_id).cloned() else {
                continue;
            };
            if self.positions.writes.contains(&entity_id) {
                self.positions.stage(entity_id, position, now);
            } else {
                self.positions.await_echo(entity_id, now);
            }
        }
    }

    // =========================================================================
    // LOCAL EDITS: POSITIONS
    // =========================================================================

    /// Create or replace an entity position as given.
    ///
    /// # Errors
    ///
    /// `Doc` when the parent is not a zone on the local board, plus
    /// `Deleted` and `NotSynced`.
    pub fn place_entity(&mut self, entity_id: &str, position: Position, now: Instant) -> Result<Edit, EngineError> {
        self.writable(EntryKind::Position, entity_id)?;
        let Some(board) = self.local.as_mut() else {
            return Err(EngineError::NotSynced);
        };
        board.validate_parent(&position)?;
        if board.positions.get(entity_id) == Some(&position) {
            return Ok(Edit::Unchanged);
        }
        board.positions.insert(entity_id.to_owned(), position.clone());
        self.positions.stage(entity_id.to_owned(), position, now);
        Ok(Edit::Applied)
    }

    /// Drag an entity to an absolute point, keeping its coordinate frame.
    ///
    /// # Errors
    ///
    /// `Doc(UnknownEntity)` if it has no position, plus `Deleted` and
    /// `NotSynced`.
    pub fn move_entity(&mut self, entity_id: &str, to: Point, now: Instant) -> Result<Edit, EngineError> {
        self.writable(EntryKind::Position, entity_id)?;
        let Some(board) = self.local.as_mut() else {
            return Err(EngineError::NotSynced);
        };
        let current = board
            .positions
            .get(entity_id)
            .ok_or_else(|| DocError::UnknownEntity(entity_id.to_owned()))?;
        let target = match &current.parent_id {
            Some(zone_id) => match board.zone_origin(zone_id) {
                Ok(origin) => {
                    let rel = doc::to_relative(to, origin);
                    Position::pinned(rel.x, rel.y, zone_id.clone())
                }
                Err(_) => Position::absolute(to.x, to.y),
            },
            None => Position::absolute(to.x, to.y),
        };
        if *current == target {
            return Ok(Edit::Unchanged);
        }
        board.positions.insert(entity_id.to_owned(), target.clone());
        self.positions.stage(entity_id.to_owned(), target, now);
        Ok(Edit::Applied)
    }

    /// Pin an entity to a zone, converting absolute → relative once.
    ///
    /// # Errors
    ///
    /// `Doc` for an unknown entity or a parent that is not a zone.
    pub fn pin_entity(&mut self, entity_id: &str, zone_id: &str, now: Instant) -> Result<Edit, EngineError> {
        self.writable(EntryKind::Position, entity_id)?;
        let Some(board) = self.local.as_ref() else {
            return Err(EngineError::NotSynced);
        };
        if board.positions.get(entity_id).and_then(|p| p.parent_id.as_deref()) == Some(zone_id) {
            return Ok(Edit::Unchanged);
        }
        let position = board.pinned_position(entity_id, zone_id)?;
        self.set_position(entity_id, position, now);
        Ok(Edit::Applied)
    }

    /// Unpin an entity, converting relative → absolute once.
    ///
    /// # Errors
    ///
    /// `Doc(UnknownEntity)` if it has no position.
    pub fn unpin_entity(&mut self, entity_id: &str, now: Instant) -> Result<Edit, EngineError> {
        self.writable(EntryKind::Position, entity_id)?;
        let Some(board) = self.local.as_ref() else {
            return Err(EngineError::NotSynced);
        };
        let current = board
            .positions
            .get(entity_id)
            .ok_or_else(|| DocError::UnknownEntity(entity_id.to_owned()))?;
        if current.parent_id.is_none() {
            return Ok(Edit::Unchanged);
        }
        let position = board.unpinned_position(entity_id)?;
        self.set_position(entity_id, position, now);
        Ok(Edit::Applied)
    }

    fn set_position(&mut self, entity_id: &str, position: Position, now: Instant) {
        if let Some(board) = self.local.as_mut() {
            board.positions.insert(entity_id.to_owned(), position.clone());
        }
        self.positions.stage(entity_id.to_owned(), position, now);
    }

    /// Remove an entity's position locally and send the removal at once.
    ///
    /// # Errors
    ///
    /// `Doc(UnknownEntity)` if it has no position.
    pub fn remove_entity(&mut self, entity_id: &str, now: Instant) -> Result<Edit, EngineError> {
        self.writable(EntryKind::Position, entity_id)?;
        let removed = self.local.as_mut().and_then(|b| b.positions.remove(entity_id));
        if removed.is_none() {
            return Err(DocError::UnknownEntity(entity_id.to_owned()).into());
        }
        self.positions.forget(entity_id);
        self.positions.bury(entity_id, now);
        self.selection.remove(entity_id);
        self.outbox.push(Mutation::RemovePosition { entity_id: entity_id.to_owned() });
        info!(board_id = %self.board_id, entity_id, "sync: entity removed locally");
        Ok(Edit::Applied)
    }

    // =========================================================================
    // SELECTION
    // =========================================================================

    /// Select an id present on the working copy.
    pub fn select(&mut self, id: &str) -> Edit {
        let present = self
            .local
            .as_ref()
            .is_some_and(|b| b.objects.contains_key(id) || b.positions.contains_key(id));
        if present && self.selection.insert(id.to_owned()) {
            Edit::Applied
        } else {
            Edit::Unchanged
        }
    }

    pub fn deselect(&mut self, id: &str) -> Edit {
        if self.selection.remove(id) { Edit::Applied } else { Edit::Unchanged }
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Apply a UI command.
    ///
    /// # Errors
    ///
    /// Whatever the matching edit returns.
    pub fn execute(&mut self, command: Command, now: Instant) -> Result<Edit, EngineError> {
        match command {
            Command::CreateObject { object_id, object } => self.create_object(&object_id, object, now),
            Command::UpdateObject { object_id, object } => self.update_object(&object_id, object, now),
            Command::MoveObject { object_id, to } => self.move_object(&object_id, to, now),
            Command::ResizeObject { object_id, width, height } => self.resize_object(&object_id, width, height, now),
            Command::DeleteObject { object_id } => self.delete_object(&object_id, now),
            Command::PlaceEntity { entity_id, position } => self.place_entity(&entity_id, position, now),
            Command::MoveEntity { entity_id, to } => self.move_entity(&entity_id, to, now),
            Command::PinEntity { entity_id, zone_id } => self.pin_entity(&entity_id, &zone_id, now),
            Command::UnpinEntity { entity_id } => self.unpin_entity(&entity_id, now),
            Command::RemoveEntity { entity_id } => self.remove_entity(&entity_id, now),
            Command::Select { id } => Ok(self.select(&id)),
            Command::Deselect { id } => Ok(self.deselect(&id)),
            Command::EndGesture => {
                self.flush_all(now);
                Ok(Edit::Applied)
            }
        }
    }

    // =========================================================================
    // FAILURES
    // =========================================================================

    /// Handle the server's refusal of a mutation taken from the outbox.
    pub fn reject(&mut self, mutation: Mutation, rejection: &Rejection, now: Instant) {
        let action = mutation.action();
        warn!(
            board_id = %self.board_id,
            action,
            code = rejection.code.as_deref().unwrap_or("-"),
            retryable = rejection.retryable,
            message = %rejection.message,
            "sync: write rejected"
        );
        let max_retries = self.config.max_retries;
        let (resolution, is_objects) = match mutation {
            Mutation::UpsertObject { object_id, object } => {
                (self.objects.reject(vec![(object_id, object)], rejection, max_retries, now), true)
            }
            Mutation::BatchUpsertObjects { objects } => {
                (self.objects.reject(objects.into_iter().collect(), rejection, max_retries, now), true)
            }
            Mutation::UpsertPosition { entity_id, position } => {
                (self.positions.reject(vec![(entity_id, position)], rejection, max_retries, now), false)
            }
            Mutation::BatchUpsertPositions { positions } => {
                (self.positions.reject(positions.into_iter().collect(), rejection, max_retries, now), false)
            }
            removal @ (Mutation::RemoveObject { .. } | Mutation::RemovePosition { .. }) => {
                self.reject_removal(removal, rejection, now);
                return;
            }
        };

        let auth = self.authoritative.as_ref();
        if let Some(local) = self.local.as_mut() {
            for id in &resolution.gone {
                if is_objects {
                    local.objects.remove(id);
                } else {
                    local.positions.remove(id);
                }
                self.selection.remove(id);
            }
            for id in &resolution.rolled_back {
                if is_objects {
                    restore(id, &mut local.objects, auth.map(|a| &a.objects));
                } else {
                    restore(id, &mut local.positions, auth.map(|a| &a.positions));
                }
            }
        }
        if !resolution.requeued.is_empty() {
            info!(board_id = %self.board_id, action, count = resolution.requeued.len(), "sync: write re-queued");
        }
        if !resolution.rolled_back.is_empty() {
            self.notices.push(Notice { action, ids: resolution.rolled_back, message: rejection.message.clone() });
        }
    }

    fn reject_removal(&mut self, mutation: Mutation, rejection: &Rejection, now: Instant) {
        let Some(id) = mutation.ids().first().map(|id| (*id).to_owned()) else {
            return;
        };
        let is_object = matches!(mutation, Mutation::RemoveObject { .. });
        let max_retries = self.config.max_retries;
        let retry = match (rejection.retryable, is_object) {
            (false, _) => false,
            (true, true) => self.objects.retry_removal(&id, max_retries),
            (true, false) => self.positions.retry_removal(&id, max_retries),
        };
        if retry {
            self.retry_removals.push(RetryRemoval { mutation, not_before: now + self.config.quiet_period });
            return;
        }

        // The delete did not happen; show the server's copy again.
        let auth = self.authoritative.as_ref();
        if is_object {
            self.objects.unbury(&id);
        } else {
            self.positions.unbury(&id);
        }
        if let Some(local) = self.local.as_mut() {
            if is_object {
                restore(&id, &mut local.objects, auth.map(|a| &a.objects));
            } else {
                restore(&id, &mut local.positions, auth.map(|a| &a.positions));
            }
        }
        self.notices.push(Notice { action: mutation.action(), ids: vec![id], message: rejection.message.clone() });
    }

    // =========================================================================
    // RECONNECT
    // =========================================================================

    /// Forget all local intent and wait for a fresh snapshot. The working
    /// copy falls back to the last authoritative board until then, and the
    /// next snapshot is accepted even if its version went backwards.
    pub fn reset_for_reconnect(&mut self) {
        self.objects.clear();
        self.positions.clear();
        self.retry_removals.clear();
        self.outbox.clear();
        self.reconciling_until = None;
        self.accept_any_version = true;
        if let Some(authoritative) = &self.authoritative {
            self.local = Some(authoritative.clone());
        }
        match &self.local {
            Some(board) => self
                .selection
                .retain(|id| board.objects.contains_key(id) || board.positions.contains_key(id)),
            None => self.selection.clear(),
        }
        self.resync_requested = true;
        info!(board_id = %self.board_id, "sync: state reset for reconnect");
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
