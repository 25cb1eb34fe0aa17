//! The replication engine.
//!
//! A [`SyncEngine`] owns one local replica (boards and tasks), the
//! replication state and the publisher queue. Multiple engines can live in
//! one process; nothing here is global.
//!
//! # Inbound pipeline
//!
//! ```text
//!   Event ─→ duplicate? ─→ verify id/sig ─→ kind ─→ scope tag → local board
//!        ─→ open envelope (or cleartext JSON) ─→ parse payload
//!        ─→ admission (logical clock) ─→ board/task merge ─→ record clock
//! ```
//!
//! Stale events and refused bounty changes come back as [`ApplyOutcome`]
//! values; only undecodable input is an error, and [`SyncEngine::handle`]
//! absorbs even those so a bad relay cannot stall a subscription.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use taskrelay_protocol::envelope::{open_scope_or_plaintext, seal_scope};
use taskrelay_protocol::{Event, Filter, Identity, UnsignedEvent, KIND_ENTITY, KIND_SCOPE_METADATA};
use taskrelay_relay::{RelayPool, Subscription, SubscriptionEvent};
use tracing::{debug, info, trace, warn};

use crate::board_merge::{merge_board, BoardMerge, BoardUpdate};
use crate::bounty::{merge_late_bounty, Bounty, BountyContext};
use crate::clock::{lock_state, Admission, ReplicationState, SharedReplicationState};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::field::Field;
use crate::models::{Board, BoardKind, Task};
use crate::payload::{
    ScopeMetadataV1, TaskStatus, TaskV1, TAG_ADDRESS, TAG_COLUMN, TAG_KIND, TAG_NAME, TAG_SCOPE,
    TAG_STATUS,
};
use crate::publisher::{
    ClockKey, EventSink, PublishHandle, PublishRequest, Publisher, PublisherConfig, SystemClock,
    WallClock,
};
use crate::scope::{scope_tag, Keyring};
use crate::store::{load_json, save_json, KeyValueStore, KEY_BOARDS, KEY_TASKS};
use crate::task_merge::{merge_task, TaskMerge, TaskUpdate};

/// Event ids remembered for duplicate suppression.
const SEEN_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Relays for shared boards that do not name their own.
    pub default_relays: Vec<String>,
    pub publisher: PublisherConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for EngineOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            default_relays: config.relays.clone(),
            publisher: config.publisher_config(),
        }
    }
}

/// Flags for [`SyncEngine::maybe_publish_task`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Do not publish the board's metadata ahead of its first task.
    pub skip_board_metadata: bool,
}

/// Why an event was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Same event id already processed.
    Duplicate,
    Stale,
    /// Equal timestamp while our own publish for the entity is in flight.
    PendingTie,
    /// Would revive a deleted task.
    Tombstoned,
    UnknownKind(u32),
    /// Board kind with nothing to merge.
    NoMergeRule,
}

/// Observable result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    BoardUpdated { board_id: String, stubs: Vec<String> },
    TaskUpserted { task_id: String, bounty_denied: bool },
    TaskRemoved { task_id: String },
    /// The task event was stale but carried a newer, authorized bounty.
    BountyUpdated { task_id: String },
    Rejected(RejectReason),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, ApplyOutcome::Rejected(_))
    }
}

/// Counters since the engine started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub admitted: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub decrypt_failures: u64,
    pub invalid_signatures: u64,
    pub malformed: u64,
    pub bounty_denied: u64,
    pub published: u64,
}

#[derive(Debug, Clone)]
struct ScopeEntry {
    board_id: String,
    shared_id: String,
    synced: bool,
}

#[derive(Debug, Default)]
struct Replica {
    boards: BTreeMap<String, Board>,
    tasks: HashMap<String, Task>,
}

#[derive(Debug, Default)]
struct SeenEvents {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenEvents {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if self.ids.insert(id.to_string()) {
            self.order.push_back(id.to_string());
            if self.order.len() > SEEN_CAPACITY {
                if let Some(oldest) = self.order.pop_front() {
                    self.ids.remove(&oldest);
                }
            }
        }
    }
}

struct EngineInner {
    identity: Arc<Identity>,
    keyring: Keyring,
    options: EngineOptions,
    state: SharedReplicationState,
    replica: Mutex<Replica>,
    scopes: Mutex<HashMap<String, ScopeEntry>>,
    seen: Mutex<SeenEvents>,
    stats: Mutex<EngineStats>,
    publisher: Publisher,
}

/// Shared handle to one replica and its replication machinery.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine publishing through `sink`. Must be called inside a
    /// tokio runtime.
    pub fn new(
        identity: Identity,
        keyring: Keyring,
        sink: Arc<dyn EventSink>,
        options: EngineOptions,
    ) -> Self {
        Self::with_clock(identity, keyring, sink, options, Arc::new(SystemClock))
    }

    /// Like [`SyncEngine::new`] with an explicit timestamp source.
    pub fn with_clock(
        identity: Identity,
        keyring: Keyring,
        sink: Arc<dyn EventSink>,
        options: EngineOptions,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        let identity = Arc::new(identity);
        let state = ReplicationState::shared();
        let publisher = Publisher::spawn(
            identity.clone(),
            sink,
            clock,
            state.clone(),
            options.publisher.clone(),
        );
        Self {
            inner: Arc::new(EngineInner {
                identity,
                keyring,
                options,
                state,
                replica: Mutex::new(Replica::default()),
                scopes: Mutex::new(HashMap::new()),
                seen: Mutex::new(SeenEvents::default()),
                stats: Mutex::new(EngineStats::default()),
                publisher,
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn keyring(&self) -> &Keyring {
        &self.inner.keyring
    }

    /// The clocks and pending set this engine admits against.
    pub fn replication_state(&self) -> SharedReplicationState {
        self.inner.state.clone()
    }

    pub fn stats(&self) -> EngineStats {
        lock(&self.inner.stats).clone()
    }

    // ------------------------------------------------------------------
    // Local replica
    // ------------------------------------------------------------------

    /// Insert or replace a board locally. Does not publish.
    pub fn upsert_board(&self, board: Board) {
        let previous = lock(&self.inner.replica)
            .boards
            .insert(board.id.clone(), board.clone());
        if let Some(tag) = previous.as_ref().and_then(Board::scope_tag) {
            if Some(&tag) != board.scope_tag().as_ref() {
                self.unregister_scope(&tag);
            }
        }
        self.register_scope(&board);
    }

    /// Remove a board and its tasks locally. Does not publish.
    pub fn remove_board(&self, board_id: &str) -> Option<Board> {
        let removed = {
            let mut replica = lock(&self.inner.replica);
            let removed = replica.boards.remove(board_id);
            if removed.is_some() {
                replica.tasks.retain(|_, task| task.board_id != board_id);
            }
            removed
        };
        if let Some(tag) = removed.as_ref().and_then(Board::scope_tag) {
            self.unregister_scope(&tag);
        }
        removed
    }

    /// Insert or replace a task locally. Does not publish.
    pub fn upsert_task(&self, task: Task) {
        lock(&self.inner.replica).tasks.insert(task.id.clone(), task);
    }

    /// Remove a task locally. Does not publish.
    pub fn remove_task(&self, task_id: &str) -> Option<Task> {
        lock(&self.inner.replica).tasks.remove(task_id)
    }

    pub fn board(&self, board_id: &str) -> Option<Board> {
        lock(&self.inner.replica).boards.get(board_id).cloned()
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        lock(&self.inner.replica).tasks.get(task_id).cloned()
    }

    /// All boards, by id.
    pub fn boards(&self) -> Vec<Board> {
        lock(&self.inner.replica).boards.values().cloned().collect()
    }

    /// All tasks, grouped by board and ordered within it.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = lock(&self.inner.replica).tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.board_id.cmp(&b.board_id).then_with(|| task_order(a).cmp(&task_order(b))));
        tasks
    }

    /// Tasks of one board by ordering index, then creation. A compound
    /// board shows its children's tasks.
    pub fn tasks_for_board(&self, board_id: &str) -> Vec<Task> {
        let replica = lock(&self.inner.replica);
        let mut members = BTreeSet::new();
        collect_members(&replica.boards, board_id, &mut members, &mut HashSet::new());

        let mut tasks: Vec<Task> = replica
            .tasks
            .values()
            .filter(|task| members.contains(task.board_id.as_str()))
            .cloned()
            .collect();
        tasks.sort_by_key(task_order);
        tasks
    }

    /// Relays a shared board publishes to and subscribes on.
    pub fn relay_set(&self, board: &Board) -> Vec<String> {
        match &board.nostr {
            Some(binding) if !binding.relays.is_empty() => binding.relays.clone(),
            _ => self.inner.options.default_relays.clone(),
        }
    }

    /// Union of every shared board's relay set.
    pub fn all_relays(&self) -> Vec<String> {
        let boards = self.boards();
        let relays: BTreeSet<String> = boards
            .iter()
            .filter(|board| board.nostr.is_some())
            .flat_map(|board| self.relay_set(board))
            .collect();
        relays.into_iter().collect()
    }

    /// Whether any relay has finished sending stored events for the board.
    pub fn is_synced(&self, board_id: &str) -> bool {
        lock(&self.inner.scopes)
            .values()
            .any(|scope| scope.board_id == board_id && scope.synced)
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Store `board` locally and publish its metadata.
    pub fn publish_board_metadata(&self, board: &Board) -> Result<PublishHandle> {
        let binding = board
            .nostr
            .as_ref()
            .ok_or_else(|| SyncError::NotShared(board.id.clone()))?;
        self.upsert_board(board.clone());

        let tag = scope_tag(&binding.board_id);
        let payload = {
            let replica = lock(&self.inner.replica);
            ScopeMetadataV1::from_board(board, |child| {
                replica
                    .boards
                    .get(child)
                    .and_then(|b| b.shared_id())
                    .unwrap_or(child)
                    .to_string()
            })
        };
        let content = seal_scope(
            &self.inner.keyring.scope_key(&binding.board_id),
            &serde_json::to_string(&payload)?,
        )?;
        let event = UnsignedEvent::new(KIND_SCOPE_METADATA, content)
            .tag(TAG_ADDRESS, tag.clone())
            .tag(TAG_SCOPE, tag.clone())
            .tag(TAG_KIND, board.kind.discriminator())
            .tag(TAG_NAME, board.name.clone());

        self.enqueue(PublishRequest {
            event,
            relays: self.relay_set(board),
            clock: ClockKey::Scope { scope_tag: tag },
        })
    }

    /// Store `task` locally and publish it if its board is shared.
    ///
    /// `board_override` publishes into that board instead of the task's
    /// current one (moving it). Unless `skip_board_metadata` is set, a board
    /// this replica has never seen metadata for is published first.
    pub fn maybe_publish_task(
        &self,
        task: &Task,
        board_override: Option<&Board>,
        options: PublishOptions,
    ) -> Result<Option<PublishHandle>> {
        let board = match board_override {
            Some(board) => board.clone(),
            None => self
                .board(&task.board_id)
                .ok_or_else(|| SyncError::UnknownBoard(task.board_id.clone()))?,
        };
        let mut task = task.clone();
        task.board_id = board.id.clone();
        self.upsert_task(task.clone());

        let Some(binding) = &board.nostr else {
            trace!("Board {} is not shared, task {} stays local", board.id, task.id);
            return Ok(None);
        };
        let tag = scope_tag(&binding.board_id);

        let metadata_known = lock_state(&self.inner.state).scope_clock(&tag).is_some();
        if !options.skip_board_metadata && !metadata_known {
            self.publish_board_metadata(&board)?;
        }

        let content = seal_scope(
            &self.inner.keyring.scope_key(&binding.board_id),
            &serde_json::to_string(&TaskV1::from_task(&task))?,
        )?;
        let mut event = UnsignedEvent::new(KIND_ENTITY, content)
            .tag(TAG_ADDRESS, task.id.clone())
            .tag(TAG_SCOPE, tag.clone())
            .tag(TAG_STATUS, TaskStatus::of(&task).as_str());
        if let Some(column) = &task.column {
            event = event.tag(TAG_COLUMN, column.clone());
        }

        self.enqueue(PublishRequest {
            event,
            relays: self.relay_set(&board),
            clock: ClockKey::Entity {
                scope_tag: tag,
                entity_id: task.id.clone(),
                deleted: false,
            },
        })
        .map(Some)
    }

    /// Remove `task` locally and publish a tombstone if its board is shared.
    pub fn publish_task_deleted(&self, task: &Task) -> Result<Option<PublishHandle>> {
        let board = self
            .board(&task.board_id)
            .ok_or_else(|| SyncError::UnknownBoard(task.board_id.clone()))?;
        self.remove_task(&task.id);
        let Some(binding) = &board.nostr else {
            return Ok(None);
        };
        let tag = scope_tag(&binding.board_id);

        let content = seal_scope(&self.inner.keyring.scope_key(&binding.board_id), "{}")?;
        let event = UnsignedEvent::new(KIND_ENTITY, content)
            .tag(TAG_ADDRESS, task.id.clone())
            .tag(TAG_SCOPE, tag.clone())
            .tag(TAG_STATUS, TaskStatus::Deleted.as_str());

        self.enqueue(PublishRequest {
            event,
            relays: self.relay_set(&board),
            clock: ClockKey::Entity {
                scope_tag: tag,
                entity_id: task.id.clone(),
                deleted: true,
            },
        })
        .map(Some)
    }

    fn enqueue(&self, request: PublishRequest) -> Result<PublishHandle> {
        let handle = self.inner.publisher.enqueue(request)?;
        self.bump(|stats| stats.published += 1);
        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Run one event through the inbound pipeline.
    pub fn apply_event(&self, event: &Event) -> Result<ApplyOutcome> {
        if lock(&self.inner.seen).contains(&event.id) {
            self.bump(|stats| stats.duplicates += 1);
            return Ok(ApplyOutcome::Rejected(RejectReason::Duplicate));
        }
        if let Err(e) = event.verify() {
            self.bump(|stats| stats.invalid_signatures += 1);
            return Err(SyncError::InvalidSignature(e.to_string()));
        }

        let outcome = match event.kind {
            KIND_SCOPE_METADATA => self.apply_scope_event(event)?,
            KIND_ENTITY => self.apply_entity_event(event)?,
            other => return Ok(ApplyOutcome::Rejected(RejectReason::UnknownKind(other))),
        };

        lock(&self.inner.seen).insert(&event.id);
        if outcome.is_applied() {
            self.bump(|stats| stats.admitted += 1);
        }
        Ok(outcome)
    }

    /// Feed one subscription event for `scope_tag`. Errors are logged and
    /// dropped.
    pub fn handle(&self, scope_tag: &str, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Event { event, relay_url } => match self.apply_event(&event) {
                Ok(outcome) => trace!("Event {} from {}: {:?}", event.id, relay_url, outcome),
                Err(e) => debug!("Dropped event {} from {}: {}", event.id, relay_url, e),
            },
            SubscriptionEvent::Eose { relay_url } => {
                let mut scopes = lock(&self.inner.scopes);
                if let Some(scope) = scopes.get_mut(scope_tag) {
                    if !scope.synced {
                        info!("Board {} synced from {}", scope.board_id, relay_url);
                    }
                    scope.synced = true;
                }
            }
            SubscriptionEvent::Closed { relay_url, message } => {
                warn!("Relay {} closed subscription for scope {}: {}", relay_url, scope_tag, message);
            }
        }
    }

    /// Subscribe to a shared board's events on its relay set.
    ///
    /// The pool is first pointed at the union of all shared boards' relays.
    pub fn subscribe_board(&self, pool: &RelayPool, board_id: &str) -> Result<ScopeSubscription> {
        let board = self
            .board(board_id)
            .ok_or_else(|| SyncError::UnknownBoard(board_id.to_string()))?;
        let tag = board
            .scope_tag()
            .ok_or_else(|| SyncError::NotShared(board_id.to_string()))?;

        pool.set_relays(self.all_relays())?;
        let filter = Filter::new()
            .kinds([KIND_SCOPE_METADATA, KIND_ENTITY])
            .scope_tag(tag.clone());
        let subscription = pool.subscribe(&self.relay_set(&board), vec![filter])?;
        info!("Subscribed to board {} (scope {})", board_id, &tag[..12]);

        Ok(ScopeSubscription {
            engine: self.clone(),
            scope_tag: tag,
            subscription,
        })
    }

    fn apply_scope_event(&self, event: &Event) -> Result<ApplyOutcome> {
        let tag = self.required_tag(event, TAG_SCOPE)?;
        let scope = self.scope(tag)?;
        let json = self.open_content(&scope, event)?;
        let payload: ScopeMetadataV1 = self.parse(&json)?;
        let update = BoardUpdate {
            kind: event.tag_value(TAG_KIND).map(str::to_string),
            name: event.tag_value(TAG_NAME).map(str::to_string),
            payload,
        };

        let (outcome, stubs) = {
            let mut state = lock_state(&self.inner.state);
            let admission = state.admit_scope(tag, event.created_at);
            if !admission.is_admitted() {
                return Ok(self.reject(admission));
            }
            let mut replica = lock(&self.inner.replica);
            match merge_board(&mut replica.boards, &scope.board_id, update) {
                BoardMerge::Updated { stubs } => {
                    state.record_scope(tag, event.created_at);
                    let stub_boards: Vec<Board> = stubs
                        .iter()
                        .filter_map(|id| replica.boards.get(id).cloned())
                        .collect();
                    let outcome = ApplyOutcome::BoardUpdated {
                        board_id: scope.board_id.clone(),
                        stubs,
                    };
                    (outcome, stub_boards)
                }
                BoardMerge::NoMergeRule => {
                    state.record_scope(tag, event.created_at);
                    (ApplyOutcome::Rejected(RejectReason::NoMergeRule), Vec::new())
                }
                BoardMerge::Missing => return Err(SyncError::UnknownBoard(scope.board_id)),
            }
        };

        for stub in &stubs {
            self.register_scope(stub);
        }
        Ok(outcome)
    }

    fn apply_entity_event(&self, event: &Event) -> Result<ApplyOutcome> {
        let tag = self.required_tag(event, TAG_SCOPE)?;
        let task_id = self.required_tag(event, TAG_ADDRESS)?;
        let status = match event.tag_value(TAG_STATUS) {
            None => TaskStatus::Open,
            Some(value) => TaskStatus::parse(value).ok_or_else(|| {
                self.bump(|stats| stats.malformed += 1);
                SyncError::Malformed(format!("unknown status {:?}", value))
            })?,
        };
        let deleted = status == TaskStatus::Deleted;
        let scope = self.scope(tag)?;
        let json = self.open_content(&scope, event)?;
        let payload: TaskV1 = if deleted {
            serde_json::from_str(&json).unwrap_or_default()
        } else {
            self.parse(&json)?
        };

        let mut state = lock_state(&self.inner.state);
        let admission = state.admit_entity(tag, task_id, event.created_at, deleted);
        let previous_at = state.entity_clock(tag, task_id).map(|clock| clock.at);
        if !admission.is_admitted() {
            if admission == Admission::Stale && !deleted {
                let ctx = BountyContext {
                    actor: &event.pubkey,
                    event_at: event.created_at,
                    local_seen_at: previous_at.unwrap_or(0),
                };
                if let Some(outcome) = self.fold_late_bounty(task_id, payload.bounty, &ctx) {
                    return Ok(outcome);
                }
            }
            return Ok(self.reject(admission));
        }

        let mut replica = lock(&self.inner.replica);
        let merged = merge_task(
            replica.tasks.get(task_id),
            TaskUpdate {
                task_id: task_id.to_string(),
                board_id: scope.board_id.clone(),
                status,
                column: event.tag_value(TAG_COLUMN).map(str::to_string),
                payload,
                actor: event.pubkey.clone(),
                event_at: event.created_at,
                previous_at,
            },
        );
        state.record_entity(tag, task_id, event.created_at, deleted);

        Ok(match merged {
            TaskMerge::Removed => {
                replica.tasks.remove(task_id);
                ApplyOutcome::TaskRemoved {
                    task_id: task_id.to_string(),
                }
            }
            TaskMerge::Upserted {
                task,
                bounty_denied,
            } => {
                replica.tasks.insert(task_id.to_string(), *task);
                if bounty_denied {
                    self.bump(|stats| stats.bounty_denied += 1);
                }
                ApplyOutcome::TaskUpserted {
                    task_id: task_id.to_string(),
                    bounty_denied,
                }
            }
        })
    }

    /// Bounty half of a stale task event. Caller holds the state lock.
    fn fold_late_bounty(
        &self,
        task_id: &str,
        incoming: Field<Bounty>,
        ctx: &BountyContext<'_>,
    ) -> Option<ApplyOutcome> {
        let mut replica = lock(&self.inner.replica);
        let task = replica.tasks.get_mut(task_id)?;
        let merged = merge_late_bounty(task.bounty.as_ref(), incoming, ctx)?;
        if merged.denied {
            self.bump(|stats| stats.bounty_denied += 1);
            return None;
        }
        debug!("Late bounty update for task {} from {}", task_id, ctx.actor);
        task.bounty = merged.bounty;
        Some(ApplyOutcome::BountyUpdated {
            task_id: task_id.to_string(),
        })
    }

    fn required_tag<'a>(&self, event: &'a Event, name: &str) -> Result<&'a str> {
        event.tag_value(name).ok_or_else(|| {
            self.bump(|stats| stats.malformed += 1);
            SyncError::Malformed(format!("event {} has no {:?} tag", event.id, name))
        })
    }

    fn scope(&self, tag: &str) -> Result<ScopeEntry> {
        lock(&self.inner.scopes)
            .get(tag)
            .cloned()
            .ok_or_else(|| SyncError::UnknownScope(tag.to_string()))
    }

    fn open_content(&self, scope: &ScopeEntry, event: &Event) -> Result<String> {
        let key = self.inner.keyring.scope_key(&scope.shared_id);
        match open_scope_or_plaintext(&key, &event.content) {
            Ok((json, _)) => Ok(json),
            Err(e) => {
                self.bump(|stats| stats.decrypt_failures += 1);
                Err(SyncError::Decryption(e.to_string()))
            }
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(&self, json: &str) -> Result<T> {
        serde_json::from_str(json).map_err(|e| {
            self.bump(|stats| stats.malformed += 1);
            SyncError::Malformed(e.to_string())
        })
    }

    fn reject(&self, admission: Admission) -> ApplyOutcome {
        self.bump(|stats| stats.stale += 1);
        ApplyOutcome::Rejected(match admission {
            Admission::PendingTie => RejectReason::PendingTie,
            Admission::Tombstoned => RejectReason::Tombstoned,
            Admission::Stale | Admission::Admit => RejectReason::Stale,
        })
    }

    fn register_scope(&self, board: &Board) {
        let Some(shared_id) = board.shared_id() else {
            return;
        };
        let tag = scope_tag(shared_id);
        let mut scopes = lock(&self.inner.scopes);
        let synced = scopes
            .get(&tag)
            .map(|scope| scope.board_id == board.id && scope.synced)
            .unwrap_or(false);
        scopes.insert(
            tag,
            ScopeEntry {
                board_id: board.id.clone(),
                shared_id: shared_id.to_string(),
                synced,
            },
        );
    }

    fn unregister_scope(&self, tag: &str) {
        lock(&self.inner.scopes).remove(tag);
        lock_state(&self.inner.state).forget_scope(tag);
    }

    fn bump(&self, update: impl FnOnce(&mut EngineStats)) {
        update(&mut lock(&self.inner.stats));
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write boards and tasks to `store`.
    pub fn save_snapshot(&self, store: &dyn KeyValueStore) -> Result<()> {
        save_json(store, KEY_BOARDS, &self.boards())?;
        save_json(store, KEY_TASKS, &self.tasks())?;
        Ok(())
    }

    /// Load boards and tasks saved by [`SyncEngine::save_snapshot`].
    /// Returns the number of boards and tasks loaded.
    pub fn load_snapshot(&self, store: &dyn KeyValueStore) -> Result<(usize, usize)> {
        let boards: Vec<Board> = load_json(store, KEY_BOARDS)?.unwrap_or_default();
        let tasks: Vec<Task> = load_json(store, KEY_TASKS)?.unwrap_or_default();
        let counts = (boards.len(), tasks.len());
        for board in boards {
            self.upsert_board(board);
        }
        for task in tasks {
            self.upsert_task(task);
        }
        debug!("Loaded snapshot: {} boards, {} tasks", counts.0, counts.1);
        Ok(counts)
    }
}

/// A live subscription feeding one board's events into the engine.
pub struct ScopeSubscription {
    engine: SyncEngine,
    scope_tag: String,
    subscription: Subscription,
}

impl ScopeSubscription {
    pub fn scope_tag(&self) -> &str {
        &self.scope_tag
    }

    /// Process the next relay delivery. Returns false once the
    /// subscription has ended.
    pub async fn process_next(&mut self) -> bool {
        match self.subscription.recv().await {
            Some(event) => {
                self.engine.handle(&self.scope_tag, event);
                true
            }
            None => false,
        }
    }

    /// Process deliveries until the subscription ends.
    pub async fn run(mut self) {
        while self.process_next().await {}
        debug!("Subscription for scope {} ended", self.scope_tag);
    }

    /// Stop inbound processing. In-flight publishes are unaffected.
    pub fn unsubscribe(self) {
        self.subscription.unsubscribe();
    }
}

fn task_order(task: &Task) -> (bool, i64, u64, String) {
    (
        task.order.is_none(),
        task.order.unwrap_or(0),
        task.created_at,
        task.id.clone(),
    )
}

/// Board ids whose tasks a board shows: itself, or a compound's children.
fn collect_members<'a>(
    boards: &'a BTreeMap<String, Board>,
    board_id: &'a str,
    members: &mut BTreeSet<&'a str>,
    visited: &mut HashSet<&'a str>,
) {
    if !visited.insert(board_id) {
        return;
    }
    match boards.get(board_id).map(|board| (board.id.as_str(), &board.kind)) {
        Some((_, BoardKind::Compound { children })) => {
            for child in children {
                collect_members(boards, child, members, visited);
            }
        }
        Some((id, _)) => {
            members.insert(id);
        }
        None => {
            members.insert(board_id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
