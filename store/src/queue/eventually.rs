//! The eventually queue.
//!
//! Commands are persisted through a [`CommandStore`] before anything is sent,
//! then replayed by a single worker task in enqueue order. A command leaves
//! the store only once the remote service acknowledged it or it failed for
//! good, so a crash at any point replays it on the next start.

use super::command::{Command, CommandError, CommandResult, CommandRunner, RunOptions, SessionProvider};
use super::reachability::{Connectivity, Reachability};
use super::store::{CommandStore, EventuallyPin, PinCommand};
use crate::config::QueueConfig;
use crate::db::{self, EventuallyRow, Session};
use crate::error::{QueueError, Result, StoreError};
use crate::objects::ObjectRef;
use crate::offline_store::OfflineStore;
use crate::pins::{self, PinRegistry, EVENTUALLY_PIN};
use chrono::Utc;
use mooring_engine::value::{map_pointers, visit_pointers, Fields};
use mooring_engine::{EnqueueClock, EnqueueStamp, LocalId, LocalObjectRecord, ObjectId, Pointer};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Error code reported when a command references an object that was never
/// created remotely.
pub const UNSAVED_POINTER_CODE: i64 = -1;

const EVENT_CAPACITY: usize = 256;

/// Lifecycle of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting commands, not replaying
    Stopped,
    Running,
    /// Replay suspended; the command in flight, if any, still completes
    Paused,
    /// Shut down for good
    Terminated,
}

/// Notifications about queue activity.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued { uuid: String },
    Succeeded { uuid: String, result: CommandResult },
    Failed { uuid: String, error: QueueError },
    /// A command's response was merged into a local object
    ObjectUpdated { local_id: LocalId },
    /// A delete was confirmed and the local row removed
    ObjectRemoved { local_id: LocalId },
}

type Outcome = std::result::Result<CommandResult, QueueError>;

/// Completion of one queued command.
///
/// Resolves once the command is acknowledged or dropped. If the queue forgets
/// the command (terminated or rebooted) it resolves to
/// [`QueueError::Terminated`]; the command itself stays persisted.
#[derive(Debug)]
pub struct PendingCommand {
    uuid: String,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingCommand {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl Future for PendingCommand {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(QueueError::Terminated)))
    }
}

/// Why one replay attempt did not succeed.
enum Failure {
    Command(CommandError),
    Pruned,
    Store(StoreError),
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        Failure::Store(err)
    }
}

/// Durable, ordered queue of commands for the remote service.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct EventuallyQueue {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<OfflineStore>,
    pins: PinRegistry,
    commands: Arc<dyn CommandStore>,
    runner: Arc<dyn CommandRunner>,
    session: Arc<dyn SessionProvider>,
    config: QueueConfig,
    state: watch::Sender<QueueState>,
    wakeup: Notify,
    events: broadcast::Sender<QueueEvent>,
    listeners: Mutex<HashMap<String, oneshot::Sender<Outcome>>>,
    /// Failed attempts per command since the last start
    attempts: Mutex<HashMap<String, u32>>,
    /// Serializes enqueues so stamps and writes never interleave
    clock: tokio::sync::Mutex<EnqueueClock>,
    /// Clock loaded and half-queued work repaired since the last reboot
    prepared: AtomicBool,
    online: AtomicBool,
    /// Cancelled on terminate; parent of every run token
    shutdown: CancellationToken,
    run: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl EventuallyQueue {
    pub fn new(
        store: Arc<OfflineStore>,
        commands: Arc<dyn CommandStore>,
        runner: Arc<dyn CommandRunner>,
        session: Arc<dyn SessionProvider>,
        config: QueueConfig,
    ) -> Self {
        let (state, _) = watch::channel(QueueState::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                pins: PinRegistry::new(store.clone()),
                store,
                commands,
                runner,
                session,
                config,
                state,
                wakeup: Notify::new(),
                events,
                listeners: Mutex::new(HashMap::new()),
                attempts: Mutex::new(HashMap::new()),
                clock: tokio::sync::Mutex::new(EnqueueClock::new()),
                prepared: AtomicBool::new(false),
                online: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> QueueState {
        *self.inner.state.borrow()
    }

    /// Load persisted commands and start replaying them.
    ///
    /// Edits frozen for a save whose command never reached the store are
    /// returned to their objects first. Starts paused if connectivity is known to be down. Does nothing if the
    /// queue is already running or paused, or was terminated.
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            QueueState::Running | QueueState::Paused => return Ok(()),
            QueueState::Terminated => {
                tracing::warn!("Command queue was terminated and cannot be restarted");
                return Ok(());
            }
            QueueState::Stopped => {}
        }

        let pending = {
            let mut clock = self.inner.clock.lock().await;
            self.inner.prepare(&mut clock).await?
        };

        let token = self.inner.shutdown.child_token();
        let initial = if self.inner.online.load(Ordering::Acquire) {
            QueueState::Running
        } else {
            QueueState::Paused
        };
        self.inner.state.send_replace(initial);
        let worker = tokio::spawn(run_worker(self.inner.clone(), token.clone()));
        if let Some((old_token, old_worker)) = self.inner.run.lock().replace((token, worker)) {
            old_token.cancel();
            old_worker.abort();
        }

        tracing::info!(pending, state = ?initial, "Command queue started");
        Ok(())
    }

    /// Suspend replay after the command in flight.
    pub fn pause(&self) {
        let paused = self.inner.state.send_if_modified(|state| {
            if *state == QueueState::Running {
                *state = QueueState::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            tracing::info!("Command queue paused");
        }
    }

    pub fn resume(&self) {
        let resumed = self.inner.state.send_if_modified(|state| {
            if *state == QueueState::Paused {
                *state = QueueState::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            tracing::info!("Command queue resumed");
        }
    }

    /// Stop for good, cancelling the command in flight. Persisted commands
    /// are kept; pending completions resolve to [`QueueError::Terminated`].
    pub async fn terminate(&self) {
        self.inner.state.send_replace(QueueState::Terminated);
        self.inner.shutdown.cancel();
        self.stop_worker().await;
        self.inner.fail_listeners();
        tracing::info!("Command queue terminated");
    }

    /// Forget all in-memory state as if the process restarted: the worker
    /// stops, completions and attempt counters are dropped, and the offline
    /// store's handles are cleared. Persisted commands are untouched; call
    /// [`start`](Self::start) to resume replay.
    pub async fn simulate_reboot(&self) {
        if self.state() != QueueState::Terminated {
            self.inner.state.send_replace(QueueState::Stopped);
        }
        self.stop_worker().await;
        self.inner.listeners.lock().clear();
        self.inner.attempts.lock().clear();
        *self.inner.clock.lock().await = EnqueueClock::new();
        self.inner.prepared.store(false, Ordering::Release);
        self.inner.store.simulate_reboot();
        tracing::info!("Command queue rebooted");
    }

    async fn stop_worker(&self) {
        let run = self.inner.run.lock().take();
        if let Some((token, worker)) = run {
            token.cancel();
            if let Err(err) = worker.await {
                if !err.is_cancelled() {
                    tracing::error!(error = %err, "Command queue worker failed");
                }
            }
        }
    }

    /// Queue a prepared command. If `object` is given it is pinned until the
    /// command completes.
    pub async fn enqueue(&self, command: Command, object: Option<&ObjectRef>) -> Result<PendingCommand> {
        let mut clock = self.inner.clock.lock().await;
        let stamp = self.inner.next_stamp(&mut clock).await?;
        let mut pin = EventuallyPin::new(stamp, PinCommand::Raw { command });
        pin.target_uuid = object.map(|object| object.local_id().to_string());
        self.inner.persist(pin, object).await
    }

    /// Queue a save of `object`'s current edits.
    ///
    /// Objects it points to that were never created remotely are queued
    /// first, so their server ids are known when this save is sent.
    pub async fn save_eventually(&self, object: &ObjectRef) -> Result<PendingCommand> {
        self.inner.ensure_prepared().await?;
        let graph = self
            .inner
            .store
            .collect_graph(std::slice::from_ref(object), true)
            .await?;
        for child in graph.iter().skip(1).rev() {
            if child.object_id().is_none() && !has_queued_save(child) {
                self.save_one(child).await?;
            }
        }
        self.save_one(object).await
    }

    async fn save_one(&self, object: &ObjectRef) -> Result<PendingCommand> {
        let mut clock = self.inner.clock.lock().await;
        let stamp = self.inner.next_stamp(&mut clock).await?;
        let set = object.state().begin_save(true)?;

        let mut pin = EventuallyPin::new(
            stamp,
            PinCommand::Save {
                class_name: object.class_name().to_string(),
                body: set.to_body(),
            },
        );
        pin.target_uuid = Some(object.local_id().to_string());
        pin.operation_set_uuid = Some(set.uuid.clone());

        match self.inner.persist(pin, Some(object)).await {
            Ok(pending) => Ok(pending),
            Err(err) => {
                let rolled_back = object.state().rollback_failed_save(&set.uuid);
                if let Err(rollback_err) = rolled_back {
                    tracing::warn!(uuid = %object.local_id(), error = %rollback_err, "Could not restore edits after failed enqueue");
                }
                Err(err)
            }
        }
    }

    /// Queue a delete of `object`. The object disappears from local queries
    /// right away.
    pub async fn delete_eventually(&self, object: &ObjectRef) -> Result<PendingCommand> {
        let mut clock = self.inner.clock.lock().await;
        let stamp = self.inner.next_stamp(&mut clock).await?;
        // Written to disk together with the command.
        object.set_deleting_eventually(true);

        let mut pin = EventuallyPin::new(
            stamp,
            PinCommand::Delete {
                class_name: object.class_name().to_string(),
            },
        );
        pin.target_uuid = Some(object.local_id().to_string());

        match self.inner.persist(pin, Some(object)).await {
            Ok(pending) => Ok(pending),
            Err(err) => {
                object.set_deleting_eventually(false);
                Err(err)
            }
        }
    }

    /// Number of persisted commands.
    pub async fn pending_count(&self) -> Result<usize> {
        self.inner.commands.count().await
    }

    /// Discard every queued command without sending it. Edits of queued
    /// saves return to their objects; queued deletes are withdrawn.
    pub async fn remove_all_commands(&self) -> Result<()> {
        let _clock = self.inner.clock.lock().await;
        let pins = self.inner.commands.load_all().await?;
        self.inner.commands.clear().await?;

        for pin in &pins {
            let target = self.inner.target(pin).await?;
            self.inner.undo_local(pin, target.as_ref(), false).await;
            self.inner.complete(&pin.uuid, Err(QueueError::Terminated));
        }
        self.inner.pins.unpin_all(Some(EVENTUALLY_PIN)).await?;
        self.inner.attempts.lock().clear();

        tracing::info!(count = pins.len(), "Removed all queued commands");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Follow `reachability`: pause while offline, resume when back online.
    pub fn monitor(&self, reachability: &Reachability) -> JoinHandle<()> {
        let mut rx = reachability.subscribe();
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let connectivity = *rx.borrow_and_update();
                queue.set_online(connectivity == Connectivity::Online);
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::Release);
        if online {
            self.resume();
        } else {
            self.pause();
        }
    }
}

fn has_queued_save(object: &ObjectRef) -> bool {
    object
        .state()
        .operation_sets()
        .any(|set| set.is_save_eventually)
}

impl Inner {
    /// Advance the clock past every persisted command and repair objects a
    /// crash left half-queued. Returns how many commands are persisted.
    async fn prepare(&self, clock: &mut EnqueueClock) -> Result<usize> {
        let pending = self.commands.load_all().await?;
        if let Some(last) = pending.iter().map(|pin| pin.stamp).max() {
            clock.merge(last);
        }
        self.recover(&pending).await?;
        self.prepared.store(true, Ordering::Release);
        Ok(pending.len())
    }

    async fn ensure_prepared(&self) -> Result<()> {
        if self.prepared.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut clock = self.clock.lock().await;
        if !self.prepared.load(Ordering::Acquire) {
            self.prepare(&mut clock).await?;
        }
        Ok(())
    }

    /// Undo queue bookkeeping that no persisted command refers to: sets frozen
    /// for a lost save fold into the next save and a lost delete is withdrawn.
    /// Repaired objects with nothing queued leave the eventually pin.
    async fn recover(&self, pending: &[EventuallyPin]) -> Result<()> {
        let referenced: HashSet<&str> = pending
            .iter()
            .filter_map(|pin| pin.operation_set_uuid.as_deref())
            .collect();

        for local_id in self.pins.members(EVENTUALLY_PIN).await? {
            let Some(object) = self.store.object_for_uuid(&local_id).await? else {
                continue;
            };
            let targeted: Vec<&EventuallyPin> = pending
                .iter()
                .filter(|pin| pin.target_uuid.as_deref() == Some(local_id.as_str()))
                .collect();

            let orphans = {
                let mut state = object.state();
                let current = state.current_operations().uuid.clone();
                let orphans: Vec<String> = state
                    .operation_sets()
                    .filter(|set| set.is_save_eventually && set.uuid != current)
                    .filter(|set| !referenced.contains(set.uuid.as_str()))
                    .map(|set| set.uuid.clone())
                    .collect();
                for set_uuid in &orphans {
                    if let Err(err) = state.rollback_failed_save(set_uuid) {
                        tracing::warn!(uuid = %local_id, set = %set_uuid, error = %err, "Could not restore edits of a lost save");
                    }
                }
                orphans.len()
            };
            if orphans > 0 {
                tracing::warn!(uuid = %local_id, sets = orphans, "Restored edits of saves that were never queued");
                self.store.update_data_for_object(&object).await?;
            }

            let delete_queued = targeted
                .iter()
                .any(|pin| matches!(pin.command, PinCommand::Delete { .. }));
            let lost_delete = object.is_deleting_eventually() && !delete_queued;
            if lost_delete {
                tracing::warn!(uuid = %local_id, "Withdrawing a delete that was never queued");
                self.store.set_deleting_eventually(&object, false).await?;
            }

            // Other untargeted members may be retained by a queued parent.
            if targeted.is_empty() && (orphans > 0 || lost_delete) {
                self.pins
                    .unpin(std::slice::from_ref(&object), Some(EVENTUALLY_PIN))
                    .await?;
            }
        }
        Ok(())
    }

    async fn next_stamp(&self, clock: &mut EnqueueClock) -> Result<EnqueueStamp> {
        if !self.prepared.load(Ordering::Acquire) {
            self.prepare(clock).await?;
        }
        Ok(clock.tick(Utc::now().timestamp_millis()))
    }

    async fn persist(&self, mut pin: EventuallyPin, object: Option<&ObjectRef>) -> Result<PendingCommand> {
        pin.session_token = self.session.session_token();

        let (tx, rx) = oneshot::channel();
        self.listeners.lock().insert(pin.uuid.clone(), tx);
        if let Err(err) = self.store_command(&pin, object).await {
            self.listeners.lock().remove(&pin.uuid);
            return Err(err);
        }

        tracing::debug!(uuid = %pin.uuid, kind = pin.command.kind(), target = ?pin.target_uuid, "Command enqueued");
        let _ = self.events.send(QueueEvent::Enqueued {
            uuid: pin.uuid.clone(),
        });
        self.wakeup.notify_one();
        Ok(PendingCommand { uuid: pin.uuid, rx })
    }

    /// Write the command and pin its target. When commands live in the
    /// object database both are written in one transaction.
    async fn store_command(&self, pin: &EventuallyPin, object: Option<&ObjectRef>) -> Result<()> {
        let shared = self
            .commands
            .database()
            .filter(|db| Arc::ptr_eq(*db, self.store.database()))
            .cloned();
        let Some(db) = shared else {
            if let Some(object) = object {
                self.pins
                    .pin(std::slice::from_ref(object), Some(EVENTUALLY_PIN))
                    .await?;
            }
            return self.commands.push(pin).await;
        };

        let records = match object {
            Some(object) => {
                self.pins
                    .retained_records(std::slice::from_ref(object))
                    .await?
            }
            None => Vec::new(),
        };
        let row = pin.to_row()?;
        let mut session = db.session().await?;
        session.begin().await?;
        let result = write_command(&mut session, &row, &records).await;
        session.finish(result).await
    }

    async fn target(&self, pin: &EventuallyPin) -> Result<Option<ObjectRef>> {
        match &pin.target_uuid {
            Some(uuid) => self.store.object_for_uuid(uuid).await,
            None => Ok(None),
        }
    }

    fn complete(&self, uuid: &str, outcome: Outcome) {
        let sender = self.listeners.lock().remove(uuid);
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }

    fn fail_listeners(&self) {
        let listeners: Vec<_> = self.listeners.lock().drain().collect();
        for (_, sender) in listeners {
            let _ = sender.send(Err(QueueError::Terminated));
        }
    }

    async fn process(&self, pin: EventuallyPin, token: &CancellationToken) {
        let target = match self.target(&pin).await {
            Ok(target) => target,
            Err(err) => {
                self.drop_pin(&pin, None, err.into()).await;
                return;
            }
        };

        match self.attempt(&pin, target.as_ref(), token).await {
            Ok(result) => self.finish(&pin, target.as_ref(), result).await,
            Err(Failure::Command(CommandError::Cancelled)) => {
                tracing::debug!(uuid = %pin.uuid, "Command cancelled, keeping it queued");
            }
            Err(Failure::Command(CommandError::Retryable(message))) => {
                let attempts = {
                    let mut counters = self.attempts.lock();
                    let count = counters.entry(pin.uuid.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                if attempts >= self.config.max_attempts {
                    let error = QueueError::Dropped {
                        attempts,
                        last: CommandError::Retryable(message),
                    };
                    self.drop_pin(&pin, target.as_ref(), error).await;
                    return;
                }
                let delay = self.config.backoff(attempts);
                tracing::warn!(uuid = %pin.uuid, attempts, ?delay, error = %message, "Command failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {}
                }
            }
            Err(Failure::Command(err)) => {
                self.drop_pin(&pin, target.as_ref(), QueueError::Command(err)).await
            }
            Err(Failure::Pruned) => self.drop_pin(&pin, target.as_ref(), QueueError::Pruned).await,
            Err(Failure::Store(err)) => self.drop_pin(&pin, target.as_ref(), err.into()).await,
        }
    }

    /// Build the command for `pin` and send it once.
    async fn attempt(
        &self,
        pin: &EventuallyPin,
        target: Option<&ObjectRef>,
        token: &CancellationToken,
    ) -> std::result::Result<CommandResult, Failure> {
        let command = match &pin.command {
            PinCommand::Raw { command } => self.resolve_command(command.clone()).await?,
            PinCommand::Save { class_name, body } => {
                let target = target.ok_or(Failure::Pruned)?;
                if target.object_id().is_none() && target.is_deleting_eventually() {
                    return Err(Failure::Pruned);
                }
                let (object_id, body) = {
                    let state = target.state();
                    let body = pin
                        .operation_set_uuid
                        .as_deref()
                        .and_then(|uuid| state.operation_set(uuid))
                        .map(|set| set.to_body())
                        .unwrap_or_else(|| body.clone());
                    (state.object_id.clone(), body)
                };
                let body = self.resolve_body(body).await?;
                match object_id {
                    Some(object_id) => Command::Update {
                        class_name: class_name.clone(),
                        object_id,
                        body,
                    },
                    None => Command::Create {
                        class_name: class_name.clone(),
                        body,
                    },
                }
            }
            PinCommand::Delete { class_name } => {
                let object_id = target
                    .and_then(|target| target.object_id())
                    .ok_or(Failure::Pruned)?;
                Command::Delete {
                    class_name: class_name.clone(),
                    object_id,
                }
            }
        };

        tracing::debug!(uuid = %pin.uuid, command = command.name(), "Sending queued command");
        let options = RunOptions {
            session_token: pin.session_token.clone(),
            cancel: token.child_token(),
        };
        tokio::select! {
            result = self.runner.run(&command, options) => result.map_err(Failure::Command),
            _ = token.cancelled() => Err(Failure::Command(CommandError::Cancelled)),
        }
    }

    async fn resolve_command(&self, command: Command) -> std::result::Result<Command, Failure> {
        Ok(match command {
            Command::Create { class_name, body } => Command::Create {
                class_name,
                body: self.resolve_body(body).await?,
            },
            Command::Update {
                class_name,
                object_id,
                body,
            } => Command::Update {
                class_name,
                object_id,
                body: self.resolve_body(body).await?,
            },
            Command::Raw {
                method,
                path,
                body: Some(body),
            } => Command::Raw {
                method,
                path,
                body: Some(self.resolve_body(body).await?),
            },
            other => other,
        })
    }

    /// Replace local ids in a body with server ids: pointers become remote
    /// pointers and relation edits list remote pointers.
    async fn resolve_body(&self, body: Value) -> std::result::Result<Value, Failure> {
        let mut local_ids = Vec::new();
        visit_pointers(&body, &mut |pointer| {
            if pointer.object_id.is_none() {
                if let Some(local_id) = pointer.local_id {
                    local_ids.push(local_id);
                }
            }
        });
        if let Value::Object(map) = &body {
            for operation in map.values().filter(|value| is_relation_op(value)) {
                for key in ["adds", "removes"] {
                    if let Some(items) = operation.get(key).and_then(Value::as_array) {
                        local_ids.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
                    }
                }
            }
        }

        let mut object_ids: HashMap<LocalId, ObjectId> = HashMap::new();
        for local_id in local_ids {
            if object_ids.contains_key(&local_id) {
                continue;
            }
            let object_id = self
                .store
                .object_for_uuid(&local_id)
                .await?
                .and_then(|object| object.object_id())
                .ok_or_else(|| {
                    Failure::Command(CommandError::Fatal {
                        code: UNSAVED_POINTER_CODE,
                        message: format!("references object {local_id} that was never saved"),
                    })
                })?;
            object_ids.insert(local_id, object_id);
        }

        let body = map_pointers(body, &mut |pointer| {
            let object_id = match (&pointer.object_id, &pointer.local_id) {
                (Some(object_id), _) => object_id.clone(),
                (None, Some(local_id)) => object_ids.get(local_id).cloned().ok_or_else(|| {
                    mooring_engine::Error::InvalidPointer(format!("unresolved local id {local_id}"))
                })?,
                (None, None) => return Ok(pointer),
            };
            Ok(Pointer::remote(pointer.class_name, object_id))
        })
        .map_err(|err| Failure::Store(err.into()))?;

        let mut map = match body {
            Value::Object(map) => map,
            other => return Ok(other),
        };
        for operation in map.values_mut().filter(|value| is_relation_op(value)) {
            let class_name = operation
                .get("className")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            for key in ["adds", "removes"] {
                if let Some(items) = operation.get_mut(key).and_then(Value::as_array_mut) {
                    for item in items.iter_mut() {
                        let remote = item
                            .as_str()
                            .and_then(|local_id| object_ids.get(local_id))
                            .map(|object_id| Pointer::remote(class_name.clone(), object_id.clone()));
                        if let Some(remote) = remote {
                            *item = remote.to_value();
                        }
                    }
                }
            }
        }
        Ok(Value::Object(map))
    }

    async fn finish(&self, pin: &EventuallyPin, target: Option<&ObjectRef>, result: CommandResult) {
        if let Err(err) = self.apply_result(pin, target, &result).await {
            tracing::error!(uuid = %pin.uuid, error = %err, "Command succeeded but its result could not be stored");
        }
        self.attempts.lock().remove(&pin.uuid);
        self.release(pin, target).await;

        tracing::info!(uuid = %pin.uuid, kind = pin.command.kind(), "Command completed");
        self.complete(&pin.uuid, Ok(result.clone()));
        let _ = self.events.send(QueueEvent::Succeeded {
            uuid: pin.uuid.clone(),
            result,
        });
    }

    async fn apply_result(&self, pin: &EventuallyPin, target: Option<&ObjectRef>, result: &CommandResult) -> Result<()> {
        let Some(target) = target else {
            return Ok(());
        };
        match &pin.command {
            PinCommand::Save { .. } => {
                let response = match self.store.normalize_pointers(result.data.clone()).await? {
                    Value::Object(map) => map,
                    _ => Fields::new(),
                };
                let (old, new) = {
                    let mut state = target.state();
                    let old = state.object_id.clone();
                    match &pin.operation_set_uuid {
                        Some(set_uuid) => state.apply_save_result(set_uuid, &response)?,
                        None => state.merge_from_server(&response)?,
                    }
                    (old, state.object_id.clone())
                };
                if let (None, Some(new)) = (old, new) {
                    self.store.update_object_id(target, None, &new).await?;
                }
                if !self.store.update_data_for_object(target).await? {
                    self.store.save_locally(target, false).await?;
                }
                let _ = self.events.send(QueueEvent::ObjectUpdated {
                    local_id: target.local_id().to_string(),
                });
            }
            PinCommand::Delete { .. } => {
                target.state().mark_deleted();
                self.store.delete_locally(target).await?;
                let _ = self.events.send(QueueEvent::ObjectRemoved {
                    local_id: target.local_id().to_string(),
                });
            }
            PinCommand::Raw { .. } => {}
        }
        Ok(())
    }

    /// Remove the command and let go of its target once nothing else queued
    /// refers to it.
    async fn release(&self, pin: &EventuallyPin, target: Option<&ObjectRef>) {
        if let Err(err) = self.commands.remove(&pin.uuid).await {
            tracing::error!(uuid = %pin.uuid, error = %err, "Could not remove queued command");
        }
        let Some(target) = target else {
            return;
        };
        match self.commands.count_for_target(target.local_id()).await {
            Ok(0) => {
                let unpinned = self
                    .pins
                    .unpin(std::slice::from_ref(target), Some(EVENTUALLY_PIN))
                    .await;
                if let Err(err) = unpinned {
                    tracing::warn!(uuid = %target.local_id(), error = %err, "Could not release queued object");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(uuid = %target.local_id(), error = %err, "Could not count queued commands")
            }
        }
    }

    /// Give up on a command for good.
    async fn drop_pin(&self, pin: &EventuallyPin, target: Option<&ObjectRef>, error: QueueError) {
        match &error {
            QueueError::Pruned => {
                tracing::info!(uuid = %pin.uuid, kind = pin.command.kind(), "Command pruned, target never existed remotely")
            }
            _ => tracing::error!(uuid = %pin.uuid, kind = pin.command.kind(), error = %error, "Dropping queued command"),
        }
        self.attempts.lock().remove(&pin.uuid);
        self.undo_local(pin, target, matches!(error, QueueError::Pruned))
            .await;
        self.release(pin, target).await;

        self.complete(&pin.uuid, Err(error.clone()));
        let _ = self.events.send(QueueEvent::Failed {
            uuid: pin.uuid.clone(),
            error,
        });
    }

    /// Return a dropped command's effect to its target: a save's edits roll
    /// forward into the next save, a delete is withdrawn. A pruned delete
    /// removes the object, since it never existed remotely.
    async fn undo_local(&self, pin: &EventuallyPin, target: Option<&ObjectRef>, pruned: bool) {
        let Some(target) = target else {
            return;
        };
        let outcome = match &pin.command {
            PinCommand::Save { .. } => {
                if let Some(set_uuid) = &pin.operation_set_uuid {
                    let rolled_back = target.state().rollback_failed_save(set_uuid);
                    if let Err(err) = rolled_back {
                        tracing::warn!(uuid = %target.local_id(), error = %err, "Could not roll back failed save");
                    }
                }
                self.store.update_data_for_object(target).await.map(|_| ())
            }
            PinCommand::Delete { .. } if pruned => {
                let removed = self.store.delete_locally(target).await;
                if removed.is_ok() {
                    let _ = self.events.send(QueueEvent::ObjectRemoved {
                        local_id: target.local_id().to_string(),
                    });
                }
                removed
            }
            PinCommand::Delete { .. } => self.store.set_deleting_eventually(target, false).await,
            PinCommand::Raw { .. } => Ok(()),
        };
        if let Err(err) = outcome {
            tracing::warn!(uuid = %target.local_id(), error = %err, "Could not update object after dropping command");
        }
    }
}

async fn write_command(session: &mut Session<'_>, row: &EventuallyRow, records: &[LocalObjectRecord]) -> Result<()> {
    if !records.is_empty() {
        pins::write_pin(session, EVENTUALLY_PIN, records).await?;
    }
    db::insert_eventually(session, row).await
}

fn is_relation_op(value: &Value) -> bool {
    value.get("__op").and_then(Value::as_str) == Some("Relation")
}

async fn run_worker(inner: Arc<Inner>, token: CancellationToken) {
    let mut state = inner.state.subscribe();
    loop {
        let current = *state.borrow_and_update();
        match current {
            QueueState::Running => {}
            QueueState::Paused => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }
            QueueState::Stopped | QueueState::Terminated => return,
        }
        if token.is_cancelled() {
            return;
        }

        let next = match inner.commands.first().await {
            Ok(next) => next,
            Err(err) => {
                tracing::error!(error = %err, "Could not read the command queue");
                None
            }
        };
        match next {
            Some(pin) => inner.process(pin, &token).await,
            None => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = inner.wakeup.notified() => {}
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_sender_resolves_terminated() {
        let (tx, rx) = oneshot::channel::<Outcome>();
        let pending = PendingCommand {
            uuid: "x".into(),
            rx,
        };
        drop(tx);
        assert!(matches!(pending.await, Err(QueueError::Terminated)));
    }

    #[test]
    fn relation_ops_are_recognized() {
        assert!(is_relation_op(&serde_json::json!({"__op": "Relation", "className": "T"})));
        assert!(!is_relation_op(&serde_json::json!({"__op": "Add"})));
        assert!(!is_relation_op(&serde_json::json!("Relation")));
    }
}
