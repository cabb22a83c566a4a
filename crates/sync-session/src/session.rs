//! Session lifecycle and the per-attachment event dispatcher.
//!
//! A session owns its units for as long as it lives; transports come and
//! go.  Each [`Session::attach`] supersedes the previous attachment (the
//! old read loop observes a generation bump and exits), clears every
//! unit's snapshot, and queues a full `SET` per unit in registration
//! order.  [`Session::run`] then drives the attachment: flush outbound,
//! read one frame, dispatch, await complete handling, repeat.
//!
//! Ordering discipline: handlers complete in arrival order, except task
//! bodies which detach at spawn.  Outbound frames leave in program order
//! through a per-attachment FIFO; sends while detached are silently
//! dropped (the next attach re-emits full state anyway).

use crate::error::{RegisterError, SessionError};
use crate::transport::Transport;
use crate::unit::{coerce_args, SyncUnit};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_protocol::{BinMeta, Envelope, ErrorReport, EventKind, EventName, Frame, TaskDone, TaskOutcome};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::TaskCtx;

tokio::task_local! {
    static CURRENT_SESSION: Session;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Outbound {
    generation: u64,
    tx: mpsc::UnboundedSender<Frame>,
}

struct PendingConn {
    generation: u64,
    transport: Box<dyn Transport>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

struct RunningTask {
    abort: tokio::task::AbortHandle,
    cancelled: Arc<AtomicBool>,
}

/// The metadata half of an inbound binary pair, waiting for its frame.
struct PendingBinary {
    unit: Arc<SyncUnit>,
    field: String,
    meta: BinMeta,
}

pub(crate) struct SessionInner {
    id: String,
    units: Mutex<IndexMap<String, Arc<SyncUnit>>>,
    outbound: Mutex<Option<Outbound>>,
    pending_conn: Mutex<Option<PendingConn>>,
    generation: watch::Sender<u64>,
    running: Mutex<HashMap<(String, String), RunningTask>>,
    /// Serializes snapshot pipelines against attach: a task's `sync()`
    /// must not interleave with the reset-and-resend sequence.  Never
    /// held across an await.
    sync_gate: Mutex<()>,
    closed: AtomicBool,
}

impl SessionInner {
    pub(crate) fn sync_gate(&self) -> MutexGuard<'_, ()> {
        lock(&self.sync_gate)
    }

    pub(crate) fn unit(&self, key: &str) -> Option<Arc<SyncUnit>> {
        lock(&self.units).get(key).cloned()
    }

    /// Enqueue one frame on the current attachment; dropped when detached.
    pub(crate) fn send_frame(&self, frame: Frame) {
        if let Some(out) = &*lock(&self.outbound) {
            let _ = out.tx.send(frame);
        }
    }

    pub(crate) fn send_event(&self, event: String, data: Value) {
        let envelope = Envelope::new(event, data);
        match sync_protocol::encode(&envelope) {
            Ok(text) => self.send_frame(Frame::Text(text)),
            Err(e) => warn!(session = %self.id, error = %e, "failed to encode envelope"),
        }
    }

    pub(crate) fn send_error(
        &self,
        key: &str,
        name: Option<&str>,
        message: &str,
        path: Option<String>,
    ) {
        let event = EventName::new(key, EventKind::Error(name.map(ToOwned::to_owned)));
        let report = ErrorReport {
            message: message.to_owned(),
            path,
        };
        if let Ok(data) = serde_json::to_value(&report) {
            self.send_event(event.to_string(), data);
        }
    }

    fn release_outbound(&self, generation: u64) {
        let mut out = lock(&self.outbound);
        if out.as_ref().is_some_and(|o| o.generation == generation) {
            *out = None;
        }
    }

    fn finish_task(&self, key: &str, name: &str, outcome: TaskOutcome, error: Option<String>) {
        lock(&self.running).remove(&(key.to_owned(), name.to_owned()));
        let done = TaskDone { outcome, error };
        if let Ok(data) = serde_json::to_value(&done) {
            let event = EventName::new(key, EventKind::TaskDone(name.to_owned()));
            self.send_event(event.to_string(), data);
        }
    }
}

/// One logical client identity: a set of synced units plus whichever
/// transport is currently attached.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        debug!(session = %id, "session created");
        Self {
            inner: Arc::new(SessionInner {
                id,
                units: Mutex::new(IndexMap::new()),
                outbound: Mutex::new(None),
                pending_conn: Mutex::new(None),
                generation: watch::Sender::new(0),
                running: Mutex::new(HashMap::new()),
                sync_gate: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// Make this session ambient for the duration of `fut`, so that
    /// objects constructed inside can `register_ambient`.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        CURRENT_SESSION.scope(self.clone(), fut).await
    }

    /// The ambient session set by the nearest enclosing [`Session::scope`]
    /// (handler and task bodies run inside one automatically).
    pub fn current() -> Option<Session> {
        CURRENT_SESSION.try_with(Clone::clone).ok()
    }

    async fn in_scope<F: Future>(&self, fut: F) -> F::Output {
        let already = Session::current().is_some_and(|s| Arc::ptr_eq(&s.inner, &self.inner));
        if already {
            fut.await
        } else {
            self.scope(fut).await
        }
    }

    pub(crate) fn register_unit(&self, unit: SyncUnit) -> Result<(), RegisterError> {
        let key = unit.key.clone();
        let unit = Arc::new(unit);
        {
            let mut units = lock(&self.inner.units);
            if units.contains_key(&key) {
                return Err(RegisterError::DuplicateKey(key));
            }
            units.insert(key.clone(), unit.clone());
        }
        info!(session = %self.inner.id, key = %key, "unit registered");
        // A client is already connected: let it learn the new unit now.
        let gate = self.inner.sync_gate();
        if lock(&self.inner.outbound).is_some() {
            unit.emit_full_state(&self.inner);
        }
        drop(gate);
        Ok(())
    }

    /// Remove a unit; its events are discarded from now on.
    pub fn detach_unit(&self, key: &str) {
        lock(&self.inner.units).shift_remove(key);
    }

    /// Adopt a transport, superseding any previous attachment.
    ///
    /// Every unit's snapshot is cleared and a full `SET` per unit is
    /// queued in registration order; the queue drains once [`run`] is
    /// driving the new transport.
    ///
    /// [`run`]: Session::run
    pub fn attach<T: Transport>(&self, transport: T) {
        if self.is_closed() {
            warn!(session = %self.inner.id, "attach on closed session, ignoring");
            return;
        }
        let gate = self.inner.sync_gate();
        let mut generation = 0;
        self.inner.generation.send_modify(|g| {
            *g += 1;
            generation = *g;
        });
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.outbound) = Some(Outbound { generation, tx });
        *lock(&self.inner.pending_conn) = Some(PendingConn {
            generation,
            transport: Box::new(transport),
            rx,
        });
        info!(session = %self.inner.id, generation, "transport attached");

        let units: Vec<Arc<SyncUnit>> = lock(&self.inner.units).values().cloned().collect();
        for unit in units {
            unit.reset_snapshot();
            unit.emit_full_state(&self.inner);
        }
        drop(gate);
    }

    /// Drive the current attachment until the peer closes, the transport
    /// errors, the attachment is superseded, or the session closes.
    pub async fn run(&self) -> Result<(), SessionError> {
        let PendingConn {
            generation,
            mut transport,
            mut rx,
        } = lock(&self.inner.pending_conn)
            .take()
            .ok_or(SessionError::NotAttached)?;

        let mut gen_rx = self.inner.generation.subscribe();
        if *gen_rx.borrow_and_update() != generation {
            // Superseded before we ever started reading.
            transport.close().await;
            return Ok(());
        }

        let mut pending_binary: Option<PendingBinary> = None;
        let mut result = Ok(());
        loop {
            tokio::select! {
                biased;
                _ = gen_rx.changed() => {
                    debug!(session = %self.inner.id, "attachment superseded");
                    break;
                }
                Some(frame) = rx.recv() => {
                    if let Err(e) = transport.send_frame(frame).await {
                        result = Err(e.into());
                        break;
                    }
                }
                inbound = transport.next_frame() => {
                    match inbound {
                        Ok(None) => {
                            info!(session = %self.inner.id, "peer closed transport");
                            break;
                        }
                        Err(e) => {
                            warn!(session = %self.inner.id, error = %e, "transport error");
                            result = Err(e.into());
                            break;
                        }
                        Ok(Some(Frame::Text(text))) => {
                            if let Some(pending) = pending_binary.take() {
                                // Unpaired binary: closes the transport, not the session.
                                warn!(
                                    session = %self.inner.id,
                                    field = %pending.field,
                                    "text frame while awaiting binary payload, closing transport"
                                );
                                break;
                            }
                            self.dispatch_text(&text, &mut pending_binary).await;
                        }
                        Ok(Some(Frame::Binary(bytes))) => match pending_binary.take() {
                            None => {
                                warn!(session = %self.inner.id, "binary frame without metadata, closing transport");
                                break;
                            }
                            Some(pending) => {
                                if pending.meta.size != bytes.len() as u64 {
                                    warn!(
                                        session = %self.inner.id,
                                        field = %pending.field,
                                        expected = pending.meta.size,
                                        got = bytes.len(),
                                        "binary payload size mismatch, discarding"
                                    );
                                } else {
                                    pending.unit.receive_binary(&pending.field, bytes);
                                }
                            }
                        },
                    }
                }
            }
        }
        transport.close().await;
        self.inner.release_outbound(generation);
        result
    }

    async fn dispatch_text(&self, text: &str, pending: &mut Option<PendingBinary>) {
        match sync_protocol::decode(text) {
            Ok(envelope) => self.dispatch(envelope, pending).await,
            Err(e) => warn!(session = %self.inner.id, error = %e, "malformed envelope, discarding"),
        }
    }

    /// Route one envelope to its unit.  Handlers are awaited to
    /// completion here, which is what serializes actions; `TASK_START`
    /// returns at spawn.
    async fn dispatch(&self, envelope: Envelope, pending: &mut Option<PendingBinary>) {
        let Some(name) = EventName::parse(&envelope.event) else {
            warn!(session = %self.inner.id, event = %envelope.event, "unknown event type, discarding");
            return;
        };
        let Some(unit) = self.inner.unit(&name.key) else {
            warn!(session = %self.inner.id, key = %name.key, "no unit for key, discarding");
            return;
        };
        match name.kind {
            EventKind::Set => unit.handle_set(&self.inner, envelope.data),
            EventKind::Get => {
                let _gate = self.inner.sync_gate();
                unit.emit_full_state(&self.inner);
            }
            EventKind::Patch => unit.handle_patch(&self.inner, envelope.data),
            EventKind::Action(action) => {
                self.in_scope(unit.handle_action(&self.inner, &action, envelope.data))
                    .await;
            }
            EventKind::TaskStart(task) => self.start_task(&unit, &task, envelope.data),
            EventKind::TaskCancel(task) => self.cancel_task(&unit, &task).await,
            EventKind::BinMeta(field) => self.arm_binary(&unit, field, envelope.data, pending),
            EventKind::TaskDone(_) | EventKind::Error(_) => {
                warn!(session = %self.inner.id, event = %envelope.event, "server-bound event from peer, discarding");
            }
        }
    }

    /// Coerce arguments, claim the `(key, name)` slot, and spawn the task
    /// body.  Everything here is synchronous, so task starts are
    /// sequenced in arrival order even though bodies detach.
    fn start_task(&self, unit: &Arc<SyncUnit>, name: &str, data: Value) {
        let Some(entry) = unit.tasks.get(name) else {
            warn!(session = %self.inner.id, key = %unit.key, task = %name, "unknown task, discarding");
            return;
        };
        let args = match coerce_args(unit.validator(), &entry.params, &data) {
            Ok(args) => args,
            Err(failure) => {
                let path = (!failure.path.is_empty()).then(|| failure.path.clone());
                self.inner
                    .send_error(&unit.key, Some(name), &failure.to_string(), path);
                return;
            }
        };

        let slot = (unit.key.clone(), name.to_owned());
        let mut running = lock(&self.inner.running);
        if running.contains_key(&slot) {
            warn!(session = %self.inner.id, key = %unit.key, task = %name, "task already running, discarding start");
            return;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let ctx = TaskCtx {
            cancelled: cancelled.clone(),
        };
        let body = (entry.start)(args, ctx);
        let join = tokio::spawn(CURRENT_SESSION.scope(self.clone(), body));
        running.insert(
            slot,
            RunningTask {
                abort: join.abort_handle(),
                cancelled: cancelled.clone(),
            },
        );
        drop(running);

        let inner = self.inner.clone();
        let key = unit.key.clone();
        let task = name.to_owned();
        tokio::spawn(async move {
            let (outcome, error) = match join.await {
                Ok(Ok(())) => {
                    if cancelled.load(Ordering::Relaxed) {
                        (TaskOutcome::Cancelled, None)
                    } else {
                        (TaskOutcome::Completed, None)
                    }
                }
                Ok(Err(e)) => (TaskOutcome::Error, Some(e.to_string())),
                Err(join_err) if join_err.is_cancelled() => (TaskOutcome::Cancelled, None),
                Err(_) => (TaskOutcome::Error, Some("task panicked".to_owned())),
            };
            debug!(key = %key, task = %task, ?outcome, "task finished");
            inner.finish_task(&key, &task, outcome, error);
        });
    }

    /// Flag the task as cancelling, then either run the declared cancel
    /// hook or abort the suspension.  `TASK_DONE` is emitted by the
    /// completion monitor in both cases.
    async fn cancel_task(&self, unit: &Arc<SyncUnit>, name: &str) {
        let slot = (unit.key.clone(), name.to_owned());
        let Some((abort, cancelled)) = lock(&self.inner.running)
            .get(&slot)
            .map(|t| (t.abort.clone(), t.cancelled.clone()))
        else {
            warn!(session = %self.inner.id, key = %unit.key, task = %name, "cancel for task that is not running");
            return;
        };
        cancelled.store(true, Ordering::Relaxed);
        match unit.tasks.get(name).and_then(|t| t.cancel.clone()) {
            Some(hook) => {
                if let Err(e) = self.in_scope(hook()).await {
                    self.inner
                        .send_error(&unit.key, Some(name), &e.to_string(), None);
                }
            }
            None => abort.abort(),
        }
    }

    fn arm_binary(
        &self,
        unit: &Arc<SyncUnit>,
        field: String,
        data: Value,
        pending: &mut Option<PendingBinary>,
    ) {
        let meta: BinMeta = match serde_json::from_value(data) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(session = %self.inner.id, field = %field, error = %e, "invalid binary metadata, discarding");
                return;
            }
        };
        if !unit.has_binary_field(&field) {
            warn!(session = %self.inner.id, key = %unit.key, field = %field, "metadata for unknown binary field, discarding");
            return;
        }
        *pending = Some(PendingBinary {
            unit: unit.clone(),
            field,
            meta,
        });
    }

    /// End the session: cancel running tasks, release the transport, drop
    /// the units.  Terminal.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        info!(session = %self.inner.id, "session closing");
        for (_, task) in lock(&self.inner.running).drain() {
            task.abort.abort();
        }
        *lock(&self.inner.outbound) = None;
        *lock(&self.inner.pending_conn) = None;
        self.inner.generation.send_modify(|g| *g += 1);
        lock(&self.inner.units).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}
