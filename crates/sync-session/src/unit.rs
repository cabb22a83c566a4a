//! One registered synced object: field projection, snapshot diffing, and
//! the handler tables for its actions, tasks, and binary fields.
//!
//! All snapshot bookkeeping is synchronous; suspension happens only in
//! user handler bodies and at the transport write.  `sync()` therefore
//! never holds a lock across an await.

use crate::error::{ProjectionError, SyncError, ValidationFailure};
use crate::registry::TaskCtx;
use crate::session::SessionInner;
use crate::validator::{TypeDesc, Validator};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_protocol::{BinMeta, EventKind, EventName, Frame};
use tracing::warn;

pub(crate) type BoxFut = Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send>>;
pub(crate) type ProjectFn = Arc<dyn Fn() -> Result<Value, ProjectionError> + Send + Sync>;
pub(crate) type AssignFn = Arc<dyn Fn(Value) -> Result<(), SyncError> + Send + Sync>;
pub(crate) type AsyncActionFn = Arc<dyn Fn(Value) -> BoxFut + Send + Sync>;
pub(crate) type BlockingActionFn = Arc<dyn Fn(Value) -> Result<(), SyncError> + Send + Sync>;
pub(crate) type TaskStartFn = Arc<dyn Fn(Value, TaskCtx) -> BoxFut + Send + Sync>;
pub(crate) type CancelFn = Arc<dyn Fn() -> BoxFut + Send + Sync>;
pub(crate) type BinReadFn = Arc<dyn Fn() -> Option<Vec<u8>> + Send + Sync>;
pub(crate) type BinWriteFn = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// One declared parameter of an action or task.
pub(crate) struct ParamSpec {
    pub name: String,
    pub ty: Option<TypeDesc>,
}

/// Source attribute -> exposed wire field.
pub(crate) struct FieldSpec {
    pub attr: String,
    pub wire: String,
    pub ty: Option<TypeDesc>,
}

pub(crate) enum ActionBody {
    Async(AsyncActionFn),
    /// Run on the blocking worker pool to keep the dispatcher responsive.
    Blocking(BlockingActionFn),
}

pub(crate) struct ActionEntry {
    pub params: Vec<ParamSpec>,
    pub body: ActionBody,
}

pub(crate) struct TaskEntry {
    pub params: Vec<ParamSpec>,
    pub start: TaskStartFn,
    pub cancel: Option<CancelFn>,
}

pub(crate) struct BinaryField {
    pub wire: String,
    pub mime: Option<String>,
    pub read: BinReadFn,
    pub write: Option<BinWriteFn>,
    /// Content hash of the last payload sent on the current attachment.
    pub last_sent: Mutex<Option<u64>>,
}

/// How owner state maps to and from the wire document.
pub(crate) enum Pipeline {
    /// Declared fields: serde-project the owner, select and rename.
    Declared {
        fields: Vec<FieldSpec>,
        project: ProjectFn,
        assign: AssignFn,
    },
    /// Caller-built projection and apply; no validation.
    Manual { project: ProjectFn, apply: AssignFn },
}

pub(crate) struct SyncUnit {
    pub key: String,
    pipeline: Pipeline,
    pub actions: HashMap<String, ActionEntry>,
    pub tasks: HashMap<String, TaskEntry>,
    binary: Vec<BinaryField>,
    validator: Arc<dyn Validator>,
    last_snapshot: Mutex<Option<Value>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

impl SyncUnit {
    pub(crate) fn new(
        key: String,
        pipeline: Pipeline,
        actions: HashMap<String, ActionEntry>,
        tasks: HashMap<String, TaskEntry>,
        binary: Vec<BinaryField>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        Self {
            key,
            pipeline,
            actions,
            tasks,
            binary,
            validator,
            last_snapshot: Mutex::new(None),
        }
    }

    fn event(&self, kind: EventKind) -> String {
        EventName::new(&self.key, kind).to_string()
    }

    /// The JSON document the peer should hold right now.
    pub(crate) fn projection(&self) -> Result<Value, ProjectionError> {
        match &self.pipeline {
            Pipeline::Manual { project, .. } => (project)(),
            Pipeline::Declared {
                fields, project, ..
            } => {
                let doc = (project)()?;
                let Value::Object(obj) = doc else {
                    return Err(ProjectionError::NotAnObject);
                };
                let mut out = Map::new();
                for f in fields {
                    let v = obj
                        .get(&f.attr)
                        .cloned()
                        .ok_or_else(|| ProjectionError::MissingAttr(f.attr.clone()))?;
                    out.insert(f.wire.clone(), v);
                }
                Ok(Value::Object(out))
            }
        }
    }

    /// Forget what the peer holds; the next sync emits a full `SET`.
    pub(crate) fn reset_snapshot(&self) {
        *lock(&self.last_snapshot) = None;
        for b in &self.binary {
            *lock(&b.last_sent) = None;
        }
    }

    /// Project, diff against the last snapshot, emit the minimal patch.
    ///
    /// Emits a full `SET` when no snapshot exists on this attachment, a
    /// `PATCH` when the diff is non-empty, nothing when the projections
    /// are structurally equal.
    pub(crate) fn sync(&self, session: &SessionInner) -> Result<(), SyncError> {
        let _gate = session.sync_gate();
        let new = match self.projection() {
            Ok(v) => v,
            Err(e) => {
                session.send_error(&self.key, None, &e.to_string(), None);
                return Err(e.into());
            }
        };
        {
            let mut snap = lock(&self.last_snapshot);
            match snap.as_ref() {
                None => {
                    session.send_event(self.event(EventKind::Set), new.clone());
                    *snap = Some(new);
                }
                Some(old) => {
                    let patch = json_patch::diff(old, &new);
                    if !patch.0.is_empty() {
                        if let Ok(data) = serde_json::to_value(&patch) {
                            session.send_event(self.event(EventKind::Patch), data);
                        }
                        *snap = Some(new);
                    }
                }
            }
        }
        self.sync_binary(session, false);
        Ok(())
    }

    /// Unconditional full `SET` plus all binary payloads.  Used on attach
    /// and on an inbound `GET`.
    pub(crate) fn emit_full_state(&self, session: &SessionInner) {
        match self.projection() {
            Ok(v) => {
                session.send_event(self.event(EventKind::Set), v.clone());
                *lock(&self.last_snapshot) = Some(v);
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "projection failed during full sync");
                session.send_error(&self.key, None, &e.to_string(), None);
            }
        }
        self.sync_binary(session, true);
    }

    fn sync_binary(&self, session: &SessionInner, force: bool) {
        for b in &self.binary {
            let Some(bytes) = (b.read)() else { continue };
            let digest = content_hash(&bytes);
            {
                let mut last = lock(&b.last_sent);
                if !force && *last == Some(digest) {
                    continue;
                }
                *last = Some(digest);
            }
            let meta = BinMeta {
                size: bytes.len() as u64,
                mime: b.mime.clone(),
            };
            if let Ok(data) = serde_json::to_value(&meta) {
                session.send_event(self.event(EventKind::BinMeta(b.wire.clone())), data);
                session.send_frame(Frame::Binary(bytes));
            }
        }
    }

    /// Inbound `SET`: validate per declared types, assign back onto the
    /// owner, refresh the snapshot.
    pub(crate) fn handle_set(&self, session: &SessionInner, data: Value) {
        let _gate = session.sync_gate();
        if let Err(e) = self.apply_inbound(data) {
            self.report(session, None, &e);
        }
    }

    /// Inbound `PATCH`: apply the RFC 6902 patch to the current
    /// projection, then run the same validate-and-assign path as `SET`.
    pub(crate) fn handle_patch(&self, session: &SessionInner, data: Value) {
        let _gate = session.sync_gate();
        let result = (|| -> Result<(), SyncError> {
            let patch: json_patch::Patch = serde_json::from_value(data)
                .map_err(|e| ValidationFailure::new("", format!("invalid JSON Patch: {e}")))?;
            let mut doc = self.projection()?;
            json_patch::patch(&mut doc, &patch)
                .map_err(|e| ValidationFailure::new("", format!("patch rejected: {e}")))?;
            self.apply_inbound(doc)
        })();
        if let Err(e) = result {
            self.report(session, None, &e);
        }
    }

    fn apply_inbound(&self, data: Value) -> Result<(), SyncError> {
        match &self.pipeline {
            Pipeline::Manual { apply, .. } => (apply)(data)?,
            Pipeline::Declared { fields, assign, .. } => {
                let Value::Object(obj) = data else {
                    return Err(ValidationFailure::new("", "expected a state object").into());
                };
                let mut source = Map::new();
                for f in fields {
                    let path = format!("/{}", f.wire);
                    let raw = obj
                        .get(&f.wire)
                        .ok_or_else(|| ValidationFailure::new(&path, "missing field"))?;
                    let v = match &f.ty {
                        Some(ty) => self.validator.validate(ty, raw, &path)?,
                        None => raw.clone(),
                    };
                    source.insert(f.attr.clone(), v);
                }
                (assign)(Value::Object(source))?;
            }
        }
        let snap = self.projection()?;
        *lock(&self.last_snapshot) = Some(snap);
        Ok(())
    }

    /// Inbound `ACTION`: coerce arguments, then run the handler.  The
    /// dispatcher awaits this to completion, which is what makes actions
    /// strictly sequential within a session.
    pub(crate) async fn handle_action(&self, session: &SessionInner, name: &str, data: Value) {
        let Some(entry) = self.actions.get(name) else {
            warn!(key = %self.key, action = %name, "unknown action, discarding");
            return;
        };
        let args = match coerce_args(self.validator.as_ref(), &entry.params, &data) {
            Ok(args) => args,
            Err(failure) => {
                self.report(session, Some(name), &failure.clone().into());
                return;
            }
        };
        let result = match &entry.body {
            ActionBody::Async(f) => f(args).await,
            ActionBody::Blocking(f) => {
                let f = f.clone();
                match tokio::task::spawn_blocking(move || f(args)).await {
                    Ok(r) => r,
                    Err(_) => Err(SyncError::handler("action handler panicked")),
                }
            }
        };
        if let Err(e) = result {
            self.report(session, Some(name), &e);
        }
    }

    /// Inbound binary frame routed to the field announced by the
    /// preceding `BIN_META`.
    pub(crate) fn receive_binary(&self, wire: &str, bytes: Vec<u8>) {
        let Some(field) = self.binary.iter().find(|b| b.wire == wire) else {
            warn!(key = %self.key, field = %wire, "binary frame for unknown field, discarding");
            return;
        };
        let Some(write) = &field.write else {
            warn!(key = %self.key, field = %wire, "binary field is read-only, discarding");
            return;
        };
        // Remember what the peer holds so the next sync doesn't echo it.
        *lock(&field.last_sent) = Some(content_hash(&bytes));
        write(bytes);
    }

    pub(crate) fn has_binary_field(&self, wire: &str) -> bool {
        self.binary.iter().any(|b| b.wire == wire)
    }

    pub(crate) fn validator(&self) -> &dyn Validator {
        self.validator.as_ref()
    }

    fn report(&self, session: &SessionInner, name: Option<&str>, error: &SyncError) {
        let path = match error {
            SyncError::Validation(v) if !v.path.is_empty() => Some(v.path.clone()),
            _ => None,
        };
        session.send_error(&self.key, name, &error.to_string(), path);
    }
}

/// Validate the inbound argument bag against the declared parameters.
///
/// Undeclared extras pass through untouched; a missing declared parameter
/// is validated as null, so it only passes for `Optional`/`Any` types.
pub(crate) fn coerce_args(
    validator: &dyn Validator,
    params: &[ParamSpec],
    data: &Value,
) -> Result<Value, ValidationFailure> {
    let empty = Map::new();
    let obj = match data {
        Value::Null => &empty,
        Value::Object(m) => m,
        _ => return Err(ValidationFailure::new("", "expected an argument object")),
    };
    let mut out = obj.clone();
    for p in params {
        if let Some(ty) = &p.ty {
            let raw = obj.get(&p.name).unwrap_or(&Value::Null);
            let v = validator.validate(ty, raw, &format!("/{}", p.name))?;
            out.insert(p.name.clone(), v);
        }
    }
    Ok(Value::Object(out))
}
