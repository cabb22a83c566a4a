//! Declarative unit registration.
//!
//! The builder is the one source of truth for a synced object's
//! declaration: which attributes are exposed (all public, an explicit
//! subset, or a fully manual pipeline), how they are named on the wire,
//! which types guard inbound writes, and which actions and tasks the
//! client may invoke.  `register` materializes the type-erased unit
//! inside a session and hands back a [`SyncHandle`] for state access and
//! `sync()` calls.

use crate::error::{ProjectionError, RegisterError, SyncError, ValidationFailure};
use crate::session::Session;
use crate::unit::{
    ActionBody, ActionEntry, BinaryField, BoxFut, FieldSpec, ParamSpec, Pipeline, SyncUnit,
    TaskEntry,
};
use crate::validator::{JsonValidator, TypeDesc, Validator};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use sync_protocol::{to_lower_camel, to_upper_snake, validate_key};

// ---------------------------------------------------------------------------
// Handler-facing types
// ---------------------------------------------------------------------------

/// The validated argument bag passed to action and task handlers.
pub struct Args(pub(crate) Value);

impl Args {
    /// Deserialize one argument.  Missing arguments read as null, so this
    /// fails for non-optional `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, SyncError> {
        let raw = self.0.get(name).cloned().unwrap_or(Value::Null);
        serde_json::from_value(raw)
            .map_err(|e| SyncError::handler(format!("argument `{name}`: {e}")))
    }

    pub fn opt<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        match self.0.get(name) {
            None | Some(Value::Null) => None,
            Some(v) => serde_json::from_value(v.clone()).ok(),
        }
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }
}

/// Cooperative cancellation signal handed to task bodies.
///
/// The flag flips when the client sends `TASK_CANCEL`; loop-shaped task
/// bodies should poll it between steps.
#[derive(Clone)]
pub struct TaskCtx {
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl TaskCtx {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A declared action/task parameter.
#[derive(Clone)]
pub struct Param {
    name: String,
    ty: Option<TypeDesc>,
}

/// Parameter with a declared type; inbound values are coerced against it.
pub fn param(name: &str, ty: TypeDesc) -> Param {
    Param {
        name: name.to_owned(),
        ty: Some(ty),
    }
}

/// Unchecked passthrough parameter.
pub fn untyped(name: &str) -> Param {
    Param {
        name: name.to_owned(),
        ty: None,
    }
}

// ---------------------------------------------------------------------------
// SyncHandle
// ---------------------------------------------------------------------------

/// Shared access to a registered owner plus the unit's sync entry point.
///
/// Cheap to clone; handlers receive a clone per invocation.  `sync()`
/// after the session is gone is a no-op, mirroring the drop semantics of
/// sends while detached.
pub struct SyncHandle<S> {
    state: Arc<RwLock<S>>,
    session: Weak<crate::session::SessionInner>,
    key: String,
}

impl<S> std::fmt::Debug for SyncHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle").field("key", &self.key).finish()
    }
}

impl<S> Clone for SyncHandle<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            session: self.session.clone(),
            key: self.key.clone(),
        }
    }
}

impl<S> SyncHandle<S> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, S> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, S> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recompute the projection, diff against the last snapshot, and emit
    /// a `SET` or minimal `PATCH`.  Emission enqueues on the attachment's
    /// FIFO; while detached this drops silently.
    pub fn sync(&self) -> Result<(), SyncError> {
        let Some(inner) = self.session.upgrade() else {
            return Ok(());
        };
        let Some(unit) = inner.unit(&self.key) else {
            return Ok(());
        };
        unit.sync(&inner)
    }
}

// ---------------------------------------------------------------------------
// Builder internals
// ---------------------------------------------------------------------------

type UserAction<S> = Arc<dyn Fn(SyncHandle<S>, Args) -> BoxFut + Send + Sync>;
type UserBlockingAction<S> =
    Arc<dyn Fn(SyncHandle<S>, Args) -> Result<(), SyncError> + Send + Sync>;
type UserTask<S> = Arc<dyn Fn(SyncHandle<S>, Args, TaskCtx) -> BoxFut + Send + Sync>;
type UserCancel<S> = Arc<dyn Fn(SyncHandle<S>) -> BoxFut + Send + Sync>;
type UserProject<S> = Arc<dyn Fn(&S) -> Result<Value, ProjectionError> + Send + Sync>;
type UserApply<S> = Arc<dyn Fn(&mut S, Value) -> Result<(), SyncError> + Send + Sync>;
type UserBinRead<S> = Arc<dyn Fn(&S) -> Option<Vec<u8>> + Send + Sync>;
type UserBinWrite<S> = Arc<dyn Fn(&mut S, Vec<u8>) + Send + Sync>;

enum Mode<S> {
    /// Every public (non-underscore) attribute of the initial state.
    All,
    /// Caller-enumerated attributes.
    Only(Vec<String>),
    /// Caller-built projection and apply; no field declaration.
    Manual {
        project: UserProject<S>,
        apply: UserApply<S>,
    },
}

enum PendingBody<S> {
    Async(UserAction<S>),
    Blocking(UserBlockingAction<S>),
}

struct PendingAction<S> {
    name: String,
    params: Vec<Param>,
    body: PendingBody<S>,
}

struct PendingTask<S> {
    name: String,
    params: Vec<Param>,
    start: UserTask<S>,
}

struct PendingBinary<S> {
    attr: String,
    mime: Option<String>,
    read: UserBinRead<S>,
    write: Option<UserBinWrite<S>>,
}

// ---------------------------------------------------------------------------
// UnitBuilder
// ---------------------------------------------------------------------------

/// Declarative configuration of one synced object.
pub struct UnitBuilder<S> {
    key: String,
    mode: Mode<S>,
    renames: HashMap<String, String>,
    camel: bool,
    types: HashMap<String, TypeDesc>,
    actions: Vec<PendingAction<S>>,
    tasks: Vec<PendingTask<S>>,
    cancels: Vec<(String, UserCancel<S>)>,
    binary: Vec<PendingBinary<S>>,
    validator: Arc<dyn Validator>,
}

impl<S> UnitBuilder<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn new(key: &str, mode: Mode<S>) -> Self {
        Self {
            key: key.to_owned(),
            mode,
            renames: HashMap::new(),
            camel: false,
            types: HashMap::new(),
            actions: Vec::new(),
            tasks: Vec::new(),
            cancels: Vec::new(),
            binary: Vec::new(),
            validator: Arc::new(JsonValidator),
        }
    }

    /// Expose every public attribute present on the initial state.
    /// Attributes whose names start with `_` are skipped.
    pub fn sync_all(key: &str) -> Self {
        Self::new(key, Mode::All)
    }

    /// Expose exactly the listed attributes.
    pub fn sync_only(key: &str, attrs: &[&str]) -> Self {
        Self::new(
            key,
            Mode::Only(attrs.iter().map(|a| (*a).to_owned()).collect()),
        )
    }

    /// Fully manual pipeline: `project` builds the wire document,
    /// `apply` consumes an inbound one.  No field validation happens.
    pub fn manual(
        key: &str,
        project: impl Fn(&S) -> Result<Value, ProjectionError> + Send + Sync + 'static,
        apply: impl Fn(&mut S, Value) -> Result<(), SyncError> + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            key,
            Mode::Manual {
                project: Arc::new(project),
                apply: Arc::new(apply),
            },
        )
    }

    /// Expose `attr` under an explicit wire name.
    pub fn rename(mut self, attr: &str, wire: &str) -> Self {
        self.renames.insert(attr.to_owned(), wire.to_owned());
        self
    }

    /// Opt in to the lowerCamel transform for field, action, and task
    /// names (`first_name` -> `firstName`).
    pub fn camel_case(mut self) -> Self {
        self.camel = true;
        self
    }

    /// Declare an inbound type for `attr`; undeclared attributes are
    /// unchecked passthrough.
    pub fn typed(mut self, attr: &str, ty: TypeDesc) -> Self {
        self.types.insert(attr.to_owned(), ty);
        self
    }

    /// Swap the validator port adapter.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Declare an action.  `name` is the method name; it is upper-snake
    /// cased on the wire (or lowerCamel'd under [`camel_case`]).
    ///
    /// [`camel_case`]: UnitBuilder::camel_case
    pub fn action<F, Fut>(mut self, name: &str, params: Vec<Param>, f: F) -> Self
    where
        F: Fn(SyncHandle<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let body: UserAction<S> = Arc::new(move |h, a| Box::pin(f(h, a)));
        self.actions.push(PendingAction {
            name: name.to_owned(),
            params,
            body: PendingBody::Async(body),
        });
        self
    }

    /// Declare a blocking action; it runs on the auxiliary worker pool so
    /// the dispatcher stays responsive.
    pub fn blocking_action<F>(mut self, name: &str, params: Vec<Param>, f: F) -> Self
    where
        F: Fn(SyncHandle<S>, Args) -> Result<(), SyncError> + Send + Sync + 'static,
    {
        self.actions.push(PendingAction {
            name: name.to_owned(),
            params,
            body: PendingBody::Blocking(Arc::new(f)),
        });
        self
    }

    /// Declare a task: the factory's future runs concurrently with event
    /// dispatch and may be cancelled.
    pub fn task<F, Fut>(mut self, name: &str, params: Vec<Param>, f: F) -> Self
    where
        F: Fn(SyncHandle<S>, Args, TaskCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let start: UserTask<S> = Arc::new(move |h, a, c| Box::pin(f(h, a, c)));
        self.tasks.push(PendingTask {
            name: name.to_owned(),
            params,
            start,
        });
        self
    }

    /// Attach a cancel hook to an already declared task.  Without one,
    /// `TASK_CANCEL` aborts the task's suspension instead.  Naming an
    /// undeclared task is caught at register time.
    pub fn on_cancel<F, Fut>(mut self, task_name: &str, f: F) -> Self
    where
        F: Fn(SyncHandle<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let hook: UserCancel<S> = Arc::new(move |h| Box::pin(f(h)));
        self.cancels.push((task_name.to_owned(), hook));
        self
    }

    /// Declare an outbound-only binary field.
    pub fn binary<R>(mut self, attr: &str, mime: Option<&str>, read: R) -> Self
    where
        R: Fn(&S) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.binary.push(PendingBinary {
            attr: attr.to_owned(),
            mime: mime.map(ToOwned::to_owned),
            read: Arc::new(read),
            write: None,
        });
        self
    }

    /// Declare a binary field the client may also write.
    pub fn binary_writable<R, W>(mut self, attr: &str, mime: Option<&str>, read: R, write: W) -> Self
    where
        R: Fn(&S) -> Option<Vec<u8>> + Send + Sync + 'static,
        W: Fn(&mut S, Vec<u8>) + Send + Sync + 'static,
    {
        self.binary.push(PendingBinary {
            attr: attr.to_owned(),
            mime: mime.map(ToOwned::to_owned),
            read: Arc::new(read),
            write: Some(Arc::new(write)),
        });
        self
    }

    /// Register with the ambient session (see [`Session::scope`]).
    pub fn register_ambient(self, state: S) -> Result<SyncHandle<S>, RegisterError> {
        let session = Session::current().ok_or(RegisterError::NoAmbientSession)?;
        self.register(state, &session)
    }

    /// Materialize the unit inside `session` and return the handle.
    pub fn register(self, state: S, session: &Session) -> Result<SyncHandle<S>, RegisterError> {
        validate_key(&self.key)?;
        let state = Arc::new(RwLock::new(state));
        let handle = SyncHandle {
            state: state.clone(),
            session: Arc::downgrade(session.inner()),
            key: self.key.clone(),
        };

        let camel = self.camel;
        let handler_name = move |raw: &str| {
            if camel {
                to_lower_camel(raw)
            } else {
                to_upper_snake(raw)
            }
        };
        let field_name = |renames: &HashMap<String, String>, attr: &str| {
            renames.get(attr).cloned().unwrap_or_else(|| {
                if camel {
                    to_lower_camel(attr)
                } else {
                    attr.to_owned()
                }
            })
        };

        let pipeline = match &self.mode {
            Mode::Manual { project, apply } => {
                let project = project.clone();
                let apply = apply.clone();
                let st = state.clone();
                let project_fn: crate::unit::ProjectFn = Arc::new(move || {
                    let guard = st.read().unwrap_or_else(PoisonError::into_inner);
                    project(&guard)
                });
                let st = state.clone();
                let apply_fn: crate::unit::AssignFn = Arc::new(move |doc| {
                    let mut guard = st.write().unwrap_or_else(PoisonError::into_inner);
                    apply(&mut guard, doc)
                });
                Pipeline::Manual {
                    project: project_fn,
                    apply: apply_fn,
                }
            }
            Mode::All | Mode::Only(_) => {
                // Attribute discovery happens once, here; the field list
                // is the single source of truth from now on.
                let initial = {
                    let guard = state.read().unwrap_or_else(PoisonError::into_inner);
                    serde_json::to_value(&*guard).map_err(ProjectionError::Serialize)?
                };
                let Value::Object(initial) = initial else {
                    return Err(ProjectionError::NotAnObject.into());
                };
                let attrs: Vec<String> = match &self.mode {
                    Mode::All => initial
                        .keys()
                        .filter(|k| !k.starts_with('_'))
                        .cloned()
                        .collect(),
                    Mode::Only(list) => {
                        for attr in list {
                            if !initial.contains_key(attr) {
                                return Err(RegisterError::UnknownAttr(attr.clone()));
                            }
                        }
                        list.clone()
                    }
                    Mode::Manual { .. } => unreachable!(),
                };

                let mut seen = HashSet::new();
                let mut fields = Vec::with_capacity(attrs.len());
                for attr in attrs {
                    let wire = field_name(&self.renames, &attr);
                    if !seen.insert(wire.clone()) {
                        return Err(RegisterError::DuplicateField(wire));
                    }
                    fields.push(FieldSpec {
                        ty: self.types.get(&attr).cloned(),
                        attr,
                        wire,
                    });
                }

                let st = state.clone();
                let project: crate::unit::ProjectFn = Arc::new(move || {
                    let guard = st.read().unwrap_or_else(PoisonError::into_inner);
                    serde_json::to_value(&*guard).map_err(ProjectionError::Serialize)
                });
                let st = state.clone();
                let assign: crate::unit::AssignFn = Arc::new(move |partial| {
                    // Merge the declared fields over the full serde image
                    // so undeclared attributes keep their values.
                    let mut full = {
                        let guard = st.read().unwrap_or_else(PoisonError::into_inner);
                        serde_json::to_value(&*guard)
                            .map_err(|e| SyncError::Projection(e.into()))?
                    };
                    if let (Value::Object(full_obj), Value::Object(partial)) = (&mut full, partial)
                    {
                        for (k, v) in partial {
                            full_obj.insert(k, v);
                        }
                    }
                    let replacement: S = serde_json::from_value(full).map_err(|e| {
                        SyncError::Validation(ValidationFailure::new(
                            "",
                            format!("state rejected: {e}"),
                        ))
                    })?;
                    *st.write().unwrap_or_else(PoisonError::into_inner) = replacement;
                    Ok(())
                });
                Pipeline::Declared {
                    fields,
                    project,
                    assign,
                }
            }
        };

        let mut names = HashSet::new();
        let mut actions = HashMap::new();
        for pending in self.actions {
            let name = handler_name(&pending.name);
            if !names.insert(name.clone()) {
                return Err(RegisterError::DuplicateName(name));
            }
            let params = pending.params.into_iter().map(Param::into_spec).collect();
            let body = match pending.body {
                PendingBody::Async(f) => {
                    let h = handle.clone();
                    ActionBody::Async(Arc::new(move |args| f(h.clone(), Args(args))))
                }
                PendingBody::Blocking(f) => {
                    let h = handle.clone();
                    ActionBody::Blocking(Arc::new(move |args| f(h.clone(), Args(args))))
                }
            };
            actions.insert(name, ActionEntry { params, body });
        }

        let mut cancels: HashMap<String, UserCancel<S>> = HashMap::new();
        for (task_name, hook) in self.cancels {
            cancels.insert(handler_name(&task_name), hook);
        }

        let mut tasks = HashMap::new();
        for pending in self.tasks {
            let name = handler_name(&pending.name);
            if !names.insert(name.clone()) {
                return Err(RegisterError::DuplicateName(name));
            }
            let params = pending.params.into_iter().map(Param::into_spec).collect();
            let start = {
                let f = pending.start;
                let h = handle.clone();
                Arc::new(move |args, ctx| f(h.clone(), Args(args), ctx)) as crate::unit::TaskStartFn
            };
            let cancel = cancels.remove(&name).map(|f| {
                let h = handle.clone();
                Arc::new(move || f(h.clone())) as crate::unit::CancelFn
            });
            tasks.insert(
                name,
                TaskEntry {
                    params,
                    start,
                    cancel,
                },
            );
        }
        if let Some(orphan) = cancels.into_keys().next() {
            return Err(RegisterError::UnknownTask(orphan));
        }

        let mut binary = Vec::with_capacity(self.binary.len());
        let mut bin_seen = HashSet::new();
        for pending in self.binary {
            let wire = field_name(&self.renames, &pending.attr);
            if !bin_seen.insert(wire.clone()) {
                return Err(RegisterError::DuplicateField(wire));
            }
            let read = {
                let f = pending.read;
                let st = state.clone();
                Arc::new(move || {
                    let guard = st.read().unwrap_or_else(PoisonError::into_inner);
                    f(&guard)
                }) as crate::unit::BinReadFn
            };
            let write = pending.write.map(|f| {
                let st = state.clone();
                Arc::new(move |bytes| {
                    let mut guard = st.write().unwrap_or_else(PoisonError::into_inner);
                    f(&mut guard, bytes);
                }) as crate::unit::BinWriteFn
            });
            binary.push(BinaryField {
                wire,
                mime: pending.mime,
                read,
                write,
                last_sent: Mutex::new(None),
            });
        }

        let unit = SyncUnit::new(
            self.key,
            pipeline,
            actions,
            tasks,
            binary,
            self.validator,
        );
        session.register_unit(unit)?;
        Ok(handle)
    }
}

impl Param {
    fn into_spec(self) -> ParamSpec {
        ParamSpec {
            name: self.name,
            ty: self.ty,
        }
    }
}
