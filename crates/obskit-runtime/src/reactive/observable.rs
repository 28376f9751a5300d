#![forbid(unsafe_code)]

//! Shared, version-tracked observable values.
//!
//! # Design
//!
//! [`Observable<T>`] is a cheap cloneable handle to state behind an `Arc`.
//! Observers are callbacks registered with [`subscribe`](Observable::subscribe)
//! or [`observe`](Observable::observe); each returns an RAII
//! [`Subscription`] that unregisters on drop.
//!
//! Writes come in two flavors:
//!
//! - [`set`](Observable::set) commits immediately and notifies observers on
//!   the calling thread.
//! - [`post`](Observable::post) stores a pending value and queues its commit
//!   on the observable's [`Dispatcher`]. Posts issued before the queue runs
//!   coalesce: only the newest pending value is committed, by a single task.
//!
//! An optional [`Activation`] hook is told when the observer count crosses
//! zero. Derived observables use it to hold upstream subscriptions only while
//! someone is listening.
//!
//! # Invariants
//!
//! 1. Version increments exactly once per committed write (the initial value
//!    of [`Observable::new`] counts as the first).
//! 2. An observer never receives an older version after a newer one.
//! 3. `on_active` and `on_inactive` strictly alternate, starting with
//!    `on_active`.
//! 4. A distinct observable never notifies for a value equal to the one it
//!    holds.
//!
//! # Failure Modes
//!
//! - **Observer panics**: the panic unwinds into the writer. State is already
//!   committed; poisoned locks are recovered on next access.
//! - **Dispatcher closed**: [`post`](Observable::post) returns
//!   [`Error::DispatcherClosed`] and the pending value is discarded.
//!
//! [`Error::DispatcherClosed`]: obskit_core::Error::DispatcherClosed

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use obskit_core::dispatch::Dispatcher;
use obskit_core::error::Result;

use super::lock;

/// Lifecycle hook invoked when an observable's observer count crosses zero.
pub trait Activation: Send + Sync {
    /// The first observer attached.
    fn on_active(&self);
    /// The last observer detached.
    fn on_inactive(&self);
}

struct Observer<T> {
    id: u64,
    callback: Box<dyn Fn(&T) + Send + Sync>,
    /// Highest version delivered to this observer.
    seen: AtomicU64,
}

impl<T> Observer<T> {
    fn deliver(&self, version: u64, value: &T) {
        if self.seen.fetch_max(version, Ordering::SeqCst) < version {
            (self.callback)(value);
        }
    }
}

struct State<T> {
    value: Option<T>,
    pending: Option<T>,
    version: u64,
    observers: Vec<Arc<Observer<T>>>,
    next_id: u64,
}

impl<T> State<T> {
    fn latest(&self) -> Option<&T> {
        self.pending.as_ref().or(self.value.as_ref())
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Serializes observer-count transitions and their hooks.
    lifecycle: Mutex<()>,
    dispatcher: Dispatcher,
    distinct: bool,
    activation: Option<Arc<dyn Activation>>,
}

type Notification<T> = (Vec<Arc<Observer<T>>>, u64, T);

/// What [`Observable::post_unless_same`] did with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostOutcome {
    Posted,
    /// Equal to a held value; nothing changed.
    Unchanged,
    /// Equal to the committed value; the pending post was discarded.
    Cancelled,
}

/// Removes a freshly registered observer if registration unwinds before its
/// [`Subscription`] exists.
struct Registration<'a, T> {
    shared: &'a Shared<T>,
    id: u64,
    armed: bool,
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.shared.state)
                .observers
                .retain(|observer| observer.id != self.id);
        }
    }
}

/// A shared value holder with change notification.
///
/// Cloning an `Observable` creates a new handle to the **same** value.
pub struct Observable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Observable")
            .field("value", &state.value)
            .field("pending", &state.pending)
            .field("version", &state.version)
            .field("observers", &state.observers.len())
            .field("distinct", &self.shared.distinct)
            .finish()
    }
}

impl<T> Observable<T> {
    /// The dispatcher that [`post`](Self::post) queues commits on.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    /// Whether writes equal to the held value are dropped.
    #[must_use]
    pub fn is_distinct(&self) -> bool {
        self.shared.distinct
    }

    /// Number of committed writes.
    #[must_use]
    pub fn version(&self) -> u64 {
        lock(&self.shared.state).version
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        lock(&self.shared.state).observers.len()
    }

    /// Whether at least one observer is registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.observer_count() > 0
    }

    /// Whether a value has been committed.
    #[must_use]
    pub fn has_value(&self) -> bool {
        lock(&self.shared.state).value.is_some()
    }

    /// Whether a posted value is waiting for the dispatcher.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        lock(&self.shared.state).pending.is_some()
    }

    /// Access the committed value by reference.
    ///
    /// The closure runs under the value lock and must not write to this
    /// observable.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let state = lock(&self.shared.state);
        f(state.value.as_ref())
    }

    /// A handle that does not keep the value alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakObservable<T> {
        WeakObservable {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Whether both handles point at the same value.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observable<T> {
    fn build(
        dispatcher: &Dispatcher,
        value: Option<T>,
        distinct: bool,
        activation: Option<Arc<dyn Activation>>,
    ) -> Self {
        let version = u64::from(value.is_some());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    value,
                    pending: None,
                    version,
                    observers: Vec::new(),
                    next_id: 0,
                }),
                lifecycle: Mutex::new(()),
                dispatcher: dispatcher.clone(),
                distinct,
                activation,
            }),
        }
    }

    /// Create an observable holding `value`.
    #[must_use]
    pub fn new(dispatcher: &Dispatcher, value: T) -> Self {
        Self::build(dispatcher, Some(value), false, None)
    }

    /// Create an observable with no value yet.
    #[must_use]
    pub fn empty(dispatcher: &Dispatcher) -> Self {
        Self::build(dispatcher, None, false, None)
    }

    /// Create a distinct-until-changed observable holding `value`.
    ///
    /// [`set`](Self::set) and [`post`](Self::post) of a value equal to the
    /// held one are no-ops: no version bump, no notification.
    #[must_use]
    pub fn distinct(dispatcher: &Dispatcher, value: T) -> Self {
        Self::build(dispatcher, Some(value), true, None)
    }

    /// Create an empty observable whose observer-count transitions drive
    /// `activation`.
    #[must_use]
    pub fn with_activation(dispatcher: &Dispatcher, activation: Arc<dyn Activation>) -> Self {
        Self::build(dispatcher, None, false, Some(activation))
    }

    /// Clone of the committed value.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        lock(&self.shared.state).value.clone()
    }

    /// Clone of the newest value: the pending post if any, else the committed
    /// value.
    #[must_use]
    pub fn latest(&self) -> Option<T> {
        lock(&self.shared.state).latest().cloned()
    }

    /// Commit `value` and notify observers on the calling thread.
    pub fn set(&self, value: T) {
        let notification = {
            let mut state = lock(&self.shared.state);
            self.store(&mut state, value)
        };
        if let Some((observers, version, value)) = notification {
            notify(&observers, version, &value);
        }
    }

    /// Queue `value` to be committed on the dispatch context.
    ///
    /// On a distinct observable, a value equal to the newest (pending or
    /// committed) value is dropped.
    pub fn post(&self, value: T) -> Result<()> {
        let schedule = {
            let mut state = lock(&self.shared.state);
            if self.shared.distinct && state.latest() == Some(&value) {
                tracing::trace!(message = "observable.post_suppressed");
                return Ok(());
            }
            state.pending.replace(value).is_none()
        };
        if schedule {
            self.schedule_commit()?;
        }
        Ok(())
    }

    /// Post `value` unless `same` matches it against the held values.
    ///
    /// A match with the committed value also discards any pending post, so
    /// the committed value stands and no observer is notified. A match with
    /// only the pending value leaves that post in place.
    pub(crate) fn post_unless_same(
        &self,
        value: T,
        same: impl Fn(&T, &T) -> bool,
    ) -> Result<PostOutcome> {
        let schedule = {
            let mut state = lock(&self.shared.state);
            if state.value.as_ref().is_some_and(|current| same(current, &value)) {
                return Ok(match state.pending.take() {
                    Some(_) => PostOutcome::Cancelled,
                    None => PostOutcome::Unchanged,
                });
            }
            if state.pending.as_ref().is_some_and(|pending| same(pending, &value)) {
                return Ok(PostOutcome::Unchanged);
            }
            state.pending.replace(value).is_none()
        };
        if schedule {
            self.schedule_commit()?;
        }
        Ok(PostOutcome::Posted)
    }

    fn schedule_commit(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.shared);
        let task = Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                Observable { shared }.commit_pending();
            }
        });
        if let Err(err) = self.shared.dispatcher.dispatch(task) {
            lock(&self.shared.state).pending = None;
            return Err(err);
        }
        Ok(())
    }

    /// Register `f` for future changes only.
    pub fn subscribe(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.attach(Box::new(f), false)
    }

    /// Register `f` and immediately deliver the committed value, if any.
    pub fn observe(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.attach(Box::new(f), true)
    }

    fn store(&self, state: &mut State<T>, value: T) -> Option<Notification<T>> {
        if self.shared.distinct && state.value.as_ref() == Some(&value) {
            tracing::trace!(message = "observable.set_suppressed");
            return None;
        }
        state.value = Some(value.clone());
        state.version += 1;
        Some((state.observers.clone(), state.version, value))
    }

    fn commit_pending(&self) {
        let notification = {
            let mut state = lock(&self.shared.state);
            match state.pending.take() {
                Some(value) => self.store(&mut state, value),
                None => None,
            }
        };
        if let Some((observers, version, value)) = notification {
            notify(&observers, version, &value);
        }
    }

    fn attach(&self, callback: Box<dyn Fn(&T) + Send + Sync>, replay: bool) -> Subscription {
        let lifecycle = lock(&self.shared.lifecycle);
        let (observer, first, current) = {
            let mut state = lock(&self.shared.state);
            let id = state.next_id;
            state.next_id += 1;
            let seen = if replay { 0 } else { state.version };
            let observer = Arc::new(Observer {
                id,
                callback,
                seen: AtomicU64::new(seen),
            });
            state.observers.push(Arc::clone(&observer));
            let current = if replay {
                state.value.clone().map(|value| (state.version, value))
            } else {
                None
            };
            (observer, state.observers.len() == 1, current)
        };
        let mut registration = Registration {
            shared: &self.shared,
            id: observer.id,
            armed: true,
        };
        if first && let Some(activation) = &self.shared.activation {
            activation.on_active();
        }
        registration.armed = false;
        drop(registration);
        drop(lifecycle);

        let weak = Arc::downgrade(&self.shared);
        let id = observer.id;
        let subscription = Subscription {
            detach: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    detach(&shared, id);
                }
            })),
        };
        if let Some((version, value)) = current {
            observer.deliver(version, &value);
        }
        subscription
    }
}

fn notify<T>(observers: &[Arc<Observer<T>>], version: u64, value: &T) {
    for observer in observers {
        observer.deliver(version, value);
    }
}

fn detach<T>(shared: &Shared<T>, id: u64) {
    let _lifecycle = lock(&shared.lifecycle);
    let last = {
        let mut state = lock(&shared.state);
        let before = state.observers.len();
        state.observers.retain(|observer| observer.id != id);
        before != state.observers.len() && state.observers.is_empty()
    };
    if last && let Some(activation) = &shared.activation {
        activation.on_inactive();
    }
}

/// Non-owning handle to an [`Observable`].
pub struct WeakObservable<T> {
    shared: Weak<Shared<T>>,
}

impl<T> Clone for WeakObservable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for WeakObservable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakObservable")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl<T> WeakObservable<T> {
    /// Recover a strong handle if the value is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Observable<T>> {
        self.shared.upgrade().map(|shared| Observable { shared })
    }
}

/// RAII guard for an observer registration.
///
/// Dropping the guard unregisters the callback before the next notification
/// cycle.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

impl Subscription {
    /// Unregister now. Equivalent to dropping the guard.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
