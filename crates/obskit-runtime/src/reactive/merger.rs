#![forbid(unsafe_code)]

//! N-source merge combinators with distinct-until-changed suppression.
//!
//! # Design
//!
//! [`Merged<R>`] derives a value from N upstream [`Observable`]s through a
//! pure merge function. Sources are described by a [`SourceSet`]: a tuple of
//! observables (heterogeneous, arity 1 to 6) or a `Vec` of same-typed
//! observables (any arity). Each source writes into its slot of an
//! index-keyed cache; the merge function runs once every slot is filled.
//!
//! Results are [`post`](Observable::post)ed to the downstream observable, so
//! observers receive them on the dispatcher's consumer context, never inline
//! in the upstream write.
//!
//! # Invariants
//!
//! 1. Nothing is published until every source has delivered a value since
//!    the last activation.
//! 2. Upstream subscriptions exist only while the downstream has observers.
//!    Deactivation drops them and clears the cache.
//! 3. Cache write, merge, comparison and publish form one critical section;
//!    concurrent upstream writes are serialized.
//! 4. With suppression on, a result equal to the downstream's committed value
//!    is not published and cancels any post still pending; a result equal to
//!    the pending post is dropped.
//! 5. Each activation tags its upstream links with a fresh epoch. A delivery
//!    from a link of an earlier activation never reaches the cache.
//!
//! # Failure Modes
//!
//! - **Merge function panics**: the panic unwinds into the upstream writer,
//!   or into `subscribe` when it happens during activation replay. Observers
//!   registered by that call are removed again, and the next upstream change
//!   or subscription recomputes.
//! - **Dispatcher closed**: the result is dropped and a warning is logged.
//!
//! # Example
//!
//! ```
//! use obskit_core::dispatch::MainLoop;
//! use obskit_runtime::reactive::{Observable, merge2};
//!
//! let main = MainLoop::new();
//! let d = main.dispatcher();
//! let width = Observable::new(&d, 10);
//! let height = Observable::new(&d, 20);
//! let area = merge2(&d, &width, &height, |w, h| w * h);
//!
//! let _sub = area.subscribe(|_| {});
//! main.run_until_idle();
//! assert_eq!(area.get(), Some(200));
//!
//! width.set(5);
//! main.run_until_idle();
//! assert_eq!(area.get(), Some(100));
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use obskit_core::dispatch::Dispatcher;

use super::lock;
use super::observable::{Activation, Observable, PostOutcome, Subscription, WeakObservable};

/// Receiver of upstream values for a merge node.
pub trait MergeSink<C>: Send + Sync + 'static {
    /// Apply `write` to the cache on behalf of source `index`, then attempt
    /// a merge.
    ///
    /// `epoch` identifies the activation the delivering link was attached
    /// in; deliveries from any other activation are dropped.
    fn receive(&self, index: usize, epoch: u64, write: impl FnOnce(&mut C));
}

/// An ordered collection of upstream observables.
pub trait SourceSet: Send + Sync + 'static {
    /// Index-keyed last-known values, one `Option` slot per source.
    type Cache: Send + 'static;

    /// Number of sources.
    fn arity(&self) -> usize;

    /// A cache with every slot empty.
    fn empty_cache(&self) -> Self::Cache;

    /// Observe every source, routing values into `sink` tagged with `epoch`.
    ///
    /// Sources holding a value replay it immediately.
    fn attach<K: MergeSink<Self::Cache>>(&self, sink: &Arc<K>, epoch: u64) -> Vec<Subscription>;
}

/// A merge function over a complete cache.
pub trait MergeFn<C, R>: Send + Sync + 'static {
    /// Merge the cached values, or `None` while any slot is empty.
    fn merge(&self, cache: &C) -> Option<R>;
}

macro_rules! impl_source_set {
    ($($T:ident $v:ident $idx:tt),+) => {
        impl<$($T),+> SourceSet for ($(Observable<$T>,)+)
        where
            $($T: Clone + PartialEq + Send + Sync + 'static),+
        {
            type Cache = ($(Option<$T>,)+);

            fn arity(&self) -> usize {
                [$($idx),+].len()
            }

            fn empty_cache(&self) -> Self::Cache {
                ($(None::<$T>,)+)
            }

            fn attach<K: MergeSink<Self::Cache>>(
                &self,
                sink: &Arc<K>,
                epoch: u64,
            ) -> Vec<Subscription> {
                vec![$({
                    let sink = Arc::downgrade(sink);
                    self.$idx.observe(move |value: &$T| {
                        if let Some(sink) = sink.upgrade() {
                            sink.receive($idx, epoch, |cache| cache.$idx = Some(value.clone()));
                        }
                    })
                }),+]
            }
        }

        impl<Func, Out, $($T),+> MergeFn<($(Option<$T>,)+), Out> for Func
        where
            Func: Fn($(&$T),+) -> Out + Send + Sync + 'static,
        {
            fn merge(&self, cache: &($(Option<$T>,)+)) -> Option<Out> {
                let ($(Some($v),)+) = cache else {
                    return None;
                };
                Some(self($($v),+))
            }
        }
    };
}

impl_source_set!(A a 0);
impl_source_set!(A a 0, B b 1);
impl_source_set!(A a 0, B b 1, C c 2);
impl_source_set!(A a 0, B b 1, C c 2, D d 3);
impl_source_set!(A a 0, B b 1, C c 2, D d 3, E e 4);
impl_source_set!(A a 0, B b 1, C c 2, D d 3, E e 4, G g 5);

impl<T: Clone + PartialEq + Send + Sync + 'static> SourceSet for Vec<Observable<T>> {
    type Cache = Vec<Option<T>>;

    fn arity(&self) -> usize {
        self.len()
    }

    fn empty_cache(&self) -> Self::Cache {
        vec![None; self.len()]
    }

    fn attach<K: MergeSink<Self::Cache>>(&self, sink: &Arc<K>, epoch: u64) -> Vec<Subscription> {
        self.iter()
            .enumerate()
            .map(|(index, source)| {
                let sink = Arc::downgrade(sink);
                source.observe(move |value: &T| {
                    if let Some(sink) = sink.upgrade() {
                        sink.receive(index, epoch, |cache| cache[index] = Some(value.clone()));
                    }
                })
            })
            .collect()
    }
}

impl<Func, Out, T> MergeFn<Vec<Option<T>>, Out> for Func
where
    Func: Fn(&[T]) -> Out + Send + Sync + 'static,
    T: Clone,
{
    fn merge(&self, cache: &Vec<Option<T>>) -> Option<Out> {
        let values = cache.iter().cloned().collect::<Option<Vec<T>>>()?;
        Some(self(values.as_slice()))
    }
}

/// Policy deciding whether a merge result is published.
pub enum Suppression<R> {
    /// Publish every result.
    Never,
    /// Drop results equal (`PartialEq`) to the downstream's committed or
    /// pending value.
    Equal,
    /// Drop results for which the predicate returns `true`.
    By(Arc<dyn Fn(&R, &R) -> bool + Send + Sync>),
}

impl<R> Default for Suppression<R> {
    fn default() -> Self {
        Self::Equal
    }
}

impl<R> Clone for Suppression<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Never => Self::Never,
            Self::Equal => Self::Equal,
            Self::By(eq) => Self::By(Arc::clone(eq)),
        }
    }
}

impl<R> fmt::Debug for Suppression<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Equal => f.write_str("Equal"),
            Self::By(_) => f.write_str("By(..)"),
        }
    }
}

impl<R: PartialEq> Suppression<R> {
    fn suppresses(&self, current: Option<&R>, next: &R) -> bool {
        let Some(current) = current else {
            return false;
        };
        match self {
            Self::Never => false,
            Self::Equal => current == next,
            Self::By(eq) => eq(current, next),
        }
    }
}

struct MergeState<C> {
    cache: C,
    active: bool,
    /// Bumped on every activation change; links carry the value they were
    /// attached with.
    epoch: u64,
}

struct MergeNode<S: SourceSet, F, R> {
    this: Weak<Self>,
    sources: S,
    merge: F,
    suppression: Suppression<R>,
    downstream: OnceLock<WeakObservable<R>>,
    state: Mutex<MergeState<S::Cache>>,
    links: Mutex<Vec<Subscription>>,
}

impl<S, F, R> MergeSink<S::Cache> for MergeNode<S, F, R>
where
    S: SourceSet,
    F: MergeFn<S::Cache, R>,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    fn receive(&self, index: usize, epoch: u64, write: impl FnOnce(&mut S::Cache)) {
        let mut state = lock(&self.state);
        if !state.active || state.epoch != epoch {
            tracing::trace!(message = "merge.ignored_inactive", index, epoch);
            return;
        }
        write(&mut state.cache);

        let Some(next) = self.merge.merge(&state.cache) else {
            tracing::trace!(message = "merge.waiting", index);
            return;
        };
        let Some(downstream) = self.downstream.get().and_then(WeakObservable::upgrade) else {
            return;
        };
        let outcome = downstream.post_unless_same(next, |current, next| {
            self.suppression.suppresses(Some(current), next)
        });
        match outcome {
            Ok(PostOutcome::Posted) => {}
            Ok(PostOutcome::Unchanged) => {
                tracing::trace!(message = "merge.suppressed", index, cancelled = false);
            }
            Ok(PostOutcome::Cancelled) => {
                tracing::trace!(message = "merge.suppressed", index, cancelled = true);
            }
            Err(error) => {
                tracing::warn!(message = "merge.publish_failed", index, %error);
            }
        }
    }
}

impl<S, F, R> Activation for MergeNode<S, F, R>
where
    S: SourceSet,
    F: MergeFn<S::Cache, R>,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    fn on_active(&self) {
        let epoch = {
            let mut state = lock(&self.state);
            state.active = true;
            state.epoch += 1;
            state.cache = self.sources.empty_cache();
            state.epoch
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tracing::debug!(message = "merge.activate", sources = self.sources.arity(), epoch);
        let links = self.sources.attach(&this, epoch);
        let stale = std::mem::replace(&mut *lock(&self.links), links);
        drop(stale);
    }

    fn on_inactive(&self) {
        {
            let mut state = lock(&self.state);
            state.active = false;
            state.epoch += 1;
            state.cache = self.sources.empty_cache();
        }
        let links = std::mem::take(&mut *lock(&self.links));
        tracing::debug!(message = "merge.deactivate", sources = links.len());
        drop(links);
    }
}

/// A derived observable merging N sources.
///
/// Dereferences to the downstream [`Observable<R>`]; subscribe to it like any
/// other observable. Cloning creates a new handle to the same node.
pub struct Merged<R> {
    observable: Observable<R>,
    arity: usize,
}

impl<R> Clone for Merged<R> {
    fn clone(&self) -> Self {
        Self {
            observable: self.observable.clone(),
            arity: self.arity,
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for Merged<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merged")
            .field("arity", &self.arity)
            .field("observable", &self.observable)
            .finish()
    }
}

impl<R> Deref for Merged<R> {
    type Target = Observable<R>;

    fn deref(&self) -> &Observable<R> {
        &self.observable
    }
}

impl<R> Merged<R> {
    /// The downstream observable.
    #[must_use]
    pub fn observable(&self) -> &Observable<R> {
        &self.observable
    }

    /// Unwrap into the downstream observable, e.g. to feed another merge.
    #[must_use]
    pub fn into_observable(self) -> Observable<R> {
        self.observable
    }

    /// Number of sources.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }
}

impl<R: Clone + PartialEq + Send + Sync + 'static> Merged<R> {
    /// Start configuring a merge whose results are delivered on
    /// `dispatcher`'s consumer context.
    #[must_use]
    pub fn builder(dispatcher: &Dispatcher) -> MergeBuilder<R> {
        MergeBuilder {
            dispatcher: dispatcher.clone(),
            suppression: Suppression::default(),
        }
    }

    /// Merge an arbitrary [`SourceSet`] with default (equality) suppression.
    #[must_use]
    pub fn from_sources<S, F>(dispatcher: &Dispatcher, sources: S, merge: F) -> Self
    where
        S: SourceSet,
        F: MergeFn<S::Cache, R>,
    {
        Self::builder(dispatcher).build(sources, merge)
    }
}

/// Configuration for a [`Merged`].
pub struct MergeBuilder<R> {
    dispatcher: Dispatcher,
    suppression: Suppression<R>,
}

impl<R> fmt::Debug for MergeBuilder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeBuilder")
            .field("suppression", &self.suppression)
            .finish()
    }
}

impl<R: Clone + PartialEq + Send + Sync + 'static> MergeBuilder<R> {
    /// Drop results equal to the current value (`true`, the default) or
    /// publish every result (`false`).
    #[must_use]
    pub fn distinct_until_changed(mut self, enabled: bool) -> Self {
        self.suppression = if enabled {
            Suppression::Equal
        } else {
            Suppression::Never
        };
        self
    }

    /// Drop results for which `eq(current, next)` is `true`.
    #[must_use]
    pub fn eq_by(mut self, eq: impl Fn(&R, &R) -> bool + Send + Sync + 'static) -> Self {
        self.suppression = Suppression::By(Arc::new(eq));
        self
    }

    /// Set the suppression policy directly.
    #[must_use]
    pub fn suppression(mut self, suppression: Suppression<R>) -> Self {
        self.suppression = suppression;
        self
    }

    /// Build a merge over `sources`.
    #[must_use]
    pub fn build<S, F>(self, sources: S, merge: F) -> Merged<R>
    where
        S: SourceSet,
        F: MergeFn<S::Cache, R>,
    {
        let arity = sources.arity();
        let cache = sources.empty_cache();
        let node = Arc::new_cyclic(|this| MergeNode {
            this: this.clone(),
            sources,
            merge,
            suppression: self.suppression,
            downstream: OnceLock::new(),
            state: Mutex::new(MergeState {
                cache,
                active: false,
                epoch: 0,
            }),
            links: Mutex::new(Vec::new()),
        });
        let activation: Arc<dyn Activation> = node.clone();
        let observable = Observable::with_activation(&self.dispatcher, activation);
        let _ = node.downstream.set(observable.downgrade());
        Merged { observable, arity }
    }

    /// Map a single source.
    #[must_use]
    pub fn merge1<A>(
        self,
        a: &Observable<A>,
        merge: impl Fn(&A) -> R + Send + Sync + 'static,
    ) -> Merged<R>
    where
        A: Clone + PartialEq + Send + Sync + 'static,
    {
        self.build((a.clone(),), merge)
    }

    /// Merge two sources.
    #[must_use]
    pub fn merge2<A, B>(
        self,
        a: &Observable<A>,
        b: &Observable<B>,
        merge: impl Fn(&A, &B) -> R + Send + Sync + 'static,
    ) -> Merged<R>
    where
        A: Clone + PartialEq + Send + Sync + 'static,
        B: Clone + PartialEq + Send + Sync + 'static,
    {
        self.build((a.clone(), b.clone()), merge)
    }

    /// Merge three sources.
    #[must_use]
    pub fn merge3<A, B, C>(
        self,
        a: &Observable<A>,
        b: &Observable<B>,
        c: &Observable<C>,
        merge: impl Fn(&A, &B, &C) -> R + Send + Sync + 'static,
    ) -> Merged<R>
    where
        A: Clone + PartialEq + Send + Sync + 'static,
        B: Clone + PartialEq + Send + Sync + 'static,
        C: Clone + PartialEq + Send + Sync + 'static,
    {
        self.build((a.clone(), b.clone(), c.clone()), merge)
    }

    /// Merge any number of same-typed sources.
    ///
    /// With no sources the result never publishes.
    #[must_use]
    pub fn merge_all<T>(
        self,
        sources: impl IntoIterator<Item = Observable<T>>,
        merge: impl Fn(&[T]) -> R + Send + Sync + 'static,
    ) -> Merged<R>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.build(sources.into_iter().collect::<Vec<_>>(), merge)
    }
}

/// Map one source, suppressing unchanged results.
#[must_use]
pub fn merge1<A, R>(
    dispatcher: &Dispatcher,
    a: &Observable<A>,
    merge: impl Fn(&A) -> R + Send + Sync + 'static,
) -> Merged<R>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    Merged::builder(dispatcher).merge1(a, merge)
}

/// Merge two sources, suppressing unchanged results.
#[must_use]
pub fn merge2<A, B, R>(
    dispatcher: &Dispatcher,
    a: &Observable<A>,
    b: &Observable<B>,
    merge: impl Fn(&A, &B) -> R + Send + Sync + 'static,
) -> Merged<R>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    Merged::builder(dispatcher).merge2(a, b, merge)
}

/// Merge three sources, suppressing unchanged results.
#[must_use]
pub fn merge3<A, B, C, R>(
    dispatcher: &Dispatcher,
    a: &Observable<A>,
    b: &Observable<B>,
    c: &Observable<C>,
    merge: impl Fn(&A, &B, &C) -> R + Send + Sync + 'static,
) -> Merged<R>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
    C: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    Merged::builder(dispatcher).merge3(a, b, c, merge)
}

/// Merge any number of same-typed sources, suppressing unchanged results.
#[must_use]
pub fn merge_all<T, R>(
    dispatcher: &Dispatcher,
    sources: impl IntoIterator<Item = Observable<T>>,
    merge: impl Fn(&[T]) -> R + Send + Sync + 'static,
) -> Merged<R>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    Merged::builder(dispatcher).merge_all(sources, merge)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use obskit_core::dispatch::MainLoop;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync)
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        (log, move |v: &T| l.lock().unwrap().push(v.clone()))
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&count), count)
    }

    #[test]
    fn publishes_after_dispatch_runs() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 2);
        let b = Observable::new(&d, 3);
        let product = merge2(&d, &a, &b, |x, y| x * y);
        let (log, f) = recorder();
        let _sub = product.subscribe(f);

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(product.latest(), Some(6));
        main.run_until_idle();
        assert_eq!(*log.lock().unwrap(), vec![6]);
    }

    #[test]
    fn waits_for_every_source() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 1);
        let b: Observable<i32> = Observable::empty(&d);
        let c = Observable::new(&d, 100);
        let (calls, calls_in) = counter();
        let sum = merge3(&d, &a, &b, &c, move |x, y, z| {
            calls_in.fetch_add(1, Ordering::SeqCst);
            x + y + z
        });
        let (log, f) = recorder();
        let _sub = sum.subscribe(f);

        a.set(2);
        c.set(200);
        main.run_until_idle();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(log.lock().unwrap().is_empty());

        b.set(10);
        main.run_until_idle();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec![212]);
    }

    #[test]
    fn equal_result_not_republished() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 4);
        let b = Observable::new(&d, 1);
        // Result ignores b's sign.
        let merged = merge2(&d, &a, &b, |x, y: &i32| x * y.abs());
        let (log, f) = recorder();
        let _sub = merged.subscribe(f);
        main.run_until_idle();

        b.set(-1);
        main.run_until_idle();
        assert_eq!(*log.lock().unwrap(), vec![4]);
    }

    #[test]
    fn suppression_off_republishes_equal_results() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 4);
        let b = Observable::new(&d, 1);
        let merged = Merged::builder(&d)
            .distinct_until_changed(false)
            .merge2(&a, &b, |x, y: &i32| x * y.abs());
        let (log, f) = recorder();
        let _sub = merged.subscribe(f);
        main.run_until_idle();

        b.set(-1);
        main.run_until_idle();
        assert_eq!(*log.lock().unwrap(), vec![4, 4]);
    }

    #[test]
    fn custom_equality_policy() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let name = Observable::new(&d, "Ada".to_string());
        let greeting = Merged::builder(&d)
            .eq_by(|a: &String, b: &String| a.eq_ignore_ascii_case(b))
            .merge1(&name, |n| format!("hello {n}"));
        let (log, f) = recorder();
        let _sub = greeting.subscribe(f);
        main.run_until_idle();

        name.set("ADA".to_string());
        main.run_until_idle();
        name.set("Grace".to_string());
        main.run_until_idle();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["hello Ada".to_string(), "hello Grace".to_string()]
        );
    }

    #[test]
    fn inactive_merge_holds_no_upstream_subscriptions() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 1);
        let b = Observable::new(&d, 2);
        let (calls, calls_in) = counter();
        let merged = merge2(&d, &a, &b, move |x, y| {
            calls_in.fetch_add(1, Ordering::SeqCst);
            x + y
        });

        assert_eq!(a.observer_count(), 0);
        a.set(5);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let sub = merged.subscribe(|_| {});
        assert_eq!(a.observer_count(), 1);
        assert_eq!(b.observer_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(sub);
        assert_eq!(a.observer_count(), 0);
        assert_eq!(b.observer_count(), 0);
        a.set(6);
        b.set(7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!merged.is_active());
    }

    #[test]
    fn reactivation_recombines_from_upstream_values() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 1);
        let b = Observable::new(&d, 2);
        let merged = merge2(&d, &a, &b, |x, y| x + y);

        let sub = merged.subscribe(|_| {});
        main.run_until_idle();
        assert_eq!(merged.get(), Some(3));
        drop(sub);

        a.set(10);
        let (log, f) = recorder();
        let _sub = merged.subscribe(f);
        main.run_until_idle();
        assert_eq!(*log.lock().unwrap(), vec![12]);
    }

    #[test]
    fn reactivation_starts_with_empty_cache() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 1);
        let b: Observable<i32> = Observable::empty(&d);
        let merged = merge2(&d, &a, &b, |x, y| x + y);

        let sub = merged.subscribe(|_| {});
        drop(sub);

        // b gets a value while the merge is detached; a's slot must be
        // refilled from a's replay, not from a stale cache.
        b.set(5);
        a.set(7);
        let _sub = merged.subscribe(|_| {});
        main.run_until_idle();
        assert_eq!(merged.get(), Some(12));
    }

    #[test]
    fn reverting_input_before_drain_notifies_nothing() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 1);
        let merged = merge1(&d, &a, |x| *x);
        let (log, f) = recorder();
        let _sub = merged.subscribe(f);
        main.run_until_idle();
        assert_eq!(*log.lock().unwrap(), vec![1]);

        a.set(2);
        assert_eq!(merged.latest(), Some(2));
        a.set(1);
        assert!(!merged.has_pending());
        main.run_until_idle();
        assert_eq!(merged.get(), Some(1));
        assert_eq!(*log.lock().unwrap(), vec![1]);

        // A result equal to the pending post is not re-posted either.
        a.set(3);
        a.set(3);
        main.run_until_idle();
        assert_eq!(*log.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn link_from_previous_activation_cannot_overwrite_cache() {
        use std::sync::mpsc;
        use std::thread;

        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 1);

        // Registered before the merge link, so a write of 5 parks here after
        // the observer snapshot was taken but before the link sees it.
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        let _gate = a.subscribe(move |v: &i32| {
            if *v == 5 {
                let _ = entered_tx.lock().unwrap().send(());
                let _ = release_rx.lock().unwrap().recv();
            }
        });

        let merged = merge1(&d, &a, |x| *x);
        let sub = merged.subscribe(|_| {});
        main.run_until_idle();
        assert_eq!(merged.get(), Some(1));

        let writer = {
            let a = a.clone();
            thread::spawn(move || a.set(5))
        };
        entered_rx.recv().unwrap();

        drop(sub);
        let _sub = merged.subscribe(|_| {});
        a.set(6);
        main.run_until_idle();
        assert_eq!(merged.get(), Some(6));

        release_tx.send(()).unwrap();
        writer.join().unwrap();
        main.run_until_idle();
        assert_eq!(a.get(), Some(6));
        assert_eq!(merged.get(), Some(6));
        assert!(!merged.has_pending());
    }

    #[test]
    fn panic_during_activation_leaves_no_observers_behind() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, -1);
        let b = Observable::new(&d, 1);
        let checked = merge2(&d, &b, &a, |x: &i32, y: &i32| {
            assert!(*y >= 0, "negative input");
            x + y
        });

        let result = panic::catch_unwind(AssertUnwindSafe(|| checked.subscribe(|_| {})));
        assert!(result.is_err());
        assert_eq!(checked.observer_count(), 0);
        assert_eq!(a.observer_count(), 0);
        assert_eq!(b.observer_count(), 0);

        a.set(2);
        let sub = checked.subscribe(|_| {});
        main.run_until_idle();
        assert_eq!(checked.get(), Some(3));
        assert_eq!(a.observer_count(), 1);

        drop(sub);
        assert!(!checked.is_active());
        assert_eq!(a.observer_count(), 0);
        assert_eq!(b.observer_count(), 0);
    }

    #[test]
    fn single_source_maps() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let celsius = Observable::new(&d, 100.0_f64);
        let fahrenheit = merge1(&d, &celsius, |c| c * 9.0 / 5.0 + 32.0);
        assert_eq!(fahrenheit.arity(), 1);
        let _sub = fahrenheit.subscribe(|_| {});
        main.run_until_idle();
        assert_eq!(fahrenheit.get(), Some(212.0));
    }

    #[test]
    fn merge_all_over_vec() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let sources: Vec<_> = (1..=5).map(|v| Observable::new(&d, v)).collect();
        let total = merge_all(&d, sources.clone(), |vs| vs.iter().sum::<i32>());
        assert_eq!(total.arity(), 5);
        let _sub = total.subscribe(|_| {});
        main.run_until_idle();
        assert_eq!(total.get(), Some(15));

        sources[4].set(50);
        main.run_until_idle();
        assert_eq!(total.get(), Some(60));
    }

    #[test]
    fn merge_all_without_sources_never_publishes() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let none: Vec<Observable<i32>> = Vec::new();
        let total = merge_all(&d, none, |vs| vs.len());
        let _sub = total.subscribe(|_| {});
        main.run_until_idle();
        assert_eq!(total.get(), None);
    }

    #[test]
    fn wide_tuple_sources() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let merged: Merged<String> = Merged::from_sources(
            &d,
            (
                Observable::new(&d, 1u8),
                Observable::new(&d, 2u16),
                Observable::new(&d, 3u32),
                Observable::new(&d, 4u64),
                Observable::new(&d, "x".to_string()),
                Observable::new(&d, true),
            ),
            |a: &u8, b: &u16, c: &u32, e: &u64, s: &String, t: &bool| {
                format!("{}{s}{t}", u64::from(*a) + u64::from(*b) + u64::from(*c) + e)
            },
        );
        assert_eq!(merged.arity(), 6);
        let _sub = merged.subscribe(|_| {});
        main.run_until_idle();
        assert_eq!(merged.get().as_deref(), Some("10xtrue"));
    }

    #[test]
    fn merges_chain() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 2);
        let b = Observable::new(&d, 3);
        let sum = merge2(&d, &a, &b, |x, y| x + y);
        let doubled = merge1(&d, sum.observable(), |s| s * 2);
        let _sub = doubled.subscribe(|_| {});
        assert!(sum.is_active());
        main.run_until_idle();
        assert_eq!(doubled.get(), Some(10));

        a.set(10);
        main.run_until_idle();
        assert_eq!(doubled.get(), Some(26));
    }

    #[test]
    fn merge_panic_propagates_and_node_recovers() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 1);
        let checked = merge1(&d, &a, |x: &i32| {
            assert!(*x >= 0, "negative input");
            *x
        });
        let _sub = checked.subscribe(|_| {});
        main.run_until_idle();

        let result = panic::catch_unwind(AssertUnwindSafe(|| a.set(-1)));
        assert!(result.is_err());

        a.set(3);
        main.run_until_idle();
        assert_eq!(checked.get(), Some(3));
    }

    #[test]
    fn dropping_merged_handle_releases_upstreams() {
        let main = MainLoop::new();
        let d = main.dispatcher();
        let a = Observable::new(&d, 1);
        let merged = merge1(&d, &a, |x| x + 1);
        let (log, f) = recorder();
        let sub = merged.subscribe(f);
        assert_eq!(a.observer_count(), 1);

        drop(merged);
        assert_eq!(a.observer_count(), 0);
        a.set(5);
        main.run_until_idle();
        assert!(log.lock().unwrap().is_empty());
        drop(sub);
    }

    #[test]
    fn suppression_debug_and_default() {
        assert!(matches!(Suppression::<i32>::default(), Suppression::Equal));
        let by: Suppression<i32> = Suppression::By(Arc::new(|a: &i32, b: &i32| a == b));
        assert_eq!(format!("{by:?}"), "By(..)");
        assert!(by.suppresses(Some(&1), &1));
        assert!(!by.suppresses(None, &1));
        assert!(!Suppression::Never.suppresses(Some(&1), &1));
    }
}
