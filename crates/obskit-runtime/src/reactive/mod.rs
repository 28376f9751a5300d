#![forbid(unsafe_code)]

//! Reactive value holders and combinators.
//!
//! This module provides:
//!
//! - [`Observable`]: a shared, version-tracked value with change
//!   notification, synchronous [`set`](Observable::set) and dispatched
//!   [`post`](Observable::post).
//! - [`Observable::distinct`]: a holder that drops writes equal to its value.
//! - [`Subscription`]: RAII guard that unsubscribes on drop.
//! - [`Merged`]: a derived observable combining N sources through a pure
//!   function, active only while it has observers.
//! - [`ObservableList`]: copy-on-write list edits on `Observable<Vec<T>>`.
//!
//! # Architecture
//!
//! Observables share state through `Arc<Mutex<..>>`, so sources may be
//! written from any thread. Posted writes and merge results travel through a
//! [`Dispatcher`](obskit_core::dispatch::Dispatcher) and land on its single
//! consumer context.
//!
//! A `Merged` holds its upstream subscriptions only between the first
//! downstream observer attaching and the last one detaching. Each
//! recomputation runs under the merge node's lock, so concurrent upstream
//! writes never expose a torn set of source values to the merge function.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod list;
pub mod merger;
pub mod observable;

pub use list::ObservableList;
pub use merger::{
    MergeBuilder, MergeFn, MergeSink, Merged, SourceSet, Suppression, merge_all, merge1, merge2,
    merge3,
};
pub use observable::{Activation, Observable, Subscription, WeakObservable};

/// Lock `mutex`, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
