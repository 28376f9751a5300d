#![forbid(unsafe_code)]

//! Copy-on-write list edits on `Observable<Vec<T>>`.
//!
//! Every write clones the held list, edits the clone and commits it with
//! [`Observable::set`], so observers always see a whole new list. These
//! operations carry no concurrency contract of their own: call them from the
//! dispatch context, like any other `set`.
//!
//! Indices outside `0..len` are never an error. Inserts fall back to
//! appending; removals do nothing.

use super::observable::Observable;

/// List conveniences for an observable holding a `Vec`.
pub trait ObservableList<T> {
    /// Insert `element` at `index`, or append when `index` is `None` or not
    /// in `0..len`.
    fn add(&self, element: T, index: Option<usize>);

    /// Insert `elements` in order at `index`, or append them when `index` is
    /// `None` or not in `0..len`.
    fn add_all(&self, elements: impl IntoIterator<Item = T>, index: Option<usize>);

    /// Remove the element at `index`. Out-of-range indices and an absent list
    /// leave the value untouched and notify nobody.
    fn remove(&self, index: usize);

    /// Replace the list with an empty one.
    fn clear(&self);

    /// Call `f` with each index and element. No-op when absent.
    fn for_each_indexed(&self, f: impl FnMut(usize, &T));

    /// `true` when the list is absent or empty.
    fn is_empty(&self) -> bool;

    /// Index of the last element, `0` when the list is absent or empty.
    fn last_index(&self) -> usize;
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ObservableList<T> for Observable<Vec<T>> {
    fn add(&self, element: T, index: Option<usize>) {
        let mut list = self.get().unwrap_or_default();
        match index.filter(|&i| i < list.len()) {
            Some(i) => list.insert(i, element),
            None => list.push(element),
        }
        self.set(list);
    }

    fn add_all(&self, elements: impl IntoIterator<Item = T>, index: Option<usize>) {
        let mut list = self.get().unwrap_or_default();
        match index.filter(|&i| i < list.len()) {
            Some(i) => {
                list.splice(i..i, elements);
            }
            None => list.extend(elements),
        }
        self.set(list);
    }

    fn remove(&self, index: usize) {
        let Some(mut list) = self.get() else {
            return;
        };
        if index >= list.len() {
            return;
        }
        list.remove(index);
        self.set(list);
    }

    fn clear(&self) {
        self.set(Vec::new());
    }

    fn for_each_indexed(&self, mut f: impl FnMut(usize, &T)) {
        let Some(list) = self.get() else {
            return;
        };
        for (i, item) in list.iter().enumerate() {
            f(i, item);
        }
    }

    fn is_empty(&self) -> bool {
        self.with(|list| list.is_none_or(Vec::is_empty))
    }

    fn last_index(&self) -> usize {
        self.with(|list| list.map_or(0, |l| l.len().saturating_sub(1)))
    }
}
