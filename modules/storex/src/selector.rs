//! Derived state with memoization.
//!
//! Any `Fn(&State) -> T` is a [`Selector`]. [`create_selector`] combines
//! input selectors with a result function into a [`MemoizedSelector`],
//! which re-runs the result function only when its inputs change.
//!
//! Inputs are compared by reference (`Arc::ptr_eq`, `State::ptr_eq`) by
//! default or by value with `.deep()`. With `.with_ttl(..)`, an entry older
//! than the TTL is recomputed whatever the inputs; equality is only
//! consulted for entries still within the TTL.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::state::State;

pub trait Selector: Send + Sync {
    type Output: Clone + Send + Sync + 'static;

    fn select(&self, state: &State) -> Self::Output;
}

impl<F, T> Selector for F
where
    F: Fn(&State) -> T + Send + Sync,
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    fn select(&self, state: &State) -> T {
        self(state)
    }
}

/// Selector for the typed sub-state under `key`.
pub fn feature_selector<T: Any + Send + Sync>(
    key: &str,
) -> impl Fn(&State) -> Option<Arc<T>> + Send + Sync + Clone {
    let key = key.to_string();
    move |state: &State| state.get::<T>(&key)
}

// ---------------------------------------------------------------------------
// Input equality
// ---------------------------------------------------------------------------

/// How a selector input is compared against its cached value.
pub trait MemoInput {
    /// Reference equality where the type has identity, value equality otherwise.
    fn same_ref(&self, other: &Self) -> bool;

    /// Value equality, as far as the type can compare values.
    fn same_value(&self, other: &Self) -> bool;
}

impl<T: PartialEq + ?Sized> MemoInput for Arc<T> {
    fn same_ref(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }

    fn same_value(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other) || **self == **other
    }
}

impl<T: MemoInput> MemoInput for Option<T> {
    fn same_ref(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same_ref(b),
            (None, None) => true,
            _ => false,
        }
    }

    fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same_value(b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Sub-states are type-erased, so a whole `State` can only be compared
/// by key set and sub-state identity, even under `.deep()`. Select typed
/// features (`feature_selector`) as inputs to compare them by value.
impl MemoInput for State {
    fn same_ref(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }

    fn same_value(&self, other: &Self) -> bool {
        self.shallow_eq(other)
    }
}

macro_rules! value_memo_input {
    ($($ty:ty),* $(,)?) => {
        $(
            impl MemoInput for $ty {
                fn same_ref(&self, other: &Self) -> bool {
                    self == other
                }

                fn same_value(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

value_memo_input!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    usize,
    isize,
    f32,
    f64,
    char,
    String,
    &'static str,
    serde_json::Value,
);

impl<T: PartialEq> MemoInput for Vec<T> {
    fn same_ref(&self, other: &Self) -> bool {
        self == other
    }

    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

// ---------------------------------------------------------------------------
// Input tuples
// ---------------------------------------------------------------------------

/// A tuple of input selectors evaluated together.
pub trait SelectorInputs: Send + Sync {
    type Values: MemoInput + Clone + Send + Sync + 'static;

    fn select_all(&self, state: &State) -> Self::Values;
}

macro_rules! selector_inputs {
    ($(($($name:ident : $idx:tt),+)),+ $(,)?) => {
        $(
            impl<$($name),+> MemoInput for ($($name,)+)
            where
                $($name: MemoInput,)+
            {
                fn same_ref(&self, other: &Self) -> bool {
                    $(self.$idx.same_ref(&other.$idx))&&+
                }

                fn same_value(&self, other: &Self) -> bool {
                    $(self.$idx.same_value(&other.$idx))&&+
                }
            }

            impl<$($name),+> SelectorInputs for ($($name,)+)
            where
                $($name: Selector, $name::Output: MemoInput,)+
            {
                type Values = ($($name::Output,)+);

                fn select_all(&self, state: &State) -> Self::Values {
                    ($(self.$idx.select(state),)+)
                }
            }
        )+
    };
}

selector_inputs!(
    (A: 0),
    (A: 0, B: 1),
    (A: 0, B: 1, C: 2),
    (A: 0, B: 1, C: 2, D: 3),
);

// ---------------------------------------------------------------------------
// MemoizedSelector
// ---------------------------------------------------------------------------

struct CacheEntry<V, O> {
    inputs: V,
    output: O,
    computed_at: Instant,
}

pub struct MemoizedSelector<I: SelectorInputs, F, O> {
    inputs: I,
    result: F,
    deep: bool,
    ttl: Option<Duration>,
    cache: Mutex<Option<CacheEntry<I::Values, O>>>,
    recomputations: AtomicU64,
}

/// Combine `inputs` (a tuple of selectors) with `result`.
pub fn create_selector<I, F, O>(inputs: I, result: F) -> MemoizedSelector<I, F, O>
where
    I: SelectorInputs,
    F: Fn(I::Values) -> O + Send + Sync,
    O: Clone + Send + Sync + 'static,
{
    MemoizedSelector {
        inputs,
        result,
        deep: false,
        ttl: None,
        cache: Mutex::new(None),
        recomputations: AtomicU64::new(0),
    }
}

impl<I, F, O> MemoizedSelector<I, F, O>
where
    I: SelectorInputs,
    F: Fn(I::Values) -> O + Send + Sync,
    O: Clone + Send + Sync + 'static,
{
    /// Compare inputs by value instead of by reference.
    pub fn deep(mut self) -> Self {
        self.deep = true;
        self
    }

    /// Recompute entries older than `ttl` even when inputs are unchanged.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// How many times the result function has run.
    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        *self.cache.lock() = None;
    }

    fn cached(&self, inputs: &I::Values) -> Option<O> {
        let cache = self.cache.lock();
        let entry = cache.as_ref()?;
        if self
            .ttl
            .is_some_and(|ttl| entry.computed_at.elapsed() >= ttl)
        {
            return None;
        }
        let unchanged = if self.deep {
            entry.inputs.same_value(inputs)
        } else {
            entry.inputs.same_ref(inputs)
        };
        unchanged.then(|| entry.output.clone())
    }
}

impl<I, F, O> Selector for MemoizedSelector<I, F, O>
where
    I: SelectorInputs,
    F: Fn(I::Values) -> O + Send + Sync,
    O: Clone + Send + Sync + 'static,
{
    type Output = O;

    fn select(&self, state: &State) -> O {
        let inputs = self.inputs.select_all(state);
        if let Some(output) = self.cached(&inputs) {
            return output;
        }

        // The result function runs without the cache lock held.
        let output = (self.result)(inputs.clone());
        self.recomputations.fetch_add(1, Ordering::Relaxed);
        *self.cache.lock() = Some(CacheEntry {
            inputs,
            output: output.clone(),
            computed_at: Instant::now(),
        });
        output
    }
}
