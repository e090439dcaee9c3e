use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::controller::{FormResult, read_lock, write_lock};
use crate::path::FieldPath;
use crate::value::Value;

static SUBSCRIPTION_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    pub fn next() -> Self {
        Self(SUBSCRIPTION_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

/// Per-path metadata. The orchestrator reads and merges it; the exact
/// lifecycle of each flag belongs to the field controller bound to the path.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldMeta<E> {
    pub is_touched: bool,
    pub is_validating: bool,
    pub error: Option<E>,
    pub validation_count: u64,
    pub async_validation_count: u64,
}

impl<E> Default for FieldMeta<E> {
    fn default() -> Self {
        Self {
            is_touched: false,
            is_validating: false,
            error: None,
            validation_count: 0,
            async_validation_count: 0,
        }
    }
}

/// Immutable form snapshot. Raw fields are written by updaters; everything
/// below the derived marker is recomputed on every transition and never
/// mutated directly.
#[derive(Clone, Debug, PartialEq)]
pub struct FormState<E> {
    pub values: Value,
    pub field_meta: BTreeMap<FieldPath, FieldMeta<E>>,
    pub is_submitting: bool,
    pub is_submitted: bool,
    pub submission_attempts: u32,
    pub is_form_validating: bool,
    pub form_validation_count: u64,
    pub form_error: Option<E>,
    // Derived.
    pub is_fields_validating: bool,
    pub is_fields_valid: bool,
    pub is_form_valid: bool,
    pub is_valid: bool,
    pub is_validating: bool,
    pub is_touched: bool,
    pub can_submit: bool,
}

impl<E> FormState<E> {
    pub fn new(values: Value) -> Self {
        let mut state = Self {
            values,
            field_meta: BTreeMap::new(),
            is_submitting: false,
            is_submitted: false,
            submission_attempts: 0,
            is_form_validating: false,
            form_validation_count: 0,
            form_error: None,
            is_fields_validating: false,
            is_fields_valid: true,
            is_form_valid: true,
            is_valid: true,
            is_validating: false,
            is_touched: false,
            can_submit: true,
        };
        state.recompute_derived();
        state
    }

    /// Pure function of the raw fields; idempotent by construction.
    pub(crate) fn recompute_derived(&mut self) {
        self.is_fields_validating = self.field_meta.values().any(|meta| meta.is_validating);
        self.is_fields_valid = !self.field_meta.values().any(|meta| meta.error.is_some());
        self.is_touched = self.field_meta.values().any(|meta| meta.is_touched);
        self.is_form_valid = self.form_error.is_none();
        self.is_valid = self.is_fields_valid && self.is_form_valid;
        self.is_validating = self.is_fields_validating || self.is_form_validating;
        // An untouched, never-attempted form is optimistically submittable;
        // after the first attempt submission requires full validity and no
        // in-flight work.
        self.can_submit = (self.submission_attempts == 0 && !self.is_touched)
            || (!self.is_validating && !self.is_submitting && self.is_valid);
    }
}

type SubscriberFn<E> = Arc<dyn Fn(&FormState<E>) + Send + Sync>;

struct StoreInner<E> {
    state: FormState<E>,
    batch_depth: u32,
    dirty: bool,
}

/// Reactive state container. Updaters mutate a single owned snapshot under a
/// write lock; derived fields are recomputed before any subscriber can
/// observe the result, so partially-applied updates are never published.
pub struct FormStore<E> {
    inner: Arc<RwLock<StoreInner<E>>>,
    subscribers: Arc<RwLock<BTreeMap<SubscriptionId, SubscriberFn<E>>>>,
}

impl<E> Clone for FormStore<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<E> FormStore<E>
where
    E: Clone,
{
    pub fn new(mut initial: FormState<E>) -> Self {
        initial.recompute_derived();
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                state: initial,
                batch_depth: 0,
                dirty: false,
            })),
            subscribers: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn state(&self) -> FormResult<FormState<E>> {
        Ok(read_lock(&self.inner, "reading form state")?.state.clone())
    }

    /// Applies `updater`, recomputes derived invariants and publishes the new
    /// snapshot, unless a batch is open in which case publication is deferred
    /// to the batch exit. Returns the updater's value so callers can capture
    /// freshness tokens in the same atomic step.
    pub fn update<R>(&self, updater: impl FnOnce(&mut FormState<E>) -> R) -> FormResult<R> {
        let (result, snapshot) = {
            let mut inner = write_lock(&self.inner, "updating form state")?;
            let result = updater(&mut inner.state);
            inner.state.recompute_derived();
            if inner.batch_depth > 0 {
                inner.dirty = true;
                (result, None)
            } else {
                (result, Some(inner.state.clone()))
            }
        };
        if let Some(snapshot) = snapshot {
            self.notify(&snapshot)?;
        }
        Ok(result)
    }

    /// Suppresses notification while `operation` runs; nested updates inside
    /// the batch produce exactly one notification carrying the final state.
    pub fn batch<R>(&self, operation: impl FnOnce() -> FormResult<R>) -> FormResult<R> {
        write_lock(&self.inner, "entering state batch")?.batch_depth += 1;
        let result = operation();
        let snapshot = {
            let mut inner = write_lock(&self.inner, "leaving state batch")?;
            inner.batch_depth -= 1;
            if inner.batch_depth == 0 && inner.dirty {
                inner.dirty = false;
                Some(inner.state.clone())
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            self.notify(&snapshot)?;
        }
        result
    }

    pub fn subscribe(
        &self,
        subscriber: impl Fn(&FormState<E>) + Send + Sync + 'static,
    ) -> FormResult<SubscriptionId> {
        let id = SubscriptionId::next();
        write_lock(&self.subscribers, "registering state subscriber")?
            .insert(id, Arc::new(subscriber));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> FormResult<()> {
        write_lock(&self.subscribers, "removing state subscriber")?.remove(&id);
        Ok(())
    }

    fn notify(&self, snapshot: &FormState<E>) -> FormResult<()> {
        // Snapshot the subscriber list so callbacks can re-enter the store.
        let subscribers = read_lock(&self.subscribers, "notifying state subscribers")?
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for subscriber in subscribers {
            subscriber(snapshot);
        }
        Ok(())
    }
}
