use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::path::{FieldPath, get_value, set_value};
use crate::store::{FieldMeta, FormState, FormStore, SubscriptionId};
use crate::validation::{FieldInstance, FormValidatorFn, ValidationError, ValidationMeta};
use crate::value::Value;

static FIELD_INSTANCE_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldInstanceId(pub u64);

impl FieldInstanceId {
    pub fn next() -> Self {
        Self(FIELD_INSTANCE_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FormError {
    StatePoisoned(&'static str),
    ValidatorFailed(String),
    SubmitFailed(String),
    ValidationInterrupted,
}

impl Display for FormError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FormError::StatePoisoned(context) => {
                write!(f, "form state lock poisoned while {context}")
            }
            FormError::ValidatorFailed(error) => write!(f, "validator failed: {error}"),
            FormError::SubmitFailed(error) => write!(f, "submit handler failed: {error}"),
            FormError::ValidationInterrupted => {
                f.write_str("form validation ended without a result")
            }
        }
    }
}

impl std::error::Error for FormError {}

pub type FormResult<T> = Result<T, FormError>;

/// When a field controller is configured to run its validators, relative to
/// user interaction. Consumed by field controllers, not by the orchestrator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationTrigger {
    Change,
    Blur,
    Submit,
}

pub type SubmitHandlerFn =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = FormResult<()>> + Send + 'static>> + Send + Sync>;
pub type InvalidSubmitFn = Arc<dyn Fn(Value) + Send + Sync>;

pub struct FormOptions<E> {
    pub default_values: Value,
    pub default_state: Option<FormState<E>>,
    pub on_submit: Option<SubmitHandlerFn>,
    pub on_invalid_submit: Option<InvalidSubmitFn>,
    pub validate: Option<FormValidatorFn<E>>,
    pub default_validate_pristine: bool,
    pub default_validate_on: ValidationTrigger,
    pub default_validate_async_on: ValidationTrigger,
    pub default_validate_async_debounce_ms: u64,
}

impl<E> Default for FormOptions<E> {
    fn default() -> Self {
        Self {
            default_values: Value::Null,
            default_state: None,
            on_submit: None,
            on_invalid_submit: None,
            validate: None,
            default_validate_pristine: false,
            default_validate_on: ValidationTrigger::Change,
            default_validate_async_on: ValidationTrigger::Change,
            default_validate_async_debounce_ms: 0,
        }
    }
}

impl<E> Clone for FormOptions<E>
where
    E: Clone,
{
    fn clone(&self) -> Self {
        Self {
            default_values: self.default_values.clone(),
            default_state: self.default_state.clone(),
            on_submit: self.on_submit.clone(),
            on_invalid_submit: self.on_invalid_submit.clone(),
            validate: self.validate.clone(),
            default_validate_pristine: self.default_validate_pristine,
            default_validate_on: self.default_validate_on,
            default_validate_async_on: self.default_validate_async_on,
            default_validate_async_debounce_ms: self.default_validate_async_debounce_ms,
        }
    }
}

/// Registry entry for one path: the live field-controller instances bound to
/// it plus the async-validation bookkeeping they share. Entries are created
/// lazily and never removed automatically.
pub struct FieldInfo<E> {
    pub instances: BTreeMap<FieldInstanceId, Arc<dyn FieldInstance<E>>>,
    pub validation: ValidationMeta<E>,
}

impl<E> Default for FieldInfo<E> {
    fn default() -> Self {
        Self {
            instances: BTreeMap::new(),
            validation: ValidationMeta::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetValueOptions {
    pub touch: bool,
}

impl Default for SetValueOptions {
    fn default() -> Self {
        Self { touch: true }
    }
}

/// Host-layer submit event; the orchestrator suppresses its default action
/// and propagation before running the submission state machine.
pub trait SubmitEvent {
    fn prevent_default(&mut self);
    fn stop_propagation(&mut self);
}

/// The form state orchestrator. Cloning yields another handle onto the same
/// form; field controllers keep one to read state and funnel every mutation
/// through these entry points.
pub struct FormController<E>
where
    E: ValidationError,
{
    pub(crate) store: FormStore<E>,
    pub(crate) options: Arc<RwLock<FormOptions<E>>>,
    pub(crate) fields: Arc<RwLock<BTreeMap<FieldPath, FieldInfo<E>>>>,
    pub(crate) form_validation: Arc<RwLock<ValidationMeta<E>>>,
}

impl<E> Clone for FormController<E>
where
    E: ValidationError,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            options: self.options.clone(),
            fields: self.fields.clone(),
            form_validation: self.form_validation.clone(),
        }
    }
}

impl<E> FormController<E>
where
    E: ValidationError,
{
    pub fn new(options: FormOptions<E>) -> Self {
        let initial = initial_state(&options);
        Self {
            store: FormStore::new(initial),
            options: Arc::new(RwLock::new(options)),
            fields: Arc::new(RwLock::new(BTreeMap::new())),
            form_validation: Arc::new(RwLock::new(ValidationMeta::default())),
        }
    }

    pub fn state(&self) -> FormResult<FormState<E>> {
        self.store.state()
    }

    pub fn options(&self) -> FormResult<FormOptions<E>> {
        Ok(read_lock(&self.options, "reading form options")?.clone())
    }

    pub fn subscribe(
        &self,
        subscriber: impl Fn(&FormState<E>) + Send + Sync + 'static,
    ) -> FormResult<SubscriptionId> {
        self.store.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> FormResult<()> {
        self.store.unsubscribe(id)
    }

    /// Swaps in a new option set. While the form is pristine (untouched and
    /// never submitted) the state is re-seeded from the new defaults.
    pub fn update_options(&self, options: FormOptions<E>) -> FormResult<()> {
        let pristine = {
            let state = self.store.state()?;
            state.submission_attempts == 0 && !state.is_touched
        };
        if pristine {
            let next = initial_state(&options);
            self.store.update(|state| *state = next)?;
        }
        *write_lock(&self.options, "updating form options")? = options;
        Ok(())
    }

    /// Restores values and flags to their configured defaults. Any caller
    /// parked on an in-flight form validation is released with a clean
    /// result, and the in-flight run itself is superseded so it cannot write
    /// stale state afterwards.
    pub fn reset(&self) -> FormResult<()> {
        let (waiters, ticket) = {
            let mut meta = write_lock(&self.form_validation, "cancelling form validation")?;
            (meta.take_waiters(), meta.bump())
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(None));
        }
        let next = {
            let options = read_lock(&self.options, "reading options for reset")?;
            initial_state(&options)
        };
        self.store.update(|state| {
            *state = next;
            state.form_validation_count = ticket.0;
        })?;
        Ok(())
    }

    // --- Field registry ---------------------------------------------------

    /// Runs `operation` against the registry entry for `path`, creating the
    /// entry on first access.
    pub fn with_field_info<R>(
        &self,
        path: &FieldPath,
        operation: impl FnOnce(&mut FieldInfo<E>) -> R,
    ) -> FormResult<R> {
        let mut fields = write_lock(&self.fields, "accessing field info")?;
        Ok(operation(fields.entry(path.clone()).or_default()))
    }

    pub fn register_field_instance(
        &self,
        path: &FieldPath,
        instance: Arc<dyn FieldInstance<E>>,
    ) -> FormResult<FieldInstanceId> {
        let id = FieldInstanceId::next();
        self.with_field_info(path, |info| {
            info.instances.insert(id, instance);
        })?;
        Ok(id)
    }

    pub fn deregister_field_instance(
        &self,
        path: &FieldPath,
        id: FieldInstanceId,
    ) -> FormResult<()> {
        self.with_field_info(path, |info| {
            info.instances.remove(&id);
        })
    }

    // --- Field values and metadata ----------------------------------------

    pub fn field_value(&self, path: &FieldPath) -> FormResult<Option<Value>> {
        Ok(get_value(&self.store.state()?.values, path).cloned())
    }

    pub fn field_meta(&self, path: &FieldPath) -> FormResult<Option<FieldMeta<E>>> {
        Ok(self.store.state()?.field_meta.get(path).cloned())
    }

    pub fn set_field_meta(
        &self,
        path: &FieldPath,
        updater: impl FnOnce(FieldMeta<E>) -> FieldMeta<E>,
    ) -> FormResult<()> {
        self.store.update(|state| {
            let current = state.field_meta.get(path).cloned().unwrap_or_default();
            state.field_meta.insert(path.clone(), updater(current));
        })
    }

    pub fn set_field_value(
        &self,
        path: &FieldPath,
        updater: impl FnOnce(Option<&Value>) -> Value,
    ) -> FormResult<()> {
        self.set_field_value_with(path, updater, SetValueOptions::default())
    }

    /// Writes the value and, unless `touch` is disabled, marks the path
    /// touched — both in one state transition, so subscribers observe a
    /// single consistent snapshot.
    pub fn set_field_value_with(
        &self,
        path: &FieldPath,
        updater: impl FnOnce(Option<&Value>) -> Value,
        options: SetValueOptions,
    ) -> FormResult<()> {
        self.store.update(|state| {
            state.values = set_value(&state.values, path, updater);
            if options.touch {
                let mut meta = state.field_meta.get(path).cloned().unwrap_or_default();
                meta.is_touched = true;
                state.field_meta.insert(path.clone(), meta);
            }
        })
    }

    // --- Array helpers ----------------------------------------------------

    pub fn push_field_value(&self, path: &FieldPath, value: Value) -> FormResult<()> {
        self.set_field_value(path, move |current| {
            let mut items = array_items(current);
            items.push(value);
            Value::from(items)
        })
    }

    pub fn insert_field_value(
        &self,
        path: &FieldPath,
        index: usize,
        value: Value,
    ) -> FormResult<()> {
        self.set_field_value(path, move |current| {
            let mut items = array_items(current);
            let index = index.min(items.len());
            items.insert(index, value);
            Value::from(items)
        })
    }

    pub fn splice_field_value(&self, path: &FieldPath, index: usize) -> FormResult<()> {
        self.set_field_value(path, move |current| {
            let mut items = array_items(current);
            if index < items.len() {
                items.remove(index);
            }
            Value::from(items)
        })
    }

    pub fn swap_field_values(&self, path: &FieldPath, a: usize, b: usize) -> FormResult<()> {
        self.set_field_value(path, move |current| {
            let mut items = array_items(current);
            if a < items.len() && b < items.len() {
                items.swap(a, b);
            }
            Value::from(items)
        })
    }

    // --- Submission -------------------------------------------------------

    pub async fn handle_submit(&self, event: &mut dyn SubmitEvent) -> FormResult<()> {
        event.prevent_default();
        event.stop_propagation();
        self.submit().await
    }

    /// One submit attempt: count it, gate on `can_submit`, touch and validate
    /// every field, validate the form, then hand the values to the submit
    /// handler. An invalid attempt resolves cleanly after the invalid-submit
    /// callback; only faults reject.
    pub async fn submit(&self) -> FormResult<()> {
        self.store.update(|state| {
            state.is_submitted = false;
            state.submission_attempts = state.submission_attempts.saturating_add(1);
        })?;

        // can_submit already encodes validity and in-flight work, so a
        // blocked attempt is a silent no-op.
        if !self.store.state()?.can_submit {
            return Ok(());
        }

        self.store.update(|state| state.is_submitting = true)?;

        if let Err(fault) = self.validate_all_fields().await {
            self.store.update(|state| state.is_submitting = false)?;
            return Err(fault);
        }
        if !self.store.state()?.is_fields_valid {
            return self.finish_invalid_submit();
        }

        if let Err(fault) = self.validate_form().await {
            self.store.update(|state| state.is_submitting = false)?;
            return Err(fault);
        }
        if !self.store.state()?.is_valid {
            return self.finish_invalid_submit();
        }

        let on_submit = { read_lock(&self.options, "reading submit handler")?.on_submit.clone() };
        if let Some(handler) = on_submit {
            let values = self.store.state()?.values.clone();
            if let Err(error) = handler(values).await {
                self.store.update(|state| state.is_submitting = false)?;
                return Err(error);
            }
        }

        self.store.update(|state| {
            state.is_submitted = true;
            state.is_submitting = false;
        })?;
        Ok(())
    }

    fn finish_invalid_submit(&self) -> FormResult<()> {
        self.store.update(|state| state.is_submitting = false)?;
        let on_invalid_submit = {
            read_lock(&self.options, "reading invalid submit handler")?
                .on_invalid_submit
                .clone()
        };
        if let Some(handler) = on_invalid_submit {
            handler(self.store.state()?.values.clone());
        }
        Ok(())
    }
}

fn array_items(current: Option<&Value>) -> Vec<Value> {
    // Non-array values (including absent ones) coerce to an empty array.
    match current {
        Some(Value::Array(items)) => (**items).clone(),
        _ => Vec::new(),
    }
}

fn initial_state<E>(options: &FormOptions<E>) -> FormState<E>
where
    E: Clone,
{
    let mut state = match &options.default_state {
        Some(seed) => seed.clone(),
        None => FormState::new(options.default_values.clone()),
    };
    if options.default_state.is_some() && !options.default_values.is_null() {
        state.values = options.default_values.clone();
    }
    state.recompute_derived();
    state
}

pub(crate) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(crate) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}
