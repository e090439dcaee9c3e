use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future;
use futures_timer::Delay;

use crate::controller::{FormController, FormError, FormResult, read_lock, write_lock};
use crate::path::FieldPath;
use crate::store::FieldMeta;
use crate::value::Value;

/// A data-level validation error. A blank message counts as "no error", so
/// validators can return an empty string to mean valid.
pub trait ValidationError: Clone + Send + Sync + 'static {
    fn message(&self) -> String;
}

impl ValidationError for String {
    fn message(&self) -> String {
        self.clone()
    }
}

/// Outcome of one validation run: `Ok(None)` valid, `Ok(Some(error))`
/// invalid, `Err` a validator fault (distinct from a failing validation).
pub type ValidationOutcome<E> = FormResult<Option<E>>;

pub type BoxedValidateFuture<'a, E> =
    Pin<Box<dyn Future<Output = ValidationOutcome<E>> + Send + 'a>>;

pub type FormValidatorFn<E> =
    Arc<dyn Fn(Value) -> BoxedValidateFuture<'static, E> + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValidationTicket(pub u64);

/// Async-validation bookkeeping shared by the form level and each field:
/// a monotonic freshness counter plus the waiters attached to the in-flight
/// run. Whoever finishes while still current resolves every waiter; a
/// superseded run resolves nobody and writes nothing.
pub struct ValidationMeta<E> {
    validation_count: u64,
    pending: Option<PendingValidation<E>>,
}

struct PendingValidation<E> {
    waiters: Vec<oneshot::Sender<ValidationOutcome<E>>>,
}

impl<E> Default for ValidationMeta<E> {
    fn default() -> Self {
        Self {
            validation_count: 0,
            pending: None,
        }
    }
}

impl<E> ValidationMeta<E> {
    pub fn validation_count(&self) -> u64 {
        self.validation_count
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Attaches to the in-flight run, if any. The receiver resolves when the
    /// run that is current at completion time publishes its outcome.
    pub fn join(&mut self) -> Option<oneshot::Receiver<ValidationOutcome<E>>> {
        self.pending.as_mut().map(|pending| {
            let (sender, receiver) = oneshot::channel();
            pending.waiters.push(sender);
            receiver
        })
    }

    /// Opens the shared pending record so later callers can attach.
    pub fn open(&mut self) {
        if self.pending.is_none() {
            self.pending = Some(PendingValidation {
                waiters: Vec::new(),
            });
        }
    }

    /// Mints the next freshness token.
    pub fn bump(&mut self) -> ValidationTicket {
        self.validation_count += 1;
        ValidationTicket(self.validation_count)
    }

    pub fn is_current(&self, ticket: ValidationTicket) -> bool {
        self.validation_count == ticket.0
    }

    /// Closes the pending record, handing back the waiters to resolve.
    pub fn take_waiters(&mut self) -> Vec<oneshot::Sender<ValidationOutcome<E>>> {
        self.pending
            .take()
            .map(|pending| pending.waiters)
            .unwrap_or_default()
    }
}

/// The collaborator contract for a live field controller bound to one path.
/// Instances register into the field registry and must deregister on
/// disposal.
pub trait FieldInstance<E>: Send + Sync
where
    E: ValidationError,
{
    fn is_touched(&self) -> bool;
    fn has_validator(&self) -> bool;
    /// Runs the instance's own validation; the instance records the outcome
    /// in its field meta through the orchestrator.
    fn validate(&self) -> BoxedValidateFuture<'static, E>;
}

pub(crate) fn normalize_error<E>(error: Option<E>) -> Option<E>
where
    E: ValidationError,
{
    error.filter(|error| !error.message().is_empty())
}

impl<E> FormController<E>
where
    E: ValidationError,
{
    /// Touches every untouched registered instance and runs the validators
    /// they carry, in parallel. The touch pass happens in one batch, so
    /// `is_touched` flips in a single notification before any validator
    /// resolves. Resolves once every triggered validation settles; the first
    /// validator fault is then propagated.
    pub async fn validate_all_fields(&self) -> FormResult<()> {
        let mut pending = Vec::new();
        self.store.batch(|| {
            let fields = read_lock(&self.fields, "iterating field registry")?;
            for (path, info) in fields.iter() {
                for instance in info.instances.values() {
                    if instance.is_touched() {
                        continue;
                    }
                    self.set_field_meta(path, |meta| FieldMeta {
                        is_touched: true,
                        ..meta
                    })?;
                    if instance.has_validator() {
                        pending.push(instance.validate());
                    }
                }
            }
            Ok(())
        })?;

        for outcome in future::join_all(pending).await {
            outcome?;
        }
        Ok(())
    }

    /// Form-level validation. Concurrent callers share one underlying run:
    /// whoever arrives while a run is in flight attaches to it instead of
    /// invoking the validator again. Completion is committed only by the run
    /// that is still current; a superseded run discards its result and its
    /// caller resolves from whichever run is current.
    pub async fn validate_form(&self) -> ValidationOutcome<E> {
        let validator = { read_lock(&self.options, "reading form validator")?.validate.clone() };
        let Some(validator) = validator else {
            return Ok(None);
        };

        let joined = { write_lock(&self.form_validation, "joining form validation")?.join() };
        if let Some(receiver) = joined {
            return receiver
                .await
                .unwrap_or(Err(FormError::ValidationInterrupted));
        }

        let ticket = {
            let mut meta = write_lock(&self.form_validation, "starting form validation")?;
            meta.open();
            meta.bump()
        };
        let values = self.store.update(|state| {
            state.form_validation_count = ticket.0;
            state.is_form_validating = true;
            state.values.clone()
        })?;

        let outcome = match validator(values).await {
            Ok(error) => Ok(normalize_error(error)),
            Err(fault) => Err(fault),
        };

        let current =
            { read_lock(&self.form_validation, "checking form validation ticket")?.is_current(ticket) };
        if !current {
            // Superseded: the current run owns the state write and the
            // waiters; this caller falls in line behind it.
            let rejoined = { write_lock(&self.form_validation, "rejoining form validation")?.join() };
            return match rejoined {
                Some(receiver) => receiver
                    .await
                    .unwrap_or(Err(FormError::ValidationInterrupted)),
                None => Ok(self.store.state()?.form_error.clone()),
            };
        }

        match &outcome {
            Ok(error) => {
                let error = error.clone();
                self.store.update(|state| {
                    state.is_form_validating = false;
                    state.form_error = error;
                })?;
            }
            Err(_) => {
                // A fault is not a validation result; form_error stays unset.
                self.store.update(|state| state.is_form_validating = false)?;
            }
        }

        let waiters =
            { write_lock(&self.form_validation, "finishing form validation")?.take_waiters() };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }

    /// Debounced per-field async validation. Each call mints a fresh ticket;
    /// a run that is superseded during its debounce window skips the
    /// validator entirely, and one superseded mid-run discards its result.
    /// Returns the ticket when this run's result was committed, `None` when
    /// it was superseded.
    pub async fn validate_field<V>(
        &self,
        path: &FieldPath,
        debounce: Duration,
        validator: V,
    ) -> FormResult<Option<ValidationTicket>>
    where
        V: FnOnce(Value) -> BoxedValidateFuture<'static, E>,
    {
        let ticket = self.with_field_info(path, |info| {
            info.validation.open();
            info.validation.bump()
        })?;
        self.set_field_meta(path, |meta| FieldMeta {
            is_validating: true,
            async_validation_count: meta.async_validation_count + 1,
            ..meta
        })?;

        if !debounce.is_zero() {
            Delay::new(debounce).await;
            let current = self.with_field_info(path, |info| info.validation.is_current(ticket))?;
            if !current {
                return Ok(None);
            }
        }

        let values = self.store.state()?.values.clone();
        let outcome = match validator(values).await {
            Ok(error) => Ok(normalize_error(error)),
            Err(fault) => Err(fault),
        };

        let current = self.with_field_info(path, |info| info.validation.is_current(ticket))?;
        if !current {
            return Ok(None);
        }

        match &outcome {
            Ok(error) => {
                let error = error.clone();
                self.set_field_meta(path, |meta| FieldMeta {
                    is_validating: false,
                    error,
                    ..meta
                })?;
            }
            Err(_) => {
                self.set_field_meta(path, |meta| FieldMeta {
                    is_validating: false,
                    ..meta
                })?;
            }
        }

        let waiters = self.with_field_info(path, |info| info.validation.take_waiters())?;
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome.map(|_| Some(ticket))
    }
}
