//! Batch fan-out and fan-in.
//!
//! A batch submits every input concurrently and collects the answers into
//! slots aligned with the inputs, whatever order they complete in.

use tokio::task::JoinSet;
use tracing::{debug, error};

use wasm_calc_common::{BindingError, RuntimeError};

use crate::context::CallContext;
use crate::coordinator::Coordinator;

/// Positionally aligned results of a batch.
///
/// Slot `i` belongs to input `i`. A failed slot holds `None` in
/// [`BatchOutcome::results`] and its error in [`BatchOutcome::errors`].
#[derive(Debug)]
pub struct BatchOutcome<T> {
    results: Vec<Option<T>>,
    errors: Vec<Option<BindingError>>,
    first_failure: Option<usize>,
}

impl<T> BatchOutcome<T> {
    /// An outcome with `len` empty slots.
    pub fn with_len(len: usize) -> Self {
        Self {
            results: std::iter::repeat_with(|| None).take(len).collect(),
            errors: std::iter::repeat_with(|| None).take(len).collect(),
            first_failure: None,
        }
    }

    /// Fill slot `index`. The first failure recorded becomes [`BatchOutcome::error`].
    pub fn record(&mut self, index: usize, result: Result<T, BindingError>) {
        match result {
            Ok(value) => self.results[index] = Some(value),
            Err(e) => {
                self.errors[index] = Some(e);
                if self.first_failure.is_none() {
                    self.first_failure = Some(index);
                }
            }
        }
    }

    /// Per-slot results; failed slots are `None`.
    pub fn results(&self) -> &[Option<T>] {
        &self.results
    }

    /// The first failure, by completion order.
    pub fn error(&self) -> Option<&BindingError> {
        self.first_failure
            .and_then(|index| self.errors[index].as_ref())
    }

    /// Every failure with its slot index, in slot order.
    pub fn errors(&self) -> impl Iterator<Item = (usize, &BindingError)> {
        self.errors
            .iter()
            .enumerate()
            .filter_map(|(index, e)| e.as_ref().map(|e| (index, e)))
    }

    /// Number of failed slots.
    pub fn failed(&self) -> usize {
        self.errors.iter().filter(|e| e.is_some()).count()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns `true` for an empty batch.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Returns `true` if no slot failed.
    pub fn is_ok(&self) -> bool {
        self.first_failure.is_none()
    }

    /// Transform successful values, keeping slots and errors in place.
    pub fn map<U>(self, mut f: impl FnMut(usize, T) -> U) -> BatchOutcome<U> {
        BatchOutcome {
            results: self
                .results
                .into_iter()
                .enumerate()
                .map(|(index, value)| value.map(|v| f(index, v)))
                .collect(),
            errors: self.errors,
            first_failure: self.first_failure,
        }
    }

    /// Split into the slot vector and the first failure.
    pub fn into_parts(mut self) -> (Vec<Option<T>>, Option<BindingError>) {
        let error = self
            .first_failure
            .and_then(|index| self.errors[index].take());
        (self.results, error)
    }
}

impl Coordinator {
    /// Submit every input concurrently.
    ///
    /// Each input gets its own [`Coordinator::submit`] sharing `ctx`, so
    /// cancelling `ctx` cancels the whole batch. Dropping the returned future
    /// aborts the outstanding submissions.
    pub async fn submit_batch<S: AsRef<str>>(
        &self,
        ctx: &CallContext,
        inputs: &[S],
    ) -> BatchOutcome<String> {
        let mut outcome = BatchOutcome::with_len(inputs.len());
        let mut set = JoinSet::new();

        for (index, input) in inputs.iter().enumerate() {
            let coordinator = self.clone();
            let ctx = ctx.clone();
            let input = input.as_ref().to_owned();

            set.spawn(async move { (index, coordinator.submit(&ctx, &input).await) });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => outcome.record(index, result),
                Err(e) => error!(error = %e, "Batch submission task failed"),
            }
        }

        // A task that died without answering leaves its slot empty.
        for index in 0..outcome.len() {
            if outcome.results[index].is_none() && outcome.errors[index].is_none() {
                outcome.record(index, Err(RuntimeError::ChannelClosed.into()));
            }
        }

        debug!(
            len = outcome.len(),
            failed = outcome.failed(),
            "Batch complete"
        );

        outcome
    }
}
