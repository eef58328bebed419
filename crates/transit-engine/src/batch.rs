//! Single-item and `batch_input` request handling.
//!
//! Every batchable request flattens one inline item next to an optional
//! `batch_input` array. When the array is present the inline item is ignored,
//! items run in order, and each failure is reported in place instead of
//! failing the whole request.

use serde::Deserialize;
use serde::Serialize;
use transit_keys::Result;
use transit_keys::TransitError;

/// Accessors the batch runner needs from an item.
pub trait BatchItem {
    /// Caller-chosen tag echoed on the matching result.
    fn reference(&self) -> Option<&str>;

    /// Base64 derivation context, if the item type carries one.
    fn context(&self) -> Option<&str> {
        None
    }
}

/// An inline item plus an optional batch of items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchInput<T> {
    /// Inline item, used when `batch_input` is absent.
    #[serde(flatten)]
    pub item: T,

    /// Batch of items. Overrides the inline item when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_input: Option<Vec<T>>,
}

impl<T> BatchInput<T> {
    /// A request with one inline item.
    pub fn single(item: T) -> Self {
        Self { item, batch_input: None }
    }

    /// A batch request.
    pub fn batch(items: Vec<T>) -> Self
    where T: Default {
        Self {
            item: T::default(),
            batch_input: Some(items),
        }
    }

    /// True when the request carries `batch_input`.
    pub fn is_batch(&self) -> bool {
        self.batch_input.is_some()
    }

    /// The items to process, the inline item or the batch.
    pub fn items(&self) -> &[T] {
        match &self.batch_input {
            Some(items) => items,
            None => std::slice::from_ref(&self.item),
        }
    }

    /// Check the batch against `max_batch_size` and reject an empty batch.
    pub(crate) fn validate(&self, max_batch_size: usize) -> Result<()> {
        if let Some(items) = &self.batch_input {
            if items.is_empty() {
                return Err(TransitError::invalid("missing batch input to process"));
            }
            if items.len() > max_batch_size {
                return Err(TransitError::invalid(format!(
                    "batch of {} items exceeds the maximum of {max_batch_size}",
                    items.len()
                )));
            }
        }
        Ok(())
    }
}

impl<T: BatchItem> BatchInput<T> {
    /// Reject batches where only some items carry a context.
    pub(crate) fn check_context_consistency(&self) -> Result<()> {
        let items = self.items();
        let Some(first) = items.first() else {
            return Ok(());
        };
        let context_set = has_context(first);
        if items.iter().any(|item| has_context(item) != context_set) {
            return Err(TransitError::invalid(
                "context should be set either in all the request blocks or in none",
            ));
        }
        Ok(())
    }

    /// True when the first item to process has a context.
    pub(crate) fn context_set(&self) -> bool {
        self.items().first().is_some_and(has_context)
    }

    /// Run `op` on every item.
    ///
    /// A single inline item fails the request on error; batch items record
    /// their error in place and the rest of the batch continues.
    pub(crate) fn run<R>(&self, mut op: impl FnMut(&T) -> Result<R>) -> Result<BatchResponse<R>> {
        let Some(items) = &self.batch_input else {
            return op(&self.item).map(BatchResponse::Single);
        };
        let batch_results = items
            .iter()
            .map(|item| {
                let reference = item.reference().map(str::to_string);
                match op(item) {
                    Ok(result) => BatchResultItem {
                        result: Some(result),
                        error: None,
                        reference,
                    },
                    Err(err) => BatchResultItem {
                        result: None,
                        error: Some(err.to_string()),
                        reference,
                    },
                }
            })
            .collect();
        Ok(BatchResponse::Batch { batch_results })
    }
}

fn has_context<T: BatchItem>(item: &T) -> bool {
    item.context().is_some_and(|c| !c.is_empty())
}

/// Result of a batchable operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchResponse<R> {
    /// Result of an inline item.
    Single(R),
    /// Results of `batch_input`, in input order.
    Batch {
        /// One entry per input item.
        batch_results: Vec<BatchResultItem<R>>,
    },
}

impl<R> BatchResponse<R> {
    /// The inline result, if this is not a batch.
    pub fn single(&self) -> Option<&R> {
        match self {
            BatchResponse::Single(result) => Some(result),
            BatchResponse::Batch { .. } => None,
        }
    }

    /// Consume into the inline result, if this is not a batch.
    pub fn into_single(self) -> Option<R> {
        match self {
            BatchResponse::Single(result) => Some(result),
            BatchResponse::Batch { .. } => None,
        }
    }

    /// The batch results; empty for an inline result.
    pub fn batch_results(&self) -> &[BatchResultItem<R>] {
        match self {
            BatchResponse::Single(_) => &[],
            BatchResponse::Batch { batch_results } => batch_results,
        }
    }
}

/// One entry of a batch response: a result or an error, plus the reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResultItem<R> {
    /// Result of the item on success.
    #[serde(flatten)]
    pub result: Option<R>,

    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Echo of the item's reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}
