//! Operator parameter exchange.
//!
//! The controller suspends on operator input at a few points in the workflow
//! (pre-strategy parameters, lattice choice, collection strategy, fine zoom).
//! Each request goes out as a [`ParameterRequest`] and the answer comes back
//! over a single-slot channel as a [`UserInput`].
//!
//! A dropped sender is treated as cancellation, so a UI that disappears
//! mid-request cannot leave the workflow hanging.

use crate::error::{AppResult, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Operator reply to a parameter request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UserInput<T> {
    /// The operator cancelled (or the requester went away)
    Cancelled,
    /// The operator confirmed these values
    Value(T),
}

impl<T> UserInput<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            UserInput::Cancelled => None,
            UserInput::Value(value) => Some(value),
        }
    }
}

/// Waits for the operator reply; a closed channel counts as cancellation.
///
/// ```
/// use beamline_workflow::parameter::{await_input, UserInput};
/// use tokio::sync::oneshot;
///
/// # tokio_test::block_on(async {
/// let (tx, rx) = oneshot::channel::<UserInput<u32>>();
/// drop(tx);
/// assert_eq!(await_input(rx).await, UserInput::Cancelled);
/// # });
/// ```
pub async fn await_input<T>(receiver: oneshot::Receiver<UserInput<T>>) -> UserInput<T> {
    receiver.await.unwrap_or(UserInput::Cancelled)
}

/// Loosely typed name to value map, as entered by an operator or supplied by
/// an automation parameter set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterValues(BTreeMap<String, Value>);

impl ParameterValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Numeric value, `None` when absent or null.
    pub fn get_f64(&self, name: &str) -> AppResult<Option<f64>> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| {
                WorkflowError::Validation(format!("parameter '{}' is not a number: {}", name, value))
            }),
        }
    }

    /// Non-negative integer value, `None` when absent or null.
    pub fn get_u32(&self, name: &str) -> AppResult<Option<u32>> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(Some)
                .ok_or_else(|| {
                    WorkflowError::Validation(format!(
                        "parameter '{}' is not a non-negative integer: {}",
                        name, value
                    ))
                }),
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for ParameterValues {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What the operator is being asked for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "purpose", rename_all = "snake_case")]
pub enum RequestPurpose {
    /// Sample and dose parameters before the first strategy
    PreStrategy,
    /// Choice of indexing solution; `table` is the rendered candidate table
    ChooseLattice {
        table: String,
        selected_row: Option<usize>,
    },
    /// Confirmation of a proposed collection strategy
    CollectionStrategy { summary: String },
    /// Informational prompt the operator only needs to acknowledge
    Acknowledge { message: String },
}

/// Request for operator input, with the values to pre-fill.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterRequest {
    pub title: String,
    #[serde(flatten)]
    pub purpose: RequestPurpose,
    pub defaults: ParameterValues,
}

impl ParameterRequest {
    pub fn new(title: impl Into<String>, purpose: RequestPurpose, defaults: ParameterValues) -> Self {
        Self {
            title: title.into(),
            purpose,
            defaults,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dropped_sender_is_cancellation() {
        let (tx, rx) = oneshot::channel::<UserInput<ParameterValues>>();
        drop(tx);
        assert_eq!(await_input(rx).await, UserInput::Cancelled);
    }

    #[tokio::test]
    async fn test_value_is_delivered() {
        let (tx, rx) = oneshot::channel();
        let values = ParameterValues::new().with("transmission", 12.5);
        tx.send(UserInput::Value(values.clone())).unwrap();
        assert_eq!(await_input(rx).await.into_value(), Some(values));
    }

    #[test]
    fn test_typed_getters() {
        let values = ParameterValues::new()
            .with("exposure", 0.04)
            .with("snapshot_count", 2)
            .with("recentring_mode", "sweep")
            .with("cell_a", Value::Null);

        assert_eq!(values.get_f64("exposure").unwrap(), Some(0.04));
        assert_eq!(values.get_u32("snapshot_count").unwrap(), Some(2));
        assert_eq!(values.get_str("recentring_mode"), Some("sweep"));
        assert_eq!(values.get_f64("cell_a").unwrap(), None);
        assert_eq!(values.get_f64("missing").unwrap(), None);
        assert!(values.get_u32("exposure").is_err());
    }

    #[test]
    fn test_values_deserialize_from_plain_object() {
        let values: ParameterValues =
            serde_json::from_value(json!({"use_dose": 3.0, "resolution": 1.8})).unwrap();
        assert_eq!(values.get_f64("resolution").unwrap(), Some(1.8));
        assert!(values.contains("use_dose"));
    }
}
