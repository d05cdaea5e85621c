//! Monitorable properties attached to monitor nodes.
//!
//! A property is read lazily. `value()` may fail with
//! `PropertyError::NoSuchProperty` whenever the underlying state has gone
//! away between discovery and read; callers treat that as routine.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use weft_types::error::PropertyError;

/// A named, readable piece of live execution state.
pub trait MonitorableProperty: Send + Sync {
    /// Property name, conventionally colon-separated
    /// (e.g. `dispatch:parallelize:queuesize`).
    fn name(&self) -> &str;

    /// Current value.
    fn value(&self) -> Result<Value, PropertyError>;

    /// When the value was last known to change.
    fn last_modified(&self) -> DateTime<Utc>;
}

impl fmt::Debug for dyn MonitorableProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorableProperty")
            .field("name", &self.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StaticProperty
// ---------------------------------------------------------------------------

/// A property holding a fixed value.
#[derive(Debug, Clone)]
pub struct StaticProperty {
    name: String,
    value: Value,
    created_at: DateTime<Utc>,
}

impl StaticProperty {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            created_at: Utc::now(),
        }
    }
}

impl MonitorableProperty for StaticProperty {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Result<Value, PropertyError> {
        Ok(self.value.clone())
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.created_at
    }
}

// ---------------------------------------------------------------------------
// DynamicProperty
// ---------------------------------------------------------------------------

type Reader = dyn Fn() -> Result<Value, PropertyError> + Send + Sync;

/// A property whose value is computed on every read.
///
/// `last_modified` is the time of the most recent read that returned a
/// different value than the one before it.
pub struct DynamicProperty {
    name: String,
    reader: Box<Reader>,
    last: Mutex<(Option<Value>, DateTime<Utc>)>,
}

impl DynamicProperty {
    pub fn new<F>(name: impl Into<String>, reader: F) -> Self
    where
        F: Fn() -> Result<Value, PropertyError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            reader: Box::new(reader),
            last: Mutex::new((None, Utc::now())),
        }
    }

    /// Convenience for handing the property straight to a monitor.
    pub fn shared<F>(name: impl Into<String>, reader: F) -> Arc<dyn MonitorableProperty>
    where
        F: Fn() -> Result<Value, PropertyError> + Send + Sync + 'static,
    {
        Arc::new(Self::new(name, reader))
    }
}

impl MonitorableProperty for DynamicProperty {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Result<Value, PropertyError> {
        let value = (self.reader)()?;
        let mut last = self.last.lock().expect("property lock poisoned");
        if last.0.as_ref() != Some(&value) {
            *last = (Some(value.clone()), Utc::now());
        }
        Ok(value)
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.last.lock().expect("property lock poisoned").1
    }
}
