//! Activity contract: the external computation behind a processor.
//!
//! An activity receives its named inputs plus an [`ActivityCallback`] and
//! must eventually report exactly one outcome through it. Both reporting
//! methods consume the callback, so a second report cannot be written; a
//! callback dropped without a report turns into a failure.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use weft_types::error::ActivityError;
use weft_types::job::DataRef;

/// Named inputs or outputs of an activity invocation.
pub type DataMap = BTreeMap<String, DataRef>;

/// Arbitrary computation invoked once per job.
///
/// `invoke` may report synchronously or hand the callback to another task
/// and return immediately.
pub trait Activity: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self, inputs: DataMap, callback: ActivityCallback);
}

impl fmt::Debug for dyn Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity").field("name", &self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// ActivityCallback
// ---------------------------------------------------------------------------

/// What an activity reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// Outputs at `index`, relative to the invoking job's index. A non-empty
    /// index marks a streamed partial result.
    Result { outputs: DataMap, index: Vec<usize> },
    Failed {
        message: String,
        cause: Option<String>,
    },
}

type Reply = Box<dyn FnOnce(ActivityOutcome) + Send>;

/// One-shot reply channel handed to [`Activity::invoke`].
pub struct ActivityCallback {
    reply: Option<Reply>,
}

impl ActivityCallback {
    pub fn new<F>(reply: F) -> Self
    where
        F: FnOnce(ActivityOutcome) + Send + 'static,
    {
        Self {
            reply: Some(Box::new(reply)),
        }
    }

    /// Report outputs.
    pub fn receive_result(mut self, outputs: DataMap, index: Vec<usize>) {
        self.send(ActivityOutcome::Result { outputs, index });
    }

    /// Report failure.
    pub fn fail(mut self, message: impl Into<String>, cause: Option<String>) {
        self.send(ActivityOutcome::Failed {
            message: message.into(),
            cause,
        });
    }

    fn send(&mut self, outcome: ActivityOutcome) {
        if let Some(reply) = self.reply.take() {
            reply(outcome);
        }
    }
}

impl Drop for ActivityCallback {
    fn drop(&mut self) {
        if self.reply.is_some() {
            warn!("activity callback dropped without a result");
            self.send(ActivityOutcome::Failed {
                message: "activity finished without reporting a result".to_string(),
                cause: None,
            });
        }
    }
}

impl fmt::Debug for ActivityCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityCallback")
            .field("pending", &self.reply.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActivityRegistry
// ---------------------------------------------------------------------------

type ActivityFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn Activity>, ActivityError> + Send + Sync>;

/// Name-indexed registry of activity factories.
///
/// Each factory builds an activity from its JSON configuration.
pub struct ActivityRegistry {
    factories: HashMap<String, ActivityFactory>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Activity>, ActivityError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Build the activity registered under `name`.
    pub fn create(&self, name: &str, config: &Value) -> Result<Arc<dyn Activity>, ActivityError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ActivityError::UnknownActivity(name.to_string()))?;
        factory(config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// List all registered names, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
