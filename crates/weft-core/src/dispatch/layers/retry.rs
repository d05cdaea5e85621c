//! Bounded retry with exponential backoff.
//!
//! Every job passing down is remembered under (owning process, index). An
//! error coming back for a remembered job is swallowed and the job reissued
//! after `initialDelay * backoffFactor^n` (capped at `maxDelay`) until
//! `maxRetries` reissues have been made; the next error goes up.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};
use weft_observe::fields;
use weft_types::config::RetryConfig;
use weft_types::error::DispatchError;
use weft_types::job::OwningProcess;

use crate::dispatch::layer::{DispatchLayer, LayerContext};
use crate::dispatch::message::{
    CompletionEvent, DispatchDown, DispatchUp, ErrorEvent, JobEvent, LayerReaction, MessageKind,
    ResultEvent, StateEffect, StateScope,
};

type JobKey = (OwningProcess, Vec<usize>);

struct Attempt {
    job: JobEvent,
    retries: u32,
}

pub struct Retry {
    config: RwLock<RetryConfig>,
    attempts: DashMap<JobKey, Attempt>,
}

impl Retry {
    pub fn new() -> Self {
        Self {
            config: RwLock::new(RetryConfig::default()),
            attempts: DashMap::new(),
        }
    }

    pub fn with_config(config: RetryConfig) -> Result<Self, DispatchError> {
        let layer = Self::new();
        layer.set_config(config)?;
        Ok(layer)
    }

    /// Build from a JSON configuration, see [`Retry::configure`].
    pub fn from_json(config: &Value) -> Result<Self, DispatchError> {
        let layer = Self::new();
        layer.configure(config)?;
        Ok(layer)
    }

    /// Replace the configuration with defaults overlaid by `partial`.
    ///
    /// Fields missing from `partial` revert to their defaults. Nothing is
    /// applied unless the whole result validates.
    pub fn configure(&self, partial: &Value) -> Result<(), DispatchError> {
        let config = RetryConfig::from_json(partial)?;
        *self.config.write().expect("retry config lock poisoned") = config;
        Ok(())
    }

    pub fn set_config(&self, config: RetryConfig) -> Result<(), DispatchError> {
        config.validate()?;
        *self.config.write().expect("retry config lock poisoned") = config;
        Ok(())
    }

    pub fn config(&self) -> RetryConfig {
        self.config.read().expect("retry config lock poisoned").clone()
    }

    /// Number of jobs currently tracked.
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }

    fn forget(&self, owning_process: &OwningProcess, index: &[usize]) {
        self.attempts
            .remove(&(owning_process.clone(), index.to_vec()));
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchLayer for Retry {
    fn name(&self) -> &str {
        fields::LAYER_RETRY
    }

    fn receive_job(&self, ctx: &LayerContext<'_>, event: JobEvent) {
        let key = (event.owning_process().clone(), event.index().to_vec());
        self.attempts.insert(
            key,
            Attempt {
                job: event.clone(),
                retries: 0,
            },
        );
        ctx.send_down(DispatchDown::Job(event));
    }

    fn receive_result(&self, ctx: &LayerContext<'_>, event: ResultEvent) {
        if !event.streaming {
            self.forget(&event.owning_process, &event.index);
        }
        ctx.send_up(DispatchUp::Result(event));
    }

    fn receive_result_completion(&self, ctx: &LayerContext<'_>, event: CompletionEvent) {
        self.forget(&event.owning_process, &event.index);
        ctx.send_up(DispatchUp::ResultCompletion(event));
    }

    fn receive_error(&self, ctx: &LayerContext<'_>, event: ErrorEvent) {
        let config = self.config();
        let key = (event.owning_process.clone(), event.index.clone());

        let reissue = match self.attempts.get_mut(&key) {
            Some(mut attempt) if i64::from(attempt.retries) < config.max_retries => {
                let delay = config.delay_for(attempt.retries);
                attempt.retries += 1;
                Some((attempt.job.clone(), delay, attempt.retries))
            }
            _ => None,
        };

        let Some((job, delay, retry)) = reissue else {
            if self.attempts.remove(&key).is_some() {
                warn!(
                    layer = fields::LAYER_RETRY,
                    owning_process = %event.owning_process,
                    index = ?event.index,
                    error = %event.message,
                    "retries exhausted"
                );
            }
            ctx.send_up(DispatchUp::Error(event));
            return;
        };

        debug!(
            layer = fields::LAYER_RETRY,
            owning_process = %event.owning_process,
            index = ?event.index,
            retry,
            delay_ms = delay.as_millis() as u64,
            error = %event.message,
            "reissuing failed job"
        );
        let stack = Arc::clone(ctx.stack());
        let position = ctx.position();
        ctx.stack().runtime().spawn(async move {
            tokio::time::sleep(delay).await;
            stack.send_down_from(position, DispatchDown::Job(job));
        });
    }

    fn finished_with(&self, owning_process: &OwningProcess) {
        self.attempts.retain(|(process, _), _| process != owning_process);
    }

    fn reactions(&self) -> Vec<LayerReaction> {
        let scope = StateScope::ProcessAndIndex;
        vec![
            LayerReaction::new(MessageKind::Job, [StateEffect::Create(scope)]),
            LayerReaction::new(MessageKind::Result, [StateEffect::Remove(scope)]),
            LayerReaction::new(MessageKind::ResultCompletion, [StateEffect::Remove(scope)]),
            LayerReaction::new(
                MessageKind::Error,
                [StateEffect::Update(scope), StateEffect::Remove(scope)],
            ),
        ]
    }
}
