//! Bottom layer: runs a job against its activity.

use std::sync::Arc;

use tracing::debug;
use weft_observe::fields;

use crate::activity::{ActivityCallback, ActivityOutcome};
use crate::dispatch::layer::{DispatchLayer, LayerContext};
use crate::dispatch::message::{
    CompletionEvent, DispatchUp, ErrorEvent, JobEvent, LayerReaction, MessageKind, ResultEvent,
    StateEffect,
};

/// Calls the first candidate activity of each job and turns its callback
/// into upward messages.
///
/// Result indices are appended to the job's index. A non-empty result index
/// marks the result as streamed and is followed by a completion at the
/// job's index.
#[derive(Debug, Default)]
pub struct Invoke;

impl Invoke {
    pub fn new() -> Self {
        Self
    }
}

impl DispatchLayer for Invoke {
    fn name(&self) -> &str {
        fields::LAYER_INVOKE
    }

    fn receive_job(&self, ctx: &LayerContext<'_>, event: JobEvent) {
        let JobEvent { job, activities } = event;

        let Some(activity) = activities.first().cloned() else {
            ctx.send_up(DispatchUp::Error(ErrorEvent {
                owning_process: job.owning_process,
                index: job.index,
                message: "no activity to invoke".to_string(),
                cause: None,
            }));
            return;
        };

        debug!(
            layer = fields::LAYER_INVOKE,
            owning_process = %job.owning_process,
            index = ?job.index,
            activity = activity.name(),
            "invoking activity"
        );

        let stack = Arc::clone(ctx.stack());
        let position = ctx.position();
        let owning_process = job.owning_process.clone();
        let job_index = job.index.clone();
        let callback = ActivityCallback::new(move |outcome| match outcome {
            ActivityOutcome::Result { outputs, index } => {
                let streaming = !index.is_empty();
                let mut full = job_index.clone();
                full.extend(index);
                stack.send_up_from(
                    position,
                    DispatchUp::Result(ResultEvent {
                        owning_process: owning_process.clone(),
                        index: full,
                        data: outputs,
                        streaming,
                    }),
                );
                if streaming {
                    stack.send_up_from(
                        position,
                        DispatchUp::ResultCompletion(CompletionEvent {
                            owning_process,
                            index: job_index,
                        }),
                    );
                }
            }
            ActivityOutcome::Failed { message, cause } => {
                stack.send_up_from(
                    position,
                    DispatchUp::Error(ErrorEvent {
                        owning_process,
                        index: job_index,
                        message,
                        cause,
                    }),
                );
            }
        });

        activity.invoke(job.data, callback);
    }

    fn reactions(&self) -> Vec<LayerReaction> {
        vec![LayerReaction::new(MessageKind::Job, [StateEffect::None])]
    }
}
