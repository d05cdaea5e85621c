//! Staged iteration: strategies applied one after another.
//!
//! Stage N+1 iterates over the output stream of stage N. Every job stage N
//! emits is handed to each of stage N+1's named inputs at the job's index; a
//! job at the empty index (a bare item, stage N did not iterate) is first
//! promoted to index `[0]` so the next stage always sees a list boundary.
//! The depth algebra follows: stage N+1's ports are supplied
//! `declared + max(depth(N), 1)`, and the stack's depth is the depth of its
//! last stage.

use std::collections::HashMap;

use weft_types::error::IterationError;
use weft_types::job::{Completion, DataRef, IterationEvent, Job, OwningProcess};

use super::strategy::IterationStrategy;

/// Ordered composition of iteration strategies.
#[derive(Debug, Default)]
pub struct IterationStrategyStack {
    stages: Vec<IterationStrategy>,
}

impl IterationStrategyStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stack with a single stage.
    pub fn single(strategy: IterationStrategy) -> Self {
        Self {
            stages: vec![strategy],
        }
    }

    pub fn push_stage(&mut self, strategy: IterationStrategy) {
        self.stages.push(strategy);
    }

    pub fn stages(&self) -> &[IterationStrategy] {
        &self.stages
    }

    pub fn stages_mut(&mut self) -> &mut [IterationStrategy] {
        &mut self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Iteration depth of the whole stack for the supplied port depths.
    pub fn iteration_depth(&self, depths: &HashMap<String, usize>) -> Result<usize, IterationError> {
        let Some(first) = self.stages.first() else {
            return Ok(0);
        };
        let mut depth = first.iteration_depth(depths)?;

        for pair in self.stages.windows(2) {
            let (previous, next) = (&pair[0], &pair[1]);
            let available = previous.desired_depths();
            let lists = depth.max(1);
            let mut supplied = HashMap::new();
            for (port, declared) in next.desired_depths() {
                if !available.contains_key(&port) {
                    return Err(IterationError::MissingInput(port));
                }
                supplied.insert(port, declared + lists);
            }
            depth = next.iteration_depth(&supplied)?;
        }
        Ok(depth)
    }

    // -----------------------------------------------------------------------
    // Runtime
    // -----------------------------------------------------------------------

    /// Feed a token to the first stage and return what leaves the last.
    ///
    /// With no stages the token passes straight through as a one-input job.
    pub fn receive_data(
        &mut self,
        port: &str,
        process: &OwningProcess,
        index: &[usize],
        data: DataRef,
    ) -> Result<Vec<IterationEvent>, IterationError> {
        let Some(first) = self.stages.first_mut() else {
            return Ok(vec![IterationEvent::Job(Job::single(
                process.clone(),
                index.to_vec(),
                port,
                data,
            ))]);
        };
        let events = first.receive_data(port, process, index, data)?;
        self.forward(1, events)
    }

    pub fn receive_completion(
        &mut self,
        port: &str,
        process: &OwningProcess,
        index: &[usize],
    ) -> Result<Vec<IterationEvent>, IterationError> {
        let Some(first) = self.stages.first_mut() else {
            return Ok(vec![IterationEvent::Completion(Completion::new(
                process.clone(),
                index.to_vec(),
            ))]);
        };
        let events = first.receive_completion(port, process, index)?;
        self.forward(1, events)
    }

    /// Drop buffered state for `process` in every stage.
    pub fn discard(&mut self, process: &OwningProcess) {
        for stage in &mut self.stages {
            stage.discard(process);
        }
    }

    fn forward(
        &mut self,
        stage: usize,
        events: Vec<IterationEvent>,
    ) -> Result<Vec<IterationEvent>, IterationError> {
        let Some(next) = self.stages.get_mut(stage) else {
            return Ok(events);
        };

        let mut produced = Vec::new();
        for event in events {
            match event {
                IterationEvent::Job(mut job) => {
                    let index = if job.index.is_empty() { vec![0] } else { job.index };
                    // Every port is resolved before any is delivered, so a
                    // missing one leaves the next stage untouched.
                    let inputs = next
                        .desired_depths()
                        .into_keys()
                        .map(|port| match job.data.remove(&port) {
                            Some(data) => Ok((port, data)),
                            None => Err(IterationError::MissingInput(port)),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    for (port, data) in inputs {
                        produced.extend(next.receive_data(
                            &port,
                            &job.owning_process,
                            &index,
                            data,
                        )?);
                    }
                }
                IterationEvent::Completion(completion) => {
                    let ports: Vec<String> = next.desired_depths().into_keys().collect();
                    for port in ports {
                        produced.extend(next.receive_completion(
                            &port,
                            &completion.owning_process,
                            &completion.index,
                        )?);
                    }
                }
            }
        }
        self.forward(stage + 1, produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depths(pairs: &[(&str, usize)]) -> HashMap<String, usize> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn process() -> OwningProcess {
        OwningProcess::new(["df0", "p1"])
    }

    fn job_indices(events: &[IterationEvent]) -> Vec<Vec<usize>> {
        events
            .iter()
            .filter_map(|e| match e {
                IterationEvent::Job(j) => Some(j.index.clone()),
                IterationEvent::Completion(_) => None,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Depth algebra
    // -----------------------------------------------------------------------

    #[test]
    fn test_empty_stack_depth_zero() {
        let stack = IterationStrategyStack::new();
        assert_eq!(stack.iteration_depth(&depths(&[("a", 3)])).unwrap(), 0);
    }

    #[test]
    fn test_single_stage_matches_strategy() {
        let stack = IterationStrategyStack::single(IterationStrategy::cross_product([
            ("a", 0),
            ("b", 0),
        ]));
        assert_eq!(
            stack.iteration_depth(&depths(&[("a", 1), ("b", 2)])).unwrap(),
            3
        );
    }

    #[test]
    fn test_dot_stage_after_iterating_stage_is_identity() {
        let mut stack = IterationStrategyStack::single(IterationStrategy::cross_product([
            ("a", 0),
            ("b", 0),
        ]));
        stack.push_stage(IterationStrategy::dot_product([("a", 0), ("b", 0)]));
        assert_eq!(
            stack.iteration_depth(&depths(&[("a", 1), ("b", 1)])).unwrap(),
            2
        );
    }

    #[test]
    fn test_bare_stage_output_promoted_to_list() {
        let mut stack = IterationStrategyStack::single(IterationStrategy::dot_product([
            ("a", 0),
            ("b", 0),
        ]));
        stack.push_stage(IterationStrategy::dot_product([("a", 0), ("b", 0)]));
        // First stage does not iterate; the second sees a one-element list.
        assert_eq!(
            stack.iteration_depth(&depths(&[("a", 0), ("b", 0)])).unwrap(),
            1
        );
    }

    #[test]
    fn test_cross_stage_over_stream() {
        let mut stack = IterationStrategyStack::single(IterationStrategy::dot_product([
            ("a", 0),
            ("b", 0),
        ]));
        stack.push_stage(IterationStrategy::cross_product([("a", 0), ("b", 0)]));
        assert_eq!(
            stack.iteration_depth(&depths(&[("a", 1), ("b", 1)])).unwrap(),
            2
        );
    }

    #[test]
    fn test_missing_input_at_later_stage() {
        let mut stack = IterationStrategyStack::single(IterationStrategy::cross_product([("a", 0)]));
        stack.push_stage(IterationStrategy::dot_product([("a", 0), ("c", 0)]));
        let err = stack.iteration_depth(&depths(&[("a", 1)])).unwrap_err();
        assert_eq!(err, IterationError::MissingInput("c".to_string()));
    }

    #[test]
    fn test_missing_input_at_first_stage() {
        let stack = IterationStrategyStack::single(IterationStrategy::cross_product([("a", 0)]));
        let err = stack.iteration_depth(&HashMap::new()).unwrap_err();
        assert_eq!(err, IterationError::MissingInput("a".to_string()));
    }

    // -----------------------------------------------------------------------
    // Runtime staging
    // -----------------------------------------------------------------------

    #[test]
    fn test_runtime_dot_then_cross() {
        let mut stack = IterationStrategyStack::single(IterationStrategy::dot_product([
            ("a", 0),
            ("b", 0),
        ]));
        stack.push_stage(IterationStrategy::cross_product([("a", 0), ("b", 0)]));

        let p = process();
        let mut out = Vec::new();
        for i in 0..2 {
            out.extend(stack.receive_data("a", &p, &[i], DataRef::new(format!("a{i}"))).unwrap());
            out.extend(stack.receive_data("b", &p, &[i], DataRef::new(format!("b{i}"))).unwrap());
        }
        let mut got = job_indices(&out);
        got.sort();
        assert_eq!(got, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);

        stack.receive_completion("a", &p, &[]).unwrap();
        let done = stack.receive_completion("b", &p, &[]).unwrap();
        assert!(done
            .iter()
            .any(|e| matches!(e, IterationEvent::Completion(c) if c.is_final())));
    }

    #[test]
    fn test_runtime_bare_item_promoted() {
        let mut stack = IterationStrategyStack::single(IterationStrategy::dot_product([
            ("a", 0),
            ("b", 0),
        ]));
        stack.push_stage(IterationStrategy::dot_product([("a", 0), ("b", 0)]));
        let p = process();
        stack.receive_data("a", &p, &[], DataRef::new("a")).unwrap();
        let out = stack.receive_data("b", &p, &[], DataRef::new("b")).unwrap();
        assert_eq!(job_indices(&out), vec![vec![0]]);
    }

    #[test]
    fn test_runtime_missing_port_between_stages() {
        let mut stack = IterationStrategyStack::single(IterationStrategy::cross_product([("a", 0)]));
        stack.push_stage(IterationStrategy::dot_product([("a", 0), ("c", 0)]));
        let err = stack
            .receive_data("a", &process(), &[0], DataRef::new("a0"))
            .unwrap_err();
        assert_eq!(err, IterationError::MissingInput("c".to_string()));
        // Port "a" sorts before "c" and must not have been cached.
        assert!(!stack.stages()[1].has_state_for(&process()));
    }

    #[test]
    fn test_empty_stack_passes_through() {
        let mut stack = IterationStrategyStack::new();
        let out = stack
            .receive_data("a", &process(), &[2], DataRef::new("x"))
            .unwrap();
        assert_eq!(job_indices(&out), vec![vec![2]]);
    }
}
