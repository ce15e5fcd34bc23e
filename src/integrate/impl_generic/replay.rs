//! On-demand reconstruction of the forward trajectory from checkpoints.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::checkpointing::CheckpointStore;
use super::rhs::RhsEvaluator;
use super::stepping::{StepCounters, Stepper, StepperState};
use crate::client::DiffClient;
use crate::error::{DiffError, DiffResult};

/// The accepted states of one checkpoint interval.
struct Segment<R: Runtime> {
    index: usize,
    states: Vec<StepperState<R>>,
}

const CACHED_SEGMENTS: usize = 2;

/// Primal state lookup for the backward pass.
///
/// Holds the two most recently replayed segments; a backward step rejected
/// across a checkpoint finds the later one still cached. A lookup at time `t`
/// starts from the last accepted state at or before `t` and, unless
/// the times coincide, takes one truncated step to reach `t`.
pub(crate) struct Replay<'a, R: Runtime, C> {
    client: &'a C,
    stepper: &'a Stepper,
    rhs: &'a RhsEvaluator<'a, R, C>,
    p: &'a Tensor<R>,
    store: &'a CheckpointStore<R>,
    segments: Vec<Segment<R>>,
    counters: StepCounters,
    replays: usize,
}

impl<'a, R, C> Replay<'a, R, C>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    pub(crate) fn new(
        client: &'a C,
        stepper: &'a Stepper,
        rhs: &'a RhsEvaluator<'a, R, C>,
        p: &'a Tensor<R>,
        store: &'a CheckpointStore<R>,
    ) -> Self {
        Self {
            client,
            stepper,
            rhs,
            p,
            store,
            segments: Vec::with_capacity(CACHED_SEGMENTS),
            counters: StepCounters::default(),
            replays: 0,
        }
    }

    /// Forward state at time `t`.
    pub(crate) fn state_at(&mut self, t: f64) -> DiffResult<Tensor<R>> {
        let (Some(first), Some(last)) = (self.store.first(), self.store.last()) else {
            return Err(DiffError::InvalidState {
                operation: "replay".to_string(),
                state: "no checkpoints recorded".to_string(),
            });
        };
        let t = t.clamp(first.state.t, last.state.t);
        let (index, _) = self.store.find_interval(t).unwrap_or((0, 0));

        match self.segments.iter().position(|s| s.index == index) {
            Some(0) => {}
            Some(k) => self.segments.swap(0, k),
            None => {
                let segment = self.load(index)?;
                self.segments.truncate(CACHED_SEGMENTS - 1);
                self.segments.insert(0, segment);
            }
        }
        let Some(segment) = self.segments.first() else {
            return Err(DiffError::InvalidState {
                operation: "replay".to_string(),
                state: "segment not loaded".to_string(),
            });
        };

        let j = segment
            .states
            .iter()
            .rposition(|s| s.t <= t)
            .unwrap_or(0);
        let start = &segment.states[j];
        let dt = t - start.t;
        if dt <= 0.0 {
            return Ok(start.y.clone());
        }
        let (rhs, p) = (self.rhs, self.p);
        let mut f = |t: f64, y: &Tensor<R>| rhs.eval(t, &[y, p]);
        self.stepper.advance(self.client, &mut f, start, dt)
    }

    /// Re-run the stepper over interval `index` and check it lands on the next checkpoint.
    fn load(&mut self, index: usize) -> DiffResult<Segment<R>> {
        let store = self.store;
        let start = store.get(index).ok_or_else(|| DiffError::InvalidArgument {
            context: format!("checkpoint {} out of range", index),
        })?;
        let mut states = vec![start.state.clone()];
        let Some(end) = store.get(index + 1) else {
            return Ok(Segment { index, states });
        };

        let (rhs, p) = (self.rhs, self.p);
        let mut f = |t: f64, y: &Tensor<R>| rhs.eval(t, &[y, p]);
        let mut state = start.state.clone();
        let steps = end.step - start.step;
        let t_end = store.last().map_or(end.state.t, |c| c.state.t);
        self.stepper.run(
            self.client,
            &mut f,
            &mut state,
            t_end,
            Some(steps),
            &mut self.counters,
            |_, s| {
                states.push(s.clone());
                Ok(())
            },
        )?;

        self.verify(&state, &end.state)?;
        self.replays += 1;
        log::trace!(
            "replayed segment {} [{:.6e}, {:.6e}] in {} steps",
            index,
            start.state.t,
            end.state.t,
            steps
        );
        Ok(Segment { index, states })
    }

    fn verify(&self, replayed: &StepperState<R>, recorded: &StepperState<R>) -> DiffResult<()> {
        let time_tol = 1e-12 * recorded.t.abs().max(1.0);
        let diverged = |context: String| DiffError::IntegrationDivergence {
            t: replayed.t,
            step: replayed.h,
            context,
        };
        if (replayed.t - recorded.t).abs() > time_tol {
            return Err(diverged(format!(
                "checkpoint replay reached t = {} instead of t = {}",
                replayed.t, recorded.t
            )));
        }
        let a: Vec<f64> = replayed.y.to_vec();
        let b: Vec<f64> = recorded.y.to_vec();
        let norm = self.stepper.norm();
        for (i, (x, y)) in a.iter().zip(&b).enumerate() {
            if (x - y).abs() > norm.atol + norm.rtol * y.abs() {
                return Err(diverged(format!(
                    "checkpoint replay diverged at component {}: {} vs recorded {}",
                    i, x, y
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn counters(&self) -> StepCounters {
        self.counters
    }

    pub(crate) fn replays(&self) -> usize {
        self.replays
    }
}
