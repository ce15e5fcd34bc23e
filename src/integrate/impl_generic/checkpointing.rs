//! Checkpoint storage for adjoint sensitivity analysis.
//!
//! The forward pass stores the stepper state every `stride` accepted steps,
//! plus the initial and terminal states. The backward pass reconstructs the
//! trajectory between two checkpoints by re-running the stepper from the
//! earlier one.

use numr::runtime::Runtime;

use super::stepping::StepperState;
use crate::error::{DiffError, DiffResult};

/// A stored stepper state and the number of accepted steps that led to it.
#[derive(Debug, Clone)]
pub struct Checkpoint<R: Runtime> {
    pub step: usize,
    pub state: StepperState<R>,
}

/// Checkpoints of one forward trajectory, in increasing time order.
#[derive(Debug, Clone)]
pub struct CheckpointStore<R: Runtime> {
    stride: usize,
    checkpoints: Vec<Checkpoint<R>>,
}

impl<R: Runtime> CheckpointStore<R> {
    pub fn new(stride: usize) -> Self {
        Self {
            stride: stride.max(1),
            checkpoints: Vec::new(),
        }
    }

    /// Accepted steps between consecutive checkpoints.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Append a checkpoint; times and step counts must strictly increase.
    pub fn add_checkpoint(&mut self, step: usize, state: StepperState<R>) -> DiffResult<()> {
        if let Some(last) = self.checkpoints.last() {
            if state.t <= last.state.t || step <= last.step {
                return Err(DiffError::InvalidArgument {
                    context: format!(
                        "checkpoint at t = {} (step {}) does not follow t = {} (step {})",
                        state.t, step, last.state.t, last.step
                    ),
                });
            }
        }
        self.checkpoints.push(Checkpoint { step, state });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Checkpoint<R>> {
        self.checkpoints.get(index)
    }

    pub fn first(&self) -> Option<&Checkpoint<R>> {
        self.checkpoints.first()
    }

    pub fn last(&self) -> Option<&Checkpoint<R>> {
        self.checkpoints.last()
    }

    pub(crate) fn last_step(&self) -> Option<usize> {
        self.checkpoints.last().map(|c| c.step)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint<R>> {
        self.checkpoints.iter()
    }

    /// Find the checkpoint interval containing time `t`.
    ///
    /// Returns `(before, after)` where `before` is the last checkpoint with
    /// time `<= t`. Times before the first checkpoint map to the first interval.
    pub fn find_interval(&self, t: f64) -> Option<(usize, usize)> {
        if self.checkpoints.is_empty() {
            return None;
        }
        let before = self
            .checkpoints
            .partition_point(|c| c.state.t <= t)
            .saturating_sub(1);
        let after = (before + 1).min(self.checkpoints.len() - 1);
        Some((before, after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};
    use numr::tensor::Tensor;

    fn state(t: f64) -> StepperState<CpuRuntime> {
        let device = CpuDevice::new();
        let y = Tensor::<CpuRuntime>::from_slice(&[t], &[1, 1], &device);
        StepperState {
            t,
            y: y.clone(),
            f: y,
            h: 0.1,
        }
    }

    #[test]
    fn test_add_and_find_checkpoint() {
        let mut store = CheckpointStore::<CpuRuntime>::new(4);
        store.add_checkpoint(0, state(0.0)).unwrap();
        store.add_checkpoint(4, state(0.5)).unwrap();
        store.add_checkpoint(6, state(1.0)).unwrap();
        assert_eq!(store.len(), 3);

        assert_eq!(store.find_interval(0.3), Some((0, 1)));
        assert_eq!(store.find_interval(0.5), Some((1, 2)));
        assert_eq!(store.find_interval(0.7), Some((1, 2)));
        assert_eq!(store.find_interval(1.0), Some((2, 2)));
        assert_eq!(store.find_interval(-1.0), Some((0, 1)));

        let steps: Vec<usize> = store.iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![0, 4, 6]);
    }

    #[test]
    fn test_times_must_increase() {
        let mut store = CheckpointStore::<CpuRuntime>::new(1);
        store.add_checkpoint(0, state(0.0)).unwrap();
        store.add_checkpoint(1, state(0.5)).unwrap();
        assert!(store.add_checkpoint(2, state(0.5)).is_err());
        assert!(store.add_checkpoint(1, state(0.7)).is_err());
        assert_eq!(store.len(), 2);
    }
}
