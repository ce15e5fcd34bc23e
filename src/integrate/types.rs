//! Configuration and result types for sensitivity integration.

use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{DiffError, DiffResult};

/// Single-step method used by the integrator.
///
/// | Method | Order | Stages | Use Case |
/// |--------|-------|--------|----------|
/// | RK23   | 2(3)  | 4      | Fast, lower accuracy |
/// | RK45   | 4(5)  | 7      | General purpose (default) |
///
/// Both methods reuse the last stage of an accepted step as the first stage
/// of the next one, so the stepper state is `(t, y, f(t, y), h)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ODEMethod {
    /// Bogacki-Shampine 2(3).
    RK23,

    /// Dormand-Prince 4(5).
    #[default]
    RK45,
}

impl ODEMethod {
    /// Order of the propagated solution.
    pub fn order(&self) -> usize {
        match self {
            Self::RK23 => 3,
            Self::RK45 => 5,
        }
    }

    /// Order used by the step-size controller.
    pub fn error_order(&self) -> usize {
        match self {
            Self::RK23 => 2,
            Self::RK45 => 4,
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rk23" => Some(Self::RK23),
            "rk45" => Some(Self::RK45),
            _ => None,
        }
    }
}

/// Preferred sensitivity direction of an integrator.
///
/// With `Adjoint`, every solve records checkpoints so that a later adjoint
/// pass can reconstruct the trajectory. `Forward` skips the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdMode {
    Forward,
    #[default]
    Adjoint,
}

/// A dynamically typed option value for string-keyed configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Float(f64),
    Integer(i64),
    Text(String),
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<usize> for OptionValue {
    fn from(v: usize) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl OptionValue {
    fn as_float(&self, key: &str) -> DiffResult<f64> {
        match self {
            Self::Float(v) => Ok(*v),
            Self::Integer(v) => Ok(*v as f64),
            Self::Text(_) => Err(invalid(key, "expected a number")),
        }
    }

    fn as_count(&self, key: &str) -> DiffResult<usize> {
        match self {
            Self::Integer(v) if *v >= 0 => Ok(*v as usize),
            Self::Integer(_) => Err(invalid(key, "must be non-negative")),
            _ => Err(invalid(key, "expected an integer")),
        }
    }

    fn as_text(&self, key: &str) -> DiffResult<&str> {
        match self {
            Self::Text(v) => Ok(v),
            _ => Err(invalid(key, "expected a string")),
        }
    }
}

fn invalid(option: &str, reason: &str) -> DiffError {
    DiffError::ConfigurationError {
        option: option.to_string(),
        reason: reason.to_string(),
    }
}

/// Options for an ODE integrator and its sensitivity passes.
///
/// Immutable once handed to an integrator; validated at configure time.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegratorOptions {
    /// Stepping method (default: RK45)
    pub method: ODEMethod,

    /// Relative tolerance (default: 1e-8)
    pub rtol: f64,

    /// Absolute tolerance (default: 1e-10)
    pub atol: f64,

    /// Start time (default: 0)
    pub t0: f64,

    /// End time (default: 1)
    pub tf: f64,

    /// Accepted steps between checkpoints (default: 20)
    pub checkpoint_stride: usize,

    /// Preferred sensitivity direction (default: Adjoint)
    pub ad_mode: AdMode,

    /// Initial step size (default: auto-computed)
    pub h0: Option<f64>,

    /// Maximum step size (default: unbounded)
    pub max_step: Option<f64>,

    /// Step-size floor; a rejected step below it fails the integration (default: 1e-14)
    pub min_step: f64,

    /// Maximum number of step attempts per integration (default: 100000)
    pub max_steps: usize,

    /// Relative tolerance of the backward adjoint integration (default: `rtol`)
    pub adjoint_rtol: Option<f64>,

    /// Absolute tolerance of the backward adjoint integration (default: `atol`)
    pub adjoint_atol: Option<f64>,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            method: ODEMethod::default(),
            rtol: 1e-8,
            atol: 1e-10,
            t0: 0.0,
            tf: 1.0,
            checkpoint_stride: 20,
            ad_mode: AdMode::default(),
            h0: None,
            max_step: None,
            min_step: 1e-14,
            max_steps: 100_000,
            adjoint_rtol: None,
            adjoint_atol: None,
        }
    }
}

impl IntegratorOptions {
    /// Set the integration horizon.
    pub fn with_horizon(mut self, t0: f64, tf: f64) -> Self {
        self.t0 = t0;
        self.tf = tf;
        self
    }

    /// Set forward tolerances.
    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    /// Set tolerances of the backward adjoint integration.
    pub fn with_adjoint_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.adjoint_rtol = Some(rtol);
        self.adjoint_atol = Some(atol);
        self
    }

    pub fn with_checkpoint_stride(mut self, stride: usize) -> Self {
        self.checkpoint_stride = stride;
        self
    }

    pub fn with_ad_mode(mut self, mode: AdMode) -> Self {
        self.ad_mode = mode;
        self
    }

    pub fn with_method(mut self, method: ODEMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_initial_step(mut self, h0: f64) -> Self {
        self.h0 = Some(h0);
        self
    }

    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = Some(max_step);
        self
    }

    pub fn with_min_step(mut self, min_step: f64) -> Self {
        self.min_step = min_step;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Tolerances `(rtol, atol)` of the backward adjoint integration.
    pub fn adjoint_tolerances(&self) -> (f64, f64) {
        (
            self.adjoint_rtol.unwrap_or(self.rtol),
            self.adjoint_atol.unwrap_or(self.atol),
        )
    }

    /// Build options from string keys, starting from the defaults.
    ///
    /// Recognized keys: `relative_tolerance`, `absolute_tolerance`, `t0`, `tf`,
    /// `checkpoint_stride`, `ad_mode` (`"forward"`/`"adjoint"`), `method`
    /// (`"rk23"`/`"rk45"`), `max_steps`, `min_step`, `max_step`, `initial_step`,
    /// `adjoint_relative_tolerance`, `adjoint_absolute_tolerance`.
    pub fn from_pairs(pairs: &[(&str, OptionValue)]) -> DiffResult<Self> {
        let mut options = Self::default();
        for (key, value) in pairs {
            match *key {
                "relative_tolerance" => options.rtol = value.as_float(key)?,
                "absolute_tolerance" => options.atol = value.as_float(key)?,
                "t0" => options.t0 = value.as_float(key)?,
                "tf" => options.tf = value.as_float(key)?,
                "checkpoint_stride" => options.checkpoint_stride = value.as_count(key)?,
                "max_steps" => options.max_steps = value.as_count(key)?,
                "min_step" => options.min_step = value.as_float(key)?,
                "max_step" => options.max_step = Some(value.as_float(key)?),
                "initial_step" => options.h0 = Some(value.as_float(key)?),
                "adjoint_relative_tolerance" => options.adjoint_rtol = Some(value.as_float(key)?),
                "adjoint_absolute_tolerance" => options.adjoint_atol = Some(value.as_float(key)?),
                "ad_mode" => {
                    options.ad_mode = match value.as_text(key)?.to_ascii_lowercase().as_str() {
                        "forward" => AdMode::Forward,
                        "adjoint" => AdMode::Adjoint,
                        other => {
                            return Err(invalid(key, &format!("unknown mode '{}'", other)));
                        }
                    }
                }
                "method" => {
                    let name = value.as_text(key)?;
                    options.method = ODEMethod::parse(name)
                        .ok_or_else(|| invalid(key, &format!("unknown method '{}'", name)))?;
                }
                other => return Err(invalid(other, "unrecognized option")),
            }
        }
        options.validate()?;
        Ok(options)
    }

    /// Check ranges; every violation is a `ConfigurationError`.
    pub fn validate(&self) -> DiffResult<()> {
        fn positive(option: &str, v: f64) -> DiffResult<()> {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(invalid(option, &format!("must be positive and finite, got {}", v)))
            }
        }

        positive("relative_tolerance", self.rtol)?;
        positive("absolute_tolerance", self.atol)?;
        positive("min_step", self.min_step)?;
        if let Some(h) = self.max_step {
            positive("max_step", h)?;
        }
        if let Some(h) = self.h0 {
            positive("initial_step", h)?;
        }
        if let Some(v) = self.adjoint_rtol {
            positive("adjoint_relative_tolerance", v)?;
        }
        if let Some(v) = self.adjoint_atol {
            positive("adjoint_absolute_tolerance", v)?;
        }
        if !self.t0.is_finite() {
            return Err(invalid("t0", "must be finite"));
        }
        if !self.tf.is_finite() || self.tf < self.t0 {
            return Err(invalid("tf", &format!("must be finite and >= t0 ({})", self.t0)));
        }
        if self.checkpoint_stride == 0 {
            return Err(invalid("checkpoint_stride", "must be at least 1"));
        }
        if self.max_steps == 0 {
            return Err(invalid("max_steps", "must be at least 1"));
        }
        Ok(())
    }
}

/// Work counters of an integration or sensitivity pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrationStatistics {
    /// Accepted steps of the forward trajectory (including replays).
    pub accepted_steps: usize,

    /// Rejected step attempts (forward and backward).
    pub rejected_steps: usize,

    /// Accepted steps of backward adjoint integrations.
    pub adjoint_steps: usize,

    /// Right-hand side evaluations (primal and adjoint).
    pub rhs_evaluations: usize,

    /// Checkpoints recorded.
    pub checkpoints: usize,

    /// Trajectory segments recomputed from checkpoints.
    pub replayed_segments: usize,
}

impl IntegrationStatistics {
    pub(crate) fn merge(&mut self, other: &IntegrationStatistics) {
        self.accepted_steps += other.accepted_steps;
        self.rejected_steps += other.rejected_steps;
        self.adjoint_steps += other.adjoint_steps;
        self.rhs_evaluations += other.rhs_evaluations;
        self.checkpoints += other.checkpoints;
        self.replayed_segments += other.replayed_segments;
    }
}

/// Result of a forward sensitivity pass.
#[derive(Debug, Clone)]
pub struct ForwardSensitivityResult<R: Runtime> {
    /// Terminal state `x(tf)`.
    pub y_final: Tensor<R>,

    /// Directional derivative of the terminal state.
    pub tangent: Tensor<R>,

    pub statistics: IntegrationStatistics,
}

impl<R: Runtime> ForwardSensitivityResult<R> {
    pub fn tangent_vec(&self) -> Vec<f64> {
        self.tangent.to_vec()
    }
}

/// Result of an adjoint sensitivity pass.
#[derive(Debug, Clone)]
pub struct AdjointSensitivityResult<R: Runtime> {
    /// Terminal state `x(tf)`.
    pub y_final: Tensor<R>,

    /// `(∂x(tf)/∂x0)ᵀ λ`.
    pub adjoint_state: Tensor<R>,

    /// `(∂x(tf)/∂p)ᵀ λ`.
    pub adjoint_parameters: Tensor<R>,

    pub statistics: IntegrationStatistics,
}

impl<R: Runtime> AdjointSensitivityResult<R> {
    pub fn adjoint_state_vec(&self) -> Vec<f64> {
        self.adjoint_state.to_vec()
    }

    pub fn adjoint_parameters_vec(&self) -> Vec<f64> {
        self.adjoint_parameters.to_vec()
    }
}
