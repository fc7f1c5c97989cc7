// BehaviorSpec: the Markov model a simulated user walks

use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use super::chooser::TransitionChooserKind;
use super::BehaviorError;
use crate::stats::{OperationQuality, QualityBar};

/// Async behavior entry meaning "start nothing"
pub const NO_ASYNC_BEHAVIOR: &str = "none";

fn default_mix_tolerance() -> f64 {
    0.10
}

/// Named per-operation transition model with quality bars
///
/// `transition_matrices[op][matrix][next]` holds relative weights. `prepare`
/// normalizes each row and builds cumulative selection rows that the next
/// operation is drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct BehaviorSpec {
    pub name: String,
    pub operations: Vec<String>,
    #[serde(default)]
    pub initial_state: usize,
    pub transition_matrices: Vec<Vec<Vec<f64>>>,
    #[serde(default)]
    pub transition_choosers: Vec<TransitionChooserKind>,
    /// Spec name of the sub-behavior each operation starts, or "none"
    #[serde(default)]
    pub async_behaviors: Vec<String>,
    #[serde(default)]
    pub max_num_async_behaviors: usize,
    /// Seconds
    #[serde(default)]
    pub mean_cycle_times: Vec<f64>,
    /// Seconds
    #[serde(default)]
    pub response_time_limits: Vec<f64>,
    #[serde(default)]
    pub response_time_limits_percentile: Vec<f64>,
    #[serde(default)]
    pub mix_percentage: Vec<f64>,
    #[serde(default = "default_mix_tolerance")]
    pub mix_percentage_tolerance: f64,
    #[serde(default)]
    pub use_response_time: Vec<bool>,
    #[serde(default)]
    pub is_reset_state: Vec<bool>,
    #[serde(skip)]
    selection_matrices: Vec<Vec<Vec<f64>>>,
}

impl BehaviorSpec {
    /// Validate shape and build the selection matrices
    pub fn prepare(mut self) -> Result<Self, BehaviorError> {
        let num_ops = self.operations.len();
        if num_ops == 0 {
            return Err(self.invalid("no operations"));
        }
        if self.initial_state >= num_ops {
            return Err(self.invalid(format!("initial state {} out of range", self.initial_state)));
        }
        if self.transition_matrices.len() != num_ops {
            return Err(self.invalid(format!(
                "{} operations but {} transition matrix sets",
                num_ops,
                self.transition_matrices.len()
            )));
        }
        for (name, len) in [
            ("transitionChoosers", self.transition_choosers.len()),
            ("asyncBehaviors", self.async_behaviors.len()),
            ("meanCycleTimes", self.mean_cycle_times.len()),
            ("isResetState", self.is_reset_state.len()),
        ] {
            if len != 0 && len != num_ops {
                return Err(self.invalid(format!("{name} has {len} entries for {num_ops} operations")));
            }
        }

        let mut selection = Vec::with_capacity(num_ops);
        for (op, matrices) in self.transition_matrices.iter_mut().enumerate() {
            if matrices.is_empty() {
                return Err(BehaviorError::invalid_spec(
                    &self.name,
                    format!("operation {op} has no transition matrices"),
                ));
            }
            let required = self
                .transition_choosers
                .get(op)
                .copied()
                .unwrap_or_default()
                .required_matrices();
            if matrices.len() < required {
                return Err(BehaviorError::invalid_spec(
                    &self.name,
                    format!("operation {op} needs {required} transition matrices"),
                ));
            }
            let mut op_selection = Vec::with_capacity(matrices.len());
            for (m, row) in matrices.iter_mut().enumerate() {
                if row.len() != num_ops {
                    return Err(BehaviorError::invalid_spec(
                        &self.name,
                        format!("matrix {m} of operation {op} has {} columns", row.len()),
                    ));
                }
                let sum: f64 = row.iter().sum();
                if sum <= 0.0 || row.iter().any(|w| *w < 0.0) {
                    return Err(BehaviorError::invalid_spec(
                        &self.name,
                        format!("matrix {m} of operation {op} has no positive weight"),
                    ));
                }
                row.iter_mut().for_each(|w| *w /= sum);

                let mut cumulative = Vec::with_capacity(row.len());
                let mut running = 0.0;
                for weight in row.iter() {
                    running += weight;
                    cumulative.push(running);
                }
                op_selection.push(cumulative);
            }
            selection.push(op_selection);
        }
        self.selection_matrices = selection;
        Ok(self)
    }

    fn invalid(&self, reason: impl Into<String>) -> BehaviorError {
        BehaviorError::invalid_spec(&self.name, reason)
    }

    pub fn num_operations(&self) -> usize {
        self.operations.len()
    }

    pub fn operation_name(&self, op: usize) -> &str {
        self.operations.get(op).map(String::as_str).unwrap_or("unknown")
    }

    pub fn num_matrices(&self, op: usize) -> usize {
        self.transition_matrices.get(op).map_or(0, Vec::len)
    }

    /// Next operation for a uniform draw in [0, 1)
    ///
    /// Falls back to the last operation when rounding leaves the final
    /// cumulative value just under the draw.
    pub fn select_next(&self, current: usize, matrix: usize, draw: f64) -> Option<usize> {
        let row = self.selection_matrices.get(current)?.get(matrix)?;
        row.iter()
            .position(|threshold| draw < *threshold)
            .or(row.len().checked_sub(1))
    }

    pub fn chooser(&self, op: usize) -> TransitionChooserKind {
        self.transition_choosers.get(op).copied().unwrap_or_default()
    }

    /// Sub-behavior spec an operation starts
    pub fn async_behavior(&self, op: usize) -> Option<&str> {
        self.async_behaviors
            .get(op)
            .map(String::as_str)
            .filter(|name| !name.is_empty() && *name != NO_ASYNC_BEHAVIOR)
    }

    /// Mean think time in milliseconds
    pub fn mean_cycle_time_ms(&self, op: usize) -> f64 {
        self.mean_cycle_times.get(op).copied().unwrap_or(0.0) * 1000.0
    }

    pub fn is_reset_state(&self, op: usize) -> bool {
        self.is_reset_state.get(op).copied().unwrap_or(false)
    }

    /// Quality bars in operation order
    pub fn operation_qualities(&self) -> Vec<OperationQuality> {
        self.operations
            .iter()
            .enumerate()
            .map(|(op, name)| OperationQuality {
                name: name.clone(),
                quality: QualityBar {
                    response_time_limit: self.response_time_limits.get(op).copied().unwrap_or(0.0),
                    response_time_limit_percentile: self
                        .response_time_limits_percentile
                        .get(op)
                        .copied()
                        .unwrap_or(0.0),
                    use_response_time: self.use_response_time.get(op).copied().unwrap_or(false),
                    required_mix_pct: self.mix_percentage.get(op).copied().unwrap_or(0.0),
                    mix_pct_tolerance: self.mix_percentage_tolerance,
                },
            })
            .collect()
    }
}
