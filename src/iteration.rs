//! Iteration counting and the convergence test.

use crate::config::{IterationPolicy, MetricKind};

/// Drives the iteration loop of a deconvolution method.
///
/// ```
/// use deconv3d::config::IterationPolicy;
/// use deconv3d::iteration::IterationController;
///
/// let mut it = IterationController::new(IterationPolicy::Fixed(3), 100);
/// let mut done = Vec::new();
/// while let Some(index) = it.advance() {
///     it.set_error(1.0 / (index + 1) as f64);
///     done.push(index);
/// }
/// assert_eq!(done, vec![0, 1, 2]);
/// ```
#[derive(Debug, Clone)]
pub struct IterationController {
    index: i64,
    error: f64,
    previous_error: f64,
    policy: IterationPolicy,
    limit: usize,
    finished: bool,
}

impl IterationController {
    /// # Arguments
    /// - `policy`: Stopping rule.
    /// - `max_iterations`: Upper bound for the relative and absolute policies. Ignored by
    ///   [`IterationPolicy::Fixed`], which carries its own count.
    pub fn new(policy: IterationPolicy, max_iterations: usize) -> Self {
        let limit = match policy {
            IterationPolicy::Fixed(n) => n,
            _ => max_iterations,
        };
        IterationController {
            index: -1,
            error: 1.0,
            previous_error: 1.0,
            policy,
            limit,
            finished: false,
        }
    }

    /// Moves to the next iteration.
    ///
    /// # Returns
    /// The index of the iteration to run, or `None` once the policy is satisfied or the
    /// iteration limit is reached. After the first `None` every further call returns `None`.
    pub fn advance(&mut self) -> Option<usize> {
        if self.finished {
            return None;
        }
        self.index += 1;
        let stop = match self.policy {
            IterationPolicy::Fixed(_) => false,
            IterationPolicy::Relative(tol) => {
                if self.index < 2 {
                    self.previous_error = 2.0 * self.error * tol;
                    // the seed alone does not block the test once tol >= 1/3
                    false
                } else {
                    self.relative_change() < tol
                }
            }
            IterationPolicy::Absolute(tol) => self.index > 0 && self.error < tol,
        };
        if stop || self.index >= self.limit as i64 {
            self.finished = true;
            return None;
        }
        Some(self.index as usize)
    }

    /// Reports the error of the iteration that just finished.
    pub fn set_error(&mut self, error: f64) {
        self.previous_error = self.error;
        self.error = error;
    }

    /// Index of the current iteration, `None` before the first [`advance`](Self::advance).
    pub fn index(&self) -> Option<usize> {
        usize::try_from(self.index).ok()
    }

    pub fn error(&self) -> f64 {
        self.error
    }

    pub fn previous_error(&self) -> f64 {
        self.previous_error
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn relative_change(&self) -> f64 {
        (self.error - self.previous_error).abs() / self.error
    }

    /// One line progress report of the current iteration.
    pub fn progress(&self, metric: MetricKind) -> String {
        let name = match metric {
            MetricKind::Mse => "fMSE",
            MetricKind::IDivergence => "Idiv",
        };
        let mut line = format!(
            "Iteration {:3}/{:3}, {name}={:.3e}",
            self.index + 1,
            self.limit,
            self.error
        );
        match self.policy {
            IterationPolicy::Relative(tol) if self.index > 1 => {
                let rel = self.relative_change();
                let cmp = if rel > tol { '>' } else { '<' };
                line.push_str(&format!(" ({rel:.3e} {cmp} {tol:.3e})"));
            }
            IterationPolicy::Absolute(tol) if self.index > 0 => {
                let cmp = if self.error > tol { '>' } else { '<' };
                line.push_str(&format!(" ({cmp} {tol:.3e})"));
            }
            _ => {}
        }
        line
    }
}
