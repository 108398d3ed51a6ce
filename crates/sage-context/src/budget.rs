//! Context window budgeting.
//!
//! `available = max(0, max_model_len - tokens(fixed_prefix))`, then each
//! allowance is `floor(available * ratio)`. When the ratios add up to more
//! than 1.0 they are scaled down proportionally so the three allowances
//! never exceed `available`.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::tokens::estimate_tokens;

const RATIO_TOLERANCE: f64 = 0.01;

/// Share of the available tokens given to each partition.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetRatios {
    /// Retrieved older history.
    pub history: f64,
    /// Verbatim recent turns.
    pub active: f64,
    /// Room for the model's output.
    pub new_output: f64,
}

impl Default for BudgetRatios {
    fn default() -> Self {
        Self {
            history: 0.2,
            active: 0.3,
            new_output: 0.5,
        }
    }
}

impl BudgetRatios {
    fn sum(&self) -> f64 {
        self.history + self.active + self.new_output
    }

    /// Clamp negatives to zero and scale down if the shares exceed 1.0.
    fn normalized(&self) -> Self {
        let clamped = Self {
            history: self.history.max(0.0),
            active: self.active.max(0.0),
            new_output: self.new_output.max(0.0),
        };
        let sum = clamped.sum();
        if sum > 1.0 {
            Self {
                history: clamped.history / sum,
                active: clamped.active / sum,
                new_output: clamped.new_output / sum,
            }
        } else {
            clamped
        }
    }
}

/// Everything needed to budget one model call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Model context length.
    pub max_model_len: usize,
    /// Partition shares.
    pub ratios: BudgetRatios,
    /// Keep only the most recent N turns (0 = unlimited).
    pub recent_turns: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_model_len: 60_000,
            ratios: BudgetRatios::default(),
            recent_turns: 0,
        }
    }
}

/// Derived allowances for one model call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetInfo {
    /// Estimated cost of the fixed prefix.
    pub fixed_cost_tokens: usize,
    /// What is left for messages and output.
    pub available_tokens: usize,
    /// Allowance for retrieved history.
    pub history_budget: usize,
    /// Allowance for the active window.
    pub active_budget: usize,
    /// Allowance for model output.
    pub new_output_budget: usize,
}

impl BudgetInfo {
    /// The prefix consumed the whole window; the call must be refused.
    pub fn is_exhausted(&self) -> bool {
        self.available_tokens == 0
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn share(available: usize, ratio: f64) -> usize {
    (available as f64 * ratio).floor() as usize
}

/// Compute the three allowances for a call whose fixed prefix is `fixed_prefix`.
pub fn compute_budget(fixed_prefix: &str, max_model_len: usize, ratios: &BudgetRatios) -> BudgetInfo {
    let fixed_cost_tokens = estimate_tokens(fixed_prefix);
    let available_tokens = max_model_len.saturating_sub(fixed_cost_tokens);

    if available_tokens == 0 {
        error!(
            fixed_cost_tokens,
            max_model_len, "fixed prefix exceeds model length, no budget left"
        );
        return BudgetInfo {
            fixed_cost_tokens,
            ..BudgetInfo::default()
        };
    }

    let sum = ratios.sum();
    if (sum - 1.0).abs() > RATIO_TOLERANCE {
        warn!(sum, "budget ratios do not sum to 1.0");
    }
    let r = ratios.normalized();

    let info = BudgetInfo {
        fixed_cost_tokens,
        available_tokens,
        history_budget: share(available_tokens, r.history),
        active_budget: share(available_tokens, r.active),
        new_output_budget: share(available_tokens, r.new_output),
    };
    debug!(
        available = info.available_tokens,
        history = info.history_budget,
        active = info.active_budget,
        new_output = info.new_output_budget,
        "budget computed"
    );
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_logging::capture_logs;
    use tracing::Level;

    #[test]
    fn default_split() {
        let info = compute_budget("", 1000, &BudgetRatios::default());
        assert_eq!(info.fixed_cost_tokens, 0);
        assert_eq!(info.available_tokens, 1000);
        assert_eq!(info.history_budget, 200);
        assert_eq!(info.active_budget, 300);
        assert_eq!(info.new_output_budget, 500);
    }

    #[test]
    fn prefix_cost_is_subtracted() {
        // 40 letters = 10 tokens
        let prefix = "a".repeat(40);
        let info = compute_budget(&prefix, 110, &BudgetRatios::default());
        assert_eq!(info.fixed_cost_tokens, 10);
        assert_eq!(info.available_tokens, 100);
        assert_eq!(info.active_budget, 30);
    }

    #[test]
    fn oversized_prefix_exhausts_budget() {
        let (logs, _guard) = capture_logs();
        let prefix = "a".repeat(4000);
        let info = compute_budget(&prefix, 500, &BudgetRatios::default());
        assert!(info.is_exhausted());
        assert_eq!(info.fixed_cost_tokens, 1000);
        assert_eq!(info.history_budget + info.active_budget + info.new_output_budget, 0);
        assert!(logs.has_event(Level::ERROR, "exceeds model length"));
    }

    #[test]
    fn ratio_mismatch_is_logged_not_fatal() {
        let (logs, _guard) = capture_logs();
        let ratios = BudgetRatios { history: 0.1, active: 0.1, new_output: 0.1 };
        let info = compute_budget("", 1000, &ratios);
        assert_eq!(info.history_budget, 100);
        assert!(logs.has_event(Level::WARN, "do not sum to 1.0"));
    }

    #[test]
    fn budgets_never_exceed_available() {
        let cases = [
            BudgetRatios::default(),
            BudgetRatios { history: 0.5, active: 0.5, new_output: 0.5 },
            BudgetRatios { history: 0.333, active: 0.333, new_output: 0.334 },
            BudgetRatios { history: -0.2, active: 0.9, new_output: 0.9 },
        ];
        for ratios in cases {
            for max_len in [0, 1, 7, 99, 1000, 60_000] {
                for prefix in ["", "system prompt", "你好"] {
                    let info = compute_budget(prefix, max_len, &ratios);
                    let total = info.history_budget + info.active_budget + info.new_output_budget;
                    assert!(total <= info.available_tokens, "{ratios:?} {max_len} {prefix}");
                }
            }
        }
    }
}
