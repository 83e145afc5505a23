//! Retry policy: decides requeue versus dead-letter.

use crate::domain::ErrorCategory;

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Move the task back into the pending pool for another attempt.
    Requeue,

    /// File the task as terminally failed.
    DeadLetter { reason: String },
}

/// Attempt-budget policy applied to every failure.
///
/// Pure: given the failure category and the number of attempts already
/// made (including the one that just failed), returns the next action
/// without side effects. The filing agent executes the decision.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn decide(&self, category: ErrorCategory, attempts_made: u32) -> Disposition {
        if !category.is_retriable() {
            return Disposition::DeadLetter {
                reason: "validation failures are never retried".to_string(),
            };
        }
        if attempts_made >= self.max_attempts {
            return Disposition::DeadLetter {
                reason: format!(
                    "attempt budget exhausted: {attempts_made}/{}",
                    self.max_attempts
                ),
            };
        }
        Disposition::Requeue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first_engine_failure(ErrorCategory::Engine, 1, false)]
    #[case::second_engine_failure(ErrorCategory::Engine, 2, false)]
    #[case::budget_exhausted(ErrorCategory::Engine, 3, true)]
    #[case::over_budget(ErrorCategory::Timeout, 4, true)]
    #[case::device_failure_retries(ErrorCategory::Device, 1, false)]
    #[case::validation_never_retries(ErrorCategory::Validation, 1, true)]
    fn disposition_matrix(
        #[case] category: ErrorCategory,
        #[case] attempts_made: u32,
        #[case] dead: bool,
    ) {
        let policy = RetryPolicy::new(3);
        let disposition = policy.decide(category, attempts_made);
        assert_eq!(
            matches!(disposition, Disposition::DeadLetter { .. }),
            dead,
            "category={category:?} attempts={attempts_made}"
        );
    }

    #[test]
    fn dead_letter_reason_names_the_budget() {
        let policy = RetryPolicy::new(3);
        let Disposition::DeadLetter { reason } = policy.decide(ErrorCategory::Engine, 3) else {
            panic!("expected dead-letter");
        };
        assert!(reason.contains("3/3"), "{reason}");
    }
}
