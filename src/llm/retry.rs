use std::time::Duration;

use super::LlmError;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry { delay: Duration },
    GiveUp,
}

/// Exponential backoff over retryable LLM errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Decide after `attempt` (1-based) failed with `error`
    pub fn next_action(&self, attempt: u32, error: &LlmError) -> RetryAction {
        let retryable = match error {
            LlmError::Timeout(_) | LlmError::Transient(_) | LlmError::Malformed(_) => true,
            LlmError::Unavailable(_) => false,
        };
        if !retryable || attempt >= self.max_attempts {
            return RetryAction::GiveUp;
        }

        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        RetryAction::Retry {
            delay: delay.min(self.max_delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> LlmError {
        LlmError::Transient("overloaded".to_string())
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.next_action(1, &transient()),
            RetryAction::Retry {
                delay: Duration::from_millis(1500)
            }
        );
        assert_eq!(
            policy.next_action(2, &LlmError::Timeout(Duration::from_secs(60))),
            RetryAction::Retry {
                delay: Duration::from_millis(3000)
            }
        );
        assert_eq!(policy.next_action(3, &transient()), RetryAction::GiveUp);
    }

    #[test]
    fn test_unavailable_gives_up_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_action(1, &LlmError::Unavailable("401".to_string())),
            RetryAction::GiveUp
        );
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(
            policy.next_action(5, &LlmError::Malformed("no tool".to_string())),
            RetryAction::Retry {
                delay: Duration::from_secs(30)
            }
        );
    }
}
