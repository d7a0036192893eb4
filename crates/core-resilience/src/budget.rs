//! Retry budgets
//!
//! A budget is a plain counter with a ceiling. Retry loops that have more
//! than one failure family keep one budget per family so that, for example,
//! exhausting transport retries never eats into the allowance for
//! correcting a request's address.

/// Counted allowance of retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    limit: u32,
    used: u32,
}

impl RetryBudget {
    /// Create a budget allowing `limit` retries
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Consume one retry. Returns `false` (and consumes nothing) when the
    /// budget is already spent.
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    /// Retries consumed so far
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Retries still available
    pub fn remaining(&self) -> u32 {
        self.limit - self.used
    }

    /// Configured ceiling
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Whether no retries remain
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_consumes_up_to_limit() {
        let mut budget = RetryBudget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), 2);
        assert_eq!(budget.remaining(), 0);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_zero_budget() {
        let mut budget = RetryBudget::new(0);
        assert!(budget.is_exhausted());
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_independent_budgets() {
        let mut corrective = RetryBudget::new(2);
        let mut transport = RetryBudget::new(3);
        assert!(corrective.try_consume());
        assert!(corrective.try_consume());
        assert!(corrective.is_exhausted());
        assert_eq!(transport.remaining(), 3);
        assert!(transport.try_consume());
        assert_eq!(corrective.used(), 2);
        assert_eq!(transport.used(), 1);
    }
}
