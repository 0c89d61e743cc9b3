//! Budget accounting for one plan run.
//!
//! Owned by the scheduling loop; tasks never touch it. A task's grant is
//! reserved when it is admitted and settled against its actual usage when it
//! finishes, so the sum of outstanding grants never exceeds the limit.

use crate::domain::{Budgets, Usage};

#[derive(Debug, Clone)]
pub struct BudgetLedger {
    limit: Budgets,
    spent: Usage,
    reserved: Usage,
}

impl BudgetLedger {
    pub fn new(limit: Budgets) -> Self {
        Self {
            limit,
            spent: Usage::default(),
            reserved: Usage::default(),
        }
    }

    pub fn spent(&self) -> Usage {
        self.spent
    }

    fn committed(&self) -> Usage {
        let mut committed = self.spent;
        committed.add(self.reserved);
        committed
    }

    /// What is left after spending and outstanding reservations.
    pub fn remaining(&self) -> Budgets {
        self.limit.minus(self.committed())
    }

    /// Reserve budget for a task about to start, alongside `share - 1`
    /// other ready tasks competing for what is left.
    ///
    /// A limited dimension grants the task an even share of the remaining
    /// budget, never less than its estimate and never more than what is
    /// left, and holds the whole grant until the task settles. Unlimited
    /// dimensions grant everything and hold only the estimate.
    pub fn try_reserve(&mut self, estimate: Usage, share: usize) -> Result<Reservation, String> {
        let committed = self.committed();
        let remaining = self.limit.minus(committed);
        if remaining.is_exhausted() {
            return Err(format!(
                "no budget left: {} tokens / ${:.4} committed",
                committed.tokens, committed.cost_usd
            ));
        }
        if !self.limit.admits(committed, estimate) {
            return Err(format!(
                "estimate of {} tokens / ${:.4} exceeds remaining {} tokens / ${:.4}",
                estimate.tokens, estimate.cost_usd, remaining.tokens, remaining.cost_usd
            ));
        }

        let share = share.max(1);
        let (tokens, held_tokens) = if self.limit.tokens == u64::MAX {
            (u64::MAX, estimate.tokens)
        } else {
            let grant = (remaining.tokens / share as u64)
                .max(estimate.tokens)
                .min(remaining.tokens);
            (grant, grant)
        };
        let (cost_usd, held_cost) = if self.limit.cost_usd.is_infinite() {
            (f64::INFINITY, estimate.cost_usd)
        } else {
            let grant = (remaining.cost_usd / share as f64)
                .max(estimate.cost_usd)
                .min(remaining.cost_usd);
            (grant, grant)
        };

        let held = Usage::new(held_tokens, held_cost);
        self.reserved.add(held);
        Ok(Reservation {
            allowance: Budgets::new(cost_usd, tokens),
            held,
        })
    }

    /// Release a reservation and charge what was actually used.
    pub fn settle(&mut self, held: Usage, actual: Usage) {
        self.reserved = Usage {
            tokens: self.reserved.tokens.saturating_sub(held.tokens),
            cost_usd: (self.reserved.cost_usd - held.cost_usd).max(0.0),
        };
        self.spent.add(actual);
    }
}

/// What one admitted task may spend, and what the ledger holds for it.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub allowance: Budgets,
    pub held: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_block_overcommit() {
        let mut ledger = BudgetLedger::new(Budgets::new(1.0, 1_000));
        let first = ledger.try_reserve(Usage::new(600, 0.1), 1).unwrap();
        assert_eq!(first.allowance.tokens, 1_000);
        assert_eq!(ledger.remaining().tokens, 0);
        assert!(ledger.try_reserve(Usage::new(1, 0.0), 1).is_err());

        ledger.settle(first.held, Usage::new(600, 0.1));
        assert_eq!(ledger.remaining().tokens, 400);
        assert!(ledger.try_reserve(Usage::new(600, 0.1), 1).is_err());
    }

    #[test]
    fn concurrent_tasks_split_the_remaining_budget() {
        let mut ledger = BudgetLedger::new(Budgets::new(1.0, 100));
        let mut granted = 0;
        for share in (1..=4).rev() {
            let r = ledger.try_reserve(Usage::default(), share).unwrap();
            assert_eq!(r.allowance.tokens, 25);
            granted += r.allowance.tokens;
        }
        assert_eq!(granted, 100);
        assert!(ledger.try_reserve(Usage::default(), 1).is_err());
    }

    #[test]
    fn estimate_is_a_floor_for_the_share() {
        let mut ledger = BudgetLedger::new(Budgets::new(1.0, 100));
        let big = ledger.try_reserve(Usage::new(70, 0.0), 2).unwrap();
        assert_eq!(big.allowance.tokens, 70);
        let rest = ledger.try_reserve(Usage::default(), 1).unwrap();
        assert_eq!(rest.allowance.tokens, 30);
    }

    #[test]
    fn settle_charges_actual_usage() {
        let mut ledger = BudgetLedger::new(Budgets::new(1.0, 1_000));
        let r = ledger.try_reserve(Usage::new(600, 0.1), 1).unwrap();
        ledger.settle(r.held, Usage::new(200, 0.05));
        assert_eq!(ledger.spent().tokens, 200);
        assert_eq!(ledger.remaining().tokens, 800);
        assert!(ledger.try_reserve(Usage::new(600, 0.1), 1).is_ok());
    }

    #[test]
    fn exhausted_budget_rejects_zero_estimates() {
        let mut ledger = BudgetLedger::new(Budgets::new(1.0, 100));
        let r = ledger.try_reserve(Usage::default(), 1).unwrap();
        ledger.settle(r.held, Usage::new(100, 0.0));
        assert!(ledger.try_reserve(Usage::default(), 1).is_err());
    }

    #[test]
    fn unlimited_never_rejects() {
        let mut ledger = BudgetLedger::new(Budgets::unlimited());
        for _ in 0..10 {
            let estimate = Usage::new(1_000_000, 10.0);
            let r = ledger.try_reserve(estimate, 3).unwrap();
            assert_eq!(r.allowance, Budgets::unlimited());
            ledger.settle(r.held, estimate);
        }
        assert_eq!(ledger.spent().tokens, 10_000_000);
    }
}
