//! Per-request execution context and budget accounting values.

use std::fmt;

use serde::{Deserialize, Serialize};
use synapse_state::TenantId;

/// Resources consumed by an agent step or a whole orchestration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn new(tokens: u64, cost_usd: f64) -> Self {
        Self { tokens, cost_usd }
    }

    pub fn add(&mut self, other: Usage) {
        self.tokens = self.tokens.saturating_add(other.tokens);
        self.cost_usd += other.cost_usd;
    }
}

/// Remaining cost and token allowance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budgets {
    pub cost_usd: f64,
    pub tokens: u64,
}

impl Budgets {
    pub fn new(cost_usd: f64, tokens: u64) -> Self {
        Self { cost_usd, tokens }
    }

    pub fn unlimited() -> Self {
        Self {
            cost_usd: f64::INFINITY,
            tokens: u64::MAX,
        }
    }

    /// Budget left after `used` has been spent, floored at zero.
    pub fn minus(&self, used: Usage) -> Budgets {
        Budgets {
            cost_usd: (self.cost_usd - used.cost_usd).max(0.0),
            tokens: self.tokens.saturating_sub(used.tokens),
        }
    }

    /// True when nothing is left to spend.
    pub fn is_exhausted(&self) -> bool {
        self.tokens == 0 || self.cost_usd <= 0.0
    }

    /// Whether an additional `next` on top of `used` still fits.
    pub fn admits(&self, used: Usage, next: Usage) -> bool {
        let tokens = used.tokens.saturating_add(next.tokens);
        let cost = used.cost_usd + next.cost_usd;
        tokens <= self.tokens && cost <= self.cost_usd && !self.minus(used).is_exhausted()
    }
}

impl Default for Budgets {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Identity, scope and remaining budgets of one top-level orchestration.
///
/// Threaded by value through every call; never stored globally. Child
/// contexts for nested plans are derived with [`ExecutionContext::nested`].
#[derive(Clone)]
pub struct ExecutionContext {
    pub tenant_id: TenantId,
    pub user_id: String,
    pub session_id: String,
    pub orchestration_id: String,
    pub recursion_depth: u32,
    pub budgets: Budgets,
    auth_token: Option<String>,
}

impl ExecutionContext {
    pub fn new(
        tenant_id: TenantId,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            user_id: user_id.into(),
            session_id: session_id.into(),
            orchestration_id: uuid::Uuid::new_v4().to_string(),
            recursion_depth: 0,
            budgets: Budgets::unlimited(),
            auth_token: None,
        }
    }

    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// Context for a nested plan: one level deeper, same identity.
    pub fn nested(&self, budgets: Budgets) -> Self {
        Self {
            recursion_depth: self.recursion_depth + 1,
            budgets,
            ..self.clone()
        }
    }

    /// Same scope with a different spending allowance.
    pub fn with_allowance(&self, budgets: Budgets) -> Self {
        Self {
            budgets,
            ..self.clone()
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("tenant_id", &self.tenant_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("orchestration_id", &self.orchestration_id)
            .field("recursion_depth", &self.recursion_depth)
            .field("budgets", &self.budgets)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
