//! Tiered tool authorization.
//!
//! Evaluation is a pure function of the call context; every evaluation is
//! appended to the policy-decision ledger so the audit trail is complete.

use crate::MessageType;
use crate::config::PolicyConfig;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::tools::Tier;
use std::sync::Arc;

/// Everything a policy evaluation may look at.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    pub tool: &'a str,
    pub tier: Tier,
    pub sender: &'a str,
    pub channel: &'a str,
    pub message_type: MessageType,
    pub task_id: &'a str,
    pub trace_id: &'a str,
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub requires_approval: bool,
    pub reason: String,
}

impl Decision {
    fn allow(reason: &str) -> Self {
        Self { allowed: true, requires_approval: false, reason: reason.into() }
    }

    fn allow_with_approval(reason: &str) -> Self {
        Self { allowed: true, requires_approval: true, reason: reason.into() }
    }

    fn deny(reason: &str) -> Self {
        Self { allowed: false, requires_approval: false, reason: reason.into() }
    }
}

/// Deterministic policy evaluator bound to the decision ledger.
pub struct PolicyEngine {
    config: PolicyConfig,
    ledger: Arc<Ledger>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig, ledger: Arc<Ledger>) -> Self {
        Self { config, ledger }
    }

    /// Pure evaluation; identical inputs always yield identical decisions.
    pub fn evaluate(config: &PolicyConfig, ctx: &PolicyContext<'_>) -> Decision {
        if ctx.tier == Tier::ReadOnly {
            return Decision::allow("tier-0");
        }

        if !config.sender_allowlist.is_empty()
            && !config.sender_allowlist.iter().any(|s| s == ctx.sender)
        {
            return Decision::deny("unauthorized-sender");
        }

        let effective_max = match ctx.message_type {
            MessageType::Internal => config.max_auto_tier,
            MessageType::External => config.external_max_tier,
        };

        if ctx.tier.as_u8() <= effective_max {
            return Decision::allow("within-tier-cap");
        }

        match ctx.message_type {
            MessageType::External => Decision::deny("tier-exceeds-external-cap"),
            MessageType::Internal => Decision::allow_with_approval("tier-exceeds-auto-cap"),
        }
    }

    /// Evaluate and append the decision to the ledger.
    pub async fn evaluate_and_record(&self, ctx: &PolicyContext<'_>) -> Result<Decision> {
        let decision = Self::evaluate(&self.config, ctx);

        self.ledger
            .record_policy_decision(
                ctx.trace_id,
                ctx.task_id,
                ctx.tool,
                ctx.tier.as_u8(),
                ctx.sender,
                ctx.channel,
                ctx.message_type.as_str(),
                decision.allowed,
                decision.requires_approval,
                &decision.reason,
            )
            .await?;

        tracing::debug!(
            tool = ctx.tool,
            tier = ctx.tier.as_u8(),
            sender = ctx.sender,
            message_type = %ctx.message_type,
            allowed = decision.allowed,
            requires_approval = decision.requires_approval,
            reason = %decision.reason,
            "policy decision"
        );

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(tier: Tier, sender: &'a str, message_type: MessageType) -> PolicyContext<'a> {
        PolicyContext {
            tool: "exec",
            tier,
            sender,
            channel: "console",
            message_type,
            task_id: "task-1",
            trace_id: "trace-1",
        }
    }

    fn config(allowlist: &[&str]) -> PolicyConfig {
        PolicyConfig {
            max_auto_tier: 2,
            external_max_tier: 0,
            sender_allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn tier_zero_always_allowed() {
        // Even for a sender outside the allowlist.
        let decision = PolicyEngine::evaluate(
            &config(&["owner"]),
            &ctx(Tier::ReadOnly, "stranger", MessageType::External),
        );
        assert!(decision.allowed);
        assert!(!decision.requires_approval);
    }

    #[test]
    fn allowlist_blocks_unknown_senders_above_tier_zero() {
        let decision = PolicyEngine::evaluate(
            &config(&["owner"]),
            &ctx(Tier::Write, "stranger", MessageType::Internal),
        );
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "unauthorized-sender");
    }

    #[test]
    fn external_high_tier_is_denied() {
        let decision = PolicyEngine::evaluate(
            &config(&[]),
            &ctx(Tier::HighRisk, "anyone", MessageType::External),
        );
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "tier-exceeds-external-cap");
    }

    #[test]
    fn internal_above_auto_cap_requires_approval() {
        let config = PolicyConfig {
            max_auto_tier: 1,
            external_max_tier: 0,
            sender_allowlist: Vec::new(),
        };
        let decision =
            PolicyEngine::evaluate(&config, &ctx(Tier::HighRisk, "owner", MessageType::Internal));
        assert!(decision.allowed);
        assert!(decision.requires_approval);
        assert_eq!(decision.reason, "tier-exceeds-auto-cap");
    }

    #[test]
    fn evaluation_is_deterministic() {
        let config = config(&["owner"]);
        let context = ctx(Tier::HighRisk, "owner", MessageType::External);
        let first = PolicyEngine::evaluate(&config, &context);
        for _ in 0..10 {
            assert_eq!(PolicyEngine::evaluate(&config, &context), first);
        }
    }

    #[tokio::test]
    async fn every_evaluation_writes_one_ledger_row() {
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let engine = PolicyEngine::new(config(&[]), ledger.clone());

        for _ in 0..3 {
            engine
                .evaluate_and_record(&ctx(Tier::HighRisk, "bob", MessageType::External))
                .await
                .expect("evaluate");
        }

        let count = ledger.policy_decisions_for_task("task-1").await.expect("count");
        assert_eq!(count, 3);
    }
}
