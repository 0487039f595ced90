//! Credit accounting
//!
//! Each tool call costs credits per the configured cost table. The
//! charge happens before execution; a hard failure refunds it, partial
//! success keeps it. Cost values come only from configuration.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::CreditConfig;
use crate::error::{HarvestError, HarvestResult};

/// A successful charge; hand it back for a refund on hard failure.
#[derive(Debug, Clone, Copy)]
pub struct Charge {
    pub amount: u64,
}

pub struct CreditLedger {
    config: CreditConfig,
    balance: AtomicU64,
}

impl CreditLedger {
    #[must_use]
    pub fn new(config: CreditConfig) -> Self {
        let balance = AtomicU64::new(config.balance);
        Self { config, balance }
    }

    /// Cost of one call to `tool`.
    #[must_use]
    pub fn cost_of(&self, tool: &str) -> u64 {
        self.config
            .costs
            .get(tool)
            .copied()
            .unwrap_or(self.config.default_cost)
    }

    /// Charge for a tool call up front.
    pub fn charge(&self, tool: &str) -> HarvestResult<Charge> {
        if !self.config.enabled {
            return Ok(Charge { amount: 0 });
        }
        let amount = self.cost_of(tool);
        let mut current = self.balance.load(Ordering::Relaxed);
        loop {
            if current < amount {
                return Err(HarvestError::CreditExhausted {
                    needed: amount,
                    available: current,
                });
            }
            match self.balance.compare_exchange_weak(
                current,
                current - amount,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(Charge { amount }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Refund a charge after a hard failure.
    pub fn refund(&self, charge: Charge) {
        if charge.amount > 0 {
            self.balance.fetch_add(charge.amount, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn balance(&self) -> u64 {
        self.balance.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ledger(balance: u64) -> CreditLedger {
        let mut costs = HashMap::new();
        costs.insert("deep_research".to_string(), 10);
        CreditLedger::new(CreditConfig {
            enabled: true,
            balance,
            costs,
            default_cost: 1,
        })
    }

    #[test]
    fn charges_configured_and_default_costs() {
        let ledger = ledger(100);
        assert_eq!(ledger.cost_of("deep_research"), 10);
        assert_eq!(ledger.cost_of("fetch_url"), 1);
        ledger.charge("deep_research").expect("charge");
        assert_eq!(ledger.balance(), 90);
    }

    #[test]
    fn exhaustion_blocks_and_refund_restores() {
        let ledger = ledger(10);
        let charge = ledger.charge("deep_research").expect("charge");
        let err = ledger.charge("deep_research").unwrap_err();
        assert_eq!(err.kind(), "CreditExhausted");
        ledger.refund(charge);
        assert!(ledger.charge("deep_research").is_ok());
    }

    #[test]
    fn disabled_ledger_charges_nothing() {
        let ledger = CreditLedger::new(CreditConfig::default());
        let charge = ledger.charge("anything").expect("free");
        assert_eq!(charge.amount, 0);
        assert_eq!(ledger.balance(), CreditConfig::default().balance);
    }
}
