use crate::error::WagerError;
use crate::types::{Money, Selection, SelectionType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bet-builder pricing configuration.
///
/// The correlation multipliers are a heuristic approximation of joint probability,
/// not a derived model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Fraction of the fair price retained by the house.
    pub house_margin: f64,
    /// Same-match player prop combined with the match result.
    pub same_match_prop_factor: f64,
    pub three_leg_factor: f64,
    pub five_leg_factor: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            house_margin: 0.05,
            same_match_prop_factor: 0.85,
            three_leg_factor: 0.90,
            five_leg_factor: 0.85,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceQuote {
    pub base_odds: f64,
    pub correlation_factor: f64,
    pub final_odds: f64,
    pub margin: f64,
}

impl PriceQuote {
    /// Amount returned for `stake` at this price, rounded to the nearest minor unit.
    pub fn payout_for(&self, stake: Money) -> Result<Money, WagerError> {
        let payout = (stake as f64 * self.final_odds).round();
        if !payout.is_finite() || payout < 0.0 || payout > Money::MAX as f64 {
            return Err(WagerError::validation(format!(
                "payout for stake {stake} at odds {} is out of range",
                self.final_odds
            )));
        }
        Ok(payout as Money)
    }
}

/// Deterministic slip pricer.
#[derive(Debug, Clone, Default)]
pub struct PricingEngine {
    config: PricingConfig,
}

impl PricingEngine {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    pub fn price(&self, selections: &[Selection]) -> Result<PriceQuote, WagerError> {
        if selections.is_empty() {
            return Err(WagerError::validation("slip has no selections"));
        }

        let mut base_odds = 1.0_f64;
        for selection in selections {
            if !selection.odds.is_finite() || selection.odds <= 1.0 {
                return Err(WagerError::validation(format!(
                    "selection {}/{} has invalid odds {}",
                    selection.match_id,
                    selection.selection_type.as_str(),
                    selection.odds
                )));
            }
            base_odds *= selection.odds;
        }

        let correlation_factor = self.correlation_factor(selections);
        let margin = self.config.house_margin;
        let final_odds = base_odds * correlation_factor * (1.0 - margin);

        Ok(PriceQuote {
            base_odds,
            correlation_factor,
            final_odds,
            margin,
        })
    }

    /// Compounded discount for statistically dependent legs.
    pub fn correlation_factor(&self, selections: &[Selection]) -> f64 {
        let mut factor = 1.0;

        if has_same_match_prop_pair(selections) {
            factor *= self.config.same_match_prop_factor;
        }
        if selections.len() >= 3 {
            factor *= self.config.three_leg_factor;
        }
        if selections.len() >= 5 {
            factor *= self.config.five_leg_factor;
        }
        factor
    }
}

fn has_same_match_prop_pair(selections: &[Selection]) -> bool {
    let mut per_match: BTreeMap<&str, (bool, bool)> = BTreeMap::new();
    for selection in selections {
        let seen = per_match.entry(selection.match_id.as_str()).or_default();
        match selection.selection_type {
            SelectionType::PlayerProp => seen.0 = true,
            SelectionType::MatchWinner => seen.1 = true,
            _ => {}
        }
    }
    per_match.values().any(|(prop, result)| *prop && *result)
}
