use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use wager_core::{OddsSource, SelectionType, WagerError};

type MarketKey = (String, SelectionType, String);

/// In-memory price board for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct FixedOddsBook {
    prices: Arc<RwLock<HashMap<MarketKey, f64>>>,
}

impl FixedOddsBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, match_id: &str, selection_type: SelectionType, value: &str, odds: f64) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(key(match_id, selection_type, value), odds);
        }
    }

    /// Close a market; placements against it are refused.
    pub fn close(&self, match_id: &str, selection_type: SelectionType, value: &str) {
        if let Ok(mut prices) = self.prices.write() {
            prices.remove(&key(match_id, selection_type, value));
        }
    }
}

fn key(match_id: &str, selection_type: SelectionType, value: &str) -> MarketKey {
    (match_id.to_string(), selection_type, value.to_ascii_lowercase())
}

#[async_trait]
impl OddsSource for FixedOddsBook {
    async fn current_odds(
        &self,
        match_id: &str,
        selection_type: SelectionType,
        value: &str,
    ) -> Result<Option<f64>, WagerError> {
        let prices = self
            .prices
            .read()
            .map_err(|_| WagerError::External {
                dependency: "odds_book".to_string(),
                message: "price board lock poisoned".to_string(),
            })?;
        Ok(prices.get(&key(match_id, selection_type, value)).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookups_ignore_value_case_and_respect_closing() {
        let book = FixedOddsBook::new();
        book.set_price("m1", SelectionType::MatchWinner, "Home", 2.1);
        assert_eq!(
            book.current_odds("m1", SelectionType::MatchWinner, "home").await.unwrap(),
            Some(2.1)
        );
        book.close("m1", SelectionType::MatchWinner, "HOME");
        assert_eq!(book.current_odds("m1", SelectionType::MatchWinner, "home").await.unwrap(), None);
    }
}
