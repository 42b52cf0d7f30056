//! Quote staleness checks at placement.

use crate::error::WagerError;
use crate::types::{SelectionRequest, SelectionType};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Live price lookup. Feed ingestion is somebody else's problem; this only answers
/// "what is the price now".
#[async_trait]
pub trait OddsSource: Send + Sync {
    /// Current decimal odds, or `None` when the market is closed or unknown.
    async fn current_odds(
        &self,
        match_id: &str,
        selection_type: SelectionType,
        value: &str,
    ) -> Result<Option<f64>, WagerError>;
}

/// Acceptance window for a quoted price.
#[derive(Debug, Clone, Copy)]
pub struct QuoteWindow {
    /// Maximum relative drift between quoted and live odds.
    pub tolerance: f64,
    pub max_age: Duration,
}

impl QuoteWindow {
    /// Reject quotes that are too old or have drifted from the live price.
    pub async fn check(
        &self,
        request: &SelectionRequest,
        source: Option<&dyn OddsSource>,
        now: DateTime<Utc>,
    ) -> Result<(), WagerError> {
        let label = format!("{}/{}", request.match_id, request.selection_type.as_str());
        if now - request.quoted_at > self.max_age {
            return Err(WagerError::validation(format!(
                "quote for {label} is stale (quoted at {})",
                request.quoted_at
            )));
        }
        if request.quoted_at - now > self.max_age {
            return Err(WagerError::validation(format!(
                "quote for {label} is dated in the future"
            )));
        }

        let Some(source) = source else {
            return Ok(());
        };
        let live = source
            .current_odds(&request.match_id, request.selection_type, &request.value)
            .await?
            .ok_or_else(|| WagerError::validation(format!("market {label} is closed")))?;
        if live <= 0.0 || !live.is_finite() {
            return Err(WagerError::validation(format!(
                "market {label} has no valid price"
            )));
        }

        let drift = (request.odds - live).abs() / live;
        if drift > self.tolerance {
            return Err(WagerError::validation(format!(
                "odds for {label} moved from {} to {live}",
                request.odds
            )));
        }
        Ok(())
    }
}
