//! Read-only ledger dumps for regulatory reporting.

use crate::error::WagerError;
use crate::ledger::{LedgerEntry, LedgerQuery};
use crate::store::{WagerResult, WagerStore};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv; charset=utf-8",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = WagerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(WagerError::validation(format!(
                "unsupported export format '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerExport {
    pub format: ExportFormat,
    pub rows: usize,
    pub body: String,
}

const CSV_HEADER: &str = "entry_id,entry_number,user_id,transaction_type,amount,currency,\
balance_before,balance_after,description,reference_type,reference_id,previous_hash,entry_hash,created_at";

pub async fn export_ledger(
    store: &dyn WagerStore,
    query: &LedgerQuery,
    format: ExportFormat,
) -> WagerResult<LedgerExport> {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if to <= from {
            return Err(WagerError::validation("export range must end after it starts"));
        }
    }
    let entries = store.ledger_entries(query).await?;
    let body = match format {
        ExportFormat::Json => serde_json::to_string(&entries)?,
        ExportFormat::Csv => render_csv(&entries),
    };
    Ok(LedgerExport {
        format,
        rows: entries.len(),
        body,
    })
}

fn render_csv(entries: &[LedgerEntry]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + entries.len() * 256);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for entry in entries {
        let fields = [
            entry.entry_id.to_string(),
            entry.entry_number.to_string(),
            entry.user_id.clone(),
            entry.transaction_type.as_str().to_string(),
            entry.amount.to_string(),
            entry.currency.clone(),
            entry.balance_before.to_string(),
            entry.balance_after.to_string(),
            entry.description.clone(),
            entry.reference_type.clone().unwrap_or_default(),
            entry.reference_id.clone().unwrap_or_default(),
            entry.previous_hash.clone().unwrap_or_default(),
            entry.entry_hash.clone(),
            entry.created_at.to_rfc3339(),
        ];
        for (index, field) in fields.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}", csv_field(field));
        }
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        std::borrow::Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        std::borrow::Cow::Borrowed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalanceAccessor;
    use crate::store::InMemoryWagerStore;
    use std::sync::Arc;

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn exports_filtered_rows_in_both_formats() {
        let store: Arc<dyn WagerStore> = Arc::new(InMemoryWagerStore::new());
        let balances = BalanceAccessor::new(store.clone(), "USD", 4);
        balances.deposit("alice", 1_000, Some("psp,1".to_string())).await.unwrap();
        balances.deposit("bob", 50, None).await.unwrap();

        let query = LedgerQuery::for_user("alice");
        let csv = export_ledger(store.as_ref(), &query, ExportFormat::Csv).await.unwrap();
        assert_eq!(csv.rows, 1);
        let lines: Vec<&str> = csv.body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("entry_id,entry_number,user_id"));
        assert!(lines[1].contains(",alice,deposit,1000,USD,0,1000,"));
        assert!(lines[1].contains("\"psp,1\""));

        let json = export_ledger(store.as_ref(), &query, ExportFormat::Json).await.unwrap();
        let rows: Vec<LedgerEntry> = serde_json::from_str(&json.body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "alice");
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
