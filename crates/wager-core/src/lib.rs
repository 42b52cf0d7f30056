//! Wager core: bet lifecycle, pricing and a hash-chained per-user ledger.
//!
//! Every balance change is a ledger entry committed in the same unit of work as
//! the state transition that caused it, and every slip transition is conditioned
//! on the status it was computed from.

#![deny(unsafe_code)]

pub mod admin;
pub mod audit;
pub mod authz;
pub mod balance;
pub mod dispute;
pub mod error;
pub mod events;
pub mod export;
pub mod integrity;
pub mod ledger;
pub mod lifecycle;
pub mod odds;
pub mod pricing;
pub mod regulatory;
pub mod runtime;
pub mod store;
pub mod types;

pub use admin::AdminTools;
pub use audit::{verify_audit_chain, AuditAppend, AuditRecord, AuditStatus};
pub use authz::{authorize, require_role, ADMIN_ROLES, SUPERADMIN_ONLY};
pub use balance::{BalanceAccessor, BalanceChange};
pub use dispute::{ticket_reference, DisputeHandler};
pub use error::WagerError;
pub use events::{EventBus, EventSink, PlatformEvent};
pub use export::{export_ledger, ExportFormat, LedgerExport};
pub use integrity::{IntegrityMonitor, IntegrityReport};
pub use ledger::{compute_entry_hash, verify_chain, verify_tail, AccountHead, LedgerEntry, LedgerQuery, PostingDraft};
pub use lifecycle::{
    BetLifecycleManager, CashOutPricer, CashOutReceipt, MatchSettlementReport, PlacementPolicy,
    SettlementOutcome, StakeShareCashOut,
};
pub use odds::{OddsSource, QuoteWindow};
pub use pricing::{PriceQuote, PricingConfig, PricingEngine};
pub use regulatory::{EscrowCheck, FlagRequest, RegulatoryConfig, RegulatoryController};
pub use runtime::{WagerEngine, WagerEngineBuilder, WagerEngineConfig};
pub use store::{
    connect_store, with_retry, CommitOutcome, CommitReceipt, InMemoryWagerStore,
    PostgresWagerStore, QueryWindow, StorageConfig, WagerResult, WagerStore, WriteSet, TABLES,
};
pub use types::{
    BetSlip, BetStatus, Caller, Dispute, DisputeRequest, DisputeResolution, DisputeStatus,
    EscrowTransfer, MarketResult, MatchOutcome, Money, PlacementRequest, RegulatoryFlag,
    ResultEvent, Role, Selection, SelectionRequest, SelectionStatus, SelectionType,
    TransactionType,
};
