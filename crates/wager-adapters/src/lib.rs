//! External collaborators for the wager engine.
//!
//! Everything here runs after a commit or on a schedule; none of it sits inside
//! a balance-mutating transaction.

#![deny(unsafe_code)]

pub mod backup;
pub mod error;
pub mod notify;
pub mod odds_book;
pub mod sinks;
pub mod tickets;

pub use backup::{BackupManager, BackupReceipt, RestoreReport, TableRestore, RESTORE_BATCH_SIZE};
pub use error::AdapterError;
pub use notify::{
    DeliveryResult, DisabledSmsGateway, HttpSmsGateway, InAppChannel, InboxMessage, MemoryInbox,
    NotificationDispatcher, SmsGateway,
};
pub use odds_book::FixedOddsBook;
pub use sinks::{player_message, NotifyingSink, TicketingSink};
pub use tickets::{HttpTicketDesk, MemoryTicketDesk, SupportTicket, TicketDesk};
