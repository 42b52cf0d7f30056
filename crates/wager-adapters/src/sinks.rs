//! Event sinks bridging committed engine events to external collaborators.

use crate::notify::NotificationDispatcher;
use crate::tickets::{SupportTicket, TicketDesk};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use wager_core::{BetStatus, EventSink, Money, PlatformEvent, WagerError};

fn display_amount(amount: Money) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Player-facing text for an event; `None` for events players are not told about.
pub fn player_message(event: &PlatformEvent) -> Option<String> {
    let text = match event {
        PlatformEvent::BetPlaced { slip_id, stake, potential_win, .. } => format!(
            "Bet {slip_id} placed: stake {}, potential return {}.",
            display_amount(*stake),
            display_amount(*potential_win)
        ),
        PlatformEvent::BetSettled { slip_id, status, payout, .. } => match status {
            BetStatus::Won => format!("Bet {slip_id} won! {} has been credited.", display_amount(*payout)),
            BetStatus::Void => format!("Bet {slip_id} was voided; {} refunded.", display_amount(*payout)),
            BetStatus::Lost => format!("Bet {slip_id} did not win this time."),
            _ => return None,
        },
        PlatformEvent::BetCashedOut { slip_id, amount, .. } => {
            format!("Bet {slip_id} cashed out for {}.", display_amount(*amount))
        }
        PlatformEvent::DisputeOpened { ticket_reference, frozen_amount, .. } => {
            if *frozen_amount > 0 {
                format!(
                    "Dispute {ticket_reference} opened. Winnings of {} are held until it is resolved.",
                    display_amount(*frozen_amount)
                )
            } else {
                format!("Dispute {ticket_reference} opened. We'll be in touch.")
            }
        }
        PlatformEvent::DisputeResolved { status, credited, .. } => format!(
            "Your dispute was closed ({}). {} credited.",
            status.as_str(),
            display_amount(*credited)
        ),
        PlatformEvent::EscrowTransferred { .. } | PlatformEvent::IntegrityHalted { .. } => return None,
    };
    Some(text)
}

pub struct NotifyingSink {
    dispatcher: NotificationDispatcher,
}

impl NotifyingSink {
    pub fn new(dispatcher: NotificationDispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl EventSink for NotifyingSink {
    fn sink_name(&self) -> &str {
        "notifications"
    }

    async fn deliver(&self, event: &PlatformEvent) -> Result<(), WagerError> {
        let (Some(user_id), Some(message)) = (event.user_id(), player_message(event)) else {
            return Ok(());
        };
        let result = self
            .dispatcher
            .dispatch(user_id, &message)
            .await
            .map_err(|err| err.into_engine("notifications"))?;
        info!(user_id, event = event.name(), result = ?result, "player notified");
        Ok(())
    }
}

/// Opens the external ticket for each new dispute under its pre-generated reference.
pub struct TicketingSink {
    desk: Arc<dyn TicketDesk>,
}

impl TicketingSink {
    pub fn new(desk: Arc<dyn TicketDesk>) -> Self {
        Self { desk }
    }
}

#[async_trait]
impl EventSink for TicketingSink {
    fn sink_name(&self) -> &str {
        "tickets"
    }

    async fn deliver(&self, event: &PlatformEvent) -> Result<(), WagerError> {
        let PlatformEvent::DisputeOpened {
            dispute_id,
            slip_id,
            user_id,
            ticket_reference,
            reason,
            frozen_amount,
            collections_review,
        } = event
        else {
            return Ok(());
        };

        let mut body = format!(
            "Dispute {dispute_id} on slip {slip_id}.\nReason: {reason}\nFrozen: {}",
            display_amount(*frozen_amount)
        );
        if *collections_review {
            body.push_str("\nBalance went negative: collections review required.");
        }
        self.desk
            .open_ticket(SupportTicket {
                reference: ticket_reference.clone(),
                user_id: user_id.clone(),
                subject: format!("Bet dispute {ticket_reference}"),
                body,
                created_at: Utc::now(),
            })
            .await
            .map_err(|err| err.into_engine("ticket_desk"))?;
        info!(ticket = %ticket_reference, dispute_id = %dispute_id, "support ticket opened");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{DisabledSmsGateway, MemoryInbox};
    use crate::tickets::MemoryTicketDesk;
    use std::time::Duration;
    use uuid::Uuid;
    use wager_core::DisputeStatus;

    #[test]
    fn amounts_render_in_major_units() {
        assert_eq!(display_amount(1_900), "19.00");
        assert_eq!(display_amount(5), "0.05");
        assert_eq!(display_amount(-1_905), "-19.05");
    }

    #[tokio::test]
    async fn notifications_fall_back_to_inbox() {
        let inbox = MemoryInbox::new();
        let dispatcher = NotificationDispatcher::new(Arc::new(DisabledSmsGateway), Arc::new(inbox.clone()))
            .with_retry_delay(Duration::ZERO);
        let sink = NotifyingSink::new(dispatcher);

        sink.deliver(&PlatformEvent::DisputeResolved {
            dispute_id: Uuid::new_v4(),
            user_id: "alice".to_string(),
            status: DisputeStatus::Released,
            credited: 1_900,
        })
        .await
        .unwrap();
        sink.deliver(&PlatformEvent::EscrowTransferred {
            transfer_id: Uuid::new_v4(),
            flag_id: Uuid::new_v4(),
            amount: 10,
        })
        .await
        .unwrap();

        let messages = inbox.messages_for("alice");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].message.contains("released"));
    }

    #[tokio::test]
    async fn dispute_opens_ticket_under_its_reference() {
        let desk = MemoryTicketDesk::new();
        let sink = TicketingSink::new(Arc::new(desk.clone()));
        let event = PlatformEvent::DisputeOpened {
            dispute_id: Uuid::new_v4(),
            slip_id: Uuid::new_v4(),
            user_id: "alice".to_string(),
            ticket_reference: "DSP-0123456789AB".to_string(),
            reason: "wrong result".to_string(),
            frozen_amount: 1_900,
            collections_review: true,
        };
        sink.deliver(&event).await.unwrap();
        sink.deliver(&event).await.unwrap();

        assert_eq!(desk.len(), 1);
        let ticket = desk.ticket("DSP-0123456789AB").unwrap();
        assert!(ticket.body.contains("collections review"));
    }
}
