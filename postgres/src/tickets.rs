//! Ticket records.

use crate::rows::{self, TICKET_COLUMNS};
use crate::{PostgresStore, db_error, limit, to_i64};
use impact_core::records::{Ticket, TicketStatus};
use impact_core::store::{StoreFuture, TicketStore};
use impact_core::types::{ReservationId, TicketId, UserId};
use impact_core::{DateTime, Utc};

impl TicketStore for PostgresStore {
    fn insert_ticket(&self, ticket: Ticket) -> StoreFuture<'_, Ticket> {
        Box::pin(async move {
            sqlx::query(&format!(
                r"
                INSERT INTO tickets ({TICKET_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (reservation_id) DO NOTHING
                "
            ))
            .bind(ticket.id.as_uuid())
            .bind(ticket.event_id.as_uuid())
            .bind(ticket.reservation_id.as_uuid())
            .bind(ticket.owner_id.as_uuid())
            .bind(ticket.kind.as_str())
            .bind(to_i64(ticket.price.minor(), "price")?)
            .bind(ticket.idempotency_key.as_str())
            .bind(ticket.issuance_receipt_id.as_ref().map(|r| r.as_str().to_string()))
            .bind(ticket.serial_number.map(|s| to_i64(s, "serial")).transpose()?)
            .bind(ticket.status.as_str())
            .bind(ticket.failure_reason.as_deref())
            .bind(ticket.created_at)
            .bind(ticket.submitted_at)
            .bind(ticket.updated_at)
            .execute(self.pool())
            .await
            .map_err(db_error)?;

            let row = sqlx::query(&format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE reservation_id = $1"
            ))
            .bind(ticket.reservation_id.as_uuid())
            .fetch_one(self.pool())
            .await
            .map_err(db_error)?;
            rows::ticket(&row)
        })
    }

    fn ticket(&self, ticket_id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"))
                .bind(ticket_id.as_uuid())
                .fetch_optional(self.pool())
                .await
                .map_err(db_error)?;
            row.as_ref().map(rows::ticket).transpose()
        })
    }

    fn ticket_for_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE reservation_id = $1"
            ))
            .bind(reservation_id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(db_error)?;
            row.as_ref().map(rows::ticket).transpose()
        })
    }

    fn tickets_for_owner(&self, owner_id: UserId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let found = sqlx::query(&format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE owner_id = $1 ORDER BY created_at DESC"
            ))
            .bind(owner_id.as_uuid())
            .fetch_all(self.pool())
            .await
            .map_err(db_error)?;
            found.iter().map(rows::ticket).collect()
        })
    }

    fn update_ticket(&self, ticket: Ticket, expected: TicketStatus) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let updated = sqlx::query(
                r"
                UPDATE tickets
                SET status = $3,
                    issuance_receipt_id = $4,
                    serial_number = $5,
                    failure_reason = $6,
                    submitted_at = $7,
                    updated_at = $8
                WHERE id = $1 AND status = $2
                ",
            )
            .bind(ticket.id.as_uuid())
            .bind(expected.as_str())
            .bind(ticket.status.as_str())
            .bind(ticket.issuance_receipt_id.as_ref().map(|r| r.as_str().to_string()))
            .bind(ticket.serial_number.map(|s| to_i64(s, "serial")).transpose()?)
            .bind(ticket.failure_reason.as_deref())
            .bind(ticket.submitted_at)
            .bind(ticket.updated_at)
            .execute(self.pool())
            .await
            .map_err(db_error)?;

            let applied = updated.rows_affected() == 1;
            if applied {
                tracing::debug!(
                    ticket_id = %ticket.id,
                    from = expected.as_str(),
                    to = ticket.status.as_str(),
                    "ticket transition stored"
                );
            }
            Ok(applied)
        })
    }

    fn stale_tickets(
        &self,
        status: TicketStatus,
        updated_before: DateTime<Utc>,
        max: usize,
    ) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let found = sqlx::query(&format!(
                r"
                SELECT {TICKET_COLUMNS}
                FROM tickets
                WHERE status = $1 AND updated_at < $2
                ORDER BY updated_at ASC
                LIMIT $3
                "
            ))
            .bind(status.as_str())
            .bind(updated_before)
            .bind(limit(max))
            .fetch_all(self.pool())
            .await
            .map_err(db_error)?;
            found.iter().map(rows::ticket).collect()
        })
    }

    fn unsplit_tickets(
        &self,
        updated_before: DateTime<Utc>,
        max: usize,
    ) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let found = sqlx::query(&format!(
                r"
                SELECT {TICKET_COLUMNS}
                FROM tickets t
                WHERE t.status IN ('active', 'used', 'transferred')
                  AND t.updated_at < $1
                  AND EXISTS (
                      SELECT 1 FROM events e
                      WHERE e.id = t.event_id
                        AND e.price_per_unit::NUMERIC * e.donation_share_bps >= 10000
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM donations d
                      WHERE d.source_ref = 'ticket:' || t.id::TEXT
                  )
                ORDER BY t.updated_at ASC
                LIMIT $2
                "
            ))
            .bind(updated_before)
            .bind(limit(max))
            .fetch_all(self.pool())
            .await
            .map_err(db_error)?;
            found.iter().map(rows::ticket).collect()
        })
    }
}
