//! Events, counters and reservations.

use crate::rows::{self, EVENT_COLUMNS, RESERVATION_COLUMNS};
use crate::{PostgresStore, db_error, limit, to_i32, to_i64};
use impact_core::error::StoreError;
use impact_core::records::{Event, Reservation, ReservationStatus};
use impact_core::store::{InventoryStore, ReserveOutcome, StoreFuture, Transition};
use impact_core::types::{EventId, RequestId, ReservationId};
use impact_core::{DateTime, Utc};
use sqlx::{Postgres, Transaction};

async fn lock_reservation(
    tx: &mut Transaction<'_, Postgres>,
    reservation_id: ReservationId,
) -> Result<Option<Reservation>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 FOR UPDATE"
    ))
    .bind(reservation_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_error)?;
    row.as_ref().map(rows::reservation).transpose()
}

async fn set_reservation_status(
    tx: &mut Transaction<'_, Postgres>,
    reservation: &Reservation,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE reservations SET status = $2, updated_at = $3 WHERE id = $1")
        .bind(reservation.id.as_uuid())
        .bind(reservation.status.as_str())
        .bind(reservation.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
    Ok(())
}

impl PostgresStore {
    async fn find_reservation(
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
        request_id: &RequestId,
    ) -> Result<Option<Reservation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE event_id = $1 AND request_id = $2"
        ))
        .bind(event_id.as_uuid())
        .bind(request_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error)?;
        row.as_ref().map(rows::reservation).transpose()
    }

    async fn reserve_in_tx(
        &self,
        event_id: EventId,
        request_id: RequestId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut tx = self.pool().begin().await.map_err(db_error)?;

        // Calls for the same (event, request) run one at a time until commit,
        // so the replay lookups below see whatever an earlier call decided.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("reserve:{event_id}:{request_id}"))
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        if let Some(reservation) = Self::find_reservation(&mut tx, event_id, &request_id).await? {
            return Ok(ReserveOutcome::Granted {
                reservation,
                fresh: false,
            });
        }

        let denied: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM reservation_denials WHERE event_id = $1 AND request_id = $2",
        )
        .bind(event_id.as_uuid())
        .bind(request_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        if denied.is_some() {
            return Ok(ReserveOutcome::Denied);
        }

        // Compare-and-increment; the row lock serializes concurrent reservers.
        let held = sqlx::query(
            r"
            UPDATE events
            SET held = held + 1, updated_at = $2
            WHERE id = $1 AND issued + held < capacity
            ",
        )
        .bind(event_id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if held.rows_affected() == 0 {
            let exists: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM events WHERE id = $1")
                .bind(event_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?;
            if exists.is_none() {
                return Ok(ReserveOutcome::EventNotFound);
            }
            sqlx::query(
                r"
                INSERT INTO reservation_denials (event_id, request_id, denied_at)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(event_id.as_uuid())
            .bind(request_id.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
            tx.commit().await.map_err(db_error)?;
            return Ok(ReserveOutcome::Denied);
        }

        let reservation = Reservation::hold(event_id, request_id, now, expires_at);
        let inserted = sqlx::query(
            r"
            INSERT INTO reservations (id, event_id, request_id, status, created_at, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id, request_id) DO NOTHING
            ",
        )
        .bind(reservation.id.as_uuid())
        .bind(event_id.as_uuid())
        .bind(reservation.request_id.as_str())
        .bind(reservation.status.as_str())
        .bind(reservation.created_at)
        .bind(reservation.expires_at)
        .bind(reservation.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "reservation for request {} was created outside the request lock",
                reservation.request_id
            )));
        }

        tx.commit().await.map_err(db_error)?;
        Ok(ReserveOutcome::Granted {
            reservation,
            fresh: true,
        })
    }

    async fn commit_in_tx(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition<Reservation>>, StoreError> {
        let mut tx = self.pool().begin().await.map_err(db_error)?;
        let Some(reservation) = lock_reservation(&mut tx, reservation_id).await? else {
            return Ok(None);
        };

        let counters = match reservation.status {
            ReservationStatus::Committed => return Ok(Some(Transition::Unchanged(reservation))),
            ReservationStatus::Held => {
                "UPDATE events SET held = held - 1, issued = issued + 1, updated_at = $2 WHERE id = $1"
            }
            ReservationStatus::Released => {
                "UPDATE events SET issued = issued + 1, updated_at = $2 \
                 WHERE id = $1 AND issued + held < capacity"
            }
        };
        let updated = sqlx::query(counters)
            .bind(reservation.event_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "released reservation {reservation_id} cannot be reclaimed: event {} is full",
                reservation.event_id
            )));
        }

        let committed = reservation.with_status(ReservationStatus::Committed, now);
        set_reservation_status(&mut tx, &committed).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(Some(Transition::Applied(committed)))
    }

    async fn release_in_tx(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition<Reservation>>, StoreError> {
        let mut tx = self.pool().begin().await.map_err(db_error)?;
        let Some(reservation) = lock_reservation(&mut tx, reservation_id).await? else {
            return Ok(None);
        };
        if reservation.status != ReservationStatus::Held {
            return Ok(Some(Transition::Unchanged(reservation)));
        }

        sqlx::query("UPDATE events SET held = held - 1, updated_at = $2 WHERE id = $1")
            .bind(reservation.event_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let released = reservation.with_status(ReservationStatus::Released, now);
        set_reservation_status(&mut tx, &released).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(Some(Transition::Applied(released)))
    }
}

impl InventoryStore for PostgresStore {
    fn insert_event(&self, event: Event) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO events ({EVENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
            ))
            .bind(event.id.as_uuid())
            .bind(&event.title)
            .bind(to_i32(event.capacity, "capacity")?)
            .bind(to_i32(event.issued, "issued")?)
            .bind(to_i32(event.held, "held")?)
            .bind(to_i64(event.price_per_unit.minor(), "price")?)
            .bind(i32::from(event.donation_share.basis_points()))
            .bind(event.cause.as_str())
            .bind(event.created_at)
            .bind(event.updated_at)
            .execute(self.pool())
            .await
            .map_err(db_error)?;
            tracing::debug!(event_id = %event.id, capacity = event.capacity, "event stored");
            Ok(())
        })
    }

    fn event(&self, event_id: EventId) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
                .bind(event_id.as_uuid())
                .fetch_optional(self.pool())
                .await
                .map_err(db_error)?;
            row.as_ref().map(rows::event).transpose()
        })
    }

    fn reserve(
        &self,
        event_id: EventId,
        request_id: RequestId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ReserveOutcome> {
        Box::pin(self.reserve_in_tx(event_id, request_id, now, expires_at))
    }

    fn reservation(&self, reservation_id: ReservationId) -> StoreFuture<'_, Option<Reservation>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
            ))
            .bind(reservation_id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(db_error)?;
            row.as_ref().map(rows::reservation).transpose()
        })
    }

    fn commit_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Reservation>>> {
        Box::pin(self.commit_in_tx(reservation_id, now))
    }

    fn release_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Reservation>>> {
        Box::pin(self.release_in_tx(reservation_id, now))
    }

    fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        max: usize,
    ) -> StoreFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            let found = sqlx::query(&format!(
                r"
                SELECT {RESERVATION_COLUMNS}
                FROM reservations
                WHERE status = 'held' AND expires_at <= $1
                ORDER BY expires_at ASC
                LIMIT $2
                "
            ))
            .bind(now)
            .bind(limit(max))
            .fetch_all(self.pool())
            .await
            .map_err(db_error)?;
            found.iter().map(rows::reservation).collect()
        })
    }
}
