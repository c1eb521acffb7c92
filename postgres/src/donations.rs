//! Donors, donations and the donor aggregate.

use crate::rows::{self, DONATION_COLUMNS, DONOR_COLUMNS};
use crate::{PostgresStore, db_error, limit, to_i64};
use impact_core::error::StoreError;
use impact_core::ledger::ReceiptId;
use impact_core::records::{Donation, DonationStatus, Donor, ImpactRecord};
use impact_core::store::{DonationStore, StoreFuture, Transition};
use impact_core::types::{DonationId, SourceRef, UserId};
use impact_core::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};

async fn lock_donation(
    tx: &mut Transaction<'_, Postgres>,
    donation_id: DonationId,
) -> Result<Option<Donation>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE id = $1 FOR UPDATE"
    ))
    .bind(donation_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_error)?;
    row.as_ref().map(rows::donation).transpose()
}

async fn write_settlement(
    tx: &mut Transaction<'_, Postgres>,
    donation: &Donation,
) -> Result<(), StoreError> {
    sqlx::query(
        r"
        UPDATE donations
        SET status = $2, transfer_receipt_id = $3, failure_reason = $4, updated_at = $5
        WHERE id = $1
        ",
    )
    .bind(donation.id.as_uuid())
    .bind(donation.status.as_str())
    .bind(donation.transfer_receipt_id.as_ref().map(|r| r.as_str().to_string()))
    .bind(donation.failure_reason.as_deref())
    .bind(donation.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;
    Ok(())
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

impl PostgresStore {
    async fn confirm_in_tx(
        &self,
        donation_id: DonationId,
        receipt_id: ReceiptId,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition<Donation>>, StoreError> {
        let mut tx = self.pool().begin().await.map_err(db_error)?;
        let Some(donation) = lock_donation(&mut tx, donation_id).await? else {
            return Ok(None);
        };
        if donation.status != DonationStatus::Pending {
            return Ok(Some(Transition::Unchanged(donation)));
        }

        let credited = sqlx::query(
            "UPDATE donors SET total_donated = total_donated + $2, updated_at = $3 WHERE id = $1",
        )
        .bind(donation.donor_id.as_uuid())
        .bind(to_i64(donation.amount.minor(), "amount")?)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        if credited.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!(
                "donation {donation_id} references a missing donor"
            )));
        }

        let confirmed = donation.confirm(receipt_id, now).map_err(corrupt)?;
        write_settlement(&mut tx, &confirmed).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(Some(Transition::Applied(confirmed)))
    }

    async fn fail_in_tx(
        &self,
        donation_id: DonationId,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition<Donation>>, StoreError> {
        let mut tx = self.pool().begin().await.map_err(db_error)?;
        let Some(donation) = lock_donation(&mut tx, donation_id).await? else {
            return Ok(None);
        };
        if donation.status != DonationStatus::Pending {
            return Ok(Some(Transition::Unchanged(donation)));
        }
        let failed = donation.fail(reason, now).map_err(corrupt)?;
        write_settlement(&mut tx, &failed).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(Some(Transition::Applied(failed)))
    }

    async fn verify_in_tx(
        &self,
        donation_id: DonationId,
        impact: ImpactRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition<Donation>>, StoreError> {
        let mut tx = self.pool().begin().await.map_err(db_error)?;
        let Some(donation) = lock_donation(&mut tx, donation_id).await? else {
            return Ok(None);
        };
        let Ok(Some(verified)) = donation.verify(impact, now) else {
            return Ok(Some(Transition::Unchanged(donation)));
        };

        sqlx::query(
            r"
            UPDATE donations
            SET verified = TRUE, verified_at = $2, impact = $3, updated_at = $4
            WHERE id = $1 AND status = 'confirmed' AND NOT verified
            ",
        )
        .bind(donation_id.as_uuid())
        .bind(verified.verified_at)
        .bind(Json(&verified.impact))
        .bind(verified.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;
        Ok(Some(Transition::Applied(verified)))
    }
}

impl DonationStore for PostgresStore {
    fn insert_donor(&self, donor: Donor) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO donors ({DONOR_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
            ))
            .bind(donor.id.as_uuid())
            .bind(&donor.name)
            .bind(donor.ledger_account.as_str())
            .bind(to_i64(donor.total_donated.minor(), "total_donated")?)
            .bind(donor.created_at)
            .bind(donor.updated_at)
            .execute(self.pool())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn donor(&self, donor_id: UserId) -> StoreFuture<'_, Option<Donor>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {DONOR_COLUMNS} FROM donors WHERE id = $1"))
                .bind(donor_id.as_uuid())
                .fetch_optional(self.pool())
                .await
                .map_err(db_error)?;
            row.as_ref().map(rows::donor).transpose()
        })
    }

    fn insert_donation(&self, donation: Donation) -> StoreFuture<'_, Donation> {
        Box::pin(async move {
            sqlx::query(&format!(
                r"
                INSERT INTO donations ({DONATION_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (source_ref) DO NOTHING
                "
            ))
            .bind(donation.id.as_uuid())
            .bind(donation.donor_id.as_uuid())
            .bind(donation.cause.as_str())
            .bind(to_i64(donation.amount.minor(), "amount")?)
            .bind(donation.source_ref.as_str())
            .bind(donation.idempotency_key.as_str())
            .bind(donation.beneficiary.as_str())
            .bind(donation.status.as_str())
            .bind(donation.transfer_receipt_id.as_ref().map(|r| r.as_str().to_string()))
            .bind(donation.failure_reason.as_deref())
            .bind(donation.verified)
            .bind(donation.verified_at)
            .bind(donation.impact.as_ref().map(Json))
            .bind(donation.created_at)
            .bind(donation.updated_at)
            .execute(self.pool())
            .await
            .map_err(db_error)?;

            let row = sqlx::query(&format!(
                "SELECT {DONATION_COLUMNS} FROM donations WHERE source_ref = $1"
            ))
            .bind(donation.source_ref.as_str())
            .fetch_one(self.pool())
            .await
            .map_err(db_error)?;
            rows::donation(&row)
        })
    }

    fn donation(&self, donation_id: DonationId) -> StoreFuture<'_, Option<Donation>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {DONATION_COLUMNS} FROM donations WHERE id = $1"
            ))
            .bind(donation_id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(db_error)?;
            row.as_ref().map(rows::donation).transpose()
        })
    }

    fn donation_by_source(&self, source_ref: &SourceRef) -> StoreFuture<'_, Option<Donation>> {
        let source_ref = source_ref.clone();
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {DONATION_COLUMNS} FROM donations WHERE source_ref = $1"
            ))
            .bind(source_ref.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(db_error)?;
            row.as_ref().map(rows::donation).transpose()
        })
    }

    fn donations_for_donor(&self, donor_id: UserId) -> StoreFuture<'_, Vec<Donation>> {
        Box::pin(async move {
            let found = sqlx::query(&format!(
                "SELECT {DONATION_COLUMNS} FROM donations WHERE donor_id = $1 ORDER BY created_at DESC"
            ))
            .bind(donor_id.as_uuid())
            .fetch_all(self.pool())
            .await
            .map_err(db_error)?;
            found.iter().map(rows::donation).collect()
        })
    }

    fn confirm_donation(
        &self,
        donation_id: DonationId,
        receipt_id: ReceiptId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Donation>>> {
        Box::pin(self.confirm_in_tx(donation_id, receipt_id, now))
    }

    fn fail_donation(
        &self,
        donation_id: DonationId,
        reason: String,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Donation>>> {
        Box::pin(self.fail_in_tx(donation_id, reason, now))
    }

    fn verify_donation(
        &self,
        donation_id: DonationId,
        impact: ImpactRecord,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Donation>>> {
        Box::pin(self.verify_in_tx(donation_id, impact, now))
    }

    fn stale_donations(
        &self,
        updated_before: DateTime<Utc>,
        max: usize,
    ) -> StoreFuture<'_, Vec<Donation>> {
        Box::pin(async move {
            let found = sqlx::query(&format!(
                r"
                SELECT {DONATION_COLUMNS}
                FROM donations
                WHERE status = 'pending' AND updated_at < $1
                ORDER BY updated_at ASC
                LIMIT $2
                "
            ))
            .bind(updated_before)
            .bind(limit(max))
            .fetch_all(self.pool())
            .await
            .map_err(db_error)?;
            found.iter().map(rows::donation).collect()
        })
    }
}
