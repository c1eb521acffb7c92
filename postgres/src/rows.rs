//! Row decoding.
//!
//! Column lists live next to the decoders so every query selects exactly what
//! its decoder reads.

use impact_core::error::StoreError;
use impact_core::ledger::{IdempotencyKey, ReceiptId};
use impact_core::records::{
    Donation, DonationStatus, Donor, Event, ImpactRecord, Reservation, ReservationStatus, Ticket,
    TicketStatus,
};
use impact_core::types::{
    Cause, DonationId, DonationShare, EventId, LedgerAccount, Money, RequestId, ReservationId,
    SourceRef, TicketId, TicketKind, UserId,
};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

pub(crate) const EVENT_COLUMNS: &str = "id, title, capacity, issued, held, price_per_unit, \
     donation_share_bps, cause, created_at, updated_at";

pub(crate) const RESERVATION_COLUMNS: &str =
    "id, event_id, request_id, status, created_at, expires_at, updated_at";

pub(crate) const TICKET_COLUMNS: &str = "id, event_id, reservation_id, owner_id, kind, price, \
     idempotency_key, issuance_receipt_id, serial_number, status, failure_reason, created_at, \
     submitted_at, updated_at";

pub(crate) const DONOR_COLUMNS: &str =
    "id, name, ledger_account, total_donated, created_at, updated_at";

pub(crate) const DONATION_COLUMNS: &str = "id, donor_id, cause, amount, source_ref, \
     idempotency_key, beneficiary, status, transfer_receipt_id, failure_reason, verified, \
     verified_at, impact, created_at, updated_at";

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Corrupt(format!("column {column}: {e}")))
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn unsigned<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| StoreError::Corrupt(format!("column {column}: {value} out of range")))
}

fn money(row: &PgRow, column: &str) -> Result<Money, StoreError> {
    unsigned::<u64>(get::<i64>(row, column)?, column).map(Money::from_minor)
}

fn counter(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    unsigned(i64::from(get::<i32>(row, column)?), column)
}

pub(crate) fn event(row: &PgRow) -> Result<Event, StoreError> {
    let bps: u16 = unsigned(i64::from(get::<i32>(row, "donation_share_bps")?), "donation_share_bps")?;
    Ok(Event {
        id: EventId::from_uuid(get::<Uuid>(row, "id")?),
        title: get(row, "title")?,
        capacity: counter(row, "capacity")?,
        issued: counter(row, "issued")?,
        held: counter(row, "held")?,
        price_per_unit: money(row, "price_per_unit")?,
        donation_share: DonationShare::from_basis_points(bps).map_err(corrupt)?,
        cause: Cause::parse(&get::<String>(row, "cause")?).map_err(corrupt)?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) fn reservation(row: &PgRow) -> Result<Reservation, StoreError> {
    Ok(Reservation {
        id: ReservationId::from_uuid(get::<Uuid>(row, "id")?),
        event_id: EventId::from_uuid(get::<Uuid>(row, "event_id")?),
        request_id: RequestId::parse(get::<String>(row, "request_id")?).map_err(corrupt)?,
        status: ReservationStatus::parse(&get::<String>(row, "status")?).map_err(corrupt)?,
        created_at: get(row, "created_at")?,
        expires_at: get(row, "expires_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) fn ticket(row: &PgRow) -> Result<Ticket, StoreError> {
    let serial_number = get::<Option<i64>>(row, "serial_number")?
        .map(|serial| unsigned::<u64>(serial, "serial_number"))
        .transpose()?;
    Ok(Ticket {
        id: TicketId::from_uuid(get::<Uuid>(row, "id")?),
        event_id: EventId::from_uuid(get::<Uuid>(row, "event_id")?),
        reservation_id: ReservationId::from_uuid(get::<Uuid>(row, "reservation_id")?),
        owner_id: UserId::from_uuid(get::<Uuid>(row, "owner_id")?),
        kind: TicketKind::parse(&get::<String>(row, "kind")?).map_err(corrupt)?,
        price: money(row, "price")?,
        idempotency_key: IdempotencyKey::from_stored(get(row, "idempotency_key")?),
        issuance_receipt_id: get::<Option<String>>(row, "issuance_receipt_id")?.map(ReceiptId::new),
        serial_number,
        status: TicketStatus::parse(&get::<String>(row, "status")?).map_err(corrupt)?,
        failure_reason: get(row, "failure_reason")?,
        created_at: get(row, "created_at")?,
        submitted_at: get(row, "submitted_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) fn donor(row: &PgRow) -> Result<Donor, StoreError> {
    Ok(Donor {
        id: UserId::from_uuid(get::<Uuid>(row, "id")?),
        name: get(row, "name")?,
        ledger_account: LedgerAccount::parse(get::<String>(row, "ledger_account")?)
            .map_err(corrupt)?,
        total_donated: money(row, "total_donated")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) fn donation(row: &PgRow) -> Result<Donation, StoreError> {
    let impact: Option<Json<ImpactRecord>> = get(row, "impact")?;
    Ok(Donation {
        id: DonationId::from_uuid(get::<Uuid>(row, "id")?),
        donor_id: UserId::from_uuid(get::<Uuid>(row, "donor_id")?),
        cause: Cause::parse(&get::<String>(row, "cause")?).map_err(corrupt)?,
        amount: money(row, "amount")?,
        source_ref: SourceRef::parse(get::<String>(row, "source_ref")?).map_err(corrupt)?,
        idempotency_key: IdempotencyKey::from_stored(get(row, "idempotency_key")?),
        beneficiary: LedgerAccount::parse(get::<String>(row, "beneficiary")?).map_err(corrupt)?,
        status: DonationStatus::parse(&get::<String>(row, "status")?).map_err(corrupt)?,
        transfer_receipt_id: get::<Option<String>>(row, "transfer_receipt_id")?.map(ReceiptId::new),
        failure_reason: get(row, "failure_reason")?,
        verified: get(row, "verified")?,
        verified_at: get(row, "verified_at")?,
        impact: impact.map(|Json(record)| record),
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}
