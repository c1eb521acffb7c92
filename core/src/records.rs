//! Persisted records and their state machines.
//!
//! Every transition is a method that takes the current time and returns the next
//! version of the record. Storage implementations persist these values; they never
//! invent timestamps or statuses of their own.

use crate::error::ImpactError;
use crate::ledger::{IdempotencyKey, ReceiptId};
use crate::types::{
    Cause, DonationId, DonationShare, EventId, LedgerAccount, Money, RequestId, ReservationId,
    SourceRef, TicketId, TicketKind, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Event
// ============================================================================

/// Input for registering an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Display title
    pub title: String,
    /// Number of admissions for sale (at least 1)
    pub capacity: u32,
    /// Price of one admission
    pub price_per_unit: Money,
    /// Share of the price donated to `cause`
    pub donation_share: DonationShare,
    /// Cause receiving the donation split
    #[serde(default)]
    pub cause: Cause,
}

/// An event with a fixed inventory of admissions.
///
/// `issued + held <= capacity` holds at all times; both counters only change
/// through the store's single-step reserve/commit/release operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID
    pub id: EventId,
    /// Display title
    pub title: String,
    /// Total admissions
    pub capacity: u32,
    /// Admissions backed by a confirmed mint; never decreases
    pub issued: u32,
    /// Admissions held by live reservations
    pub held: u32,
    /// Price of one admission
    pub price_per_unit: Money,
    /// Share of the price donated to `cause`
    pub donation_share: DonationShare,
    /// Cause receiving the donation split
    pub cause: Cause,
    /// When the event was registered
    pub created_at: DateTime<Utc>,
    /// Last counter change
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Create an event from registration input.
    ///
    /// # Errors
    ///
    /// Returns [`ImpactError::Validation`] for a zero capacity or a blank title.
    pub fn create(input: NewEvent, now: DateTime<Utc>) -> Result<Self, ImpactError> {
        if input.capacity == 0 {
            return Err(ImpactError::Validation(
                "event capacity must be at least 1".to_string(),
            ));
        }
        if input.title.trim().is_empty() {
            return Err(ImpactError::Validation(
                "event title must not be empty".to_string(),
            ));
        }
        Ok(Self {
            id: EventId::new(),
            title: input.title,
            capacity: input.capacity,
            issued: 0,
            held: 0,
            price_per_unit: input.price_per_unit,
            donation_share: input.donation_share,
            cause: input.cause,
            created_at: now,
            updated_at: now,
        })
    }

    /// Admissions neither issued nor held.
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.capacity
            .saturating_sub(self.issued)
            .saturating_sub(self.held)
    }

    /// Donation carried by every admission sold.
    #[must_use]
    pub const fn donation_per_ticket(&self) -> Money {
        self.donation_share.of(self.price_per_unit)
    }

    /// Compare-and-increment on `issued + held`.
    ///
    /// Returns `false` (and changes nothing) when the event is full. The caller must
    /// hold whatever lock makes this check and the increment one step.
    pub fn try_hold(&mut self, now: DateTime<Utc>) -> bool {
        if self.available() == 0 {
            return false;
        }
        self.held += 1;
        self.updated_at = now;
        true
    }

    /// Return a held slot to the pool.
    pub fn release_hold(&mut self, now: DateTime<Utc>) {
        self.held = self.held.saturating_sub(1);
        self.updated_at = now;
    }

    /// Convert a held slot into an issued admission.
    pub fn commit_hold(&mut self, now: DateTime<Utc>) {
        self.held = self.held.saturating_sub(1);
        self.issued += 1;
        self.updated_at = now;
    }

    /// Snapshot of the counters.
    #[must_use]
    pub const fn availability(&self) -> Availability {
        Availability {
            event_id: self.id,
            capacity: self.capacity,
            issued: self.issued,
            held: self.held,
            available: self.available(),
        }
    }
}

/// Inventory counters of one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// Event ID
    pub event_id: EventId,
    /// Total admissions
    pub capacity: u32,
    /// Issued admissions
    pub issued: u32,
    /// Held admissions
    pub held: u32,
    /// Remaining admissions
    pub available: u32,
}

// ============================================================================
// Reservation
// ============================================================================

/// Reservation lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Holding one slot of capacity
    Held,
    /// Converted into an issued admission
    Committed,
    /// Slot returned to the pool
    Released,
}

impl ReservationStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, ImpactError> {
        match s {
            "held" => Ok(Self::Held),
            "committed" => Ok(Self::Committed),
            "released" => Ok(Self::Released),
            _ => Err(ImpactError::Validation(format!(
                "invalid reservation status: {s}"
            ))),
        }
    }
}

/// A short-lived hold on one admission, keyed by the client's request id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation ID
    pub id: ReservationId,
    /// Event the slot belongs to
    pub event_id: EventId,
    /// Client idempotency key
    pub request_id: RequestId,
    /// Current status
    pub status: ReservationStatus,
    /// When the slot was granted
    pub created_at: DateTime<Utc>,
    /// When a still-held slot becomes eligible for release
    pub expires_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// A freshly granted hold.
    #[must_use]
    pub fn hold(
        event_id: EventId,
        request_id: RequestId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            event_id,
            request_id,
            status: ReservationStatus::Held,
            created_at: now,
            expires_at,
            updated_at: now,
        }
    }

    /// Held past its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Held && self.expires_at <= now
    }

    /// Same reservation in a new status.
    #[must_use]
    pub fn with_status(&self, status: ReservationStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at: now,
            ..self.clone()
        }
    }
}

// ============================================================================
// Ticket
// ============================================================================

/// Ticket lifecycle: `Reserved → Minting → Active → {Used, Transferred, Cancelled}`.
///
/// `Reserved` tickets were never submitted to the ledger. `Minting` tickets may
/// have been; only the reconciliation sweep resolves them after a timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    /// Record created, ledger not yet asked
    Reserved,
    /// Mint submitted, outcome not yet known
    Minting,
    /// Backed by a confirmed mint
    Active,
    /// Admission consumed
    Used,
    /// Ownership moved to someone else
    Transferred,
    /// Mint refused or abandoned
    Cancelled,
}

impl TicketStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Minting => "minting",
            Self::Active => "active",
            Self::Used => "used",
            Self::Transferred => "transferred",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, ImpactError> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "minting" => Ok(Self::Minting),
            "active" => Ok(Self::Active),
            "used" => Ok(Self::Used),
            "transferred" => Ok(Self::Transferred),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ImpactError::Validation(format!("invalid ticket status: {s}"))),
        }
    }

    /// Whether the state machine allows `self → next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Reserved, Self::Minting | Self::Cancelled)
                | (Self::Minting, Self::Active | Self::Cancelled)
                | (Self::Active, Self::Used | Self::Transferred | Self::Cancelled)
        )
    }

    /// Backed by a confirmed mint (now or in the past).
    #[must_use]
    pub const fn is_issued(self) -> bool {
        matches!(self, Self::Active | Self::Used | Self::Transferred)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One admission, tied 1:1 to the reservation that funded it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket ID
    pub id: TicketId,
    /// Event ID
    pub event_id: EventId,
    /// Reservation this ticket consumes
    pub reservation_id: ReservationId,
    /// Buyer
    pub owner_id: UserId,
    /// Admission tier
    pub kind: TicketKind,
    /// Price paid
    pub price: Money,
    /// Ledger idempotency key of the mint
    pub idempotency_key: IdempotencyKey,
    /// Receipt of the confirmed mint
    pub issuance_receipt_id: Option<ReceiptId>,
    /// Serial number from the confirmed mint, unique per event
    pub serial_number: Option<u64>,
    /// Current status
    pub status: TicketStatus,
    /// Why the ticket was cancelled
    pub failure_reason: Option<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the mint was submitted
    pub submitted_at: Option<DateTime<Utc>>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// A ticket record for `reservation`, not yet submitted to the ledger.
    #[must_use]
    pub fn reserved(
        reservation: &Reservation,
        owner_id: UserId,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TicketId::new(),
            event_id: reservation.event_id,
            reservation_id: reservation.id,
            owner_id,
            kind: TicketKind::default(),
            price: event.price_per_unit,
            idempotency_key: IdempotencyKey::for_mint(reservation.event_id, &reservation.request_id),
            issuance_receipt_id: None,
            serial_number: None,
            status: TicketStatus::Reserved,
            failure_reason: None,
            created_at: now,
            submitted_at: None,
            updated_at: now,
        }
    }

    fn advance(&self, next: TicketStatus, now: DateTime<Utc>) -> Result<Self, ImpactError> {
        if !self.status.can_transition_to(next) {
            return Err(ImpactError::inconsistent(
                format!("ticket {}", self.id),
                format!("illegal transition {} -> {}", self.status, next),
            ));
        }
        Ok(Self {
            status: next,
            updated_at: now,
            ..self.clone()
        })
    }

    /// `Reserved → Minting`, stamping the submission time.
    ///
    /// # Errors
    ///
    /// [`ImpactError::InconsistentState`] from any other status.
    pub fn mark_minting(&self, now: DateTime<Utc>) -> Result<Self, ImpactError> {
        let mut next = self.advance(TicketStatus::Minting, now)?;
        next.submitted_at = Some(now);
        Ok(next)
    }

    /// `Minting → Active` with the ledger's receipt and serial.
    ///
    /// # Errors
    ///
    /// [`ImpactError::InconsistentState`] from any other status.
    pub fn activate(
        &self,
        receipt_id: ReceiptId,
        serial: u64,
        now: DateTime<Utc>,
    ) -> Result<Self, ImpactError> {
        let mut next = self.advance(TicketStatus::Active, now)?;
        next.issuance_receipt_id = Some(receipt_id);
        next.serial_number = Some(serial);
        Ok(next)
    }

    /// Cancel with a reason.
    ///
    /// # Errors
    ///
    /// [`ImpactError::InconsistentState`] if the ticket is already terminal.
    pub fn cancel(&self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<Self, ImpactError> {
        let mut next = self.advance(TicketStatus::Cancelled, now)?;
        next.failure_reason = Some(reason.into());
        Ok(next)
    }
}

// ============================================================================
// Donation
// ============================================================================

/// Settlement status of a donation. Verification is a separate axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DonationStatus {
    /// Transfer not yet confirmed
    Pending,
    /// Transfer executed; counted in the donor's total
    Confirmed,
    /// Transfer refused or abandoned
    Failed,
}

impl DonationStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, ImpactError> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            _ => Err(ImpactError::Validation(format!(
                "invalid donation status: {s}"
            ))),
        }
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Auditor attestation that a settled donation produced a real-world outcome.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactRecord {
    /// Who attests
    pub author: String,
    /// What happened
    pub description: String,
    /// Named measurements (e.g. `patients_treated → 12`)
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// References to supporting evidence (URLs, document ids)
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl ImpactRecord {
    /// Check the fixed envelope.
    ///
    /// # Errors
    ///
    /// [`ImpactError::Validation`] for blank author/description or non-finite metrics.
    pub fn validate(&self) -> Result<(), ImpactError> {
        if self.author.trim().is_empty() {
            return Err(ImpactError::Validation(
                "impact author must not be empty".to_string(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(ImpactError::Validation(
                "impact description must not be empty".to_string(),
            ));
        }
        if let Some((name, _)) = self.metrics.iter().find(|(_, value)| !value.is_finite()) {
            return Err(ImpactError::Validation(format!(
                "impact metric {name} must be a finite number"
            )));
        }
        Ok(())
    }
}

/// A donation toward a cause and its settlement on the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Donation {
    /// Donation ID
    pub id: DonationId,
    /// Donor
    pub donor_id: UserId,
    /// Cause
    pub cause: Cause,
    /// Amount in minor units (non-zero)
    pub amount: Money,
    /// Where the donation came from; unique
    pub source_ref: SourceRef,
    /// Ledger idempotency key of the transfer
    pub idempotency_key: IdempotencyKey,
    /// Account receiving the funds
    pub beneficiary: LedgerAccount,
    /// Settlement status
    pub status: DonationStatus,
    /// Receipt of the confirmed transfer
    pub transfer_receipt_id: Option<ReceiptId>,
    /// Why the transfer failed
    pub failure_reason: Option<String>,
    /// Attested by an auditor; never reverts
    pub verified: bool,
    /// When it was attested
    pub verified_at: Option<DateTime<Utc>>,
    /// The attestation
    pub impact: Option<ImpactRecord>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl Donation {
    /// A new, unsettled donation.
    #[must_use]
    pub fn pending(
        donor_id: UserId,
        cause: Cause,
        amount: Money,
        source_ref: SourceRef,
        beneficiary: LedgerAccount,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DonationId::new(),
            donor_id,
            cause,
            amount,
            idempotency_key: IdempotencyKey::for_donation(&source_ref),
            source_ref,
            beneficiary,
            status: DonationStatus::Pending,
            transfer_receipt_id: None,
            failure_reason: None,
            verified: false,
            verified_at: None,
            impact: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a replayed request describes this same donation.
    #[must_use]
    pub fn matches(&self, donor_id: UserId, cause: Cause, amount: Money) -> bool {
        self.donor_id == donor_id && self.cause == cause && self.amount == amount
    }

    fn record(&self) -> String {
        format!("donation {}", self.id)
    }

    /// `Pending → Confirmed`.
    ///
    /// # Errors
    ///
    /// [`ImpactError::InconsistentState`] unless pending.
    pub fn confirm(&self, receipt_id: ReceiptId, now: DateTime<Utc>) -> Result<Self, ImpactError> {
        if self.status != DonationStatus::Pending {
            return Err(ImpactError::inconsistent(
                self.record(),
                format!("cannot confirm a {} donation", self.status),
            ));
        }
        Ok(Self {
            status: DonationStatus::Confirmed,
            transfer_receipt_id: Some(receipt_id),
            updated_at: now,
            ..self.clone()
        })
    }

    /// `Pending → Failed`.
    ///
    /// # Errors
    ///
    /// [`ImpactError::InconsistentState`] unless pending.
    pub fn fail(&self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<Self, ImpactError> {
        if self.status != DonationStatus::Pending {
            return Err(ImpactError::inconsistent(
                self.record(),
                format!("cannot fail a {} donation", self.status),
            ));
        }
        Ok(Self {
            status: DonationStatus::Failed,
            failure_reason: Some(reason.into()),
            updated_at: now,
            ..self.clone()
        })
    }

    /// Attach an attestation.
    ///
    /// Returns `Ok(None)` if already verified: verification happens once and the
    /// first attestation is kept.
    ///
    /// # Errors
    ///
    /// [`ImpactError::Validation`] unless confirmed or if `impact` is malformed.
    pub fn verify(&self, impact: ImpactRecord, now: DateTime<Utc>) -> Result<Option<Self>, ImpactError> {
        if self.verified {
            return Ok(None);
        }
        if self.status != DonationStatus::Confirmed {
            return Err(ImpactError::Validation(format!(
                "donation {} is {}; only confirmed donations can be verified",
                self.id, self.status
            )));
        }
        impact.validate()?;
        Ok(Some(Self {
            verified: true,
            verified_at: Some(now),
            impact: Some(impact),
            updated_at: now,
            ..self.clone()
        }))
    }
}

// ============================================================================
// Donor
// ============================================================================

/// The donor side of a user: ledger account and running total.
///
/// `total_donated` is derived: with no pending donations it equals the sum of the
/// donor's confirmed donations. Only the store's confirm operation changes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donor {
    /// User ID
    pub id: UserId,
    /// Display name
    pub name: String,
    /// Account funds are drawn from
    pub ledger_account: LedgerAccount,
    /// Sum of confirmed donations
    pub total_donated: Money,
    /// When the donor was registered
    pub created_at: DateTime<Utc>,
    /// Last total change
    pub updated_at: DateTime<Utc>,
}

impl Donor {
    /// A donor with nothing donated yet.
    #[must_use]
    pub fn new(name: impl Into<String>, ledger_account: LedgerAccount, now: DateTime<Utc>) -> Self {
        Self {
            id: UserId::new(),
            name: name.into(),
            ledger_account,
            total_donated: Money::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a confirmed amount to the running total.
    ///
    /// # Errors
    ///
    /// [`ImpactError::InconsistentState`] on overflow.
    pub fn credit(&self, amount: Money, now: DateTime<Utc>) -> Result<Self, ImpactError> {
        let total_donated = self.total_donated.checked_add(amount).ok_or_else(|| {
            ImpactError::inconsistent(format!("donor {}", self.id), "total_donated overflow")
        })?;
        Ok(Self {
            total_donated,
            updated_at: now,
            ..self.clone()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(capacity: u32) -> Event {
        Event::create(
            NewEvent {
                title: "Gala".to_string(),
                capacity,
                price_per_unit: Money::from_minor(2_000),
                donation_share: DonationShare::from_basis_points(1_000).unwrap(),
                cause: Cause::Health,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result = Event::create(
            NewEvent {
                title: "Empty".to_string(),
                capacity: 0,
                price_per_unit: Money::ZERO,
                donation_share: DonationShare::NONE,
                cause: Cause::Health,
            },
            Utc::now(),
        );
        assert!(matches!(result, Err(ImpactError::Validation(_))));
    }

    #[test]
    fn holds_never_exceed_capacity() {
        let now = Utc::now();
        let mut event = event(2);
        assert!(event.try_hold(now));
        assert!(event.try_hold(now));
        assert!(!event.try_hold(now));
        event.commit_hold(now);
        assert_eq!((event.issued, event.held, event.available()), (1, 1, 0));
        event.release_hold(now);
        assert_eq!(event.available(), 1);
    }

    #[test]
    fn donation_per_ticket_uses_share() {
        assert_eq!(event(1).donation_per_ticket(), Money::from_minor(200));
    }

    #[test]
    fn ticket_state_machine() {
        use TicketStatus::*;
        assert!(Reserved.can_transition_to(Minting));
        assert!(Minting.can_transition_to(Active));
        assert!(Minting.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Used));
        assert!(!Reserved.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Active.can_transition_to(Minting));
    }

    #[test]
    fn ticket_activation_records_receipt_and_serial() {
        let now = Utc::now();
        let event = event(1);
        let reservation = Reservation::hold(
            event.id,
            RequestId::parse("r1").unwrap(),
            now,
            now + chrono::Duration::minutes(15),
        );
        let ticket = Ticket::reserved(&reservation, UserId::new(), &event, now);
        assert!(ticket.activate(ReceiptId::new("rcpt"), 1, now).is_err());

        let minting = ticket.mark_minting(now).unwrap();
        assert_eq!(minting.submitted_at, Some(now));
        let active = minting.activate(ReceiptId::new("rcpt"), 7, now).unwrap();
        assert_eq!(active.status, TicketStatus::Active);
        assert_eq!(active.serial_number, Some(7));
        assert!(active.mark_minting(now).is_err());
    }

    #[test]
    fn verification_requires_confirmation_and_is_sticky() {
        let now = Utc::now();
        let donation = Donation::pending(
            UserId::new(),
            Cause::Education,
            Money::from_minor(100),
            SourceRef::parse("ref").unwrap(),
            LedgerAccount::parse("0.0.9").unwrap(),
            now,
        );
        let impact = ImpactRecord {
            author: "auditor".to_string(),
            description: "books delivered".to_string(),
            ..ImpactRecord::default()
        };
        assert!(matches!(
            donation.verify(impact.clone(), now),
            Err(ImpactError::Validation(_))
        ));

        let confirmed = donation.confirm(ReceiptId::new("t1"), now).unwrap();
        let verified = confirmed.verify(impact.clone(), now).unwrap().unwrap();
        assert!(verified.verified);
        assert!(verified.verify(impact, now).unwrap().is_none());
    }

    #[test]
    fn impact_envelope_is_validated() {
        let mut impact = ImpactRecord {
            author: "a".to_string(),
            description: "d".to_string(),
            ..ImpactRecord::default()
        };
        assert!(impact.validate().is_ok());
        impact.metrics.insert("ratio".to_string(), f64::NAN);
        assert!(impact.validate().is_err());
    }
}
