//! Value objects shared by every record.
//!
//! Identifiers are UUID newtypes. Client-supplied keys (`RequestId`, `SourceRef`)
//! are validated strings because callers choose them. Amounts are integer minor
//! units so that donation arithmetic never touches floating point.

use crate::error::ImpactError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an event
    EventId
);
uuid_id!(
    /// Unique identifier for a reservation
    ReservationId
);
uuid_id!(
    /// Unique identifier for a ticket
    TicketId
);
uuid_id!(
    /// Unique identifier for a donation
    DonationId
);
uuid_id!(
    /// Unique identifier for a user (buyer and donor)
    UserId
);

/// Longest client-supplied key we accept.
pub const MAX_KEY_LEN: usize = 128;

fn validate_key(kind: &str, raw: &str) -> Result<(), ImpactError> {
    if raw.trim().is_empty() {
        return Err(ImpactError::Validation(format!("{kind} must not be empty")));
    }
    if raw.len() > MAX_KEY_LEN {
        return Err(ImpactError::Validation(format!(
            "{kind} must be at most {MAX_KEY_LEN} characters"
        )));
    }
    Ok(())
}

/// Client-supplied idempotency key for a purchase.
///
/// Scoped per event: the same `RequestId` on two events is two requests.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(String);

impl RequestId {
    /// Parse a request id.
    ///
    /// # Errors
    ///
    /// Returns [`ImpactError::Validation`] for empty or oversized keys.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ImpactError> {
        let raw = raw.into();
        validate_key("request id", &raw)?;
        Ok(Self(raw))
    }

    /// Borrow the key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RequestId {
    type Error = ImpactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RequestId> for String {
    fn from(value: RequestId) -> Self {
        value.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied reference identifying where a donation came from.
///
/// Unique across all donations; it doubles as the transfer idempotency key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceRef(String);

impl SourceRef {
    /// Parse a source reference.
    ///
    /// # Errors
    ///
    /// Returns [`ImpactError::Validation`] for empty or oversized references.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ImpactError> {
        let raw = raw.into();
        validate_key("source ref", &raw)?;
        Ok(Self(raw))
    }

    /// Source reference of the donation split implied by a ticket sale.
    #[must_use]
    pub fn for_ticket(ticket_id: TicketId) -> Self {
        Self(format!("ticket:{ticket_id}"))
    }

    /// Borrow the reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SourceRef {
    type Error = ImpactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SourceRef> for String {
    fn from(value: SourceRef) -> Self {
        value.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An account on the external ledger (e.g. `0.0.123456`).
///
/// The format is the ledger client's business; we only require it to be present.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LedgerAccount(String);

impl LedgerAccount {
    /// Parse a ledger account.
    ///
    /// # Errors
    ///
    /// Returns [`ImpactError::Validation`] if the account is blank.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ImpactError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(ImpactError::Validation(
                "ledger account must not be empty".to_string(),
            ));
        }
        Ok(Self(raw))
    }

    /// Borrow the account string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LedgerAccount {
    type Error = ImpactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<LedgerAccount> for String {
    fn from(value: LedgerAccount) -> Self {
        value.0
    }
}

impl fmt::Display for LedgerAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Money Value Object (minor units to avoid floating point errors)
// ============================================================================

/// An amount of the ledger's currency in minor units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from minor units
    #[must_use]
    pub const fn from_minor(units: u64) -> Self {
        Self(units)
    }

    /// Returns the amount in minor units
    #[must_use]
    pub const fn minor(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fraction of each sale redirected to the event's cause, in basis points.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct DonationShare(u16);

impl DonationShare {
    /// 100%
    pub const WHOLE: u16 = 10_000;

    /// No donation split
    pub const NONE: Self = Self(0);

    /// Create a share from basis points (`0..=10_000`).
    ///
    /// # Errors
    ///
    /// Returns [`ImpactError::Validation`] above 10 000 basis points.
    pub fn from_basis_points(bps: u16) -> Result<Self, ImpactError> {
        if bps > Self::WHOLE {
            return Err(ImpactError::Validation(format!(
                "donation share must be between 0 and {} basis points, got {bps}",
                Self::WHOLE
            )));
        }
        Ok(Self(bps))
    }

    /// The share in basis points
    #[must_use]
    pub const fn basis_points(&self) -> u16 {
        self.0
    }

    /// The donated part of `price`, rounded down to whole minor units.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // result never exceeds `price`
    pub const fn of(&self, price: Money) -> Money {
        let donated = (price.0 as u128 * self.0 as u128) / Self::WHOLE as u128;
        Money(donated as u64)
    }
}

impl TryFrom<u16> for DonationShare {
    type Error = ImpactError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::from_basis_points(value)
    }
}

impl From<DonationShare> for u16 {
    fn from(value: DonationShare) -> Self {
        value.0
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Cause a donation is directed toward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Cause {
    /// Health care (default)
    #[default]
    Health,
    /// Education
    Education,
    /// Environment
    Environment,
    /// Community
    Community,
}

impl Cause {
    /// Every cause, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::Health,
        Self::Education,
        Self::Environment,
        Self::Community,
    ];

    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Health => "Health",
            Self::Education => "Education",
            Self::Environment => "Environment",
            Self::Community => "Community",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`ImpactError::Validation`] for unknown causes.
    pub fn parse(s: &str) -> Result<Self, ImpactError> {
        Self::ALL
            .into_iter()
            .find(|cause| cause.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ImpactError::Validation(format!("unknown cause: {s}")))
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission tier printed on a ticket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketKind {
    /// General admission (default)
    #[default]
    Standard,
    /// VIP
    Vip,
    /// Premium
    Premium,
}

impl TicketKind {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Vip => "vip",
            Self::Premium => "premium",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`ImpactError::Validation`] for unknown kinds.
    pub fn parse(s: &str) -> Result<Self, ImpactError> {
        match s {
            "standard" => Ok(Self::Standard),
            "vip" => Ok(Self::Vip),
            "premium" => Ok(Self::Premium),
            _ => Err(ImpactError::Validation(format!("unknown ticket kind: {s}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn donation_share_rounds_down() {
        let share = DonationShare::from_basis_points(1_250).unwrap();
        assert_eq!(share.of(Money::from_minor(1_000)), Money::from_minor(125));
        assert_eq!(share.of(Money::from_minor(7)), Money::ZERO);
    }

    #[test]
    fn donation_share_rejects_more_than_whole() {
        assert!(matches!(
            DonationShare::from_basis_points(10_001),
            Err(ImpactError::Validation(_))
        ));
    }

    #[test]
    fn keys_are_validated() {
        assert!(RequestId::parse("").is_err());
        assert!(RequestId::parse("   ").is_err());
        assert!(RequestId::parse("x".repeat(MAX_KEY_LEN + 1)).is_err());
        assert_eq!(RequestId::parse("req-1").unwrap().as_str(), "req-1");
        assert!(SourceRef::parse("").is_err());
        assert!(LedgerAccount::parse("").is_err());
    }

    #[test]
    fn request_id_deserialization_validates() {
        let parsed: Result<RequestId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
        let parsed: RequestId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(parsed.as_str(), "abc");
    }

    #[test]
    fn cause_parse_is_case_insensitive() {
        assert_eq!(Cause::parse("health").unwrap(), Cause::Health);
        assert_eq!(Cause::parse("Community").unwrap(), Cause::Community);
        assert!(Cause::parse("Sports").is_err());
    }

    proptest! {
        #[test]
        fn donated_part_never_exceeds_price(price in any::<u64>(), bps in 0u16..=10_000) {
            let share = DonationShare::from_basis_points(bps).unwrap();
            prop_assert!(share.of(Money::from_minor(price)) <= Money::from_minor(price));
        }
    }
}
