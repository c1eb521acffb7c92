//! Inventory allocator.
//!
//! Grants and denies reservation slots for an event. The capacity check and the
//! slot increment happen inside one store operation, so the allocator never holds
//! anything across network I/O and the "last seat" race cannot oversell.

use crate::metrics;
use impact_core::ImpactError;
use impact_core::environment::Clock;
use impact_core::error::StoreError;
use impact_core::records::{Availability, Event, NewEvent, Reservation};
use impact_core::store::{InventoryStore, ReserveOutcome, Transition};
use impact_core::types::{EventId, RequestId, ReservationId};
use std::sync::Arc;

/// Owns every change to an event's `held` and `issued` counters.
#[derive(Clone)]
pub struct InventoryAllocator {
    store: Arc<dyn InventoryStore>,
    clock: Arc<dyn Clock>,
    reservation_timeout: chrono::Duration,
}

impl InventoryAllocator {
    /// Create an allocator whose reservations expire after `reservation_timeout`.
    #[must_use]
    pub fn new(
        store: Arc<dyn InventoryStore>,
        clock: Arc<dyn Clock>,
        reservation_timeout: chrono::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            reservation_timeout,
        }
    }

    /// Register a new event with all of its capacity available.
    ///
    /// # Errors
    ///
    /// [`ImpactError::Validation`] for a zero capacity or a blank title.
    pub async fn register_event(&self, input: NewEvent) -> Result<Event, ImpactError> {
        let event = Event::create(input, self.clock.now())?;
        self.store.insert_event(event.clone()).await?;
        metrics::record_availability(&event.availability());
        tracing::info!(event_id = %event.id, capacity = event.capacity, "Event registered");
        Ok(event)
    }

    /// Hold one slot of `event_id` for `request_id`.
    ///
    /// Repeating a request returns the original reservation, whatever its status,
    /// or the original denial. No capacity is consumed by a repeat.
    ///
    /// # Errors
    ///
    /// - [`ImpactError::NotFound`] for an unknown event
    /// - [`ImpactError::CapacityExceeded`] when the event was full at the first attempt
    #[tracing::instrument(skip_all, fields(event_id = %event_id, request_id = %request_id))]
    pub async fn reserve(
        &self,
        event_id: EventId,
        request_id: RequestId,
    ) -> Result<Reservation, ImpactError> {
        let now = self.clock.now();
        let outcome = self
            .store
            .reserve(event_id, request_id, now, now + self.reservation_timeout)
            .await?;

        match outcome {
            ReserveOutcome::Granted { reservation, fresh } => {
                metrics::record_reservation(if fresh { "granted" } else { "replayed" });
                if fresh {
                    tracing::debug!(reservation_id = %reservation.id, "Slot held");
                    self.publish_availability(event_id).await;
                }
                Ok(reservation)
            }
            ReserveOutcome::Denied => {
                metrics::record_reservation("denied");
                tracing::debug!("Event is full");
                Err(ImpactError::CapacityExceeded {
                    event_id: event_id.to_string(),
                })
            }
            ReserveOutcome::EventNotFound => Err(ImpactError::not_found("event", event_id)),
        }
    }

    /// Return a held slot to the pool. Idempotent; a committed or already
    /// released reservation is returned unchanged.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown reservation.
    pub async fn release(&self, reservation_id: ReservationId) -> Result<Reservation, ImpactError> {
        let transition = self
            .store
            .release_reservation(reservation_id, self.clock.now())
            .await?
            .ok_or_else(|| ImpactError::not_found("reservation", reservation_id))?;
        Ok(self.settled(transition, "released").await)
    }

    /// `Held → Committed`, bumping `issued`.
    ///
    /// Only called once the mint backing the reservation is confirmed, so a
    /// reservation the sweep already released is reclaimed rather than refused.
    ///
    /// # Errors
    ///
    /// - [`ImpactError::NotFound`] for an unknown reservation
    /// - [`ImpactError::InconsistentState`] when a released slot cannot be
    ///   reclaimed because the event sold out in the meantime
    pub(crate) async fn commit(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Reservation, ImpactError> {
        let transition = self
            .store
            .commit_reservation(reservation_id, self.clock.now())
            .await
            .map_err(|err| match err {
                StoreError::Conflict(detail) => {
                    ImpactError::inconsistent(format!("reservation {reservation_id}"), detail)
                }
                other => ImpactError::Storage(other),
            })?
            .ok_or_else(|| ImpactError::not_found("reservation", reservation_id))?;
        Ok(self.settled(transition, "committed").await)
    }

    async fn settled(&self, transition: Transition<Reservation>, verb: &str) -> Reservation {
        let applied = transition.is_applied();
        let reservation = transition.into_inner();
        if applied {
            tracing::debug!(reservation_id = %reservation.id, "Reservation {verb}");
            self.publish_availability(reservation.event_id).await;
        }
        reservation
    }

    /// Load a reservation.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown reservation.
    pub async fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Reservation, ImpactError> {
        self.store
            .reservation(reservation_id)
            .await?
            .ok_or_else(|| ImpactError::not_found("reservation", reservation_id))
    }

    /// Load an event with its counters.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown event.
    pub async fn event(&self, event_id: EventId) -> Result<Event, ImpactError> {
        self.store
            .event(event_id)
            .await?
            .ok_or_else(|| ImpactError::not_found("event", event_id))
    }

    /// Capacity, issued, held and available counts of an event.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown event.
    pub async fn availability(&self, event_id: EventId) -> Result<Availability, ImpactError> {
        let availability = self.event(event_id).await?.availability();
        metrics::record_availability(&availability);
        Ok(availability)
    }

    async fn publish_availability(&self, event_id: EventId) {
        if let Ok(Some(event)) = self.store.event(event_id).await {
            metrics::record_availability(&event.availability());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use impact_core::records::ReservationStatus;
    use impact_core::types::{Cause, DonationShare, Money};
    use impact_testing::{InMemoryStore, test_clock};

    fn allocator() -> InventoryAllocator {
        InventoryAllocator::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(test_clock()),
            chrono::Duration::minutes(15),
        )
    }

    async fn event(allocator: &InventoryAllocator, capacity: u32) -> Event {
        allocator
            .register_event(NewEvent {
                title: "Gala".to_string(),
                capacity,
                price_per_unit: Money::from_minor(1_000),
                donation_share: DonationShare::NONE,
                cause: Cause::Health,
            })
            .await
            .unwrap()
    }

    fn request(raw: &str) -> RequestId {
        RequestId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn reservations_expire_after_the_timeout() {
        let allocator = allocator();
        let event = event(&allocator, 1).await;
        let reservation = allocator.reserve(event.id, request("a")).await.unwrap();
        assert_eq!(
            reservation.expires_at - reservation.created_at,
            chrono::Duration::minutes(15)
        );
    }

    #[tokio::test]
    async fn full_events_deny_and_keep_denying() {
        let allocator = allocator();
        let event = event(&allocator, 1).await;
        allocator.reserve(event.id, request("a")).await.unwrap();

        let err = allocator.reserve(event.id, request("b")).await.unwrap_err();
        assert!(matches!(err, ImpactError::CapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn release_returns_capacity_once() {
        let allocator = allocator();
        let event = event(&allocator, 1).await;
        let reservation = allocator.reserve(event.id, request("a")).await.unwrap();

        let released = allocator.release(reservation.id).await.unwrap();
        assert_eq!(released.status, ReservationStatus::Released);
        allocator.release(reservation.id).await.unwrap();

        let availability = allocator.availability(event.id).await.unwrap();
        assert_eq!((availability.held, availability.available), (0, 1));
    }

    #[tokio::test]
    async fn commit_moves_the_slot_to_issued() {
        let allocator = allocator();
        let event = event(&allocator, 2).await;
        let reservation = allocator.reserve(event.id, request("a")).await.unwrap();

        allocator.commit(reservation.id).await.unwrap();
        allocator.commit(reservation.id).await.unwrap();
        // Committed reservations are not released.
        allocator.release(reservation.id).await.unwrap();

        let availability = allocator.availability(event.id).await.unwrap();
        assert_eq!((availability.issued, availability.held), (1, 0));
    }

    #[tokio::test]
    async fn unknown_records_are_not_found() {
        let allocator = allocator();
        assert!(matches!(
            allocator.reserve(EventId::new(), request("a")).await,
            Err(ImpactError::NotFound { kind: "event", .. })
        ));
        assert!(matches!(
            allocator.release(ReservationId::new()).await,
            Err(ImpactError::NotFound { kind: "reservation", .. })
        ));
    }
}
