use anyhow::anyhow;
use chrono::Utc;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::ReservationEvent;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::store::CounterStore;

/// Terminal outcome of one pass through the hot path. Every variant maps to
/// exactly one HTTP reply in the API layer.
#[derive(Debug)]
pub enum OrderOutcome {
    Accepted { order_id: Uuid },
    Duplicate,
    SoldOut,
    Throttled,
    Invalid(&'static str),
}

#[derive(Debug, Error)]
pub enum OrderError {
    /// The counter store failed before any stock was taken. Fail-closed:
    /// admission or idempotency cannot be proven, so nothing is sold.
    #[error("counter store unavailable: {0}")]
    CounterStore(#[source] anyhow::Error),

    /// Stock was decremented but the reservation never reached the log.
    /// Not compensated in-line; the unit is surfaced for manual
    /// reconciliation.
    #[error("reservation {order_id} for {product_id} taken but not logged")]
    ReservedNotLogged {
        order_id: Uuid,
        product_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The order is reserved and logged but the idempotency marker was not
    /// set. A client retry within the window may reserve a second unit.
    #[error("idempotency marker not set for {order_id}")]
    MarkerNotSet {
        order_id: Uuid,
        #[source]
        source: anyhow::Error,
    },
}

/// Validation for the order operation. Admission has already run by the time
/// this is consulted, so a rejected request still counts against its bucket.
pub fn validate_order_input<'a>(
    product_id: &str,
    user_id: &str,
    token: Option<&'a str>,
) -> Result<&'a str, &'static str> {
    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => return Err("Missing Idempotency Key"),
    };
    if !shared::valid_token(token) {
        return Err("Invalid idempotency key");
    }
    if !shared::valid_id(product_id) {
        return Err("Invalid product id");
    }
    if !shared::valid_id(user_id) {
        return Err("Invalid user id");
    }
    Ok(token)
}

/// The ordered hot path: admission, validation, idempotency lookup, atomic
/// reservation, durable handoff, idempotency marking. Each step short-circuits;
/// the step order is load-bearing and must not be rearranged.
#[derive(Clone)]
pub struct OrderPipeline {
    store: CounterStore,
    producer: FutureProducer,
    topic: String,
    admission_cap: u32,
}

impl OrderPipeline {
    pub fn new(
        store: CounterStore,
        producer: FutureProducer,
        topic: String,
        admission_cap: u32,
    ) -> Self {
        Self {
            store,
            producer,
            topic,
            admission_cap,
        }
    }

    pub async fn place(
        &self,
        product_id: &str,
        user_id: &str,
        token: Option<&str>,
    ) -> Result<OrderOutcome, OrderError> {
        let bucket = Utc::now().timestamp();
        let admitted = self
            .store
            .admit(bucket, self.admission_cap)
            .await
            .map_err(OrderError::CounterStore)?;
        if !admitted {
            return Ok(OrderOutcome::Throttled);
        }

        let token = match validate_order_input(product_id, user_id, token) {
            Ok(token) => token,
            Err(msg) => return Ok(OrderOutcome::Invalid(msg)),
        };

        if self
            .store
            .idempotency_seen(token)
            .await
            .map_err(OrderError::CounterStore)?
        {
            return Ok(OrderOutcome::Duplicate);
        }

        if !self
            .store
            .try_reserve(product_id)
            .await
            .map_err(OrderError::CounterStore)?
        {
            return Ok(OrderOutcome::SoldOut);
        }

        // A unit of stock is now held. Any failure from here until the broker
        // ack leaves a reserved-but-not-logged unit that is only reported,
        // never compensated in-line.
        let event = ReservationEvent::new(product_id, user_id);
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                return Err(self.reserved_not_logged(event, anyhow!(e)));
            }
        };

        let record = FutureRecord::to(&self.topic)
            .key(&event.product_id)
            .payload(&payload);
        if let Err((e, _)) = self.producer.send(record, Duration::from_secs(5)).await {
            return Err(self.reserved_not_logged(event, anyhow!(e)));
        }

        if let Err(e) = self.store.mark_idempotency(token).await {
            warn!(
                order_id = %event.order_id,
                "idempotency marker not set; a retry of this token may reserve again"
            );
            return Err(OrderError::MarkerNotSet {
                order_id: event.order_id,
                source: e,
            });
        }

        Ok(OrderOutcome::Accepted {
            order_id: event.order_id,
        })
    }

    fn reserved_not_logged(&self, event: ReservationEvent, source: anyhow::Error) -> OrderError {
        error!(
            order_id = %event.order_id,
            product_id = %event.product_id,
            user_id = %event.user_id,
            timestamp = event.timestamp,
            error = %source,
            "stock decremented but reservation not logged; manual reconciliation required"
        );
        OrderError::ReservedNotLogged {
            order_id: event.order_id,
            product_id: event.product_id,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_is_rejected() {
        assert_eq!(
            validate_order_input("p", "u", None),
            Err("Missing Idempotency Key")
        );
        assert_eq!(
            validate_order_input("p", "u", Some("")),
            Err("Missing Idempotency Key")
        );
    }

    #[test]
    fn bad_ids_are_rejected() {
        assert_eq!(
            validate_order_input("", "u", Some("tok")),
            Err("Invalid product id")
        );
        assert_eq!(
            validate_order_input("p p", "u", Some("tok")),
            Err("Invalid product id")
        );
        assert_eq!(
            validate_order_input("p", "", Some("tok")),
            Err("Invalid user id")
        );
        let long = "x".repeat(shared::MAX_ID_LEN + 1);
        assert_eq!(
            validate_order_input(&long, "u", Some("tok")),
            Err("Invalid product id")
        );
    }

    #[test]
    fn oversized_token_is_rejected() {
        let long = "t".repeat(shared::MAX_TOKEN_LEN + 1);
        assert_eq!(
            validate_order_input("p", "u", Some(&long)),
            Err("Invalid idempotency key")
        );
    }

    #[test]
    fn valid_input_passes_through() {
        assert_eq!(
            validate_order_input("iphone-15", "user-1", Some("tok-1")),
            Ok("tok-1")
        );
    }
}
