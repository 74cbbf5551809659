use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use shared::ReservationEvent;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::{error, info, warn};

use crate::models::NewOrder;
use crate::schema::{orders, products};

type DbPool = Pool<AsyncPgConnection>;

const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FulfillError {
    /// The durable row had no stock left although the counter store accepted
    /// the sale. The transaction is rolled back and the message retried; a
    /// persistent divergence needs an operator.
    #[error("durable stock exhausted for product {0} while the counter accepted the sale")]
    Divergence(String),

    /// The order row already exists: this message is a redelivery of work
    /// that already committed. Signals rollback of the duplicate decrement.
    #[error("order {0} already persisted")]
    AlreadyPersisted(String),

    #[error("database: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool: {0}")]
    Pool(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Persisted {
    Inserted,
    Duplicate,
}

/// Write one reservation into the record of truth: conditional stock
/// decrement plus order insert, in a single transaction. A unique-key
/// conflict on the insert rolls the decrement back and reports `Duplicate`,
/// so replaying a message any number of times nets exactly one row and one
/// decrement.
pub async fn persist_reservation(
    conn: &mut AsyncPgConnection,
    event: &ReservationEvent,
) -> Result<Persisted, FulfillError> {
    let product_id = event.product_id.clone();
    let new_order = NewOrder {
        id: event.order_id.to_string(),
        product_id: event.product_id.clone(),
        user_id: event.user_id.clone(),
    };

    let result = conn
        .transaction::<_, FulfillError, _>(|conn| {
            Box::pin(async move {
                let updated = diesel::update(
                    products::table
                        .filter(products::id.eq(&product_id))
                        .filter(products::stock.gt(0)),
                )
                .set(products::stock.eq(products::stock - 1))
                .execute(conn)
                .await?;

                if updated == 0 {
                    return Err(FulfillError::Divergence(product_id));
                }

                match diesel::insert_into(orders::table)
                    .values(&new_order)
                    .execute(conn)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(diesel::result::Error::DatabaseError(
                        DatabaseErrorKind::UniqueViolation,
                        _,
                    )) => Err(FulfillError::AlreadyPersisted(new_order.id.clone())),
                    Err(e) => Err(e.into()),
                }
            })
        })
        .await;

    match result {
        Ok(()) => Ok(Persisted::Inserted),
        Err(FulfillError::AlreadyPersisted(order_id)) => {
            info!(%order_id, "redelivered reservation already persisted, decrement rolled back");
            Ok(Persisted::Duplicate)
        }
        Err(e) => Err(e),
    }
}

pub struct FulfillmentHandler {
    pool: DbPool,
    producer: FutureProducer,
    dlq_topic: String,
    dlq_after: u32,
}

impl FulfillmentHandler {
    pub fn new(pool: DbPool, producer: FutureProducer, dlq_topic: String, dlq_after: u32) -> Self {
        Self {
            pool,
            producer,
            dlq_topic,
            dlq_after,
        }
    }

    /// Consume the orders topic. The offset of a message is committed only
    /// after its transaction has committed (or the message was recognized as
    /// a redelivery or poison), so a crash replays at most the in-flight
    /// message. Messages within a partition are processed strictly in order;
    /// a failing message is retried in place rather than skipped.
    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            let m = match message {
                Ok(m) => m,
                Err(e) => {
                    error!("Error receiving message: {}", e);
                    continue;
                }
            };

            let payload = match m.payload_view::<str>() {
                Some(Ok(payload)) => payload,
                _ => {
                    error!(
                        partition = m.partition(),
                        offset = m.offset(),
                        "poison message without UTF-8 payload, skipping"
                    );
                    self.commit(&consumer, &m);
                    continue;
                }
            };

            let event = match serde_json::from_str::<ReservationEvent>(payload) {
                Ok(event) => event,
                Err(e) => {
                    error!(
                        partition = m.partition(),
                        offset = m.offset(),
                        error = %e,
                        "poison message, cannot parse reservation envelope, skipping"
                    );
                    self.commit(&consumer, &m);
                    continue;
                }
            };

            self.process_until_settled(&event, payload).await;
            self.commit(&consumer, &m);
        }
    }

    /// Drive one reservation to a terminal state: persisted, recognized as a
    /// redelivery, or dead-lettered after repeated divergence. Transient
    /// database failures retry indefinitely; the partition waits.
    async fn process_until_settled(&self, event: &ReservationEvent, payload: &str) {
        let mut divergence_attempts = 0u32;

        loop {
            let result = match self.pool.get().await {
                Ok(mut conn) => persist_reservation(&mut conn, event).await,
                Err(e) => Err(FulfillError::Pool(e.to_string())),
            };

            match result {
                Ok(Persisted::Inserted) => {
                    info!(
                        order_id = %event.order_id,
                        product_id = %event.product_id,
                        "order persisted"
                    );
                    return;
                }
                Ok(Persisted::Duplicate) => return,
                Err(FulfillError::Divergence(product_id)) => {
                    divergence_attempts += 1;
                    error!(
                        order_id = %event.order_id,
                        product_id = %product_id,
                        user_id = %event.user_id,
                        timestamp = event.timestamp,
                        attempt = divergence_attempts,
                        "stock divergence: durable store is out of stock for an accepted reservation"
                    );
                    if divergence_attempts >= self.dlq_after {
                        if self.send_to_dlq(event, payload).await {
                            return;
                        }
                    }
                    time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(
                        order_id = %event.order_id,
                        error = %e,
                        "transient failure persisting reservation, will retry"
                    );
                    time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn send_to_dlq(&self, event: &ReservationEvent, payload: &str) -> bool {
        let record = FutureRecord::to(&self.dlq_topic)
            .key(&event.product_id)
            .payload(payload);

        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok(_) => {
                error!(
                    order_id = %event.order_id,
                    product_id = %event.product_id,
                    dlq_topic = %self.dlq_topic,
                    "reservation routed to dead letter topic after repeated divergence"
                );
                true
            }
            Err((e, _)) => {
                error!(
                    order_id = %event.order_id,
                    error = %e,
                    "failed to dead-letter reservation, will keep retrying"
                );
                false
            }
        }
    }

    fn commit(&self, consumer: &StreamConsumer, m: &rdkafka::message::BorrowedMessage<'_>) {
        if let Err(e) = consumer.commit_message(m, CommitMode::Async) {
            error!("Error committing message: {}", e);
        }
    }
}
