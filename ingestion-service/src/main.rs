mod api;
mod pipeline;
mod store;

use anyhow::Result;
use clap::Parser;
use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use tracing::info;

#[derive(Parser)]
#[command(name = "ingestion-service")]
struct Args {
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    kafka_brokers: String,

    #[arg(long, default_value = shared::ORDERS_TOPIC)]
    orders_topic: String,

    /// Requests admitted per second before spillover to the waiting room.
    #[arg(long, env = "ADMISSION_CAP", default_value = "10000")]
    admission_cap: u32,

    #[arg(
        long,
        env = "WAITING_ROOM_URL",
        default_value = "http://localhost:8080/waiting-room"
    )]
    waiting_room_url: String,

    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let store = store::CounterStore::connect(&args.redis_url).await?;

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &args.kafka_brokers)
        .set("message.timeout.ms", "5000")
        .create()?;

    let pipeline = pipeline::OrderPipeline::new(
        store.clone(),
        producer,
        args.orders_topic.clone(),
        args.admission_cap,
    );

    let app_state = api::AppState {
        store,
        pipeline,
        waiting_room_url: args.waiting_room_url.clone(),
    };

    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!(
        port = args.port,
        orders_topic = %args.orders_topic,
        admission_cap = args.admission_cap,
        waiting_room_url = %args.waiting_room_url,
        "ingestion service started"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
