use contractor_outbox::{
    Schedule, Scheduler, Transport,
    outbox::sqlx::PgOutbox,
    settings::Settings,
    telemetry,
    transport::rabbitmq::{RabbitMq, RabbitMqConfig},
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), tower::BoxError> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init(&settings.log)?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(&settings.database.url)
        .await?;
    let store = PgOutbox::try_new(pool).await?;

    let broker = RabbitMqConfig::from(settings.broker);
    tracing::info!(exchange = %broker.exchange, queue = %broker.queue, "Publishing to RabbitMQ");
    let transport = Transport::new(RabbitMq::new(broker));

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(error) => tracing::error!(%error, "Failed to listen for Ctrl-C"),
        }
        cancel_signal.cancel();
    });

    Scheduler::new(store, transport, Schedule::from(settings.schedule))
        .run(cancel)
        .await;
    Ok(())
}
