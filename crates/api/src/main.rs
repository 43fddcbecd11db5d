//! Doorlist API server entry point

use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use doorlist_api::{routes, AppState, Config};
use doorlist_billing::{BillingService, PriceIds, StripeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "doorlist_api=info,doorlist_billing=info,doorlist_tickets=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;

    let pool = doorlist_shared::db::create_pool(&config.database_url).await?;

    let migration_pool = doorlist_shared::db::create_migration_pool(&config.database_url).await?;
    doorlist_shared::db::run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let stripe_config = StripeConfig {
        secret_key: config.stripe_secret_key.clone(),
        webhook_secret: config.stripe_webhook_secret.clone(),
        price_ids: PriceIds {
            standard: config.stripe_price_standard.clone(),
            plus: config.stripe_price_plus.clone(),
            elite: config.stripe_price_elite.clone(),
        },
        app_base_url: config.public_url.clone(),
        trial_period_days: doorlist_billing::DEFAULT_TRIAL_PERIOD_DAYS,
    };
    let billing = BillingService::new(stripe_config, pool.clone());

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, pool, billing);

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(bind_address = %bind_address, "Doorlist API listening");

    axum::serve(listener, app).await?;

    Ok(())
}
