use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use common::cache::{RedisConfig, RedisPool};
use common::database::{self, DatabaseConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use otp_auth::clock::{Clock, SystemClock};
use otp_auth::delivery::{CodeSender, LogSender, TwilioSender};
use otp_auth::hashing::CodeHasher;
use otp_auth::identity::{IdentityStore, PgIdentityStore};
use otp_auth::issuer::OtpIssuer;
use otp_auth::jwt::{JwtConfig, JwtService};
use otp_auth::rate_limiter::{RateLimiter, RedisWindowCounter};
use otp_auth::session::SessionIssuer;
use otp_auth::settings::Settings;
use otp_auth::store::{CodeStore, PgCodeStore};
use otp_auth::verifier::OtpVerifier;
use otp_auth::{AppState, OtpService, cleanup, routes};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting OTP authentication service");

    let settings = Settings::load()?;

    // Initialize database connection pool
    let db_config = DatabaseConfig::from_env()?;
    let pool = database::init_pool(&db_config).await?;

    // Check database connectivity
    if database::health_check(&pool).await? {
        info!("Database connection successful");
    } else {
        anyhow::bail!("Failed to connect to database");
    }

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied");

    // Initialize Redis connection
    let redis_pool = RedisPool::new(&RedisConfig::from_env()).await?;

    // Initialize JWT service
    let jwt_service = JwtService::new(JwtConfig::from_env()?)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hasher = CodeHasher::new(settings.otp.hash_key.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid OTP hash key: {}", e))?;
    let store: Arc<dyn CodeStore> = Arc::new(PgCodeStore::new(pool.clone()));
    let identities: Arc<dyn IdentityStore> = Arc::new(PgIdentityStore::new(pool.clone()));

    let sender: Arc<dyn CodeSender> = match settings.twilio_options() {
        Some(options) => {
            info!("Delivering codes through Twilio ({:?})", options.channel);
            Arc::new(TwilioSender::new(options, settings.message_template())?)
        }
        None => {
            warn!("Log delivery selected: codes will not reach any phone");
            Arc::new(LogSender)
        }
    };

    let limiter = RateLimiter::new(
        settings.rate_limiter_config(),
        Arc::new(RedisWindowCounter::new(redis_pool.clone())),
    );
    let issuer = OtpIssuer::new(
        store.clone(),
        sender,
        hasher.clone(),
        clock.clone(),
        settings.code_ttl(),
        settings.delivery.on_failure,
    );
    let verifier = OtpVerifier::new(
        store.clone(),
        hasher,
        clock.clone(),
        settings.otp.max_attempts,
    );
    let sessions = SessionIssuer::new(
        identities.clone(),
        Arc::new(jwt_service),
        clock.clone(),
        settings.session_ttl(),
    );
    let service = OtpService::new(limiter, issuer, verifier, sessions, identities, store, clock)
        .with_region_hint(settings.otp.region_hint);

    let mut scheduler = cleanup::start_cleanup(service.clone(), &settings.cleanup.schedule).await?;

    if settings.server.trust_forwarded_headers {
        info!("Client addresses taken from proxy headers");
    }
    let state = AppState::new(service)
        .with_infrastructure(pool, redis_pool)
        .with_forwarded_headers(settings.server.trust_forwarded_headers);
    let app = routes::create_router(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("OTP authentication service listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
        }
    })
    .await?;

    info!("Shutting down OTP authentication service");
    scheduler.shutdown().await?;

    Ok(())
}
