use common::cache::RedisPool;
use sqlx::PgPool;

use crate::service::OtpService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: OtpService,
    /// Checked by `/health` when the service runs against Postgres
    pub db_pool: Option<PgPool>,
    /// Checked by `/health` when the service runs against Redis
    pub redis_pool: Option<RedisPool>,
    /// Whether proxy headers may name the client address
    pub trust_forwarded_headers: bool,
}

impl AppState {
    pub fn new(service: OtpService) -> Self {
        Self {
            service,
            db_pool: None,
            redis_pool: None,
            trust_forwarded_headers: false,
        }
    }

    pub fn with_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    pub fn with_infrastructure(mut self, db_pool: PgPool, redis_pool: RedisPool) -> Self {
        self.db_pool = Some(db_pool);
        self.redis_pool = Some(redis_pool);
        self
    }
}
