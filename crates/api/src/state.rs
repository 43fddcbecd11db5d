//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use doorlist_billing::BillingService;
use doorlist_tickets::{CheckInService, InventoryGuard};

use crate::config::Config;

/// State shared across request handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub billing: Arc<BillingService>,
    pub checkin: Arc<CheckInService>,
    pub inventory: Arc<InventoryGuard>,
}

impl AppState {
    pub fn new(config: Config, pool: PgPool, billing: BillingService) -> Self {
        Self {
            config: Arc::new(config),
            checkin: Arc::new(CheckInService::new(pool.clone())),
            inventory: Arc::new(InventoryGuard::new(pool.clone())),
            billing: Arc::new(billing),
            pool,
        }
    }
}
