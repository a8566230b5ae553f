use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::MetadataDb;
use crate::jobs::JobBroker;
use crate::scraper::Scraper;
use crate::services::ServicePool;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<ServicePool>,
    pub broker: Arc<dyn JobBroker>,
    pub db: Arc<dyn MetadataDb>,
    pub scraper: Arc<dyn Scraper>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        services: Arc<ServicePool>,
        broker: Arc<dyn JobBroker>,
        db: Arc<dyn MetadataDb>,
        scraper: Arc<dyn Scraper>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            services,
            broker,
            db,
            scraper,
        }
    }
}
