//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::tus::TusService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    tus: TusService,
}

impl AppState {
    pub fn new(config: Config, tus: TusService) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, tus }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload engine
    pub fn tus(&self) -> &TusService {
        &self.inner.tus
    }
}
