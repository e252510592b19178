//! Shared application state handed to every axum handler via `with_state`.

use crate::config::Config;
use crate::hub::Hub;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub hub: Hub,
    pub config: std::sync::Arc<Config>,
}

impl AppState {
    pub fn new(store: Store, hub: Hub, config: Config) -> Self {
        Self {
            store,
            hub,
            config: std::sync::Arc::new(config),
        }
    }
}
