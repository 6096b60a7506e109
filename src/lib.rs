//! capstore — capability token store, identity model and migration engine.
//!
//! Re-exports modules needed by the binary and by integration tests in `tests/`.

pub mod api;
pub mod cli;
pub mod config;
pub mod errors;
pub mod identity;
pub mod jobs;
pub mod migrations;
pub mod models;
pub mod store;
pub mod tokens;
pub mod vault;

use identity::AccountService;
use store::SharedStore;
use tokens::TokenStore;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: config::Config,
    pub store: SharedStore,
    pub tokens: TokenStore,
    pub accounts: AccountService,
}

impl AppState {
    pub fn new(config: config::Config, store: SharedStore) -> Self {
        Self {
            tokens: TokenStore::new(store.clone()),
            accounts: AccountService::new(store.clone(), config.profile.clone()),
            store,
            config,
        }
    }
}
