// Export route modules
pub mod chat;
pub mod health;
pub mod ws;

use crate::state::AppState;
use axum::Router;

// Function to configure all routes
pub fn configure(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(chat::routes(state.clone()))
        .merge(ws::routes(state))
}
