mod health;
mod keys;
mod shares;
mod workspace;

use axum::{middleware, Router};

use crate::auth::require_user;
use crate::AppState;

/// Create the API router
pub fn router(state: AppState) -> Router<AppState> {
    let authenticated = Router::new()
        .merge(workspace::router())
        .merge(shares::router())
        .merge(keys::router())
        .layer(middleware::from_fn_with_state(state, require_user));

    Router::new().merge(authenticated).merge(health::router())
}
