use axum::Router;

use crate::state::AppState;

pub mod error_handling;
pub mod guards;
pub mod logging;

/// Layers applied to the whole router.
pub fn with_defaults(router: Router<AppState>) -> Router<AppState> {
    logging::add_tracing(router)
}
