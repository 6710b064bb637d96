use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");

    let families: [fn(&mut AppState, &Request) -> Option<serde_json::Value>; 15] = [
        handlers::core::try_handle,
        handlers::schools::try_handle,
        handlers::users::try_handle,
        handlers::classes::try_handle,
        handlers::students::try_handle,
        handlers::employees::try_handle,
        handlers::attendance::try_handle,
        handlers::fees::try_handle,
        handlers::accounts::try_handle,
        handlers::inventory::try_handle,
        handlers::payroll::try_handle,
        handlers::messages::try_handle,
        handlers::calendar::try_handle,
        handlers::reports::try_handle,
        handlers::backup::try_handle,
    ];
    for try_handle in families {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
