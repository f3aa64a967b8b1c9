//! HTTP surface: public status endpoints, the proxy gateway, and the
//! admin/observability endpoints over the event store.

mod admin;
mod auth;
mod gateway;
mod state;

pub mod routes;

pub use routes::serve;
pub use state::AppState;
