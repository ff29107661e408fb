//! HTTP route handlers, annotated with `#[openapi]` so `rocket_okapi` can
//! derive the OpenAPI document.

pub mod admin;
pub mod health;
pub mod imports;
