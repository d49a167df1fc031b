//! API Version 1 endpoints
//!
//! One module per resource; `routes` wires them under `/api/v1`.

pub mod auth;
pub mod categories;
pub mod courses;
pub mod enrollments;
pub mod lessons;
pub mod profiles;
pub mod progress;
pub mod reviews;
pub mod routes;
pub mod users;
