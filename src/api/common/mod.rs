//! Common API utilities shared across resources
//!
//! Response envelopes, the JSON extractor, list-query handling and the
//! authentication layer live here.

pub mod middleware;
pub mod query;
pub mod tracing;
pub mod utils;

use axum::extract::FromRequest;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::AppError;

/// `axum::Json` whose rejections are reported as [`AppError`] (400).
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message.into()),
        }
    }
}

/// Pagination metadata
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}

impl PaginationInfo {
    pub fn new(total: i64, page: u32, limit: u32) -> Self {
        let total_pages = ((total.max(0) as f64) / (limit.max(1) as f64)).ceil() as u32;
        Self {
            total,
            page,
            limit,
            total_pages,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub pagination: PaginationInfo,
}

impl<T> PaginatedResponse<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PaginatedResponse<U> {
        PaginatedResponse {
            data: self.data.into_iter().map(f).collect(),
            pagination: self.pagination,
        }
    }
}

/// Distinguishes an absent field from an explicit `null` in partial updates:
/// absent stays `None`, `null` becomes `Some(None)`.
pub fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_pages_rounds_up() {
        assert_eq!(PaginationInfo::new(41, 1, 20).total_pages, 3);
        assert_eq!(PaginationInfo::new(40, 1, 20).total_pages, 2);
        assert_eq!(PaginationInfo::new(0, 1, 20).total_pages, 0);
    }

    #[derive(Deserialize)]
    struct Patch {
        #[serde(default, deserialize_with = "deserialize_some")]
        category_id: Option<Option<i64>>,
    }

    #[test]
    fn explicit_null_is_kept_apart_from_absent() {
        let absent: Patch = serde_json::from_str("{}").unwrap();
        let null: Patch = serde_json::from_str(r#"{"category_id": null}"#).unwrap();
        let set: Patch = serde_json::from_str(r#"{"category_id": 4}"#).unwrap();
        assert_eq!(absent.category_id, None);
        assert_eq!(null.category_id, Some(None));
        assert_eq!(set.category_id, Some(Some(4)));
    }
}
