//! Search, filtering, ordering and pagination for list endpoints.
//!
//! Each resource describes what it allows with a static [`ListRules`]; the
//! raw query string is parsed against it into a [`ListQuery`] which then
//! appends its clauses to a `QueryBuilder`. Only expressions named in the
//! rules are spliced into SQL, every user value is bound.

use std::collections::HashMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::api::common::utils::timeout_query;
use crate::api::common::{PaginatedResponse, PaginationInfo};
use crate::errors::AppError;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy)]
pub enum FilterKind {
    Integer,
    Boolean,
    Text,
}

#[derive(Debug)]
pub struct FilterField {
    pub param: &'static str,
    pub column: &'static str,
    pub kind: FilterKind,
}

#[derive(Debug)]
pub struct ListRules {
    pub search_columns: &'static [&'static str],
    /// `(query name, SQL expression)` pairs accepted by `ordering`.
    pub ordering_fields: &'static [(&'static str, &'static str)],
    pub filters: &'static [FilterField],
    /// Appended after any requested ordering so pages are stable.
    pub default_ordering: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
enum FilterValue {
    Integer(i64),
    Boolean(bool),
    Text(String),
}

/// Row visibility for the caller, applied before any user filter.
#[derive(Debug, Clone)]
pub enum Scope {
    Everything,
    /// Rows where at least one of `columns` equals `user_id`.
    Related {
        columns: &'static [&'static str],
        user_id: i64,
    },
    /// Published rows, plus unpublished ones where the viewer is in any of `owners`.
    Published {
        flag: &'static str,
        owners: &'static [&'static str],
        viewer: Option<i64>,
    },
}

impl Scope {
    fn push(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            Scope::Everything => {}
            Scope::Related { columns, user_id } => {
                qb.push(" AND (");
                for (index, column) in columns.iter().enumerate() {
                    if index > 0 {
                        qb.push(" OR ");
                    }
                    qb.push(*column).push(" = ").push_bind(*user_id);
                }
                qb.push(")");
            }
            Scope::Published { flag, owners, viewer } => match viewer {
                Some(user_id) => {
                    qb.push(" AND (").push(*flag).push(" = 1");
                    for owner in owners.iter() {
                        qb.push(" OR ").push(*owner).push(" = ").push_bind(*user_id);
                    }
                    qb.push(")");
                }
                None => {
                    qb.push(" AND ").push(*flag).push(" = 1");
                }
            },
        }
    }
}

#[derive(Debug)]
pub struct ListQuery {
    pub page: u32,
    pub limit: u32,
    search: Option<String>,
    ordering: Vec<(&'static str, bool)>,
    filters: Vec<(&'static str, FilterValue)>,
    rules: &'static ListRules,
}

impl ListQuery {
    pub fn parse(
        params: &HashMap<String, String>,
        rules: &'static ListRules,
    ) -> Result<Self, AppError> {
        let mut errors: HashMap<String, Vec<String>> = HashMap::new();

        let mut number = |name: &str, default: u32| -> u32 {
            match params.get(name).map(|raw| raw.trim()) {
                None | Some("") => default,
                Some(raw) => raw.parse::<u32>().unwrap_or_else(|_| {
                    errors
                        .entry(name.to_string())
                        .or_default()
                        .push("A valid integer is required.".to_string());
                    default
                }),
            }
        };
        let page = number("page", 1).max(1);
        let limit = number("limit", DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let search = params
            .get("search")
            .map(|term| term.trim().to_string())
            .filter(|term| !term.is_empty());

        let mut ordering: Vec<(&'static str, bool)> = Vec::new();
        if let Some(raw) = params.get("ordering") {
            for term in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let (name, descending) = match term.strip_prefix('-') {
                    Some(name) => (name, true),
                    None => (term, false),
                };
                let known = rules
                    .ordering_fields
                    .iter()
                    .find(|(field, _)| *field == name)
                    .map(|(_, expression)| *expression);
                match known {
                    Some(expression) if !ordering.iter().any(|(e, _)| *e == expression) => {
                        ordering.push((expression, descending));
                    }
                    Some(_) => {}
                    None => tracing::debug!("Ignoring unknown ordering field: {}", name),
                }
            }
        }

        let mut filters = Vec::new();
        for field in rules.filters {
            let Some(raw) = params.get(field.param).map(|raw| raw.trim()) else {
                continue;
            };
            if raw.is_empty() {
                continue;
            }
            match parse_filter(field.kind, raw) {
                Some(value) => filters.push((field.column, value)),
                None => errors
                    .entry(field.param.to_string())
                    .or_default()
                    .push(match field.kind {
                        FilterKind::Integer => "Enter a whole number.".to_string(),
                        FilterKind::Boolean => "Select a valid choice.".to_string(),
                        FilterKind::Text => "Enter a valid value.".to_string(),
                    }),
            }
        }

        if !errors.is_empty() {
            return Err(AppError::ValidationErrors(errors));
        }

        Ok(ListQuery {
            page,
            limit,
            search,
            ordering,
            filters,
            rules,
        })
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.limit as i64
    }

    fn push_filters(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        for (column, value) in &self.filters {
            qb.push(" AND ").push(*column).push(" = ");
            match value {
                FilterValue::Integer(v) => {
                    qb.push_bind(*v);
                }
                FilterValue::Boolean(v) => {
                    qb.push_bind(*v);
                }
                FilterValue::Text(v) => {
                    qb.push_bind(v.clone());
                }
            }
        }

        if let Some(term) = &self.search {
            if self.rules.search_columns.is_empty() {
                return;
            }
            let pattern = format!("%{}%", escape_like(term));
            qb.push(" AND (");
            for (index, column) in self.rules.search_columns.iter().enumerate() {
                if index > 0 {
                    qb.push(" OR ");
                }
                qb.push(*column)
                    .push(" LIKE ")
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\'");
            }
            qb.push(")");
        }
    }

    fn push_ordering(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" ORDER BY ");
        for (expression, descending) in &self.ordering {
            qb.push(*expression)
                .push(if *descending { " DESC, " } else { " ASC, " });
        }
        qb.push(self.rules.default_ordering);
    }

    fn push_pagination(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" LIMIT ")
            .push_bind(self.limit as i64)
            .push(" OFFSET ")
            .push_bind(self.offset());
    }
}

fn parse_filter(kind: FilterKind, raw: &str) -> Option<FilterValue> {
    match kind {
        FilterKind::Integer => raw.parse::<i64>().ok().map(FilterValue::Integer),
        FilterKind::Boolean => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(FilterValue::Boolean(true)),
            "false" | "0" | "no" => Some(FilterValue::Boolean(false)),
            _ => None,
        },
        FilterKind::Text => Some(FilterValue::Text(raw.to_string())),
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Runs the count and page queries for a list endpoint.
///
/// `from` is everything after `FROM` up to (excluding) `WHERE`; `columns` is
/// the select list decoded into `T`.
#[tracing::instrument(name = "Fetch list page", skip(db, columns, from, query), fields(page = query.page, limit = query.limit))]
pub async fn fetch_page<T>(
    db: &SqlitePool,
    timeout: std::time::Duration,
    columns: &str,
    from: &str,
    scope: &Scope,
    query: &ListQuery,
) -> Result<PaginatedResponse<T>, AppError>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM ");
    count.push(from).push(" WHERE 1 = 1");
    scope.push(&mut count);
    query.push_filters(&mut count);
    let total: i64 = timeout_query(timeout, count.build_query_scalar::<i64>().fetch_one(db)).await?;

    let mut rows = QueryBuilder::<Sqlite>::new("SELECT ");
    rows.push(columns).push(" FROM ").push(from).push(" WHERE 1 = 1");
    scope.push(&mut rows);
    query.push_filters(&mut rows);
    query.push_ordering(&mut rows);
    query.push_pagination(&mut rows);
    let data = timeout_query(timeout, rows.build_query_as::<T>().fetch_all(db)).await?;

    tracing::debug!("Fetched {} of {} rows", data.len(), total);
    Ok(PaginatedResponse {
        data,
        pagination: PaginationInfo::new(total, query.page, query.limit),
    })
}

/// Fetches the row with `id_column = id` if the scope lets the caller see it.
#[tracing::instrument(name = "Fetch scoped row", skip(db, columns, from))]
pub async fn fetch_scoped<T>(
    db: &SqlitePool,
    columns: &str,
    from: &str,
    id_column: &str,
    id: i64,
    scope: &Scope,
) -> Result<Option<T>, AppError>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
    qb.push(columns)
        .push(" FROM ")
        .push(from)
        .push(" WHERE ")
        .push(id_column)
        .push(" = ")
        .push_bind(id);
    scope.push(&mut qb);

    Ok(qb.build_query_as::<T>().fetch_optional(db).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    static RULES: ListRules = ListRules {
        search_columns: &["t.name", "t.note"],
        ordering_fields: &[("name", "t.name"), ("createdAt", "t.created_at")],
        filters: &[
            FilterField { param: "owner", column: "t.owner_id", kind: FilterKind::Integer },
            FilterField { param: "active", column: "t.active", kind: FilterKind::Boolean },
        ],
        default_ordering: "t.id ASC",
    };

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn sql_for(query: &ListQuery, scope: &Scope) -> String {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM things t WHERE 1 = 1");
        scope.push(&mut qb);
        query.push_filters(&mut qb);
        query.push_ordering(&mut qb);
        query.push_pagination(&mut qb);
        qb.sql().to_string()
    }

    #[test]
    fn defaults_apply_without_params() {
        let query = ListQuery::parse(&HashMap::new(), &RULES).unwrap();
        assert_eq!((query.page, query.limit, query.offset()), (1, DEFAULT_PAGE_SIZE, 0));
        assert_eq!(
            sql_for(&query, &Scope::Everything),
            "SELECT * FROM things t WHERE 1 = 1 ORDER BY t.id ASC LIMIT ? OFFSET ?"
        );
    }

    #[test]
    fn limit_is_clamped_and_page_floored() {
        let query = ListQuery::parse(&params(&[("page", "0"), ("limit", "1000")]), &RULES).unwrap();
        assert_eq!((query.page, query.limit), (1, MAX_PAGE_SIZE));

        let query = ListQuery::parse(&params(&[("page", "3"), ("limit", "10")]), &RULES).unwrap();
        assert_eq!(query.offset(), 20);
    }

    #[test]
    fn ordering_accepts_known_fields_only() {
        let query = ListQuery::parse(
            &params(&[("ordering", "-createdAt,password,name,-name")]),
            &RULES,
        )
        .unwrap();
        assert_eq!(
            sql_for(&query, &Scope::Everything),
            "SELECT * FROM things t WHERE 1 = 1 ORDER BY t.created_at DESC, t.name ASC, t.id ASC LIMIT ? OFFSET ?"
        );
    }

    #[test]
    fn filters_and_search_are_bound() {
        let query = ListQuery::parse(
            &params(&[("owner", "7"), ("active", "false"), ("search", " rust ")]),
            &RULES,
        )
        .unwrap();
        let sql = sql_for(&query, &Scope::Everything);
        assert!(sql.contains("AND t.owner_id = ? AND t.active = ?"));
        assert!(sql.contains("AND (t.name LIKE ? ESCAPE '\\' OR t.note LIKE ? ESCAPE '\\')"));
    }

    #[test]
    fn malformed_filters_are_field_errors() {
        let err = ListQuery::parse(&params(&[("owner", "me"), ("active", "maybe")]), &RULES)
            .unwrap_err();
        match err {
            AppError::ValidationErrors(errors) => {
                assert!(errors.contains_key("owner"));
                assert!(errors.contains_key("active"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn scopes_restrict_rows() {
        let query = ListQuery::parse(&HashMap::new(), &RULES).unwrap();
        let related = Scope::Related { columns: &["t.owner_id", "t.reviewer_id"], user_id: 3 };
        assert!(sql_for(&query, &related).contains("AND (t.owner_id = ? OR t.reviewer_id = ?)"));

        let owners: &'static [&'static str] = &["t.owner_id", "t.reviewer_id"];
        let anonymous = Scope::Published { flag: "t.published", owners, viewer: None };
        assert!(sql_for(&query, &anonymous).contains("AND t.published = 1 ORDER BY"));

        let viewer = Scope::Published { flag: "t.published", owners: &["t.owner_id"], viewer: Some(3) };
        assert!(sql_for(&query, &viewer).contains("AND (t.published = 1 OR t.owner_id = ?)"));

        let author = Scope::Published { flag: "t.published", owners, viewer: Some(3) };
        assert!(sql_for(&query, &author)
            .contains("AND (t.published = 1 OR t.owner_id = ? OR t.reviewer_id = ?)"));
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("100%_done\\"), "100\\%\\_done\\\\");
    }
}
