//! Query builder: metadata matchers rendered into parameterized SQL.
//!
//! Metadata-domain matches compare against the `metadata` JSONB blob.
//! Comparisons go through `metadata -> 'key'` so numbers compare numerically
//! and strings textually; the value is bound as `jsonb`. Booleans are inlined
//! as `'true'::jsonb` / `'false'::jsonb`. Regular expressions and set
//! membership work on the text form, `metadata ->> 'key'`. A dotted key such
//! as `tenant.region` addresses a nested object through `#>` / `#>>`.
//!
//! Property-domain matches target a fixed set of columns and cast the bound
//! value to the column's type. Set literals are parsed into their elements
//! and bound as one `text[]` parameter, never spliced into the SQL text.

use serde_json::Value;
use sqlx::Postgres;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use streamstore::{
    EventStoreError, FieldDomain, MatchOperator, MatchValue, MessageProperty, MetadataMatch,
    MetadataMatcher, SequenceNumber, StreamName, parse_set_literal,
};

/// One bound parameter of a [`BuiltQuery`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    /// Bound as `jsonb`.
    Json(Value),
    /// Bound as `text`.
    Text(String),
    /// Bound as `bigint`.
    Integer(i64),
    /// Bound as `double precision`.
    Float(f64),
    /// Bound as `text[]`.
    TextArray(Vec<String>),
}

/// SQL text plus its positional parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    sql: String,
    params: Vec<QueryParam>,
}

impl BuiltQuery {
    /// The SQL text, without paging.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bound parameters; `params()[i]` binds `$(i + 1)`.
    pub fn params(&self) -> &[QueryParam] {
        &self.params
    }

    /// SQL text for one page of the result.
    pub fn paged_sql(&self, limit: usize, offset: usize) -> String {
        format!("{} LIMIT {limit} OFFSET {offset}", self.sql)
    }

    /// Bind every parameter onto `query` in order.
    pub(crate) fn bind_all<'q>(
        &self,
        mut query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        for param in &self.params {
            query = match param {
                QueryParam::Json(value) => query.bind(Json(value.clone())),
                QueryParam::Text(value) => query.bind(value.clone()),
                QueryParam::Integer(value) => query.bind(*value),
                QueryParam::Float(value) => query.bind(*value),
                QueryParam::TextArray(values) => query.bind(values.clone()),
            };
        }
        query
    }
}

/// One resolved stream of a single or merged read.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueryTarget<'a> {
    pub(crate) stream: &'a StreamName,
    pub(crate) table: &'a str,
    pub(crate) from: SequenceNumber,
    pub(crate) matcher: &'a MetadataMatcher,
}

/// Render the read of one stream, ordered by sequence.
pub(crate) fn render_stream_query(target: QueryTarget<'_>) -> Result<BuiltQuery, EventStoreError> {
    let mut params = Vec::new();
    let sql = render_select(target, &mut params)?;
    Ok(BuiltQuery {
        sql: format!("{sql} ORDER BY no ASC"),
        params,
    })
}

/// Render the union of several streams, ordered by creation time.
///
/// Ties on `created_at` fall back to stream name and sequence so that paging
/// over the union is deterministic.
pub(crate) fn render_merge_query(
    targets: &[QueryTarget<'_>],
) -> Result<BuiltQuery, EventStoreError> {
    match targets {
        [] => Err(EventStoreError::EmptyMerge),
        [single] => render_stream_query(*single),
        _ => {
            let mut params = Vec::new();
            let mut parts = Vec::with_capacity(targets.len());
            for target in targets {
                parts.push(format!("({})", render_select(*target, &mut params)?));
            }
            Ok(BuiltQuery {
                sql: format!(
                    "{} ORDER BY created_at ASC, stream ASC, no ASC",
                    parts.join(" UNION ALL ")
                ),
                params,
            })
        }
    }
}

fn render_select(
    target: QueryTarget<'_>,
    params: &mut Vec<QueryParam>,
) -> Result<String, EventStoreError> {
    let mut predicates = Vec::with_capacity(target.matcher.len() + 1);
    for matched in target.matcher {
        predicates.push(render_match(matched, params)?);
    }
    params.push(QueryParam::Integer(target.from.as_i64()));
    predicates.push(format!("no >= ${}", params.len()));

    Ok(format!(
        concat!(
            "SELECT no, event_id, event_name, payload, metadata, created_at, ",
            r#"{}::text AS stream FROM "{}" WHERE {}"#
        ),
        quote_literal(target.stream.as_ref()),
        target.table,
        predicates.join(" AND ")
    ))
}

fn render_match(
    matched: &MetadataMatch,
    params: &mut Vec<QueryParam>,
) -> Result<String, EventStoreError> {
    matched.validate()?;
    match matched.domain() {
        FieldDomain::Metadata => render_metadata_match(matched, params),
        FieldDomain::MessageProperty => {
            let property = matched
                .property()?
                .ok_or_else(|| matched.invalid("unknown message property"))?;
            render_property_match(matched, property, params)
        }
    }
}

fn render_metadata_match(
    matched: &MetadataMatch,
    params: &mut Vec<QueryParam>,
) -> Result<String, EventStoreError> {
    let key = matched.field();
    match (matched.operator(), matched.value()) {
        (MatchOperator::In | MatchOperator::NotIn, MatchValue::Text(literal)) => {
            let elements = parse_set_literal(key, literal)?;
            let placeholder = push(params, QueryParam::TextArray(elements));
            Ok(membership(&metadata_path(key, true), matched.operator(), placeholder))
        }
        (MatchOperator::Regex, MatchValue::Text(pattern)) => {
            let placeholder = push(params, QueryParam::Text(pattern.clone()));
            Ok(format!("{} ~ {placeholder}", metadata_path(key, true)))
        }
        (operator, value) => {
            let comparison = operator
                .comparison()
                .ok_or_else(|| matched.invalid("operator does not accept this value"))?;
            let rhs = match value {
                MatchValue::Bool(flag) => format!("'{flag}'::jsonb"),
                other => push(params, QueryParam::Json(other.to_json())),
            };
            Ok(format!("{} {comparison} {rhs}", metadata_path(key, false)))
        }
    }
}

/// Accessor for a metadata key; `as_text` selects the `text` form.
///
/// Keys are validated to `[A-Za-z0-9_.-]` with non-empty dot segments, so
/// they can be quoted without escaping.
fn metadata_path(key: &str, as_text: bool) -> String {
    if key.contains('.') {
        let path = key
            .split('.')
            .map(|segment| format!("\"{segment}\""))
            .collect::<Vec<_>>()
            .join(",");
        let operator = if as_text { "#>>" } else { "#>" };
        format!("metadata {operator} '{{{path}}}'")
    } else {
        let operator = if as_text { "->>" } else { "->" };
        format!("metadata {operator} '{key}'")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Integer,
    Text,
    Uuid,
    Timestamp,
}

fn column_kind(property: MessageProperty) -> ColumnKind {
    match property {
        MessageProperty::Sequence | MessageProperty::AggregateVersion => ColumnKind::Integer,
        MessageProperty::EventName
        | MessageProperty::AggregateType
        | MessageProperty::AggregateId => ColumnKind::Text,
        MessageProperty::EventId => ColumnKind::Uuid,
        MessageProperty::CreatedAt => ColumnKind::Timestamp,
    }
}

fn render_property_match(
    matched: &MetadataMatch,
    property: MessageProperty,
    params: &mut Vec<QueryParam>,
) -> Result<String, EventStoreError> {
    let column = property.column();
    let kind = column_kind(property);

    match (matched.operator(), matched.value()) {
        (MatchOperator::In | MatchOperator::NotIn, MatchValue::Text(literal)) => {
            let elements = parse_set_literal(matched.field(), literal)?;
            let placeholder = push(params, QueryParam::TextArray(elements));
            Ok(membership(&format!("{column}::text"), matched.operator(), placeholder))
        }
        (MatchOperator::Regex, MatchValue::Text(pattern)) => {
            let placeholder = push(params, QueryParam::Text(pattern.clone()));
            Ok(format!("{column}::text ~ {placeholder}"))
        }
        (operator, value) => {
            let comparison = operator
                .comparison()
                .ok_or_else(|| matched.invalid("operator does not accept this value"))?;
            let rhs = match (kind, value) {
                (_, MatchValue::Bool(_)) => {
                    return Err(matched.invalid("message properties are never boolean"));
                }
                (ColumnKind::Integer, MatchValue::Integer(number)) => {
                    push(params, QueryParam::Integer(*number))
                }
                (ColumnKind::Integer, MatchValue::Float(number)) => {
                    push(params, QueryParam::Float(*number))
                }
                (_, MatchValue::Integer(_) | MatchValue::Float(_)) => {
                    return Err(matched.invalid("numbers only compare against numeric properties"));
                }
                (kind, MatchValue::Text(text)) => {
                    let placeholder = push(params, QueryParam::Text(text.clone()));
                    match kind {
                        ColumnKind::Integer => format!("{placeholder}::bigint"),
                        ColumnKind::Text => placeholder,
                        ColumnKind::Uuid => format!("{placeholder}::uuid"),
                        ColumnKind::Timestamp => format!("{placeholder}::timestamptz"),
                    }
                }
            };
            Ok(format!("{column} {comparison} {rhs}"))
        }
    }
}

fn membership(lhs: &str, operator: MatchOperator, placeholder: String) -> String {
    if operator == MatchOperator::NotIn {
        format!("{lhs} <> ALL({placeholder})")
    } else {
        format!("{lhs} = ANY({placeholder})")
    }
}

/// Append a parameter and return its placeholder.
fn push(params: &mut Vec<QueryParam>, param: QueryParam) -> String {
    params.push(param);
    format!("${}", params.len())
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
