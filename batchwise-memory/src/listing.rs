//! Query evaluation for listing requests.

use std::cmp::Ordering;

use batchwise::helpers::ID_FIELD;
use batchwise::{Query, TransportFailure};
use serde_json::{json, Value};

const DEFAULT_LIMIT: usize = 25;

/// Apply the `queries` in `payload` to `entities` and build a listing
/// response with the matches under `items_key`.
pub(crate) fn list(
    entities: &[Value],
    payload: Option<&Value>,
    items_key: &str,
) -> Result<Value, TransportFailure> {
    let queries = parse_queries(payload)?;

    let mut matched: Vec<&Value> = entities
        .iter()
        .filter(|entity| queries.iter().all(|query| matches(entity, query)))
        .collect();
    let total = matched.len();

    for query in queries.iter().rev() {
        match query {
            Query::OrderAsc(attribute) => {
                matched.sort_by(|a, b| compare_fields(a, b, attribute));
            }
            Query::OrderDesc(attribute) => {
                matched.sort_by(|a, b| compare_fields(b, a, attribute));
            }
            _ => {}
        }
    }

    let mut window: &[&Value] = &matched;
    for query in &queries {
        match query {
            Query::CursorAfter(id) => window = &window[position(window, id)? + 1..],
            Query::CursorBefore(id) => window = &window[..position(window, id)?],
            _ => {}
        }
    }

    let offset = queries
        .iter()
        .rev()
        .find_map(|query| match query {
            Query::Offset(n) => Some(*n as usize),
            _ => None,
        })
        .unwrap_or(0);
    let limit = queries
        .iter()
        .rev()
        .find_map(|query| match query {
            Query::Limit(n) => Some(*n as usize),
            _ => None,
        })
        .unwrap_or(DEFAULT_LIMIT);

    let items: Vec<Value> = window
        .iter()
        .skip(offset)
        .take(limit)
        .map(|entity| (*entity).clone())
        .collect();

    let mut response = json!({ "total": total });
    response[items_key] = Value::Array(items);
    Ok(response)
}

fn parse_queries(payload: Option<&Value>) -> Result<Vec<Query>, TransportFailure> {
    let Some(raw) = payload.and_then(|payload| payload.get("queries")) else {
        return Ok(Vec::new());
    };
    let Value::Array(raw) = raw else {
        return Err(TransportFailure::from_status(400, "`queries` must be an array"));
    };
    raw.iter()
        .map(|query| {
            query
                .as_str()
                .ok_or_else(|| TransportFailure::from_status(400, "queries must be strings"))?
                .parse::<Query>()
                .map_err(|e| TransportFailure::from_status(400, format!("invalid query: {e}")))
        })
        .collect()
}

fn position(window: &[&Value], id: &str) -> Result<usize, TransportFailure> {
    window
        .iter()
        .position(|entity| entity.get(ID_FIELD).and_then(Value::as_str) == Some(id))
        .ok_or_else(|| {
            TransportFailure::from_status(400, format!("cursor `{id}` does not match any entity"))
        })
}

/// Attribute as text; strings unquoted, everything else in JSON form.
fn field_text(entity: &Value, attribute: &str) -> Option<String> {
    match entity.get(attribute)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Numeric comparison when both sides are numbers, text otherwise.
fn compare_text(left: &str, right: &str) -> Ordering {
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => left.cmp(right),
    }
}

fn compare_fields(a: &Value, b: &Value, attribute: &str) -> Ordering {
    match (field_text(a, attribute), field_text(b, attribute)) {
        (Some(l), Some(r)) => compare_text(&l, &r),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn matches(entity: &Value, query: &Query) -> bool {
    let compare = |attribute: &str, value: &str, accept: fn(Ordering) -> bool| {
        field_text(entity, attribute).is_some_and(|actual| accept(compare_text(&actual, value)))
    };
    match query {
        Query::Equal { attribute, value } => field_text(entity, attribute).as_deref() == Some(value.as_str()),
        Query::NotEqual { attribute, value } => {
            field_text(entity, attribute).as_deref() != Some(value.as_str())
        }
        Query::LessThan { attribute, value } => compare(attribute, value, Ordering::is_lt),
        Query::LessThanEqual { attribute, value } => compare(attribute, value, Ordering::is_le),
        Query::GreaterThan { attribute, value } => compare(attribute, value, Ordering::is_gt),
        Query::GreaterThanEqual { attribute, value } => compare(attribute, value, Ordering::is_ge),
        Query::Search { attribute, value } => field_text(entity, attribute).is_some_and(|actual| {
            let haystack = actual.to_lowercase();
            value
                .split_whitespace()
                .all(|term| haystack.contains(&term.to_lowercase()))
        }),
        _ => true,
    }
}
