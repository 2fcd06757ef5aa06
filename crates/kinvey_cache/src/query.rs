//! Queries: predicates, sorting, windows and field projection.
//!
//! The same [`Query`] is evaluated locally against cached entities and
//! rendered as Mongo-style JSON for the network. Its [`Query::signature`]
//! and [`Query::fields_key`] identify the query's sync checkpoint.

use crate::entity::{resolve_path, Entity};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// A predicate over entity properties.
///
/// Field names are dotted paths. Inside [`Filter::ElemMatch`] an empty
/// field name refers to the array element itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Field equals value (or, for array fields, contains it).
    Eq(String, Value),
    /// Negation of [`Filter::Eq`].
    Ne(String, Value),
    /// Field greater than value.
    Gt(String, Value),
    /// Field greater than or equal to value.
    Gte(String, Value),
    /// Field less than value.
    Lt(String, Value),
    /// Field less than or equal to value.
    Lte(String, Value),
    /// Field equals one of the values.
    In(String, Vec<Value>),
    /// Field equals none of the values.
    Nin(String, Vec<Value>),
    /// Array field contains every value.
    All(String, Vec<Value>),
    /// Field presence.
    Exists(String, bool),
    /// Some element of an array field satisfies the inner filter.
    ElemMatch(String, Box<Filter>),
    /// Every filter matches.
    And(Vec<Filter>),
    /// At least one filter matches.
    Or(Vec<Filter>),
    /// The filter does not match.
    Not(Box<Filter>),
}

impl Filter {
    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    /// `field != value`.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    /// `field > value`.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    /// `field >= value`.
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte(field.into(), value.into())
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    /// `field <= value`.
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(field.into(), value.into())
    }

    /// `field IN values`.
    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    /// `field NOT IN values`.
    pub fn not_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::Nin(field.into(), values.into_iter().map(Into::into).collect())
    }

    /// Array `field` contains all `values`.
    pub fn all<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::All(field.into(), values.into_iter().map(Into::into).collect())
    }

    /// `field` is present (`true`) or absent (`false`).
    pub fn exists(field: impl Into<String>, present: bool) -> Self {
        Self::Exists(field.into(), present)
    }

    /// Some element of array `field` matches `inner`.
    pub fn elem_match(field: impl Into<String>, inner: Filter) -> Self {
        Self::ElemMatch(field.into(), Box::new(inner))
    }

    /// Conjunction with another filter.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match self {
            Self::And(mut filters) => {
                filters.push(other);
                Self::And(filters)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Disjunction with another filter.
    #[must_use]
    pub fn or(self, other: Filter) -> Self {
        match self {
            Self::Or(mut filters) => {
                filters.push(other);
                Self::Or(filters)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    /// Negation.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluates the filter against an entity.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        self.evaluate(&|path: &str| entity.lookup(path))
    }

    fn evaluate<'d>(&self, resolve: &dyn Fn(&str) -> Option<Cow<'d, Value>>) -> bool {
        match self {
            Self::Eq(field, expected) => match resolve(field) {
                Some(actual) => matches_value(&actual, expected),
                None => expected.is_null(),
            },
            Self::Ne(field, expected) => !Self::Eq(field.clone(), expected.clone()).evaluate(resolve),
            Self::Gt(field, bound) => compares(resolve(field), bound, |o| o == Ordering::Greater),
            Self::Gte(field, bound) => compares(resolve(field), bound, |o| o != Ordering::Less),
            Self::Lt(field, bound) => compares(resolve(field), bound, |o| o == Ordering::Less),
            Self::Lte(field, bound) => compares(resolve(field), bound, |o| o != Ordering::Greater),
            Self::In(field, candidates) => match resolve(field) {
                Some(actual) => candidates.iter().any(|c| matches_value(&actual, c)),
                None => candidates.iter().any(Value::is_null),
            },
            Self::Nin(field, candidates) => {
                !Self::In(field.clone(), candidates.clone()).evaluate(resolve)
            }
            Self::All(field, required) => match resolve(field) {
                Some(actual) => required.iter().all(|r| matches_value(&actual, r)),
                None => false,
            },
            Self::Exists(field, present) => resolve(field).is_some() == *present,
            Self::ElemMatch(field, inner) => match resolve(field).as_deref() {
                Some(Value::Array(items)) => items.iter().any(|item| {
                    inner.evaluate(&|path: &str| {
                        if path.is_empty() {
                            Some(Cow::Borrowed(item))
                        } else {
                            resolve_path(item, path.split('.')).map(Cow::Borrowed)
                        }
                    })
                }),
                _ => false,
            },
            Self::And(filters) => filters.iter().all(|f| f.evaluate(resolve)),
            Self::Or(filters) => filters.iter().any(|f| f.evaluate(resolve)),
            Self::Not(inner) => !inner.evaluate(resolve),
        }
    }

    /// Renders the filter as Mongo-style JSON.
    #[must_use]
    pub fn to_mongo(&self) -> Value {
        match self {
            Self::Eq(field, value) if field.is_empty() => json!({ "$eq": value }),
            Self::Eq(field, value) => json!({ field.as_str(): value }),
            Self::Ne(field, value) => operator(field, "$ne", value.clone()),
            Self::Gt(field, value) => operator(field, "$gt", value.clone()),
            Self::Gte(field, value) => operator(field, "$gte", value.clone()),
            Self::Lt(field, value) => operator(field, "$lt", value.clone()),
            Self::Lte(field, value) => operator(field, "$lte", value.clone()),
            Self::In(field, values) => operator(field, "$in", Value::Array(values.clone())),
            Self::Nin(field, values) => operator(field, "$nin", Value::Array(values.clone())),
            Self::All(field, values) => operator(field, "$all", Value::Array(values.clone())),
            Self::Exists(field, present) => operator(field, "$exists", Value::Bool(*present)),
            Self::ElemMatch(field, inner) => operator(field, "$elemMatch", inner.to_mongo()),
            Self::And(filters) => json!({ "$and": filters.iter().map(Self::to_mongo).collect::<Vec<_>>() }),
            Self::Or(filters) => json!({ "$or": filters.iter().map(Self::to_mongo).collect::<Vec<_>>() }),
            Self::Not(inner) => json!({ "$nor": [inner.to_mongo()] }),
        }
    }
}

fn operator(field: &str, op: &str, value: Value) -> Value {
    let mut condition = Map::new();
    condition.insert(op.to_string(), value);
    if field.is_empty() {
        return Value::Object(condition);
    }
    let mut object = Map::new();
    object.insert(field.to_string(), Value::Object(condition));
    Value::Object(object)
}

/// Equality with array containment: an array field matches a scalar it
/// contains.
fn matches_value(actual: &Value, expected: &Value) -> bool {
    if values_equal(actual, expected) {
        return true;
    }
    match (actual, expected) {
        (Value::Array(items), scalar) if !scalar.is_array() => {
            items.iter().any(|item| values_equal(item, scalar))
        }
        _ => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compares(actual: Option<Cow<'_, Value>>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    let check = |value: &Value| compare_values(value, bound).is_some_and(&accept);
    match actual.as_ref() {
        Value::Array(items) if !bound.is_array() => items.iter().any(check),
        value => check(value),
    }
}

/// Orders two values of the same kind; `None` across kinds.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Total order used for sorting: missing/null, numbers, strings, objects,
/// arrays, booleans.
fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(Value::Object(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Bool(_)) => 5,
        }
    }
    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    })
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Dotted field path.
    pub field: String,
    /// Direction.
    pub direction: SortDirection,
}

/// A query over one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Predicate; `None` matches everything.
    pub filter: Option<Filter>,
    /// Sort keys in priority order.
    pub sort: Vec<SortKey>,
    /// Number of matches to skip.
    pub skip: Option<usize>,
    /// Maximum number of matches to return.
    pub limit: Option<usize>,
    /// Field projection; empty means whole entities.
    pub fields: BTreeSet<String>,
}

impl Query {
    /// A query matching every entity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A query for the given ids.
    #[must_use]
    pub fn by_ids<S: AsRef<str>>(ids: impl IntoIterator<Item = S>) -> Self {
        Self::new().filter(Filter::is_in(
            crate::entity::ID_FIELD,
            ids.into_iter().map(|id| Value::String(id.as_ref().to_string())),
        ))
    }

    /// Adds a predicate, and-ing it with any existing one.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    /// Adds an ascending sort key.
    #[must_use]
    pub fn sort_ascending(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction: SortDirection::Ascending,
        });
        self
    }

    /// Adds a descending sort key.
    #[must_use]
    pub fn sort_descending(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction: SortDirection::Descending,
        });
        self
    }

    /// Sets the number of matches to skip.
    #[must_use]
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Sets the maximum number of matches.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the field projection. Names are trimmed; blanks are dropped.
    #[must_use]
    pub fn fields<S: AsRef<str>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = fields
            .into_iter()
            .map(|f| f.as_ref().trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        self
    }

    /// Whether skip or limit restrict the result window.
    #[must_use]
    pub fn is_windowed(&self) -> bool {
        self.skip.is_some() || self.limit.is_some()
    }

    /// Whether the query matches the whole collection.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.filter.is_none() && !self.is_windowed()
    }

    /// The same query without skip and limit.
    #[must_use]
    pub fn without_window(&self) -> Self {
        Self {
            skip: None,
            limit: None,
            ..self.clone()
        }
    }

    /// The same query restricted to one page.
    #[must_use]
    pub fn window(&self, skip: usize, limit: usize) -> Self {
        Self {
            skip: Some(skip),
            limit: Some(limit),
            ..self.clone()
        }
    }

    /// Canonical predicate text identifying the query's result set.
    ///
    /// Object keys are emitted in sorted order, so equal predicates built
    /// in different orders share a signature. Sort and window are not part
    /// of it.
    #[must_use]
    pub fn signature(&self) -> String {
        self.filter
            .as_ref()
            .map_or_else(|| "{}".to_string(), |f| f.to_mongo().to_string())
    }

    /// Normalized projection: sorted, de-duplicated, comma-joined.
    #[must_use]
    pub fn fields_key(&self) -> String {
        self.fields.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }

    /// Sort rendered for the network, keys in priority order.
    #[must_use]
    pub fn sort_param(&self) -> Option<String> {
        if self.sort.is_empty() {
            return None;
        }
        let keys: Vec<String> = self
            .sort
            .iter()
            .map(|key| {
                let direction = match key.direction {
                    SortDirection::Ascending => 1,
                    SortDirection::Descending => -1,
                };
                format!("{}:{direction}", Value::String(key.field.clone()))
            })
            .collect();
        Some(format!("{{{}}}", keys.join(",")))
    }

    /// Whether an entity satisfies the predicate.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(entity))
    }

    /// Evaluates the query: filter, order, then window.
    ///
    /// Without sort keys results are ordered by id.
    pub fn apply<'a>(&self, entities: impl IntoIterator<Item = &'a Entity>) -> Vec<Entity> {
        let mut matched: Vec<&Entity> = entities.into_iter().filter(|e| self.matches(e)).collect();
        if self.sort.is_empty() {
            matched.sort_by(|a, b| a.id().cmp(b.id()));
        } else {
            matched.sort_by(|a, b| {
                self.sort.iter().fold(Ordering::Equal, |acc, key| {
                    acc.then_with(|| {
                        let order = sort_order(
                            a.lookup(&key.field).as_deref(),
                            b.lookup(&key.field).as_deref(),
                        );
                        match key.direction {
                            SortDirection::Ascending => order,
                            SortDirection::Descending => order.reverse(),
                        }
                    })
                })
            });
        }
        matched
            .into_iter()
            .skip(self.skip.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}
