//! Filter model for tenant-scoped queries

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::DEFAULT_TENANT_FIELD;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    In,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    #[must_use]
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluate against a JSON record; a missing field never matches
    pub fn matches(&self, record: &Value) -> bool {
        let Some(actual) = record.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.contains(actual)),
            FilterOp::Contains => match (actual, &self.value) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
        }
    }
}

/// Conjunction of filters handed to downstream data services
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    #[must_use]
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn filters_on<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a Filter> + 'a {
        self.filters.iter().filter(move |f| f.field == field)
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }
}

/// Record that belongs to a tenant
pub trait TenantOwned {
    fn tenant_id(&self) -> Option<&str>;

    /// Tenant read from a named field; typed records ignore the name
    fn tenant_in(&self, field: &str) -> Option<&str> {
        let _ = field;
        self.tenant_id()
    }
}

impl TenantOwned for Value {
    fn tenant_id(&self) -> Option<&str> {
        self.tenant_in(DEFAULT_TENANT_FIELD)
    }

    fn tenant_in(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }
}

impl<T: TenantOwned> TenantOwned for &T {
    fn tenant_id(&self) -> Option<&str> {
        (**self).tenant_id()
    }

    fn tenant_in(&self, field: &str) -> Option<&str> {
        (**self).tenant_in(field)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_filter_ops() {
        let record = json!({"tenant_id": "acme", "severity": "high", "tags": ["db", "prod"]});

        assert!(Filter::new("tenant_id", FilterOp::Eq, "acme").matches(&record));
        assert!(Filter::new("severity", FilterOp::Ne, "low").matches(&record));
        assert!(Filter::new("severity", FilterOp::In, json!(["high", "critical"])).matches(&record));
        assert!(Filter::new("tags", FilterOp::Contains, "prod").matches(&record));
        assert!(Filter::new("severity", FilterOp::Contains, "ig").matches(&record));
        assert!(!Filter::new("missing", FilterOp::Ne, "x").matches(&record));
    }

    #[test]
    fn test_query_matches_all_filters() {
        let q = Query::new().where_eq("tenant_id", "acme").where_eq("severity", "high");
        assert!(q.matches(&json!({"tenant_id": "acme", "severity": "high"})));
        assert!(!q.matches(&json!({"tenant_id": "globex", "severity": "high"})));
        assert_eq!(q.filters_on("tenant_id").count(), 1);
    }

    #[test]
    fn test_query_deserialize() {
        let q: Query = serde_json::from_value(json!({
            "filters": [{"field": "tenant_id", "op": "in", "value": ["a", "b"]}]
        }))
        .unwrap();
        assert_eq!(q.filters[0].op, FilterOp::In);
    }

    #[test]
    fn test_value_tenant() {
        let record = json!({"tenant_id": "acme", "org": "initech"});
        assert_eq!(record.tenant_id(), Some("acme"));
        assert_eq!(record.tenant_in("org"), Some("initech"));
        assert_eq!(json!({"tenant_id": 5}).tenant_id(), None);
    }
}
