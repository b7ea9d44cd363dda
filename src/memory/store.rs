//! MemoryStore - the abstract key-value/append interface and the mandated
//! in-memory backend
//!
//! Every backend guarantees linearizable single-operation semantics and
//! durable-on-return writes. Compound operations are the caller's problem.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::Result;

use super::ContextItem;

/// Which item attribute a filter inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterField {
    Id,
    Kind,
    Source,
    Tag,
    Importance,
    TokenCost,
    Timestamp,
}

/// Comparison operators: exact match, list-membership, and orderings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Ge,
    Gt,
    In,
}

/// A single predicate over an item attribute
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: FilterField,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: FilterField, op: FilterOp, value: Value) -> Self {
        Self { field, op, value }
    }

    /// `kind IN [...]`
    pub fn kind_in(kinds: &[String]) -> Self {
        Self::new(FilterField::Kind, FilterOp::In, Value::from(kinds.to_vec()))
    }

    /// `kind NOT IN [...]` is expressed as one Ne per excluded kind by
    /// callers; this builds a single exclusion.
    pub fn kind_not(kind: &str) -> Self {
        Self::new(FilterField::Kind, FilterOp::Ne, Value::from(kind))
    }

    /// `importance >= min`
    pub fn importance_at_least(min: f32) -> Self {
        Self::new(FilterField::Importance, FilterOp::Ge, Value::from(min))
    }

    pub fn matches(&self, item: &ContextItem) -> bool {
        match self.field {
            FilterField::Id => self.match_str(&item.id),
            FilterField::Kind => self.match_str(&item.kind),
            FilterField::Source => self.match_str(&item.source),
            FilterField::Tag => match self.op {
                // Tag semantics: does any tag satisfy the predicate
                FilterOp::Eq => item.tags.iter().any(|t| Some(t.as_str()) == self.value.as_str()),
                FilterOp::Ne => item.tags.iter().all(|t| Some(t.as_str()) != self.value.as_str()),
                FilterOp::In => item.tags.iter().any(|t| {
                    self.value
                        .as_array()
                        .is_some_and(|arr| arr.iter().any(|v| v.as_str() == Some(t.as_str())))
                }),
                _ => false,
            },
            FilterField::Importance => self.match_f64(f64::from(item.importance)),
            FilterField::TokenCost => self.match_f64(f64::from(item.token_cost)),
            FilterField::Timestamp => self.match_timestamp(item.timestamp),
        }
    }

    fn match_str(&self, actual: &str) -> bool {
        match self.op {
            FilterOp::Eq => self.value.as_str() == Some(actual),
            FilterOp::Ne => self.value.as_str() != Some(actual),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|arr| arr.iter().any(|v| v.as_str() == Some(actual))),
            // Orderings on strings are lexicographic
            FilterOp::Lt | FilterOp::Le | FilterOp::Ge | FilterOp::Gt => self
                .value
                .as_str()
                .is_some_and(|expected| self.cmp_holds(actual.cmp(expected))),
        }
    }

    fn match_f64(&self, actual: f64) -> bool {
        let Some(expected) = self.value.as_f64() else {
            return matches!(self.op, FilterOp::In)
                && self
                    .value
                    .as_array()
                    .is_some_and(|arr| arr.iter().any(|v| v.as_f64() == Some(actual)));
        };
        match self.op {
            FilterOp::Eq => (actual - expected).abs() < f64::EPSILON,
            FilterOp::Ne => (actual - expected).abs() >= f64::EPSILON,
            _ => self.cmp_holds(actual.partial_cmp(&expected).unwrap_or(std::cmp::Ordering::Less)),
        }
    }

    fn match_timestamp(&self, actual: DateTime<Utc>) -> bool {
        let Some(expected) = self
            .value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
        else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == expected,
            FilterOp::Ne => actual != expected,
            FilterOp::In => false,
            _ => self.cmp_holds(actual.cmp(&expected)),
        }
    }

    fn cmp_holds(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self.op {
            FilterOp::Lt => ordering == Less,
            FilterOp::Le => ordering != Greater,
            FilterOp::Ge => ordering != Less,
            FilterOp::Gt => ordering == Greater,
            FilterOp::Eq => ordering == Equal,
            FilterOp::Ne => ordering != Equal,
            FilterOp::In => false,
        }
    }
}

/// Sort key for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    Importance,
    Timestamp,
    TokenCost,
}

/// A filtered, ordered, limited retrieval
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    /// Descending is the retrieval-relevant direction and the default
    pub descending: bool,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            order_by: None,
            descending: true,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn apply(&self, mut items: Vec<ContextItem>) -> Vec<ContextItem> {
        items.retain(|item| self.filters.iter().all(|f| f.matches(item)));

        if let Some(order) = self.order_by {
            items.sort_by(|a, b| {
                let ord = match order {
                    OrderBy::Importance => a
                        .importance
                        .partial_cmp(&b.importance)
                        .unwrap_or(std::cmp::Ordering::Equal),
                    OrderBy::Timestamp => a.timestamp.cmp(&b.timestamp),
                    OrderBy::TokenCost => a.token_cost.cmp(&b.token_cost),
                };
                if self.descending { ord.reverse() } else { ord }
            });
        }

        if let Some(limit) = self.limit {
            items.truncate(limit);
        }
        items
    }
}

/// The store contract all three tiers share.
///
/// Implementations: [`InMemoryStore`] (mandated), [`super::AppendFileStore`]
/// (append-only JSONL, by contract).
pub trait MemoryStore: Send + Sync {
    fn add(&self, item: ContextItem) -> Result<()>;
    fn get(&self, id: &str) -> Result<Option<ContextItem>>;
    fn delete(&self, id: &str) -> Result<bool>;
    fn query(&self, query: &Query) -> Result<Vec<ContextItem>>;
    fn list_all(&self) -> Result<Vec<ContextItem>>;
    fn count(&self) -> Result<usize>;
    fn clear(&self) -> Result<()>;
}

/// The mandated in-memory backend. Linearizable per operation via a single
/// RwLock; optionally count-bounded for the project tier.
pub struct InMemoryStore {
    items: RwLock<FxHashMap<String, ContextItem>>,
    max_items: Option<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(FxHashMap::default()),
            max_items: None,
        }
    }

    /// Bounded variant: beyond `max_items`, the lowest-importance (oldest on
    /// ties) item is evicted to make room.
    pub fn bounded(max_items: usize) -> Self {
        Self {
            items: RwLock::new(FxHashMap::default()),
            max_items: Some(max_items),
        }
    }

    /// Stable ordering for list_all: oldest first, id tie-break
    fn sorted(items: impl Iterator<Item = ContextItem>) -> Vec<ContextItem> {
        let mut v: Vec<ContextItem> = items.collect();
        v.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        v
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore for InMemoryStore {
    fn add(&self, item: ContextItem) -> Result<()> {
        let mut items = self.items.write();

        if let Some(max) = self.max_items {
            // Replacing an existing id never grows the map
            if !items.contains_key(&item.id) && items.len() >= max {
                let victim = items
                    .values()
                    .min_by(|a, b| {
                        a.importance
                            .partial_cmp(&b.importance)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.timestamp.cmp(&b.timestamp))
                    })
                    .map(|i| i.id.clone());
                if let Some(victim) = victim {
                    items.remove(&victim);
                }
            }
        }

        items.insert(item.id.clone(), item);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ContextItem>> {
        Ok(self.items.read().get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.items.write().remove(id).is_some())
    }

    fn query(&self, query: &Query) -> Result<Vec<ContextItem>> {
        let items = Self::sorted(self.items.read().values().cloned());
        Ok(query.apply(items))
    }

    fn list_all(&self) -> Result<Vec<ContextItem>> {
        Ok(Self::sorted(self.items.read().values().cloned()))
    }

    fn count(&self) -> Result<usize> {
        Ok(self.items.read().len())
    }

    fn clear(&self) -> Result<()> {
        self.items.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Tier;
    use chrono::TimeZone;
    use serde_json::json;

    fn item(id: &str, kind: &str, importance: f32, cost: u32) -> ContextItem {
        ContextItem::new(id, Tier::Project, kind, json!({"id": id}))
            .with_importance(importance)
            .with_token_cost(cost)
    }

    #[test]
    fn add_get_delete_roundtrip() {
        let store = InMemoryStore::new();
        store.add(item("a", "code", 0.5, 10)).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.get("a").unwrap().unwrap().kind, "code");
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn query_filters_by_kind_membership() {
        let store = InMemoryStore::new();
        store.add(item("a", "code", 0.5, 10)).unwrap();
        store.add(item("b", "reasoning", 0.5, 10)).unwrap();
        store.add(item("c", "decision", 0.5, 10)).unwrap();

        let query = Query::new().filter(Filter::kind_in(&[
            "code".to_string(),
            "decision".to_string(),
        ]));
        let results = store.query(&query).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|i| i.kind != "reasoning"));
    }

    #[test]
    fn query_comparison_operators() {
        let store = InMemoryStore::new();
        store.add(item("low", "code", 0.2, 10)).unwrap();
        store.add(item("mid", "code", 0.5, 20)).unwrap();
        store.add(item("high", "code", 0.9, 30)).unwrap();

        let at_least_half = store
            .query(&Query::new().filter(Filter::importance_at_least(0.5)))
            .unwrap();
        assert_eq!(at_least_half.len(), 2);

        let cheap = store
            .query(&Query::new().filter(Filter::new(
                FilterField::TokenCost,
                FilterOp::Lt,
                json!(25),
            )))
            .unwrap();
        assert_eq!(cheap.len(), 2);

        let not_mid = store
            .query(&Query::new().filter(Filter::new(FilterField::Id, FilterOp::Ne, json!("mid"))))
            .unwrap();
        assert_eq!(not_mid.len(), 2);
    }

    #[test]
    fn query_orders_descending_by_default() {
        let store = InMemoryStore::new();
        store.add(item("a", "code", 0.3, 10)).unwrap();
        store.add(item("b", "code", 0.9, 10)).unwrap();
        store.add(item("c", "code", 0.6, 10)).unwrap();

        let results = store
            .query(&Query::new().order_by(OrderBy::Importance))
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn query_limit_truncates() {
        let store = InMemoryStore::new();
        for i in 0..10 {
            store.add(item(&format!("i{i}"), "code", 0.5, 1)).unwrap();
        }
        let results = store.query(&Query::new().limit(3)).unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn bounded_store_evicts_lowest_importance_oldest() {
        let store = InMemoryStore::bounded(2);
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        store
            .add(item("old_weak", "code", 0.1, 1).with_timestamp(t0))
            .unwrap();
        store
            .add(item("new_weak", "code", 0.1, 1).with_timestamp(t1))
            .unwrap();
        store.add(item("strong", "code", 0.9, 1)).unwrap();

        assert_eq!(store.count().unwrap(), 2);
        // old_weak shares lowest importance with new_weak but is older
        assert!(store.get("old_weak").unwrap().is_none());
        assert!(store.get("new_weak").unwrap().is_some());
        assert!(store.get("strong").unwrap().is_some());
    }

    #[test]
    fn timestamp_filter_compares_rfc3339() {
        let store = InMemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        store.add(item("early", "code", 0.5, 1).with_timestamp(t0)).unwrap();
        store.add(item("late", "code", 0.5, 1).with_timestamp(t1)).unwrap();

        let results = store
            .query(&Query::new().filter(Filter::new(
                FilterField::Timestamp,
                FilterOp::Ge,
                json!("2026-03-01T00:00:00Z"),
            )))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "late");
    }

    #[test]
    fn tag_membership() {
        let store = InMemoryStore::new();
        let mut tagged = item("a", "code", 0.5, 1);
        tagged.tags = vec!["rust".to_string(), "parser".to_string()];
        store.add(tagged).unwrap();
        store.add(item("b", "code", 0.5, 1)).unwrap();

        let results = store
            .query(&Query::new().filter(Filter::new(
                FilterField::Tag,
                FilterOp::Eq,
                json!("rust"),
            )))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a");
    }
}
