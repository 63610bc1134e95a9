use serde::{Deserialize, Serialize};

use crate::firestore::core::query::{Bound, FieldFilter, OrderBy, Query};
use crate::firestore::model::{DocumentKey, ResourcePath};

/// Server-facing query shape. Filters are kept sorted by canonical id so
/// logically identical queries produce identical targets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    path: ResourcePath,
    #[serde(default)]
    filters: Vec<FieldFilter>,
    #[serde(default)]
    order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_at: Option<Bound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_at: Option<Bound>,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        mut filters: Vec<FieldFilter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        filters.sort_by_key(FieldFilter::canonical_id);
        Self {
            path,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        }
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Query::for_document(key).to_target()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn is_document_target(&self) -> bool {
        self.path.len() % 2 == 0 && !self.path.is_empty() && self.filters.is_empty()
    }

    /// Key of the document for single-document targets.
    pub fn document_key(&self) -> Option<DocumentKey> {
        if self.is_document_target() {
            DocumentKey::from_path(self.path.clone()).ok()
        } else {
            None
        }
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if !self.filters.is_empty() {
            let filters: Vec<String> = self.filters.iter().map(FieldFilter::canonical_id).collect();
            id.push_str("|f:");
            id.push_str(&filters.join(","));
        }
        if !self.order_by.is_empty() {
            let orders: Vec<String> = self.order_by.iter().map(OrderBy::canonical_id).collect();
            id.push_str("|ob:");
            id.push_str(&orders.join(","));
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&start.canonical_id());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&end.canonical_id());
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::FilterOperator;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::FirestoreValue;

    #[test]
    fn document_targets_expose_key() {
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let target = Target::for_document(&key);
        assert!(target.is_document_target());
        assert_eq!(target.document_key(), Some(key));
        assert_eq!(target.canonical_id(), "rooms/eros|ob:__name__asc");
    }

    #[test]
    fn canonical_id_includes_shape() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_filter(
                FieldFilter::new(
                    FieldPath::from_dot_separated("size").unwrap(),
                    FilterOperator::Equal,
                    FirestoreValue::from_integer(3),
                )
                .unwrap(),
            )
            .limit_to_first(10);
        assert_eq!(
            query.to_target().canonical_id(),
            "rooms|f:size==3|ob:__name__asc|l:10"
        );
    }

    #[test]
    fn serializes_to_json() {
        let target = Query::collection("rooms").unwrap().to_target();
        let json = serde_json::to_string(&target).unwrap();
        let back: Target = serde_json::from_str(&json).unwrap();
        assert_eq!(back, target);
    }
}
