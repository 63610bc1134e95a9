use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{type_order, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThanOrEqual,
    GreaterThan,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::In => "in",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn takes_array_operand(&self) -> bool {
        matches!(
            self,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array_operand() {
            match value.as_array() {
                Some(values) if !values.is_empty() => {}
                _ => {
                    return Err(invalid_argument(format!(
                        "Filter '{}' requires a non-empty array value",
                        op.as_str()
                    )))
                }
            }
        }
        if (value.is_null() || value.is_nan())
            && !matches!(op, FilterOperator::Equal | FilterOperator::NotEqual)
        {
            return Err(invalid_argument(
                "Null and NaN can only be used with '==' or '!=' filters",
            ));
        }
        if field.is_document_id() && !matches!(value.kind(), ValueKind::Reference(_) | ValueKind::Array(_)) {
            return Err(invalid_argument(
                "Document id filters require a document reference value",
            ));
        }
        Ok(Self { field, op, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            self.value.canonical_id()
        )
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let Some(other) = field_value(document, &self.field) else {
            return false;
        };
        match self.op {
            FilterOperator::Equal => other == self.value,
            FilterOperator::NotEqual => !other.is_null() && other != self.value,
            FilterOperator::LessThan
            | FilterOperator::LessThanOrEqual
            | FilterOperator::GreaterThan
            | FilterOperator::GreaterThanOrEqual => {
                if type_order(other.kind()) != type_order(self.value.kind()) {
                    return false;
                }
                let ordering = other.cmp(&self.value);
                match self.op {
                    FilterOperator::LessThan => ordering == Ordering::Less,
                    FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
                    FilterOperator::GreaterThan => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }
            }
            FilterOperator::ArrayContains => other
                .as_array()
                .map(|values| values.contains(&self.value))
                .unwrap_or(false),
            FilterOperator::In => self
                .value
                .as_array()
                .map(|values| values.contains(&other))
                .unwrap_or(false),
            FilterOperator::NotIn => {
                let Some(values) = self.value.as_array() else {
                    return false;
                };
                !other.is_null()
                    && !values.iter().any(FirestoreValue::is_null)
                    && !values.contains(&other)
            }
            FilterOperator::ArrayContainsAny => match (other.as_array(), self.value.as_array()) {
                (Some(haystack), Some(needles)) => {
                    needles.iter().any(|needle| haystack.contains(needle))
                }
                _ => false,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    pub(crate) fn flipped(&self) -> Self {
        let direction = match self.direction {
            OrderDirection::Ascending => OrderDirection::Descending,
            OrderDirection::Descending => OrderDirection::Ascending,
        };
        Self::new(self.field.clone(), direction)
    }

    pub fn canonical_id(&self) -> String {
        let direction = match self.direction {
            OrderDirection::Ascending => "asc",
            OrderDirection::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), direction)
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_document_id() {
            left.key().cmp(right.key())
        } else {
            let null = FirestoreValue::null();
            let left_value = left.field(&self.field).unwrap_or(&null);
            let right_value = right.field(&self.field).unwrap_or(&null);
            left_value.cmp(right_value)
        };
        match self.direction {
            OrderDirection::Ascending => ordering,
            OrderDirection::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitType {
    First,
    Last,
}

/// Cursor position over the order-by fields of a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    pub fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(|v| v.canonical_id()).collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, values.join(","))
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by.iter()) {
            let ordering = if order.field.is_document_id() {
                match component.kind() {
                    ValueKind::Reference(path) => match DocumentKey::from_string(path) {
                        Ok(key) => key.cmp(document.key()),
                        Err(_) => Ordering::Equal,
                    },
                    _ => Ordering::Equal,
                }
            } else {
                let null = FirestoreValue::null();
                component.cmp(document.field(&order.field).unwrap_or(&null))
            };
            let ordering = match order.direction {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub(crate) fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    pub(crate) fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }
}

/// Application-facing query over a collection or a single document.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 == 0 {
            return Err(invalid_argument(
                "Queries must reference a collection (odd number of path segments)",
            ));
        }
        Ok(Self::new(path))
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: FieldPath, direction: OrderDirection) -> Self {
        self.explicit_order_by.push(OrderBy::new(field, direction));
        self
    }

    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        self.path.len() % 2 == 0 && !self.path.is_empty() && self.filters.is_empty()
    }

    /// Collection id of the queried collection.
    pub fn collection_group(&self) -> Option<&str> {
        if self.is_document_query() {
            self.path.segment(self.path.len() - 2)
        } else {
            self.path.last_segment()
        }
    }

    fn first_inequality_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .find(|filter| filter.op().is_inequality())
            .map(FieldFilter::field)
    }

    /// Explicit orders, the implicit inequality order and the trailing
    /// document-name order.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if order_by.is_empty() {
            if let Some(field) = self.first_inequality_field() {
                if !field.is_document_id() {
                    order_by.push(OrderBy::new(field.clone(), OrderDirection::Ascending));
                }
            }
        }
        let ends_with_key = order_by
            .last()
            .map(|order| order.field().is_document_id())
            .unwrap_or(false);
        if !ends_with_key {
            let direction = order_by
                .last()
                .map(OrderBy::direction)
                .unwrap_or(OrderDirection::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        if self.is_document_query() {
            key.path() == &self.path
        } else {
            self.path.is_immediate_parent_of(key.path())
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.explicit_order_by.iter().all(|order| {
            order.field().is_document_id() || document.field(order.field()).is_some()
        })
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        self.compare_with(&self.normalized_order_by(), left, right)
    }

    pub(crate) fn compare_with(
        &self,
        order_by: &[OrderBy],
        left: &MutableDocument,
        right: &MutableDocument,
    ) -> Ordering {
        order_by
            .iter()
            .map(|order| order.compare(left, right))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }

    /// Server-facing form. Limit-to-last queries are sent with flipped order
    /// and swapped cursors.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        if self.limit_type == LimitType::Last {
            Target::new(
                self.path.clone(),
                self.filters.clone(),
                order_by.iter().map(OrderBy::flipped).collect(),
                self.limit,
                self.end_at.clone(),
                self.start_at.clone(),
            )
        } else {
            Target::new(
                self.path.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            )
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }
}

fn field_value(document: &MutableDocument, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_document_id() {
        return Some(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        ));
    }
    document.field(field).cloned()
}
