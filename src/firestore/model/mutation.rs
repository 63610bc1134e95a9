use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{FirestoreValue, ObjectValue, ValueKind};

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(true) => document.is_found_document(),
            Precondition::Exists(false) => !document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(previous, local_write_time)
            }
            TransformOperation::ArrayUnion(elements) => {
                let mut values = existing_array(previous);
                for element in elements {
                    if !values.contains(element) {
                        values.push(element.clone());
                    }
                }
                FirestoreValue::from_array(values)
            }
            TransformOperation::ArrayRemove(elements) => {
                let values = existing_array(previous)
                    .into_iter()
                    .filter(|value| !elements.contains(value))
                    .collect();
                FirestoreValue::from_array(values)
            }
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                add_numbers(&base, operand)
            }
        }
    }

    /// Uses the server's result when present; array transforms are
    /// recomputed since the server does not return them.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: Option<FirestoreValue>,
    ) -> FirestoreValue {
        match (self, transform_result) {
            (TransformOperation::ArrayUnion(_), _) | (TransformOperation::ArrayRemove(_), _) => {
                self.apply_to_local_view(previous, Timestamp::default())
            }
            (_, Some(result)) => result,
            (TransformOperation::ServerTimestamp, None) => FirestoreValue::null(),
            (TransformOperation::NumericIncrement(_), None) => {
                self.apply_to_local_view(previous, Timestamp::default())
            }
        }
    }

    /// Pre-image of the field an increment builds on.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }
}

fn existing_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(<[FirestoreValue]>::to_vec)
        .unwrap_or_default()
}

fn add_numbers(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(left), ValueKind::Integer(right)) => {
            FirestoreValue::from_integer(left.saturating_add(*right))
        }
        _ => {
            let left = base.as_double().unwrap_or(0.0);
            let right = operand.as_double().unwrap_or(0.0);
            FirestoreValue::from_double(left + right)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

/// Outcome of one mutation reported by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub version: SnapshotVersion,
    #[serde(default)]
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: ObjectValue,
        #[serde(default)]
        precondition: Precondition,
        #[serde(default)]
        transforms: Vec<FieldTransform>,
    },
    Patch {
        key: DocumentKey,
        value: ObjectValue,
        mask: FieldMask,
        #[serde(default)]
        precondition: Precondition,
        #[serde(default)]
        transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        #[serde(default)]
        precondition: Precondition,
    },
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            transforms: Vec::new(),
        }
    }

    pub fn patch(
        key: DocumentKey,
        value: ObjectValue,
        mask: FieldMask,
        precondition: Precondition,
    ) -> Self {
        Mutation::Patch {
            key,
            value,
            mask,
            precondition,
            transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    /// Attaches field transforms. Ignored for deletes and verifies.
    pub fn with_transforms(mut self, field_transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set { transforms, .. } | Mutation::Patch { transforms, .. } => {
                *transforms = field_transforms;
            }
            Mutation::Delete { .. } | Mutation::Verify { .. } => {}
        }
        self
    }

    pub fn with_precondition(mut self, new_precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new_precondition,
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set { transforms, .. } | Mutation::Patch { transforms, .. } => transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Applies the mutation to a local view of `document`.
    ///
    /// `previous_mask` is the set of fields changed so far by earlier
    /// mutations, `None` meaning the whole document was replaced. Returns the
    /// updated mask in the same form.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(document) {
            return previous_mask;
        }
        match self {
            Mutation::Set {
                value, transforms, ..
            } => {
                let mut data = value.clone();
                data.set_all(local_transform_results(transforms, document, local_write_time));
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                value,
                mask,
                transforms,
                ..
            } => {
                let transform_results =
                    local_transform_results(transforms, document, local_write_time);
                let mut data = document.data().clone();
                data.set_all(patch_values(value, mask));
                data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                previous_mask.map(|previous| {
                    let mut merged = previous.union(mask);
                    for transform in transforms {
                        merged.insert(transform.field.clone());
                    }
                    merged
                })
            }
            Mutation::Delete { .. } => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Applies the backend-acknowledged outcome of this mutation.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match self {
            Mutation::Set {
                value, transforms, ..
            } => {
                let mut data = value.clone();
                data.set_all(server_transform_results(
                    transforms,
                    document,
                    &result.transform_results,
                ));
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch {
                value,
                mask,
                precondition,
                transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results =
                    server_transform_results(transforms, document, &result.transform_results);
                let mut data = document.data().clone();
                data.set_all(patch_values(value, mask));
                data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Patch that pins the pre-image of every incremented field, so the
    /// increment replays on the same base when the overlay is recomputed.
    pub fn extract_transform_base_mutation(&self, document: &MutableDocument) -> Option<Mutation> {
        let mut base = ObjectValue::empty();
        let mut mask = FieldMask::empty();
        for transform in self.field_transforms() {
            let previous = document.field(&transform.field);
            if let Some(value) = transform.operation.compute_base_value(previous) {
                base.set(&transform.field, value);
                mask.insert(transform.field.clone());
            }
        }
        if mask.is_empty() {
            return None;
        }
        Some(Mutation::patch(
            self.key().clone(),
            base,
            mask,
            Precondition::Exists(true),
        ))
    }

    /// Squashes the effect of a local fold into one mutation: a set or
    /// delete when the document was replaced, a patch over the touched
    /// fields otherwise. `None` when the fold changed nothing.
    pub fn calculate_overlay(document: &MutableDocument, mask: Option<&FieldMask>) -> Option<Mutation> {
        if !document.has_local_mutations() {
            return None;
        }
        let Some(mask) = mask else {
            return Some(if document.is_no_document() {
                Mutation::delete(document.key().clone())
            } else {
                Mutation::set(document.key().clone(), document.data().clone())
            });
        };
        if mask.is_empty() {
            return None;
        }

        let mut patch = ObjectValue::empty();
        let mut patch_mask = FieldMask::empty();
        for field in mask.fields() {
            if patch_mask.fields().contains(field) {
                continue;
            }
            let mut path = field.clone();
            let mut value = document.field(&path);
            if value.is_none() {
                if let Some(parent) = path.parent() {
                    value = document.field(&parent);
                    path = parent;
                }
            }
            match value {
                Some(value) => patch.set(&path, value.clone()),
                None => patch.delete(&path),
            }
            patch_mask.insert(path);
        }
        Some(Mutation::patch(
            document.key().clone(),
            patch,
            patch_mask,
            Precondition::None,
        ))
    }
}

fn patch_values(value: &ObjectValue, mask: &FieldMask) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    mask.fields()
        .iter()
        .map(|path| (path.clone(), value.field(path).cloned()))
        .collect()
}

fn local_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    local_write_time: Timestamp,
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    transforms
        .iter()
        .map(|transform| {
            let previous = document.field(&transform.field);
            let value = transform
                .operation
                .apply_to_local_view(previous, local_write_time);
            (transform.field.clone(), Some(value))
        })
        .collect()
}

fn server_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    results: &[FirestoreValue],
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    transforms
        .iter()
        .enumerate()
        .map(|(index, transform)| {
            let previous = document.field(&transform.field);
            let value = transform
                .operation
                .apply_to_remote_document(previous, results.get(index).cloned());
            (transform.field.clone(), Some(value))
        })
        .collect()
}
