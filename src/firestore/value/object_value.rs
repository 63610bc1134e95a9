use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Document contents addressed by field path.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectValue {
    fields: MapValue,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(fields: MapValue) -> Self {
        Self { fields }
    }

    pub fn from_fields(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            fields: MapValue::new(fields),
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        self.fields.fields()
    }

    pub fn map_value(&self) -> &MapValue {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = &self.fields;
        for segment in parents {
            current = current.get(segment)?.as_map()?;
        }
        current.get(last)
    }

    /// Writes `value` at `path`, replacing any non-map value along the way.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self.fields.fields_mut();
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map(BTreeMap::new());
            }
            current = match entry.as_map_mut() {
                Some(map) => map.fields_mut(),
                None => return,
            };
        }
        current.insert(last.clone(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self.fields.fields_mut();
        for segment in parents {
            current = match current.get_mut(segment).and_then(|v| v.as_map_mut()) {
                Some(map) => map.fields_mut(),
                None => return,
            };
        }
        current.remove(last);
    }

    /// Applies a batch of writes; `None` deletes the field.
    pub fn set_all(&mut self, data: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in data {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Leaf paths of the object. Empty maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut mask = FieldMask::empty();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut mask);
        mask
    }

    pub fn to_value(&self) -> FirestoreValue {
        FirestoreValue::from(ValueKind::Map(self.fields.clone()))
    }

    pub fn estimated_byte_size(&self) -> usize {
        self.fields.estimated_byte_size()
    }
}

fn collect_leaf_paths(map: &MapValue, prefix: &mut Vec<String>, mask: &mut FieldMask) {
    for (key, value) in map.fields() {
        prefix.push(key.clone());
        match value.as_map() {
            Some(nested) if !nested.is_empty() => collect_leaf_paths(nested, prefix, mask),
            _ => {
                if let Ok(path) = FieldPath::new(prefix.iter().cloned()) {
                    mask.insert(path);
                }
            }
        }
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> FieldPath {
        FieldPath::from_dot_separated(raw).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        assert_eq!(
            object.field(&path("a.b.c")),
            Some(&FirestoreValue::from_integer(1))
        );
        assert!(object.field(&path("a.b")).unwrap().as_map().is_some());
    }

    #[test]
    fn set_overwrites_scalars_on_the_way() {
        let mut object = ObjectValue::empty();
        object.set(&path("a"), FirestoreValue::from_string("scalar"));
        object.set(&path("a.b"), FirestoreValue::from_bool(true));
        assert_eq!(object.field(&path("a.b")), Some(&FirestoreValue::from_bool(true)));
    }

    #[test]
    fn delete_removes_nested_field() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.set(&path("a.c"), FirestoreValue::from_integer(2));
        object.delete(&path("a.b"));
        assert!(object.field(&path("a.b")).is_none());
        assert!(object.field(&path("a.c")).is_some());
        object.delete(&path("missing.field"));
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.set(&path("c"), FirestoreValue::from_map(BTreeMap::new()));
        let mask = object.field_mask();
        let fields: Vec<String> = mask.fields().iter().map(|f| f.canonical_string()).collect();
        assert_eq!(fields, vec!["a.b", "c"]);
    }
}
