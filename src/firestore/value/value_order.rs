use std::cmp::Ordering;

use crate::firestore::model::ResourcePath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Rank of each value kind in the cross-type ordering. Integers and doubles
/// share a rank so they compare numerically.
pub(crate) fn type_order(kind: &ValueKind) -> u8 {
    match kind {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp(_) => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Vector(_) => 10,
        ValueKind::Map(_) => 11,
    }
}

/// Total order over doubles: NaN sorts first and `-0.0 == 0.0`.
pub fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_integer_to_double(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    if double < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    if double >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    let truncated = double.trunc();
    integer
        .cmp(&(truncated as i64))
        .then_with(|| compare_doubles(0.0, double - truncated))
}

fn compare_numbers(left: &ValueKind, right: &ValueKind) -> Ordering {
    match (left, right) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_integer_to_double(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => {
            compare_integer_to_double(*r, *l).reverse()
        }
        _ => Ordering::Equal,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_path = ResourcePath::from_segments(left.split('/').filter(|s| !s.is_empty()));
    let right_path = ResourcePath::from_segments(right.split('/').filter(|s| !s.is_empty()));
    left_path.cmp(&right_path)
}

fn compare_slices(left: &[FirestoreValue], right: &[FirestoreValue]) -> Ordering {
    for (l, r) in left.iter().zip(right.iter()) {
        match compare_values(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left.len().cmp(&right.len())
}

pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_kind = left.kind();
    let right_kind = right.kind();
    let rank = type_order(left_kind).cmp(&type_order(right_kind));
    if rank != Ordering::Equal {
        return rank;
    }

    match (left_kind, right_kind) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::ServerTimestamp(l), ValueKind::ServerTimestamp(r)) => {
            l.local_write_time.cmp(&r.local_write_time)
        }
        (ValueKind::String(l), ValueKind::String(r)) => l.as_bytes().cmp(r.as_bytes()),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => compare_slices(l.values(), r.values()),
        (ValueKind::Vector(l), ValueKind::Vector(r)) => l.len().cmp(&r.len()).then_with(|| {
            l.iter()
                .zip(r.iter())
                .map(|(a, b)| compare_doubles(*a, *b))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        }),
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            for ((lk, lv), (rk, rv)) in l.fields().iter().zip(r.fields().iter()) {
                let ordering = lk
                    .as_bytes()
                    .cmp(rk.as_bytes())
                    .then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.fields().len().cmp(&r.fields().len())
        }
        (l, r) => compare_numbers(l, r),
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        compare_values(self, other) == Ordering::Equal
    }
}

impl Eq for FirestoreValue {}

impl PartialOrd for FirestoreValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirestoreValue {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(self, other)
    }
}
