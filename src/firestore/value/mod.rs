mod array_value;
mod bytes_value;
mod map_value;
mod object_value;
mod value;
mod value_order;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use object_value::ObjectValue;
pub use value::{FirestoreValue, ServerTimestampValue, ValueKind};
pub use value_order::{compare_doubles, compare_values};
pub(crate) use value_order::type_order;
