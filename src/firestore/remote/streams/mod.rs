pub mod listen;
pub mod write;

pub use listen::{watch_target_for, ListenStream, ListenStreamDelegate};
pub use write::{WriteRequest, WriteResponse, WriteStream, WriteStreamDelegate};
