mod base;

pub use base::{ClientId, EventBus, GraphEvent, ObjectRef};
