use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

define_id!(
    /// Arena key of a node in the graph
    NodeId,
    "node#"
);
define_id!(
    /// Arena key of a port; the port itself records its owning node
    PortId,
    "port#"
);
define_id!(
    /// Arena key of a link between two ports
    LinkId,
    "link#"
);
define_id!(
    /// Reactor source (event, idle or timer)
    SourceId,
    "source#"
);

/// Monotonic allocator for arena ids. Ids are never reused within a graph.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next<T: From<u32>>(&mut self) -> T {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        T::from(id)
    }
}
