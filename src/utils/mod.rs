//! Internal helpers shared across the runtime.

pub(crate) mod slab;
