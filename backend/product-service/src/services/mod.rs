/// Business logic layer.
///
/// The apply engine is the only component that mutates the canonical store;
/// the HTTP layer is a pure event source.
pub mod apply;

pub use apply::{ProductApplier, StockApplier};
