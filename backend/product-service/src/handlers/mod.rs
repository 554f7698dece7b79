/// HTTP handlers for catalog endpoints
///
/// Writes publish envelopes and answer 202 Accepted once the broker
/// acknowledges; they never touch the products table. Reads query the store
/// directly and may lag the most recently accepted write.
pub mod products;

pub use products::{
    adjust_stock, create_product, delete_product, get_product, list_products, update_product,
    PublishState,
};
