pub mod reconcile;
pub mod table_field;

pub use reconcile::*;
pub use table_field::*;
