pub mod common;
pub mod field;
pub mod relationship;
pub mod row;
pub mod sync;
pub mod working_list;

pub use common::*;
pub use field::*;
pub use relationship::*;
pub use row::*;
pub use sync::*;
pub use working_list::*;
