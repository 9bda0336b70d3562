pub mod models;
pub mod table;
pub mod traits;

pub use models::*;
pub use table::*;
pub use traits::*;
