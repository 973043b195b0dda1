pub mod store;
pub mod view;

pub use store::*;
pub use view::*;
