pub mod errors;
pub mod ids;
pub mod keyval;
pub mod message;
pub mod peer;

pub use errors::DhtError;
pub use ids::Id;
pub use keyval::{Entry, Value};
pub use peer::{Lifecycle, NodeInfo};
