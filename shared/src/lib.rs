pub mod error;
pub mod events;
pub mod status;
pub mod topics;

pub use error::{CoreError, CoreResult};
pub use events::*;
pub use status::OrderStatus;
pub use topics::EventType;
