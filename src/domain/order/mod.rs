// ============================================================================
// Order Domain
// ============================================================================
//
// - Value objects (Order, OrderStatus, CreateOrder, NewOrder)
// - Events (OrderCreatedEvent, the published wire contract)
// - Errors (OrderError, the pipeline's error taxonomy)
//
// ============================================================================

pub mod value_objects;
pub mod events;
pub mod errors;

pub use value_objects::*;
pub use events::*;
pub use errors::*;
