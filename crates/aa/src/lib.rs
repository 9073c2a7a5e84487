pub mod contracts;
mod entity;
pub mod tracer;
mod userop;

pub use entity::{EntityKind, ReturnInfo, StakeInfo};
pub use userop::{UserOperation, encode_handle_ops, encode_simulate_validation};
