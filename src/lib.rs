pub mod core;
pub mod slave;
