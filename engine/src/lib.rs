pub mod iface;
pub mod mock;
pub mod pool;
pub mod value;
