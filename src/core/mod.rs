pub mod layout;
pub mod memory;
pub mod process;
pub mod types;
