pub mod inventory;

pub use inventory::MemoryCloud;
