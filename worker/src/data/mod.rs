pub mod dataloader;
pub mod shard;

pub use dataloader::DataLoader;
pub use shard::generate_or_restore;
