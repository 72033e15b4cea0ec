mod adapter;
mod run;

pub use adapter::Adapter;
pub use run::RunConfig;
