pub mod data;
pub mod driver;
pub mod error;
pub mod identity;
pub mod result;
pub mod store;
pub mod worker;

pub use driver::{StepDriver, StepOutput};
pub use error::{Result, WorkerErr};
pub use identity::{FixedHost, HostAddress, SystemHost, assign_task_id};
pub use result::{ShardHandle, WorkerResult, WorkerStatus};
pub use store::ShardStore;
pub use worker::{Worker, run_reference, train};
