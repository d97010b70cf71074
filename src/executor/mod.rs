mod bulk;
mod single;

pub use bulk::{BatchFailure, BatchResult, BulkOptions, BulkTransitionExecutor, TransactionMode};
pub use single::SingleTransitionExecutor;
