pub mod queue;
pub mod worker;

pub use queue::RetryQueue;
pub use worker::RetryWorker;
