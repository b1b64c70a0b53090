pub mod dispatch;
pub mod handlers;
pub mod queue;
pub mod retry;
pub mod safety;
