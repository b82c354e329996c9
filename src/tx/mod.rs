//! Transaction submission and fee estimation

mod dispatcher;
mod gas;

pub use dispatcher::Dispatcher;
pub use gas::FeeEstimator;
