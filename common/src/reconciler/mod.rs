// Cluster scheduling reconciler: places records waiting in the scheduling state

pub mod controller;
pub mod dispatcher;
pub mod queue;

pub use controller::{admits, ClusterReconciler, ReconcileOutcome};
pub use dispatcher::Dispatcher;
pub use queue::WorkQueue;
