pub mod gateway;
pub mod view_model;

pub use gateway::MutationGateway;
pub use view_model::{OptimisticChange, SubscriptionHandle, TaskListViewModel, TaskSubscription};
