pub mod auth;
pub mod capture;
pub mod config;
pub mod error;
pub mod model;
pub mod normalizer;
pub mod parser;
pub mod profile;
pub mod rewards;
pub mod services;
pub mod store;
pub mod workspace;

pub use auth::{Account, AccountError, AuthProvider, LocalAccounts, SessionFile, StaticAuth};
pub use capture::{PointsInput, TaskDraft, TaskPatch};
pub use config::AppConfig;
pub use error::{StoreError, TaskError, ValidationIssue};
pub use model::*;
pub use normalizer::StoreLayout;
pub use profile::Profile;
pub use rewards::{RewardError, RewardsShop};
pub use services::{
    MutationGateway, OptimisticChange, SubscriptionHandle, TaskListViewModel, TaskSubscription,
};
pub use store::{MemoryTaskStore, SqliteTaskStore, TaskStore};
pub use workspace::Workspace;
