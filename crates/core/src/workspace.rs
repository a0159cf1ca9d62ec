use std::sync::Arc;

use anyhow::Result;

use crate::auth::{AuthProvider, LocalAccounts, SessionFile};
use crate::config::AppConfig;
use crate::rewards::RewardsShop;
use crate::services::{MutationGateway, TaskListViewModel};
use crate::store::{SqliteTaskStore, TaskStore};

/// Everything a client needs, wired against the on-disk store.
#[derive(Clone)]
pub struct Workspace {
    config: AppConfig,
    store: Arc<SqliteTaskStore>,
    session: Arc<SessionFile>,
}

impl Workspace {
    pub fn open(config: AppConfig) -> Result<Self> {
        let store = SqliteTaskStore::initialize(&config)?;
        let session = SessionFile::for_config(&config);
        Ok(Self {
            config,
            store: Arc::new(store),
            session: Arc::new(session),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionFile {
        &self.session
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.session.current_user_id()
    }

    pub fn accounts(&self) -> Result<LocalAccounts> {
        LocalAccounts::initialize(&self.config)
    }

    pub fn gateway(&self) -> MutationGateway {
        MutationGateway::new(self.store(), self.session.clone(), self.config.layout())
    }

    pub fn view_model(&self) -> TaskListViewModel {
        TaskListViewModel::new(self.store(), self.config.layout())
            .with_max_tasks(self.config.max_tasks())
    }

    pub fn rewards(&self) -> RewardsShop {
        RewardsShop::new(self.store(), self.session.clone(), self.config.layout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TaskDraft;
    use crate::error::TaskError;
    use futures::StreamExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn session_gates_the_whole_workspace() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::from_data_dir(dir.path().to_path_buf()).unwrap();
        let workspace = Workspace::open(config).unwrap();

        assert_eq!(
            workspace.gateway().create(&TaskDraft::new("Nope")).await,
            Err(TaskError::Unauthenticated)
        );

        let account = workspace
            .accounts()
            .unwrap()
            .sign_up("a@b.co", "secret1", "secret1")
            .unwrap();
        workspace.session().sign_in(&account).unwrap();

        let task = workspace
            .gateway()
            .create(&TaskDraft::new("Persisted"))
            .await
            .unwrap();
        let vm = workspace.view_model();
        let mut sub = vm.subscribe(&account.user_id).await.unwrap();
        let snapshot = sub.next().await.unwrap();
        assert_eq!(snapshot.find(&task.id).map(|t| t.title.as_str()), Some("Persisted"));
    }
}
