//! Points shop. Completed tasks earn points; rewards spend them.
//!
//! Purchases are records under `purchases/{uid}` in the same store as the
//! tasks, so the balance is always derived and never stored.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::auth::AuthProvider;
use crate::error::TaskError;
use crate::normalizer::{normalize_all, StoreLayout};
use crate::store::{server_timestamp, FieldMap, RawRecord, StoreScope, TaskStore};

const PURCHASES_PATH: &str = "purchases";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardKind {
    Theme,
    Badge,
    Animation,
}

impl RewardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardKind::Theme => "theme",
            RewardKind::Badge => "badge",
            RewardKind::Animation => "animation",
        }
    }
}

impl fmt::Display for RewardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reward {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub price: u64,
    pub kind: RewardKind,
}

pub const CATALOG: [Reward; 4] = [
    Reward {
        id: "dark-theme",
        name: "Dark theme",
        description: "Unlock the dark app theme",
        price: 100,
        kind: RewardKind::Theme,
    },
    Reward {
        id: "blue-theme",
        name: "Blue theme",
        description: "Unlock the blue app theme",
        price: 150,
        kind: RewardKind::Theme,
    },
    Reward {
        id: "premium-icon",
        name: "Premium icon",
        description: "Special icon on your profile",
        price: 200,
        kind: RewardKind::Badge,
    },
    Reward {
        id: "special-animation",
        name: "Special animation",
        description: "Animation when completing tasks",
        price: 250,
        kind: RewardKind::Animation,
    },
];

pub fn find_reward(id: &str) -> Option<&'static Reward> {
    CATALOG.iter().find(|reward| reward.id == id)
}

#[derive(Debug, Error)]
pub enum RewardError {
    #[error("Unknown reward '{0}'")]
    UnknownReward(String),
    #[error("'{0}' was already purchased")]
    AlreadyPurchased(String),
    #[error("Not enough points: {needed} needed, {available} available")]
    InsufficientPoints { needed: u64, available: u64 },
    #[error(transparent)]
    Task(#[from] TaskError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub reward_id: String,
    pub price: u64,
    pub purchased_at: DateTime<Utc>,
}

impl Purchase {
    fn from_record(record: &RawRecord) -> Option<Self> {
        let fields = &record.fields;
        Some(Self {
            reward_id: fields.get("rewardId")?.as_str()?.to_string(),
            price: fields.get("price").and_then(Value::as_u64).unwrap_or(0),
            purchased_at: fields
                .get("purchasedAt")
                .and_then(Value::as_i64)
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Wallet {
    pub earned: u64,
    pub spent: u64,
}

impl Wallet {
    pub fn balance(&self) -> u64 {
        self.earned.saturating_sub(self.spent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Offer {
    pub reward: Reward,
    pub purchased: bool,
    pub affordable: bool,
}

/// Clones share one checkout lock, so purchases made through the same shop
/// never both pass the balance check.
#[derive(Clone)]
pub struct RewardsShop {
    store: Arc<dyn TaskStore>,
    auth: Arc<dyn AuthProvider>,
    layout: StoreLayout,
    checkout: Arc<tokio::sync::Mutex<()>>,
}

impl RewardsShop {
    pub fn new(store: Arc<dyn TaskStore>, auth: Arc<dyn AuthProvider>, layout: StoreLayout) -> Self {
        Self {
            store,
            auth,
            layout,
            checkout: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn user(&self) -> Result<String, TaskError> {
        self.auth
            .current_user_id()
            .filter(|id| !id.trim().is_empty())
            .ok_or(TaskError::Unauthenticated)
    }

    fn purchases_scope(user_id: &str) -> StoreScope {
        StoreScope::path(format!("{PURCHASES_PATH}/{user_id}"))
    }

    pub async fn purchases(&self) -> Result<Vec<Purchase>, TaskError> {
        let user_id = self.user()?;
        self.purchases_of(&user_id).await
    }

    async fn purchases_of(&self, user_id: &str) -> Result<Vec<Purchase>, TaskError> {
        let records = self.store.query(&Self::purchases_scope(user_id)).await?;
        Ok(records.iter().filter_map(Purchase::from_record).collect())
    }

    async fn wallet_of(&self, user_id: &str) -> Result<(Wallet, Vec<Purchase>), TaskError> {
        let records = self.store.query(&self.layout.task_scope(user_id)).await?;
        let earned = normalize_all(self.layout.normalizer(), &records)
            .tasks
            .iter()
            .filter(|task| task.completed)
            .map(|task| u64::from(task.points))
            .sum();
        let purchases = self.purchases_of(user_id).await?;
        let spent = purchases.iter().map(|purchase| purchase.price).sum();
        Ok((Wallet { earned, spent }, purchases))
    }

    pub async fn wallet(&self) -> Result<Wallet, TaskError> {
        let user_id = self.user()?;
        Ok(self.wallet_of(&user_id).await?.0)
    }

    /// The catalog annotated for the signed-in user.
    pub async fn offers(&self) -> Result<(Wallet, Vec<Offer>), TaskError> {
        let user_id = self.user()?;
        let (wallet, purchases) = self.wallet_of(&user_id).await?;
        let offers = CATALOG
            .iter()
            .map(|reward| Offer {
                reward: *reward,
                purchased: purchases.iter().any(|p| p.reward_id == reward.id),
                affordable: wallet.balance() >= reward.price,
            })
            .collect();
        Ok((wallet, offers))
    }

    pub async fn purchase(&self, reward_id: &str) -> Result<Purchase, RewardError> {
        let user_id = self.user()?;
        let reward =
            find_reward(reward_id).ok_or_else(|| RewardError::UnknownReward(reward_id.into()))?;
        // Held until the purchase record is written.
        let _checkout = self.checkout.lock().await;
        let (wallet, purchases) = self.wallet_of(&user_id).await?;
        if purchases.iter().any(|p| p.reward_id == reward.id) {
            return Err(RewardError::AlreadyPurchased(reward.id.into()));
        }
        if wallet.balance() < reward.price {
            return Err(RewardError::InsufficientPoints {
                needed: reward.price,
                available: wallet.balance(),
            });
        }

        let scope = Self::purchases_scope(&user_id);
        let mut fields = FieldMap::new();
        fields.insert("rewardId".into(), Value::from(reward.id));
        fields.insert("price".into(), Value::from(reward.price));
        fields.insert("purchasedAt".into(), server_timestamp());
        let key = self
            .store
            .create_record(&scope, fields)
            .await
            .map_err(TaskError::from)?;
        tracing::debug!(reward = reward.id, user = user_id.as_str(), "reward purchased");

        let record = self
            .store
            .fetch_record(&scope, &key)
            .await
            .map_err(TaskError::from)?;
        record
            .as_ref()
            .and_then(Purchase::from_record)
            .ok_or_else(|| TaskError::NotFound { id: key }.into())
    }
}
