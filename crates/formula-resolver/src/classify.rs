//! Routing by account type.
//!
//! Balance-sheet entities carry a running balance (the value as of a period is
//! cumulative); income-statement entities report activity per period. The two
//! classes take different paths through the scheduler.

use crate::collaborator::Collaborator;
use crate::error::ResolveError;
use crate::single_flight::SingleFlight;
use formula_storage::Storage;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const PERSISTED_PREFIX: &str = "class:";

/// Account type strings as the ledger service reports them.
pub mod account_type {
    pub const BANK: &str = "Bank";
    pub const ACCOUNTS_RECEIVABLE: &str = "AcctRec";
    pub const OTHER_CURRENT_ASSET: &str = "OthCurrAsset";
    pub const FIXED_ASSET: &str = "FixedAsset";
    pub const OTHER_ASSET: &str = "OthAsset";
    pub const DEFERRED_EXPENSE: &str = "DeferExpense";
    pub const UNBILLED_RECEIVABLE: &str = "UnbilledRec";
    pub const ACCOUNTS_PAYABLE: &str = "AcctPay";
    pub const CREDIT_CARD: &str = "CredCard";
    pub const OTHER_CURRENT_LIABILITY: &str = "OthCurrLiab";
    pub const LONG_TERM_LIABILITY: &str = "LongTermLiab";
    pub const DEFERRED_REVENUE: &str = "DeferRevenue";
    pub const EQUITY: &str = "Equity";
    pub const RETAINED_EARNINGS: &str = "RetainedEarnings";

    pub const INCOME: &str = "Income";
    pub const OTHER_INCOME: &str = "OthIncome";
    pub const COGS: &str = "COGS";
    pub const COST_OF_GOODS_SOLD: &str = "Cost of Goods Sold";
    pub const EXPENSE: &str = "Expense";
    pub const OTHER_EXPENSE: &str = "OthExpense";

    pub const NON_POSTING: &str = "NonPosting";
    pub const STATISTICAL: &str = "Stat";

    pub const CUMULATIVE: &[&str] = &[
        BANK,
        ACCOUNTS_RECEIVABLE,
        OTHER_CURRENT_ASSET,
        FIXED_ASSET,
        OTHER_ASSET,
        DEFERRED_EXPENSE,
        UNBILLED_RECEIVABLE,
        ACCOUNTS_PAYABLE,
        CREDIT_CARD,
        OTHER_CURRENT_LIABILITY,
        LONG_TERM_LIABILITY,
        DEFERRED_REVENUE,
        EQUITY,
        RETAINED_EARNINGS,
    ];

    pub const ACTIVITY: &[&str] = &[
        INCOME,
        OTHER_INCOME,
        COGS,
        COST_OF_GOODS_SOLD,
        EXPENSE,
        OTHER_EXPENSE,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountClass {
    /// Balance sheet: value as of a period is the running balance.
    Cumulative,
    /// Income statement: value for a period is that period's activity.
    Activity,
}

pub fn class_for_account_type(raw: &str) -> Result<AccountClass, ResolveError> {
    let ty = raw.trim();
    if account_type::CUMULATIVE.contains(&ty) {
        Ok(AccountClass::Cumulative)
    } else if account_type::ACTIVITY.contains(&ty) {
        Ok(AccountClass::Activity)
    } else if ty == account_type::NON_POSTING || ty == account_type::STATISTICAL {
        Err(ResolveError::InvalidParameters(format!(
            "{ty} accounts carry no balance"
        )))
    } else {
        Err(ResolveError::InvalidParameters(format!(
            "unknown account type {ty:?}"
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedClass {
    account_type: String,
    class: AccountClass,
}

/// Cached account-type lookups. Only successful classifications are kept.
#[derive(Clone)]
pub struct RoutingClassifier {
    storage: Storage,
    known: Arc<Mutex<HashMap<String, AccountClass>>>,
    lookups: SingleFlight<String, Result<AccountClass, ResolveError>>,
}

impl RoutingClassifier {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            known: Arc::new(Mutex::new(HashMap::new())),
            lookups: SingleFlight::new(),
        }
    }

    /// Already-known class, without any lookup.
    pub fn known(&self, entity: &str) -> Option<AccountClass> {
        self.known
            .lock()
            .expect("classifier mutex poisoned")
            .get(entity)
            .copied()
    }

    pub async fn classify<C: Collaborator>(
        &self,
        collaborator: &C,
        entity: &str,
    ) -> Result<AccountClass, ResolveError> {
        if let Some(class) = self.known(entity) {
            return Ok(class);
        }
        if let Some(class) = self.load_persisted(entity) {
            self.remember(entity, class);
            return Ok(class);
        }

        self.lookups
            .run(entity.to_string(), move || async move {
                let account_type = collaborator.account_type(entity.to_string()).await?;
                let class = class_for_account_type(&account_type)?;
                debug!("classified {entity} ({account_type}) as {class:?}");
                self.remember(entity, class);
                self.persist(entity, &account_type, class);
                Ok::<_, ResolveError>(class)
            })
            .await
    }

    pub fn clear(&self) -> Result<(), formula_storage::StorageError> {
        self.known.lock().expect("classifier mutex poisoned").clear();
        self.storage.delete_prefix(PERSISTED_PREFIX)?;
        Ok(())
    }

    fn remember(&self, entity: &str, class: AccountClass) {
        self.known
            .lock()
            .expect("classifier mutex poisoned")
            .insert(entity.to_string(), class);
    }

    fn load_persisted(&self, entity: &str) -> Option<AccountClass> {
        let raw = match self.storage.get(&format!("{PERSISTED_PREFIX}{entity}")) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!("persisted class lookup for {entity} failed: {err}");
                return None;
            }
        };
        match serde_json::from_str::<PersistedClass>(&raw) {
            Ok(persisted) => Some(persisted.class),
            Err(err) => {
                warn!("persisted class for {entity} is corrupt; ignoring: {err}");
                None
            }
        }
    }

    fn persist(&self, entity: &str, account_type: &str, class: AccountClass) {
        let record = PersistedClass {
            account_type: account_type.to_string(),
            class,
        };
        let result = serde_json::to_string(&record)
            .map_err(|err| err.to_string())
            .and_then(|json| {
                self.storage
                    .put(&format!("{PERSISTED_PREFIX}{entity}"), &json)
                    .map_err(|err| err.to_string())
            });
        if let Err(err) = result {
            warn!("failed to persist class of {entity}: {err}");
        }
    }
}
