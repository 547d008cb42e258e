use std::path::Path;

use async_trait::async_trait;
use color_eyre::{eyre::Context as _, Result};
use portal_data::{
    account::SlurmAccount,
    allocation::{Allocation, AllocationTable},
};
use tracing::{info, instrument};

/// Where the provisioned resources of an account come from.
#[async_trait]
pub trait AllocationSource: Send + Sync {
    async fn allocation(&self, account: &SlurmAccount) -> Result<Option<Allocation>>;
}

/// Allocations from a JSON file `{"<account>": {"cpu": n} | {"gpu": n}}`, read once on startup.
#[derive(Debug, Clone, Default)]
pub struct FileAllocations(AllocationTable);

impl FileAllocations {
    #[instrument]
    pub async fn load(path: &Path) -> Result<Self> {
        let input = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("reading allocations from {path:?}"))?;
        let table = AllocationTable::from_json(&input).wrap_err_with(|| format!("in {path:?}"))?;
        info!(accounts = table.len(), "loaded allocations");
        Ok(Self(table))
    }
}

impl From<AllocationTable> for FileAllocations {
    fn from(value: AllocationTable) -> Self {
        Self(value)
    }
}

#[async_trait]
impl AllocationSource for FileAllocations {
    async fn allocation(&self, account: &SlurmAccount) -> Result<Option<Allocation>> {
        Ok(self.0.get(account))
    }
}
