use std::collections::HashMap;

use color_eyre::{eyre::Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::account::SlurmAccount;

/// Provisioned resources of an account. An account is either a CPU or a GPU allocation,
/// never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Cpu(u32),
    Gpu(u32),
}

impl Allocation {
    pub fn count(&self) -> u32 {
        match *self {
            Allocation::Cpu(count) | Allocation::Gpu(count) => count,
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Allocation::Gpu(_))
    }
}

/// What the allocation source hands out: `{"cpu": 120}` or `{"gpu": 8}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RawAllocation {
    pub cpu: Option<u32>,
    pub gpu: Option<u32>,
}

impl RawAllocation {
    /// `cpu` wins when a record carries both keys.
    pub fn resolve(self) -> Option<Allocation> {
        match (self.cpu, self.gpu) {
            (Some(cpu), _) => Some(Allocation::Cpu(cpu)),
            (None, Some(gpu)) => Some(Allocation::Gpu(gpu)),
            (None, None) => None,
        }
    }
}

/// Account → allocation snapshot. Accounts without an active allocation are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationTable(HashMap<SlurmAccount, Allocation>);

impl AllocationTable {
    pub fn from_json(input: &str) -> Result<Self> {
        let raw: HashMap<String, RawAllocation> = serde_json::from_str(input).wrap_err("parsing allocation table")?;
        Ok(Self(
            raw.into_iter()
                .filter_map(|(account, raw)| raw.resolve().map(|alloc| (SlurmAccount(account), alloc)))
                .collect(),
        ))
    }

    pub fn get(&self, account: &SlurmAccount) -> Option<Allocation> {
        self.0.get(account).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(SlurmAccount, Allocation)> for AllocationTable {
    fn from_iter<T: IntoIterator<Item = (SlurmAccount, Allocation)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Allocation metadata as shown on the account page. `gpu` is absent when the account has
/// no allocation, and only the count matching the allocation type is present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocationSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
}

impl From<Option<Allocation>> for AllocationSummary {
    fn from(value: Option<Allocation>) -> Self {
        match value {
            Some(Allocation::Cpu(count)) => Self {
                gpu: Some(false),
                cpu_count: Some(count),
                gpu_count: None,
            },
            Some(Allocation::Gpu(count)) => Self {
                gpu: Some(true),
                cpu_count: None,
                gpu_count: Some(count),
            },
            None => Self::default(),
        }
    }
}

/// An account the user belongs to, with its allocation if any (index page).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountAllocation {
    pub account: SlurmAccount,
    #[serde(flatten)]
    pub allocation: AllocationSummary,
}
