use std::fmt::Debug;

use derive_more::derive::{Deref, Display, From, Into};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deref, Display, From, Into, Serialize, Deserialize)]
pub struct SlurmUser(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deref, Display, From, Into, Serialize, Deserialize)]
pub struct SlurmAccount(pub String);

impl From<&str> for SlurmUser {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<&str> for SlurmAccount {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl SlurmAccount {
    /// `def-<pi>` accounts are the default share every group gets without applying for
    /// resources, so there is no allocation to draw a reference line for.
    pub fn is_default(&self) -> bool {
        self.0.starts_with("def-")
    }
}

/// One row of `<cluster>_assoc_table`: the (user, account, partition) tuple a job is
/// charged to. The job table is indexed by `id_assoc`, not by account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assoc {
    pub id_assoc: u32,
    pub user: SlurmUser,
    pub account: SlurmAccount,
    pub partition: String,
}

pub fn assoc_ids(assocs: &[Assoc]) -> Vec<u32> {
    assocs.iter().map(|assoc| assoc.id_assoc).collect()
}

/// True if `user` has at least one association in the given set.
pub fn has_member(assocs: &[Assoc], user: &SlurmUser) -> bool {
    assocs.iter().any(|assoc| &assoc.user == user)
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;

    fn assoc(id: u32, user: &str, account: &str) -> Assoc {
        Assoc {
            id_assoc: id,
            user: user.into(),
            account: account.into(),
            partition: "cpubase_bycore_b1".to_owned(),
        }
    }

    #[test]
    fn SlurmAccount__is_default() {
        assert!(SlurmAccount::from("def-alice").is_default());
        assert!(!SlurmAccount::from("rrg-alice").is_default());
        assert!(!SlurmAccount::from("alice-def-").is_default());
    }

    #[test]
    fn has_member__only_exact_user() {
        let assocs = [assoc(1, "alice", "def-alice"), assoc(2, "bob", "def-alice")];
        assert!(has_member(&assocs, &"bob".into()));
        assert!(!has_member(&assocs, &"bo".into()));
        assert_eq!(assoc_ids(&assocs), vec![1, 2]);
    }
}
