//! Who is asking, and may they see this account/user.
//!
//! Authentication happens in front of the portal (SSO proxy / `RemoteUser`). The proxy
//! passes the login name in `X-Remote-User`; the portal only authorizes.

use std::{collections::HashSet, sync::Arc};

use poem::Request;
use poem_openapi::{auth::ApiKey, SecurityScheme};
use portal_data::account::{has_member, Assoc, SlurmAccount, SlurmUser};
use tracing::debug;

use crate::error::PortalError;

pub const REMOTE_USER_HEADER: &str = "X-Remote-User";

/// Logins with the staff capability: they may look at any account or user.
#[derive(Debug, Clone, Default)]
pub struct StaffList(Arc<HashSet<SlurmUser>>);

impl StaffList {
    pub fn is_staff(&self, user: &SlurmUser) -> bool {
        self.0.contains(user)
    }
}

impl<S: Into<SlurmUser>> FromIterator<S> for StaffList {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().map(Into::into).collect()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: SlurmUser,
    pub staff: bool,
}

impl Identity {
    /// Own data or staff.
    pub fn authorize_user(&self, target: &SlurmUser) -> Result<(), PortalError> {
        if self.staff || &self.user == target {
            return Ok(());
        }
        Err(PortalError::Forbidden {
            requester: self.user.clone(),
            target: target.to_string(),
        })
    }

    /// `assocs` are the associations of `account`. A requester owns an account when it is
    /// named after them or they have an association in it.
    pub fn authorize_account(&self, account: &SlurmAccount, assocs: &[Assoc]) -> Result<(), PortalError> {
        if self.staff || self.user.as_str() == account.as_str() || has_member(assocs, &self.user) {
            return Ok(());
        }
        Err(PortalError::Forbidden {
            requester: self.user.clone(),
            target: account.to_string(),
        })
    }
}

/// Requesting identity taken from the proxy header. Requests without it get a 401.
#[derive(SecurityScheme)]
#[oai(ty = "api_key", key_name = "X-Remote-User", key_in = "header", checker = "identity_checker")]
pub struct RemoteUser(pub Identity);

async fn identity_checker(req: &Request, api_key: ApiKey) -> Option<Identity> {
    let login = api_key.key.trim();
    if login.is_empty() {
        return None;
    }
    let user = SlurmUser::from(login);
    let staff = req.data::<StaffList>().is_some_and(|staff| staff.is_staff(&user));
    debug!(%user, staff, "identified requester");
    Some(Identity { user, staff })
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user: &str, staff: bool) -> Identity {
        Identity {
            user: user.into(),
            staff,
        }
    }

    fn assoc(user: &str, account: &str) -> Assoc {
        Assoc {
            id_assoc: 1,
            user: user.into(),
            account: account.into(),
            partition: String::new(),
        }
    }

    #[test]
    fn Identity__authorize_user() {
        assert!(identity("alice", false).authorize_user(&"alice".into()).is_ok());
        assert!(identity("root", true).authorize_user(&"alice".into()).is_ok());
        assert!(matches!(
            identity("bob", false).authorize_user(&"alice".into()),
            Err(PortalError::Forbidden { .. })
        ));
    }

    #[test]
    fn Identity__authorize_account() {
        let account = SlurmAccount::from("def-alice");
        let assocs = [assoc("alice", "def-alice"), assoc("carol", "def-alice")];

        assert!(identity("carol", false).authorize_account(&account, &assocs).is_ok());
        assert!(identity("root", true).authorize_account(&account, &[]).is_ok());
        assert!(identity("def-alice", false).authorize_account(&account, &[]).is_ok());
        assert!(identity("bob", false).authorize_account(&account, &assocs).is_err());
        assert!(identity("bob", false).authorize_account(&account, &[]).is_err());
    }

    #[test]
    fn StaffList__is_staff() {
        let staff: StaffList = ["root", "admin"].into_iter().collect();
        assert!(staff.is_staff(&"admin".into()));
        assert!(!staff.is_staff(&"alice".into()));
        assert!(!StaffList::default().is_staff(&"root".into()));
    }
}
