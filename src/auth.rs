//! Authorization: the control plane receives already-authenticated
//! operations carrying a principal. Admins may act on any cluster;
//! non-admins only on clusters they own.

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("principal {user_id} is not authorized for this cluster")]
    Unauthorized { user_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub is_admin: bool,
}

impl Principal {
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: true,
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    /// The principal the control plane's own background loops act as —
    /// health recovery, metrics sampling and scheduled backups are not
    /// acting on behalf of any particular caller, so they need admin
    /// visibility across every cluster.
    pub fn system() -> Self {
        Self::admin("system")
    }
}

pub fn authorize(principal: &Principal, owner_id: &str) -> Result<(), AuthError> {
    if principal.is_admin || principal.user_id == owner_id {
        Ok(())
    } else {
        Err(AuthError::Unauthorized {
            user_id: principal.user_id.clone(),
        })
    }
}
