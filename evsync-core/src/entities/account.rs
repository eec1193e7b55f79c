use super::{SessionId, UserId};
use compact_str::CompactString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountState {
    NotReady,
    Ready,
    Disabled,
    Removed,
    UnlockFailed,
    UserKeyCheckFailed,
    UserAddressKeyCheckFailed,
    MigrationNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    SecondFactorNeeded,
    SecondFactorSuccess,
    SecondFactorFailed,
    Authenticated,
    ForceLogout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user_id: UserId,
    pub username: CompactString,
    pub state: AccountState,
    pub session_id: Option<SessionId>,
    pub session_state: Option<SessionState>,
}

impl Account {
    pub fn is_ready(&self) -> bool {
        self.state == AccountState::Ready
    }
}

/// An API session. Unauthenticated sessions have no user.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: Option<UserId>,
    pub access_token: String,
    pub refresh_token: String,
    pub scopes: Vec<String>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}
