use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::User;

/// Called with the new user whenever the signed-in identity changes.
pub type UserChangeListener = Arc<dyn Fn(User) + Send + Sync>;

/// Source of the bearer tokens attached to every stream and unary call.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Forces the next [`TokenProvider::get_token`] to fetch a fresh token.
    fn invalidate_token(&self);

    fn current_user(&self) -> User {
        User::unauthenticated()
    }

    fn set_change_listener(&self, _listener: UserChangeListener) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[async_trait]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

struct StaticTokenState {
    user: User,
    token: Option<String>,
    invalidations: usize,
    listener: Option<UserChangeListener>,
}

/// Provider backed by a fixed user and token that can be swapped at runtime.
pub struct StaticTokenProvider {
    state: Mutex<StaticTokenState>,
}

impl StaticTokenProvider {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self {
            state: Mutex::new(StaticTokenState {
                user,
                token,
                invalidations: 0,
                listener: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StaticTokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switches identity and notifies the registered listener.
    pub fn set_user(&self, user: User, token: Option<String>) {
        let listener = {
            let mut state = self.lock();
            state.user = user.clone();
            state.token = token;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }

    pub fn invalidation_count(&self) -> usize {
        self.lock().invalidations
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(self.lock().token.clone())
    }

    fn invalidate_token(&self) {
        self.lock().invalidations += 1;
    }

    fn current_user(&self) -> User {
        self.lock().user.clone()
    }

    fn set_change_listener(&self, listener: UserChangeListener) {
        self.lock().listener = Some(listener);
    }
}
