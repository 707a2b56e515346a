//! Cached public identity and its derived signer.

use std::sync::RwLock;

use super::protocol::MeResponse;

/// Last successful [`MeResponse`], cleared on unpair.
#[derive(Debug, Default)]
pub struct ProfileCache {
    current: RwLock<Option<MeResponse>>,
}

impl ProfileCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking read-through; `None` if no successful `Me` has landed yet.
    #[must_use]
    pub fn get(&self) -> Option<MeResponse> {
        self.current.read().expect("profile cache lock poisoned").clone()
    }

    /// Replace the cache after a successful `Me` response.
    pub fn set(&self, me: MeResponse) {
        *self.current.write().expect("profile cache lock poisoned") = Some(me);
    }

    /// Clear on unpair.
    pub fn clear(&self) {
        *self.current.write().expect("profile cache lock poisoned") = None;
    }
}
