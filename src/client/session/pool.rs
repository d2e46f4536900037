use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;

use super::ServerSession;
#[cfg(test)]
use bson::Document;

/// A pool of server sessions, reused oldest-first so that sessions cycle through the pool before
/// their server-side timeout can expire.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Checks out a server session from the pool. Sessions that are about to expire are
    /// discarded along the way. If no usable session remains, a new one is created.
    pub(crate) async fn check_out(&self, logical_session_timeout: Option<Duration>) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks in a server session to the pool. If it is about to expire or is dirty, it is
    /// discarded instead.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;
        // Prune expired sessions from the back of the queue; anything in front of them is
        // younger and still valid.
        while let Some(pooled_session) = pool.back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                pool.pop_back();
            } else {
                break;
            }
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_back(session);
        }
    }

    #[cfg(test)]
    pub(crate) async fn clear(&self) {
        self.pool.lock().await.clear();
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &Document) -> bool {
        self.pool.lock().await.iter().any(|s| &s.id == id)
    }
}
