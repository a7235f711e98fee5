//! Per-user session table.
//!
//! One coarse lock guards the table and the blocked-user set; it is never
//! held across an `.await`. Process teardown always happens outside it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kbroker_core::BrokerConfig;

use crate::process::ProcessLauncher;

use super::types::{CreateSession, SessionError, SessionSpec, SessionState};
use super::worker::Session;

#[derive(Default)]
struct SessionTable {
    /// Sessions per user, in creation order.
    sessions: HashMap<String, Vec<Session>>,
    /// Blocked users with their outstanding guard count.
    blocked: HashMap<String, usize>,
}

impl SessionTable {
    fn remove_session(&mut self, user: &str, session: &Session) -> bool {
        let Some(list) = self.sessions.get_mut(user) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| !s.ptr_eq(session));
        let removed = list.len() != before;
        if list.is_empty() {
            self.sessions.remove(user);
        }
        removed
    }

    fn take_by_id(&mut self, user: &str, id: &str) -> Vec<Session> {
        let Some(list) = self.sessions.get_mut(user) else {
            return Vec::new();
        };
        let (taken, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(|s| s.id() == id);
        *list = kept;
        if list.is_empty() {
            self.sessions.remove(user);
        }
        taken
    }
}

struct ManagerInner {
    config: BrokerConfig,
    launcher: Arc<dyn ProcessLauncher>,
    table: Mutex<SessionTable>,
    shutdown: CancellationToken,
}

/// Owns every worker session of the broker.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(config: BrokerConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                launcher,
                table: Mutex::new(SessionTable::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Token cancelled when the broker shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    fn is_blocked(&self, user: &str) -> bool {
        self.inner.table.lock().blocked.contains_key(user)
    }

    /// Create and start a session, replacing any session with the same id.
    pub async fn create(
        &self,
        user: &str,
        id: &str,
        request: CreateSession,
    ) -> Result<Session, SessionError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }
        if user.is_empty() || id.is_empty() {
            return Err(SessionError::InvalidRequest(
                "user and session id must not be empty".to_string(),
            ));
        }
        if self.is_blocked(user) {
            return Err(SessionError::Blocked {
                user: user.to_string(),
            });
        }

        let spec = self.resolve_spec(user, request).await?;
        let session = Session::new(
            id,
            user,
            spec,
            Arc::clone(&self.inner.launcher),
            &self.inner.shutdown,
        );

        let replaced = {
            let mut table = self.inner.table.lock();
            if table.blocked.contains_key(user) {
                return Err(SessionError::Blocked {
                    user: user.to_string(),
                });
            }
            let replaced = table.take_by_id(user, id);
            table
                .sessions
                .entry(user.to_string())
                .or_default()
                .push(session.clone());
            replaced
        };

        for old in replaced {
            info!(user, session_id = id, "Replacing existing session");
            tokio::spawn(async move {
                if let Err(e) = old.kill().await {
                    warn!(session_id = old.id(), error = %e, "Failed to kill replaced session");
                }
            });
        }

        self.remove_on_termination(&session);

        if let Err(e) = session.start().await {
            self.inner.table.lock().remove_session(user, &session);
            return Err(e);
        }
        info!(user, session_id = id, pid = ?session.info().pid, "Session created");
        Ok(session)
    }

    async fn resolve_spec(
        &self,
        user: &str,
        request: CreateSession,
    ) -> Result<SessionSpec, SessionError> {
        let config = &self.inner.config;
        let (name, interpreter) = config
            .interpreter(request.interpreter.as_deref())
            .ok_or_else(|| SessionError::NoInterpreter {
                selector: request.interpreter.clone(),
            })?;

        let working_directory = config.sessions.working_root.join(sanitize_user(user));
        tokio::fs::create_dir_all(&working_directory).await?;

        Ok(SessionSpec {
            interpreter_name: name.to_string(),
            interpreter: interpreter.clone(),
            args: request.args,
            interactive: request.interactive,
            working_directory,
            log_dir: config.sessions.log_dir.clone(),
            log_level: config.sessions.worker_log_level.clone(),
            run_as: config.sessions.impersonate_users.then(|| user.to_string()),
            max_frame_bytes: config.sessions.max_frame_bytes,
        })
    }

    fn remove_on_termination(&self, session: &Session) {
        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let session = session.clone();
        let mut state_rx = session.subscribe();
        tokio::spawn(async move {
            let _ = state_rx
                .wait_for(|state| *state == SessionState::Terminated)
                .await;
            if let Some(inner) = manager.upgrade()
                && inner.table.lock().remove_session(session.user(), &session)
            {
                debug!(session_id = session.id(), "Removed terminated session");
            }
        });
    }

    /// Look up a session. Without a user, matches on id alone.
    pub fn get(&self, user: Option<&str>, id: &str) -> Option<Session> {
        let table = self.inner.table.lock();
        let mut candidates: Box<dyn Iterator<Item = &Session> + '_> = match user {
            Some(user) => Box::new(table.sessions.get(user).into_iter().flatten()),
            None => Box::new(table.sessions.values().flatten()),
        };
        let mut fallback = None;
        for session in &mut candidates {
            if session.id() != id {
                continue;
            }
            if session.state() != SessionState::Terminated {
                return Some(session.clone());
            }
            fallback.get_or_insert_with(|| session.clone());
        }
        fallback
    }

    pub fn list_by_user(&self, user: &str) -> Vec<Session> {
        self.inner
            .table
            .lock()
            .sessions
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    pub fn list_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.inner.table.lock().sessions.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn session_count(&self) -> usize {
        self.inner.table.lock().sessions.values().map(Vec::len).sum()
    }

    /// Remove a session and kill its worker.
    pub async fn delete(&self, user: &str, id: &str) -> Result<(), SessionError> {
        let removed = self.inner.table.lock().take_by_id(user, id);
        if removed.is_empty() {
            return Err(SessionError::NotFound { id: id.to_string() });
        }
        info!(user, session_id = id, "Deleting session");
        kill_all(removed).await;
        Ok(())
    }

    /// Block a user from creating sessions until the guard is dropped.
    pub async fn block_user(&self, user: &str, terminate_existing: bool) -> UserBlock {
        let removed = {
            let mut table = self.inner.table.lock();
            *table.blocked.entry(user.to_string()).or_insert(0) += 1;
            if terminate_existing {
                table.sessions.remove(user).unwrap_or_default()
            } else {
                Vec::new()
            }
        };
        info!(user, terminated = removed.len(), "User blocked");
        kill_all(removed).await;
        UserBlock {
            manager: Arc::downgrade(&self.inner),
            user: user.to_string(),
        }
    }

    /// Stop accepting sessions and kill every worker.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let all: Vec<Session> = {
            let mut table = self.inner.table.lock();
            table.sessions.drain().flat_map(|(_, list)| list).collect()
        };
        info!(sessions = all.len(), "Shutting down sessions");
        kill_all(all).await;
    }
}

async fn kill_all(sessions: Vec<Session>) {
    join_all(sessions.into_iter().map(|session| async move {
        if let Err(e) = session.kill().await {
            warn!(session_id = session.id(), error = %e, "Failed to kill session");
        }
    }))
    .await;
}

/// Keeps a user blocked while alive.
#[must_use = "the user is unblocked as soon as the guard is dropped"]
pub struct UserBlock {
    manager: Weak<ManagerInner>,
    user: String,
}

impl UserBlock {
    pub fn user(&self) -> &str {
        &self.user
    }
}

impl Drop for UserBlock {
    fn drop(&mut self) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        let mut table = inner.table.lock();
        if let Some(count) = table.blocked.get_mut(&self.user) {
            *count -= 1;
            if *count == 0 {
                table.blocked.remove(&self.user);
                info!(user = %self.user, "User unblocked");
            }
        }
    }
}

/// Map a user name onto a single safe path component.
fn sanitize_user(user: &str) -> PathBuf {
    let cleaned: String = user
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        PathBuf::from("_")
    } else {
        PathBuf::from(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_names_become_single_path_components() {
        assert_eq!(sanitize_user("alice"), PathBuf::from("alice"));
        assert_eq!(sanitize_user("CORP\\bob"), PathBuf::from("CORP_bob"));
        assert_eq!(sanitize_user("../etc"), PathBuf::from(".._etc"));
        assert_eq!(sanitize_user(".."), PathBuf::from("_"));
        assert_eq!(sanitize_user("a@b.com"), PathBuf::from("a@b.com"));
    }
}
