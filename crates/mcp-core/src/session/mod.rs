//! Agent session lifecycle with sliding expiration.
//!
//! Sessions move `active → expired | terminated`. Neither end state ever goes
//! back to active. Ended sessions stay readable for the retention window and are
//! purged by the sweep once it passes.

mod types;

pub use types::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::background::BackgroundTask;
use crate::clock::{self, Clock, system_clock};
use crate::error::{Error, Result};

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<String, Session>,
    /// agent id -> ids of its active sessions
    by_agent: HashMap<String, HashSet<String>>,
    /// ended session id -> when it may be dropped
    purge_at: HashMap<String, DateTime<Utc>>,
}

impl SessionTable {
    /// Move an active session into an end state. Returns false if it was not active.
    fn end(&mut self, id: &str, status: SessionStatus, purge_at: DateTime<Utc>) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        if session.status != SessionStatus::Active {
            return false;
        }
        session.status = status;

        if let Some(agent_id) = &session.agent_id {
            if let Some(active) = self.by_agent.get_mut(agent_id) {
                active.remove(id);
                if active.is_empty() {
                    self.by_agent.remove(agent_id);
                }
            }
        }
        self.purge_at.insert(id.to_string(), purge_at);
        true
    }

    fn expire_stale(&mut self, now: DateTime<Utc>, retention: ChronoDuration) -> usize {
        let stale: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.expires_at < now)
            .map(|s| s.id.clone())
            .collect();
        for id in &stale {
            self.end(id, SessionStatus::Expired, now + retention);
        }
        stale.len()
    }

    fn active_count(&self, agent_id: &str) -> usize {
        self.by_agent.get(agent_id).map_or(0, HashSet::len)
    }
}

/// Owns every session and the per-agent active index.
pub struct SessionManager {
    config: SessionConfig,
    table: RwLock<SessionTable>,
    clock: Arc<dyn Clock>,
    sweeper: BackgroundTask,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            table: RwLock::new(SessionTable::default()),
            clock,
            sweeper: BackgroundTask::new("session_cleanup"),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn window(&self) -> ChronoDuration {
        clock::minutes(self.config.default_expiration_minutes)
    }

    fn retention(&self) -> ChronoDuration {
        clock::hours(self.config.retention_hours)
    }

    /// Open a session for an agent.
    pub async fn create_session(&self, agent_id: &str, user_id: Option<&str>) -> Result<Session> {
        self.create_session_with_metadata(agent_id, user_id, Map::new())
            .await
    }

    pub async fn create_session_with_metadata(
        &self,
        agent_id: &str,
        user_id: Option<&str>,
        metadata: Map<String, Value>,
    ) -> Result<Session> {
        let now = self.clock.now();
        let mut table = self.table.write().await;
        table.expire_stale(now, self.retention());

        let max = self.config.max_concurrent_sessions;
        if table.active_count(agent_id) >= max {
            warn!(agent_id, max, "Session limit reached");
            return Err(Error::SessionLimit {
                agent_id: agent_id.to_string(),
                max,
            });
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            agent_id: Some(agent_id.to_string()),
            user_id: user_id.map(String::from),
            status: SessionStatus::Active,
            created_at: now,
            expires_at: now + self.window(),
            last_activity: now,
            metadata,
        };

        table
            .by_agent
            .entry(agent_id.to_string())
            .or_default()
            .insert(session.id.clone());
        table.sessions.insert(session.id.clone(), session.clone());

        info!(session_id = %session.id, agent_id, "Session created");
        Ok(session)
    }

    /// Look up a session.
    ///
    /// A session found past its expiry is expired on the spot and reported as
    /// absent. Terminated sessions are still returned until purged.
    pub async fn get_session(&self, id: &str) -> Option<Session> {
        let now = self.clock.now();
        {
            let table = self.table.read().await;
            let session = table.sessions.get(id)?;
            match session.status {
                SessionStatus::Active if session.expires_at >= now => return Some(session.clone()),
                SessionStatus::Terminated => return Some(session.clone()),
                SessionStatus::Expired => return None,
                SessionStatus::Active => {}
            }
        }

        let mut table = self.table.write().await;
        if table.end(id, SessionStatus::Expired, now + self.retention()) {
            debug!(session_id = id, "Session expired on access");
        }
        None
    }

    /// Record activity, sliding the expiry forward when extension is enabled.
    ///
    /// A no-op for absent or ended sessions. `expires_at` never moves backwards.
    pub async fn update_activity(&self, id: &str) -> Option<Session> {
        let now = self.clock.now();
        let window = self.window();
        let retention = self.retention();
        let mut table = self.table.write().await;

        let session = table.sessions.get_mut(id)?;
        if session.status != SessionStatus::Active {
            return None;
        }
        if session.expires_at < now {
            table.end(id, SessionStatus::Expired, now + retention);
            return None;
        }

        session.last_activity = now;
        if self.config.extend_on_activity {
            session.expires_at = session.expires_at.max(now + window);
        }
        Some(session.clone())
    }

    /// Terminate a session. Idempotent; returns whether the session exists.
    pub async fn terminate_session(&self, id: &str) -> bool {
        let now = self.clock.now();
        let mut table = self.table.write().await;
        if !table.sessions.contains_key(id) {
            return false;
        }
        if table.end(id, SessionStatus::Terminated, now + self.retention()) {
            info!(session_id = id, "Session terminated");
        }
        true
    }

    /// Resolve an active session without recording activity.
    pub async fn check_session(&self, id: &str) -> Result<Session> {
        match self.get_session(id).await {
            Some(s) if s.status == SessionStatus::Active => Ok(s),
            _ => Err(Error::InvalidSession(id.to_string())),
        }
    }

    /// Resolve an active session and extend it.
    pub async fn validate_session(&self, id: &str) -> Result<Session> {
        self.check_session(id).await?;
        self.update_activity(id)
            .await
            .ok_or_else(|| Error::InvalidSession(id.to_string()))
    }

    /// Terminate every active session of an agent. Returns how many were ended.
    pub async fn terminate_agent_sessions(&self, agent_id: &str) -> usize {
        let now = self.clock.now();
        let mut table = self.table.write().await;
        let ids: Vec<String> = table
            .by_agent
            .get(agent_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let purge_at = now + self.retention();
        let ended = ids
            .iter()
            .filter(|id| table.end(id, SessionStatus::Terminated, purge_at))
            .count();
        if ended > 0 {
            info!(agent_id, ended, "Terminated agent sessions");
        }
        ended
    }

    /// Active sessions of an agent, oldest first.
    pub async fn get_agent_sessions(&self, agent_id: &str) -> Vec<Session> {
        let now = self.clock.now();
        let table = self.table.read().await;
        let mut sessions: Vec<Session> = table
            .by_agent
            .get(agent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| table.sessions.get(id))
            .filter(|s| s.expires_at >= now)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub async fn stats(&self) -> SessionStats {
        let table = self.table.read().await;
        let mut stats = SessionStats {
            total: table.sessions.len(),
            agents_with_sessions: table.by_agent.len(),
            ..Default::default()
        };
        for session in table.sessions.values() {
            match session.status {
                SessionStatus::Active => stats.active += 1,
                SessionStatus::Expired => stats.expired += 1,
                SessionStatus::Terminated => stats.terminated += 1,
            }
        }
        stats
    }

    /// Expire overdue sessions and purge ended ones past retention.
    pub async fn cleanup_expired(&self) -> SessionSweep {
        let now = self.clock.now();
        let mut table = self.table.write().await;
        let expired = table.expire_stale(now, self.retention());

        let due: Vec<String> = table
            .purge_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            table.purge_at.remove(id);
            table.sessions.remove(id);
        }

        let sweep = SessionSweep {
            expired,
            purged: due.len(),
        };
        if sweep.expired + sweep.purged > 0 {
            info!(expired = sweep.expired, purged = sweep.purged, "Session sweep");
        } else {
            debug!("Session sweep found nothing to do");
        }
        sweep
    }

    /// Start the periodic sweep.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.sweeper.spawn(self.config.cleanup_interval(), move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(manager) => {
                        manager.cleanup_expired().await;
                        true
                    }
                    None => false,
                }
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.is_running()
    }

    /// Stop the sweep and terminate every active session.
    pub async fn shutdown(&self) -> usize {
        self.sweeper.stop();
        let now = self.clock.now();
        let purge_at = now + self.retention();
        let mut table = self.table.write().await;
        let active: Vec<String> = table
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .map(|s| s.id.clone())
            .collect();
        for id in &active {
            table.end(id, SessionStatus::Terminated, purge_at);
        }
        debug!(terminated = active.len(), "Session manager shut down");
        active.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager(max: usize) -> (SessionManager, ManualClock) {
        let clock = ManualClock::new();
        let config = SessionConfig::default().with_max_concurrent_sessions(max);
        (
            SessionManager::with_clock(config, Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (sessions, _) = manager(5);
        let session = sessions.create_session("a1", Some("u1")).await.unwrap();

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.expires_at - session.created_at, ChronoDuration::minutes(60));

        let found = sessions.get_session(&session.id).await.unwrap();
        assert_eq!(found.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_session_cap_and_release() {
        let (sessions, _) = manager(2);
        let first = sessions.create_session("a1", None).await.unwrap();
        sessions.create_session("a1", None).await.unwrap();

        let err = sessions.create_session("a1", None).await.unwrap_err();
        assert!(matches!(err, Error::SessionLimit { max: 2, .. }));

        // Other agents are unaffected
        sessions.create_session("a2", None).await.unwrap();

        assert!(sessions.terminate_session(&first.id).await);
        sessions.create_session("a1", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_sessions_free_slots() {
        let (sessions, clock) = manager(1);
        sessions.create_session("a1", None).await.unwrap();

        clock.advance(ChronoDuration::minutes(61));
        sessions.create_session("a1", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_lazy_expiry_on_get() {
        let (sessions, clock) = manager(5);
        let session = sessions.create_session("a1", None).await.unwrap();

        clock.advance(ChronoDuration::minutes(61));
        assert!(sessions.get_session(&session.id).await.is_none());
        assert_eq!(sessions.stats().await.expired, 1);
        assert!(sessions.get_agent_sessions("a1").await.is_empty());
    }

    #[tokio::test]
    async fn test_sliding_expiration_is_monotonic() {
        let (sessions, clock) = manager(5);
        let session = sessions.create_session("a1", None).await.unwrap();
        let original = session.expires_at;

        clock.advance(ChronoDuration::minutes(30));
        let extended = sessions.update_activity(&session.id).await.unwrap();
        assert_eq!(extended.expires_at, original + ChronoDuration::minutes(30));
        assert_eq!(extended.last_activity, clock.now());

        // Moving the clock backwards never shortens the session
        clock.advance(ChronoDuration::minutes(-20));
        let again = sessions.update_activity(&session.id).await.unwrap();
        assert_eq!(again.expires_at, extended.expires_at);
    }

    #[tokio::test]
    async fn test_extension_disabled() {
        let clock = ManualClock::new();
        let config = SessionConfig {
            extend_on_activity: false,
            ..Default::default()
        };
        let sessions = SessionManager::with_clock(config, Arc::new(clock.clone()));
        let session = sessions.create_session("a1", None).await.unwrap();

        clock.advance(ChronoDuration::minutes(10));
        let touched = sessions.update_activity(&session.id).await.unwrap();
        assert_eq!(touched.expires_at, session.expires_at);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_retained() {
        let (sessions, clock) = manager(5);
        let session = sessions.create_session("a1", None).await.unwrap();

        assert!(sessions.terminate_session(&session.id).await);
        assert!(sessions.terminate_session(&session.id).await);
        assert!(!sessions.terminate_session("nope").await);

        let retained = sessions.get_session(&session.id).await.unwrap();
        assert_eq!(retained.status, SessionStatus::Terminated);
        assert!(sessions.update_activity(&session.id).await.is_none());
        assert!(sessions.validate_session(&session.id).await.is_err());

        clock.advance(ChronoDuration::hours(23));
        assert_eq!(sessions.cleanup_expired().await.purged, 0);

        clock.advance(ChronoDuration::hours(2));
        assert_eq!(sessions.cleanup_expired().await.purged, 1);
        assert!(sessions.get_session(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_validate_extends() {
        let (sessions, clock) = manager(5);
        let session = sessions.create_session("a1", None).await.unwrap();

        clock.advance(ChronoDuration::minutes(45));
        let validated = sessions.validate_session(&session.id).await.unwrap();
        assert!(validated.expires_at > session.expires_at);

        let err = sessions.validate_session("missing").await.unwrap_err();
        assert!(matches!(err, Error::InvalidSession(_)));
    }

    #[tokio::test]
    async fn test_check_does_not_extend() {
        let (sessions, clock) = manager(5);
        let session = sessions.create_session("a1", None).await.unwrap();

        clock.advance(ChronoDuration::minutes(30));
        let checked = sessions.check_session(&session.id).await.unwrap();
        assert_eq!(checked.expires_at, session.expires_at);
        assert_eq!(checked.last_activity, session.last_activity);

        sessions.terminate_session(&session.id).await;
        assert!(matches!(
            sessions.check_session(&session.id).await,
            Err(Error::InvalidSession(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_windows_saturate() {
        let clock = ManualClock::new();
        let config = SessionConfig {
            default_expiration_minutes: u64::MAX,
            retention_hours: u64::MAX,
            ..Default::default()
        };
        let sessions = SessionManager::with_clock(config, Arc::new(clock.clone()));

        let session = sessions.create_session("a1", None).await.unwrap();
        assert!(session.expires_at > session.created_at);

        clock.advance(ChronoDuration::days(365));
        assert!(sessions.validate_session(&session.id).await.is_ok());
        assert!(sessions.terminate_session(&session.id).await);
        assert_eq!(sessions.cleanup_expired().await.purged, 0);
    }

    #[tokio::test]
    async fn test_sweep_expires_overdue() {
        let (sessions, clock) = manager(5);
        sessions.create_session("a1", None).await.unwrap();
        sessions.create_session("a2", None).await.unwrap();

        clock.advance(ChronoDuration::minutes(90));
        let sweep = sessions.cleanup_expired().await;
        assert_eq!(sweep.expired, 2);
        assert_eq!(sessions.stats().await.active, 0);
    }

    #[tokio::test]
    async fn test_terminate_agent_sessions() {
        let (sessions, _) = manager(5);
        sessions.create_session("a1", None).await.unwrap();
        sessions.create_session("a1", None).await.unwrap();
        sessions.create_session("a2", None).await.unwrap();

        assert_eq!(sessions.terminate_agent_sessions("a1").await, 2);
        assert!(sessions.get_agent_sessions("a1").await.is_empty());
        assert_eq!(sessions.get_agent_sessions("a2").await.len(), 1);

        let stats = sessions.stats().await;
        assert_eq!(stats.terminated, 2);
        assert_eq!(stats.agents_with_sessions, 1);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_all() {
        let (sessions, _) = manager(5);
        let sessions = Arc::new(sessions);
        sessions.start();
        sessions.create_session("a1", None).await.unwrap();
        sessions.create_session("a2", None).await.unwrap();

        assert_eq!(sessions.shutdown().await, 2);
        assert!(!sessions.is_running());
        assert_eq!(sessions.stats().await.active, 0);
    }
}
