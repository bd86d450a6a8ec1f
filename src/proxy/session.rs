// Session registry - owns all per-client upstream HTTP state
//
// Sessions are held in a sharded concurrent map with one RwLock per entry:
// mutations against the same session id are linearizable, operations on
// different ids never contend on a shared lock.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::proxy::error::ProxyError;

/// Persistent upstream state for one registered client.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: String,
    pub client_ip: String,
    pub user_agent: Option<String>,
    /// Header names are normalized to lowercase on insert.
    pub headers: HashMap<String, String>,
    /// Cookie jar, updated from upstream Set-Cookie on every forwarded call.
    pub cookies: HashMap<String, String>,
    /// Opaque caller-supplied data, never interpreted.
    pub user_data: serde_json::Map<String, serde_json::Value>,
    pub verify_ssl: bool,
    pub request_count: u64,
    pub created_at: i64,
    pub last_used_at: i64,
}

/// Read-only snapshot returned by `get_session_info`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub user_data: serde_json::Map<String, serde_json::Value>,
    pub verify_ssl: bool,
    pub request_count: u64,
    pub created_at: i64,
    pub last_used_at: i64,
}

/// Snapshot handed to the forwarding engine for one upstream call.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub verify_ssl: bool,
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<RwLock<SessionState>>>,
    /// Idle lifetime in seconds before a session is eligible for eviction.
    session_timeout: i64,
    /// Default certificate verification policy for new sessions.
    verify_ssl: bool,
}

impl SessionRegistry {
    pub fn new(session_timeout: i64, verify_ssl: bool) -> Self {
        tracing::info!(
            "SessionRegistry initialized with timeout of {}s",
            session_timeout
        );
        Self {
            sessions: DashMap::new(),
            session_timeout,
            verify_ssl,
        }
    }

    /// Create a new session and return its id.
    pub async fn create(
        &self,
        client_ip: String,
        user_agent: Option<String>,
        user_data: serde_json::Map<String, serde_json::Value>,
    ) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        let state = SessionState {
            session_id: session_id.clone(),
            client_ip: client_ip.clone(),
            user_agent,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            user_data,
            verify_ssl: self.verify_ssl,
            request_count: 0,
            created_at: now,
            last_used_at: now,
        };

        self.sessions
            .insert(session_id.clone(), Arc::new(RwLock::new(state)));

        tracing::info!(
            "New session created: {}... for IP {}",
            &session_id[..8],
            client_ip
        );

        session_id
    }

    // Clones the entry Arc out of the map so no shard guard is held across
    // an await on the per-session lock.
    fn entry(&self, session_id: &str) -> Result<Arc<RwLock<SessionState>>, ProxyError> {
        self.sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or(ProxyError::SessionNotFound)
    }

    /// Check that a session exists and has not idled past the timeout.
    /// An expired session is deleted on the spot.
    pub async fn validate(&self, session_id: &str) -> bool {
        let Ok(entry) = self.entry(session_id) else {
            return false;
        };

        let last_used_at = entry.read().await.last_used_at;
        let now = chrono::Utc::now().timestamp();

        if now - last_used_at > self.session_timeout {
            self.delete(session_id).await;
            return false;
        }
        true
    }

    /// Refresh `last_used_at` and bump the request counter.
    pub async fn touch(&self, session_id: &str) -> Result<(), ProxyError> {
        let entry = self.entry(session_id)?;
        let mut state = entry.write().await;
        state.last_used_at = chrono::Utc::now().timestamp();
        state.request_count += 1;
        Ok(())
    }

    /// Merge the given headers into the session's header map (right-biased:
    /// new values win on key collision). Keys are normalized to lowercase.
    pub async fn set_headers(
        &self,
        session_id: &str,
        headers: HashMap<String, String>,
    ) -> Result<(), ProxyError> {
        let entry = self.entry(session_id)?;
        let mut state = entry.write().await;
        for (name, value) in headers {
            state.headers.insert(name.to_ascii_lowercase(), value);
        }
        state.last_used_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    pub async fn get_headers(
        &self,
        session_id: &str,
    ) -> Result<HashMap<String, String>, ProxyError> {
        let entry = self.entry(session_id)?;
        let mut state = entry.write().await;
        state.last_used_at = chrono::Utc::now().timestamp();
        Ok(state.headers.clone())
    }

    pub async fn get_cookies(
        &self,
        session_id: &str,
    ) -> Result<HashMap<String, String>, ProxyError> {
        let entry = self.entry(session_id)?;
        let mut state = entry.write().await;
        state.last_used_at = chrono::Utc::now().timestamp();
        Ok(state.cookies.clone())
    }

    pub async fn get_info(&self, session_id: &str) -> Result<SessionInfo, ProxyError> {
        let entry = self.entry(session_id)?;
        let mut state = entry.write().await;
        state.last_used_at = chrono::Utc::now().timestamp();
        Ok(SessionInfo {
            session_id: state.session_id.clone(),
            client_ip: state.client_ip.clone(),
            user_agent: state.user_agent.clone(),
            headers: state.headers.clone(),
            cookies: state.cookies.clone(),
            user_data: state.user_data.clone(),
            verify_ssl: state.verify_ssl,
            request_count: state.request_count,
            created_at: state.created_at,
            last_used_at: state.last_used_at,
        })
    }

    /// Empty the session's headers and cookies without deleting the session.
    pub async fn clear(&self, session_id: &str) -> Result<(), ProxyError> {
        let entry = self.entry(session_id)?;
        let mut state = entry.write().await;
        state.headers.clear();
        state.cookies.clear();
        state.last_used_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    /// Snapshot headers/cookies for one forwarded call, persisting any
    /// per-call cookies into the jar first. Per-call headers are merged later
    /// by the forwarding engine and never persisted here.
    pub async fn forward_context(
        &self,
        session_id: &str,
        extra_cookies: Option<&HashMap<String, String>>,
    ) -> Result<ForwardContext, ProxyError> {
        let entry = self.entry(session_id)?;
        let mut state = entry.write().await;
        if let Some(extra) = extra_cookies {
            for (name, value) in extra {
                state.cookies.insert(name.clone(), value.clone());
            }
        }
        state.last_used_at = chrono::Utc::now().timestamp();
        Ok(ForwardContext {
            headers: state.headers.clone(),
            cookies: state.cookies.clone(),
            verify_ssl: state.verify_ssl,
        })
    }

    /// Merge cookies set by an upstream response into the session's jar and
    /// return the jar after the merge.
    pub async fn apply_response_cookies(
        &self,
        session_id: &str,
        cookies: &[(String, String)],
    ) -> Result<HashMap<String, String>, ProxyError> {
        let entry = self.entry(session_id)?;
        let mut state = entry.write().await;
        for (name, value) in cookies {
            state.cookies.insert(name.clone(), value.clone());
        }
        state.last_used_at = chrono::Utc::now().timestamp();
        Ok(state.cookies.clone())
    }

    /// Idempotent removal. Returns whether a session was actually present.
    pub async fn delete(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            tracing::info!("Session deleted: {}...", &session_id[..session_id.len().min(8)]);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Delete every session idle longer than the timeout at `now`.
    /// Returns the number of evicted sessions. Eviction is silent to the
    /// owning client; its next call simply gets SessionNotFound.
    pub async fn sweep_expired(&self, now: i64) -> usize {
        // Collect candidate Arcs first so no shard guard is held across an
        // await, then re-check under the entry lock before removal.
        let candidates: Vec<(String, Arc<RwLock<SessionState>>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut evicted = 0;
        for (session_id, entry) in candidates {
            let last_used_at = entry.read().await.last_used_at;
            if now - last_used_at > self.session_timeout {
                if self.sessions.remove(&session_id).is_some() {
                    evicted += 1;
                    tracing::debug!(
                        "Expired session evicted: {}... (idle {}s)",
                        &session_id[..8],
                        now - last_used_at
                    );
                }
            }
        }
        evicted
    }

    #[cfg(test)]
    async fn age_session(&self, session_id: &str, seconds: i64) {
        let entry = self.entry(session_id).expect("session exists");
        let mut state = entry.write().await;
        state.last_used_at -= seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(600, false)
    }

    #[tokio::test]
    async fn test_create_returns_empty_session() {
        let reg = registry();
        let id = reg
            .create("127.0.0.1".into(), Some("test-agent".into()), Default::default())
            .await;

        let info = reg.get_info(&id).await.unwrap();
        assert_eq!(info.session_id, id);
        assert!(info.headers.is_empty());
        assert!(info.cookies.is_empty());
        assert_eq!(info.request_count, 0);
        assert_eq!(info.created_at, info.last_used_at);
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let reg = registry();
        let a = reg.create("127.0.0.1".into(), None, Default::default()).await;
        let b = reg.create("127.0.0.1".into(), None, Default::default()).await;
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn test_set_headers_merges_right_biased() {
        let reg = registry();
        let id = reg.create("127.0.0.1".into(), None, Default::default()).await;

        reg.set_headers(&id, map(&[("Authorization", "Bearer old"), ("Accept", "text/html")]))
            .await
            .unwrap();
        reg.set_headers(&id, map(&[("Authorization", "Bearer new")]))
            .await
            .unwrap();

        let headers = reg.get_headers(&id).await.unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer new");
        assert_eq!(headers.get("accept").unwrap(), "text/html");
    }

    #[tokio::test]
    async fn test_set_headers_is_idempotent() {
        let reg = registry();
        let id = reg.create("127.0.0.1".into(), None, Default::default()).await;
        let headers = map(&[("X-Custom", "value")]);

        reg.set_headers(&id, headers.clone()).await.unwrap();
        let first = reg.get_headers(&id).await.unwrap();
        reg.set_headers(&id, headers).await.unwrap();
        let second = reg.get_headers(&id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_header_keys_are_case_insensitive() {
        let reg = registry();
        let id = reg.create("127.0.0.1".into(), None, Default::default()).await;

        reg.set_headers(&id, map(&[("AUTHORIZATION", "a")])).await.unwrap();
        reg.set_headers(&id, map(&[("authorization", "b")])).await.unwrap();

        let headers = reg.get_headers(&id).await.unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("authorization").unwrap(), "b");
    }

    #[tokio::test]
    async fn test_unknown_id_fails_everywhere() {
        let reg = registry();
        assert!(matches!(
            reg.get_headers("missing").await,
            Err(ProxyError::SessionNotFound)
        ));
        assert!(matches!(
            reg.get_cookies("missing").await,
            Err(ProxyError::SessionNotFound)
        ));
        assert!(matches!(
            reg.get_info("missing").await,
            Err(ProxyError::SessionNotFound)
        ));
        assert!(matches!(
            reg.set_headers("missing", HashMap::new()).await,
            Err(ProxyError::SessionNotFound)
        ));
        assert!(matches!(
            reg.forward_context("missing", None).await,
            Err(ProxyError::SessionNotFound)
        ));
        assert!(!reg.validate("missing").await);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let reg = registry();
        let id = reg.create("127.0.0.1".into(), None, Default::default()).await;

        assert!(reg.delete(&id).await);
        assert!(!reg.delete(&id).await);
        assert!(matches!(
            reg.get_headers(&id).await,
            Err(ProxyError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_clear_keeps_session_alive() {
        let reg = registry();
        let id = reg.create("127.0.0.1".into(), None, Default::default()).await;
        reg.set_headers(&id, map(&[("X-Custom", "v")])).await.unwrap();
        reg.apply_response_cookies(&id, &[("token".into(), "abc".into())])
            .await
            .unwrap();

        reg.clear(&id).await.unwrap();

        let info = reg.get_info(&id).await.unwrap();
        assert!(info.headers.is_empty());
        assert!(info.cookies.is_empty());
    }

    #[tokio::test]
    async fn test_forward_context_persists_extra_cookies() {
        let reg = registry();
        let id = reg.create("127.0.0.1".into(), None, Default::default()).await;

        let extra = map(&[("csrf", "tok")]);
        let ctx = reg.forward_context(&id, Some(&extra)).await.unwrap();
        assert_eq!(ctx.cookies.get("csrf").unwrap(), "tok");

        // Persisted into the jar, visible to the next call
        let cookies = reg.get_cookies(&id).await.unwrap();
        assert_eq!(cookies.get("csrf").unwrap(), "tok");
    }

    #[tokio::test]
    async fn test_apply_response_cookies_merges() {
        let reg = registry();
        let id = reg.create("127.0.0.1".into(), None, Default::default()).await;

        reg.apply_response_cookies(&id, &[("foo".into(), "bar".into())])
            .await
            .unwrap();
        let jar = reg
            .apply_response_cookies(&id, &[("foo".into(), "baz".into()), ("k".into(), "v".into())])
            .await
            .unwrap();

        assert_eq!(jar.get("foo").unwrap(), "baz");
        assert_eq!(jar.get("k").unwrap(), "v");
    }

    #[tokio::test]
    async fn test_touch_bumps_request_count() {
        let reg = registry();
        let id = reg.create("127.0.0.1".into(), None, Default::default()).await;

        reg.touch(&id).await.unwrap();
        reg.touch(&id).await.unwrap();

        let info = reg.get_info(&id).await.unwrap();
        assert_eq!(info.request_count, 2);
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_idle_sessions() {
        let reg = registry();
        let old = reg.create("127.0.0.1".into(), None, Default::default()).await;
        let fresh = reg.create("127.0.0.1".into(), None, Default::default()).await;

        reg.age_session(&old, 700).await;

        let now = chrono::Utc::now().timestamp();
        let evicted = reg.sweep_expired(now).await;

        assert_eq!(evicted, 1);
        assert!(matches!(
            reg.get_info(&old).await,
            Err(ProxyError::SessionNotFound)
        ));
        assert!(reg.get_info(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_drops_expired_session() {
        let reg = registry();
        let id = reg.create("127.0.0.1".into(), None, Default::default()).await;
        reg.age_session(&id, 700).await;

        assert!(!reg.validate(&id).await);
        // Expired-on-access sessions are removed immediately
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn test_user_data_stored_verbatim() {
        let reg = registry();
        let mut data = serde_json::Map::new();
        data.insert("tenant".into(), serde_json::json!({"id": 42}));
        let id = reg.create("10.0.0.1".into(), None, data.clone()).await;

        let info = reg.get_info(&id).await.unwrap();
        assert_eq!(info.user_data, data);
        assert_eq!(info.client_ip, "10.0.0.1");
    }
}
