//! Party session lifecycle: create, join, leave, end.
//!
//! `SessionManager` owns "the party I am currently in". The session is a
//! single JSON slot per user id on disk, so it survives a restart of the
//! hosting view; it is not synchronized across concurrent instances. All
//! room mutations go through the external room management API, which is
//! the source of truth for membership and host identity.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::UserIdentity;

/// The local member's role in its party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartyRole {
    Host,
    Guest,
}

/// The local party membership record, at most one per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartySession {
    pub party_id: String,
    pub role: PartyRole,
    pub joined_at: DateTime<Utc>,
}

/// A member entry in a room snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyMember {
    pub user_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// A room snapshot as the room management API reports it. Referenced
/// here, never owned; `host_id` is what the dispatcher validates sync
/// authority against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyDescriptor {
    pub party_id: String,
    pub movie_id: String,
    pub host_id: u64,
    pub status: String,
    #[serde(default)]
    pub members: Vec<PartyMember>,
    /// The backend stamps a zoneless local datetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
}

/// Session lifecycle errors.
#[derive(Debug)]
pub enum SessionError {
    /// Create was attempted while a session already exists. Raised before
    /// any network call.
    AlreadyInParty,
    /// Identity has not resolved yet; create/join are not allowed.
    IdentityUnresolved,
    /// The room API call failed, network or business-rule rejection.
    Api(String),
    /// The local session slot could not be written.
    Store(std::io::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyInParty => write!(f, "Already in a watch party"),
            Self::IdentityUnresolved => write!(f, "User identity has not resolved yet"),
            Self::Api(e) => write!(f, "Room API error: {e}"),
            Self::Store(e) => write!(f, "Session store error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::Api(e.to_string())
    }
}

/// One JSON slot per user id under a base directory.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn slot(&self, user_id: u64) -> PathBuf {
        self.dir.join(format!("session-{user_id}.json"))
    }

    /// Read the slot. A missing or corrupt slot is treated as absent.
    pub fn load(&self, user_id: u64) -> Option<PartySession> {
        let raw = std::fs::read_to_string(self.slot(user_id)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                log::warn!("Discarding corrupt session slot for user {user_id}: {e}");
                None
            }
        }
    }

    pub fn save(&self, user_id: u64, session: &PartySession) -> Result<(), SessionError> {
        std::fs::create_dir_all(&self.dir).map_err(SessionError::Store)?;
        let raw = serde_json::to_string(session)
            .map_err(|e| SessionError::Store(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        std::fs::write(self.slot(user_id), raw).map_err(SessionError::Store)
    }

    /// Remove the slot. Absent is fine.
    pub fn clear(&self, user_id: u64) {
        if let Err(e) = std::fs::remove_file(self.slot(user_id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Could not clear session slot for user {user_id}: {e}");
            }
        }
    }
}

/// REST client for the external room management API.
pub struct RoomApi {
    client: reqwest::Client,
    base_url: String,
}

impl RoomApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn create_party(&self, movie_id: &str) -> Result<PartyDescriptor, SessionError> {
        let url = format!("{}/watch-party/{movie_id}", self.base_url);
        let resp = self.client.post(&url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn join_party(&self, party_id: &str) -> Result<PartyDescriptor, SessionError> {
        let url = format!("{}/watch-party/join/{party_id}", self.base_url);
        let resp = self.client.post(&url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn get_room(&self, party_id: &str) -> Result<PartyDescriptor, SessionError> {
        let url = format!("{}/watch-party/{party_id}", self.base_url);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn leave_party(&self, party_id: &str) -> Result<(), SessionError> {
        let url = format!("{}/watch-party/leave/{party_id}", self.base_url);
        self.client.delete(&url).send().await?.error_for_status()?;
        Ok(())
    }

    pub async fn end_party(&self, party_id: &str) -> Result<(), SessionError> {
        let url = format!("{}/watch-party/{party_id}", self.base_url);
        self.client.delete(&url).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Enforces the single-active-party invariant and persists the session
/// across restarts.
///
/// Starts in a loading state; nothing is allowed until
/// [`resolve_identity`](Self::resolve_identity) re-hydrates the slot for
/// the signed-in user.
pub struct SessionManager {
    store: SessionStore,
    api: RoomApi,
    identity: Option<UserIdentity>,
    session: Option<PartySession>,
}

impl SessionManager {
    pub fn new(store: SessionStore, api: RoomApi) -> Self {
        Self {
            store,
            api,
            identity: None,
            session: None,
        }
    }

    /// True until identity resolves.
    pub fn is_loading(&self) -> bool {
        self.identity.is_none()
    }

    pub fn session(&self) -> Option<&PartySession> {
        self.session.as_ref()
    }

    /// Called once authentication resolves. Re-hydrates any persisted
    /// session for this user.
    pub fn resolve_identity(&mut self, identity: UserIdentity) {
        self.session = self.store.load(identity.user_id);
        if let Some(session) = &self.session {
            log::info!(
                "Restored {:?} session in party {} for user {}",
                session.role,
                session.party_id,
                identity.user_id
            );
        }
        self.identity = Some(identity);
    }

    /// Create a room and become its host.
    ///
    /// Rejected before any network call if a session already exists.
    pub async fn create_party(&mut self, movie_id: &str) -> Result<PartyDescriptor, SessionError> {
        let user_id = self
            .identity
            .as_ref()
            .ok_or(SessionError::IdentityUnresolved)?
            .user_id;
        if self.session.is_some() {
            return Err(SessionError::AlreadyInParty);
        }
        let descriptor = self.api.create_party(movie_id).await?;
        self.persist(user_id, &descriptor.party_id, PartyRole::Host)?;
        Ok(descriptor)
    }

    /// Join an existing room as a guest.
    ///
    /// No blocking pre-check against an existing session; the server is
    /// the arbiter. Attempting it while in a party is still a caller bug.
    pub async fn join_party(&mut self, party_id: &str) -> Result<PartyDescriptor, SessionError> {
        let user_id = self
            .identity
            .as_ref()
            .ok_or(SessionError::IdentityUnresolved)?
            .user_id;
        if let Some(existing) = &self.session {
            log::warn!(
                "Joining party {party_id} while already in party {}",
                existing.party_id
            );
        }
        let descriptor = self.api.join_party(party_id).await?;
        self.persist(user_id, party_id, PartyRole::Guest)?;
        Ok(descriptor)
    }

    /// Tear down membership: hosts delete the room, guests leave it.
    ///
    /// The local session is cleared even when the API call fails, so a
    /// user is never trapped in a party their client cannot reach. The
    /// failure is still returned.
    pub async fn leave_or_end_party(&mut self) -> Result<(), SessionError> {
        let (session, identity) = match (&self.session, &self.identity) {
            (Some(session), Some(identity)) => (session.clone(), identity.clone()),
            _ => return Ok(()),
        };
        let result = match session.role {
            PartyRole::Host => self.api.end_party(&session.party_id).await,
            PartyRole::Guest => self.api.leave_party(&session.party_id).await,
        };
        if let Err(e) = &result {
            log::warn!(
                "Teardown call for party {} failed, clearing session anyway: {e}",
                session.party_id
            );
        }
        self.session = None;
        self.store.clear(identity.user_id);
        result
    }

    /// Drop the local session without an API call. Used when the party is
    /// deleted remotely.
    pub fn clear_session(&mut self) {
        if let Some(identity) = &self.identity {
            self.store.clear(identity.user_id);
        }
        self.session = None;
    }

    /// Room snapshot for display and host validation.
    pub async fn get_room(&self, party_id: &str) -> Result<PartyDescriptor, SessionError> {
        self.api.get_room(party_id).await
    }

    fn persist(&mut self, user_id: u64, party_id: &str, role: PartyRole) -> Result<(), SessionError> {
        let session = PartySession {
            party_id: party_id.to_string(),
            role,
            joined_at: Utc::now(),
        };
        self.store.save(user_id, &session)?;
        log::info!("Persisted {role:?} session in party {party_id} for user {user_id}");
        self.session = Some(session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn session(party_id: &str, role: PartyRole) -> PartySession {
        PartySession {
            party_id: party_id.to_string(),
            role,
            joined_at: Utc::now(),
        }
    }

    /// One-shot HTTP stub answering every request with the given body.
    async fn serve_json(body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let mut head = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                head.extend_from_slice(&buf[..n]);
                if n == 0 || head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// A port nothing listens on, so every API call fails fast.
    fn dead_api() -> RoomApi {
        RoomApi::new("http://127.0.0.1:1")
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        assert!(store.load(7).is_none());
        let s = session("P1", PartyRole::Host);
        store.save(7, &s).unwrap();
        assert_eq!(store.load(7).unwrap(), s);

        store.clear(7);
        assert!(store.load(7).is_none());
        // Clearing an absent slot is fine.
        store.clear(7);
    }

    #[test]
    fn test_store_slots_are_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save(1, &session("P1", PartyRole::Host)).unwrap();
        assert!(store.load(2).is_none());
    }

    #[test]
    fn test_corrupt_slot_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        std::fs::write(dir.path().join("session-7.json"), "{not json").unwrap();
        assert!(store.load(7).is_none());
    }

    #[tokio::test]
    async fn test_create_requires_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = SessionManager::new(SessionStore::new(dir.path()), dead_api());
        assert!(mgr.is_loading());
        assert!(matches!(
            mgr.create_party("M1").await,
            Err(SessionError::IdentityUnresolved)
        ));
    }

    #[tokio::test]
    async fn test_create_rejected_while_in_party_before_any_network_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save(7, &session("P1", PartyRole::Guest)).unwrap();

        // The API is unreachable; if create got that far the error would
        // be Api, not AlreadyInParty.
        let mut mgr = SessionManager::new(SessionStore::new(dir.path()), dead_api());
        mgr.resolve_identity(UserIdentity::new(7, "Ada"));
        assert_eq!(mgr.session().unwrap().party_id, "P1");
        assert!(matches!(
            mgr.create_party("M1").await,
            Err(SessionError::AlreadyInParty)
        ));
    }

    #[tokio::test]
    async fn test_create_persists_host_session() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_json(
            r#"{"partyId":"P1","movieId":"M1","hostId":7,"status":"ACTIVE","createdAt":"2026-08-24T19:03:11"}"#
                .to_string(),
        )
        .await;

        let mut mgr = SessionManager::new(SessionStore::new(dir.path()), RoomApi::new(base));
        mgr.resolve_identity(UserIdentity::new(7, "Ada"));
        let descriptor = mgr.create_party("M1").await.unwrap();

        assert_eq!(descriptor.party_id, "P1");
        assert_eq!(descriptor.host_id, 7);
        let s = mgr.session().unwrap();
        assert_eq!(s.party_id, "P1");
        assert_eq!(s.role, PartyRole::Host);
        assert_eq!(SessionStore::new(dir.path()).load(7).unwrap().role, PartyRole::Host);
    }

    #[tokio::test]
    async fn test_join_persists_guest_session() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_json(
            r#"{"partyId":"P1","movieId":"M1","hostId":99,"status":"ACTIVE","members":[{"userId":99},{"userId":7,"userName":"Ada"}]}"#
                .to_string(),
        )
        .await;

        let mut mgr = SessionManager::new(SessionStore::new(dir.path()), RoomApi::new(base));
        mgr.resolve_identity(UserIdentity::new(7, "Ada"));
        let descriptor = mgr.join_party("P1").await.unwrap();

        assert_eq!(descriptor.members.len(), 2);
        assert_eq!(mgr.session().unwrap().role, PartyRole::Guest);
    }

    #[tokio::test]
    async fn test_join_failure_leaves_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = SessionManager::new(SessionStore::new(dir.path()), dead_api());
        mgr.resolve_identity(UserIdentity::new(7, "Ada"));

        assert!(matches!(mgr.join_party("P1").await, Err(SessionError::Api(_))));
        assert!(mgr.session().is_none());
        assert!(SessionStore::new(dir.path()).load(7).is_none());
    }

    #[tokio::test]
    async fn test_leave_without_session_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = SessionManager::new(SessionStore::new(dir.path()), dead_api());
        mgr.resolve_identity(UserIdentity::new(7, "Ada"));
        assert!(mgr.leave_or_end_party().await.is_ok());
    }

    #[tokio::test]
    async fn test_leave_clears_session_even_when_api_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save(7, &session("P1", PartyRole::Guest)).unwrap();

        let mut mgr = SessionManager::new(SessionStore::new(dir.path()), dead_api());
        mgr.resolve_identity(UserIdentity::new(7, "Ada"));
        assert!(mgr.session().is_some());

        let result = mgr.leave_or_end_party().await;
        assert!(matches!(result, Err(SessionError::Api(_))));
        assert!(mgr.session().is_none());
        assert!(SessionStore::new(dir.path()).load(7).is_none());
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_json(
            r#"{"partyId":"P9","movieId":"M1","hostId":7,"status":"ACTIVE"}"#.to_string(),
        )
        .await;

        {
            let mut mgr = SessionManager::new(SessionStore::new(dir.path()), RoomApi::new(base));
            mgr.resolve_identity(UserIdentity::new(7, "Ada"));
            mgr.create_party("M1").await.unwrap();
        }

        let mut restored = SessionManager::new(SessionStore::new(dir.path()), dead_api());
        restored.resolve_identity(UserIdentity::new(7, "Ada"));
        let s = restored.session().unwrap();
        assert_eq!(s.party_id, "P9");
        assert_eq!(s.role, PartyRole::Host);
    }

    #[tokio::test]
    async fn test_clear_session_drops_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save(7, &session("P1", PartyRole::Guest)).unwrap();

        let mut mgr = SessionManager::new(SessionStore::new(dir.path()), dead_api());
        mgr.resolve_identity(UserIdentity::new(7, "Ada"));
        mgr.clear_session();
        assert!(mgr.session().is_none());
        assert!(SessionStore::new(dir.path()).load(7).is_none());
    }

    #[test]
    fn test_descriptor_decodes_backend_shape() {
        let raw = r#"{
            "partyId": "a1b2",
            "movieId": "m-42",
            "hostId": 3,
            "status": "ACTIVE",
            "members": [{"userId": 3, "userName": "Eve"}],
            "createdAt": "2026-08-24T19:03:11.500"
        }"#;
        let d: PartyDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(d.host_id, 3);
        assert_eq!(d.members[0].user_name.as_deref(), Some("Eve"));
        assert!(d.created_at.is_some());
    }
}
