//! Credential storage across the two persistence surfaces
//!
//! A credential is held twice: in the server-only store (cookies, see
//! `cookies.rs`) and in the client-readable store (`ClientStore`, a JSON
//! document with the same keys browser code keeps in local storage). No
//! transaction spans both, so `CredentialStore` owns the ordering:
//!
//! - `save` writes the server-only store first, then the client store. If the
//!   client write fails the server store is rolled back to its previous value;
//!   if the rollback fails too, both are cleared.
//! - `read` treats the server-only store as authoritative and re-syncs the
//!   client store from it when they disagree.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// An access/refresh token pair with its absolute expiry.
///
/// `expires_at` is a unix timestamp in milliseconds, computed once from the
/// issue time plus the server-declared lifetime.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: u64,
}

impl Credential {
    /// Build a credential issued at `issued_at` (epoch ms) that lives `expires_in_secs`.
    pub fn issued(
        access_token: String,
        refresh_token: String,
        issued_at: u64,
        expires_in_secs: u64,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: issued_at.saturating_add(expires_in_secs.saturating_mul(1000)),
        }
    }

    /// Time left before expiry, zero once expired.
    pub fn expires_in(&self, now: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Boxed future returned by backend writes.
pub type StoreFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// One physical place a credential can live.
///
/// `load` is synchronous and never touches the network: implementations keep
/// an in-memory snapshot and only do I/O on writes.
pub trait CredentialBackend: Send + Sync {
    /// Backend label for logs ("server", "client").
    fn name(&self) -> &'static str;

    fn load(&self) -> Option<Credential>;

    fn store<'a>(&'a self, credential: &'a Credential) -> StoreFuture<'a>;

    fn clear(&self) -> StoreFuture<'_>;
}

/// On-disk layout of the client-readable store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_expiry: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oauth_state: Option<String>,
}

impl ClientDocument {
    fn credential(&self) -> Option<Credential> {
        match (&self.token, &self.refresh_token, self.token_expiry) {
            (Some(access), Some(refresh), Some(expires_at)) => Some(Credential {
                access_token: access.clone(),
                refresh_token: refresh.clone(),
                expires_at,
            }),
            _ => None,
        }
    }
}

/// Client-readable store: `token`, `refreshToken`, `tokenExpiry` and the
/// pending `oauthState`, persisted as a JSON document.
///
/// Reads come from an in-memory snapshot. Writes are serialized by a tokio
/// Mutex, persisted atomically, and only then published to the snapshot.
pub struct ClientStore {
    path: PathBuf,
    snapshot: RwLock<ClientDocument>,
    write_lock: Mutex<()>,
}

impl ClientStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let document = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading client store: {e}")))?;
            let document: ClientDocument = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing client store: {e}")))?;
            info!(path = %path.display(), authenticated = document.credential().is_some(), "loaded client store");
            document
        } else {
            info!(path = %path.display(), "client store not found, starting empty");
            ClientDocument::default()
        };

        Ok(Self {
            path,
            snapshot: RwLock::new(document),
            write_lock: Mutex::new(()),
        })
    }

    /// Persist the pending anti-forgery state token.
    pub async fn save_state(&self, state: &str) -> Result<()> {
        self.update(|doc| doc.oauth_state = Some(state.to_owned()))
            .await
    }

    /// Remove and return the pending state token. A second call returns `None`.
    pub async fn take_state(&self) -> Result<Option<String>> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.current();
        let taken = next.oauth_state.take();
        if taken.is_some() {
            self.persist(next).await?;
        }
        Ok(taken)
    }

    fn current(&self) -> ClientDocument {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn update(&self, apply: impl FnOnce(&mut ClientDocument)) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.current();
        apply(&mut next);
        self.persist(next).await
    }

    async fn persist(&self, next: ClientDocument) -> Result<()> {
        write_atomic(&self.path, &next).await?;
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        Ok(())
    }
}

impl CredentialBackend for ClientStore {
    fn name(&self) -> &'static str {
        "client"
    }

    fn load(&self) -> Option<Credential> {
        self.current().credential()
    }

    fn store<'a>(&'a self, credential: &'a Credential) -> StoreFuture<'a> {
        Box::pin(self.update(|doc| {
            doc.token = Some(credential.access_token.clone());
            doc.refresh_token = Some(credential.refresh_token.clone());
            doc.token_expiry = Some(credential.expires_at);
        }))
    }

    fn clear(&self) -> StoreFuture<'_> {
        Box::pin(self.update(|doc| {
            doc.token = None;
            doc.refresh_token = None;
            doc.token_expiry = None;
            doc.oauth_state = None;
        }))
    }
}

/// The credential as seen through both backings.
pub struct CredentialStore {
    server: Arc<dyn CredentialBackend>,
    client: Arc<dyn CredentialBackend>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(server: Arc<dyn CredentialBackend>, client: Arc<dyn CredentialBackend>) -> Self {
        Self {
            server,
            client,
            write_lock: Mutex::new(()),
        }
    }

    /// Write `credential` to both backings, server-only store first.
    ///
    /// On return either both hold `credential`, or neither changed, or (when
    /// the rollback itself failed) both are cleared and `PartialStoreWrite` is
    /// returned.
    pub async fn save(&self, credential: &Credential) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let previous = self.server.load();

        self.server.store(credential).await?;

        let Err(client_err) = self.client.store(credential).await else {
            debug!(expires_at = credential.expires_at, "credential saved to both stores");
            return Ok(());
        };

        warn!(error = %client_err, "client store write failed, rolling back server store");
        let rollback = match &previous {
            Some(previous) => self.server.store(previous).await,
            None => self.server.clear().await,
        };
        if let Err(rollback_err) = rollback {
            warn!(error = %rollback_err, "server store rollback failed, clearing both stores");
            self.clear_both().await;
        }

        Err(Error::PartialStoreWrite(format!(
            "client store write failed: {client_err}"
        )))
    }

    /// Current credential, reconciling the two backings.
    ///
    /// The server-only store wins any disagreement. A client copy that differs
    /// is rewritten from it; a client copy with no server counterpart is
    /// dropped. If the re-sync fails both stores are cleared.
    pub async fn read(&self) -> Option<Credential> {
        let server = self.server.load();
        let client = self.client.load();
        if server == client {
            return server;
        }

        let _guard = self.write_lock.lock().await;
        // Re-check under the lock: a save may have landed in between.
        let server = self.server.load();
        let client = self.client.load();
        if server == client {
            return server;
        }

        let resync = match &server {
            Some(credential) => self.client.store(credential).await,
            None => self.client.clear().await,
        };
        match resync {
            Ok(()) => {
                info!(
                    authenticated = server.is_some(),
                    "client store re-synchronized from server store"
                );
                server
            }
            Err(e) => {
                warn!(error = %e, "client store re-sync failed, clearing both stores");
                self.clear_both().await;
                None
            }
        }
    }

    /// Remove the credential from both backings. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let server = self.server.clear().await;
        let client = self.client.clear().await;
        debug!("credential cleared from both stores");
        server.and(client)
    }

    /// Whether an unexpired credential is present.
    pub async fn is_authenticated(&self) -> bool {
        self.read()
            .await
            .is_some_and(|credential| !credential.is_expired(now_millis()))
    }

    async fn clear_both(&self) {
        if let Err(e) = self.server.clear().await {
            warn!(backend = self.server.name(), error = %e, "failed to clear store");
        }
        if let Err(e) = self.client.clear().await {
            warn!(backend = self.client.name(), error = %e, "failed to clear store");
        }
    }
}

/// Write a JSON document atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Permissions are 0600 since the file contains OAuth tokens.
pub(crate) async fn write_atomic<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Store(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Store("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("store");

    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub(crate) fn test_credential(suffix: &str) -> Credential {
        Credential {
            access_token: format!("at_{suffix}"),
            refresh_token: format!("rt_{suffix}"),
            expires_at: 4_102_444_800_000,
        }
    }

    /// In-memory backend whose writes can be made to fail.
    #[derive(Default)]
    pub(crate) struct FlakyBackend {
        value: RwLock<Option<Credential>>,
        fail_writes: AtomicBool,
    }

    impl FlakyBackend {
        pub(crate) fn failing() -> Self {
            let backend = Self::default();
            backend.fail_writes.store(true, Ordering::SeqCst);
            backend
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            self.fail_writes.store(failing, Ordering::SeqCst);
        }

        pub(crate) fn force(&self, credential: Option<Credential>) {
            *self.value.write().unwrap() = credential;
        }
    }

    impl CredentialBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn load(&self) -> Option<Credential> {
            self.value.read().unwrap().clone()
        }

        fn store<'a>(&'a self, credential: &'a Credential) -> StoreFuture<'a> {
            Box::pin(async move {
                if self.fail_writes.load(Ordering::SeqCst) {
                    return Err(Error::Store("disk full".into()));
                }
                *self.value.write().unwrap() = Some(credential.clone());
                Ok(())
            })
        }

        fn clear(&self) -> StoreFuture<'_> {
            Box::pin(async move {
                if self.fail_writes.load(Ordering::SeqCst) {
                    return Err(Error::Store("disk full".into()));
                }
                *self.value.write().unwrap() = None;
                Ok(())
            })
        }
    }

    async fn file_store(dir: &tempfile::TempDir) -> (Arc<ClientStore>, Arc<crate::CookieJarStore>) {
        let client = ClientStore::open(dir.path().join("client.json")).await.unwrap();
        let server = crate::CookieJarStore::open(dir.path().join("cookies.json"), false)
            .await
            .unwrap();
        (Arc::new(client), Arc::new(server))
    }

    #[test]
    fn expiry_is_issue_time_plus_lifetime() {
        let credential = Credential::issued("at".into(), "rt".into(), 1_000_000, 3600);
        assert_eq!(credential.expires_at, 1_000_000 + 3_600_000);
        assert_eq!(credential.expires_in(1_000_000), Duration::from_secs(3600));
        assert!(!credential.is_expired(1_000_000));
        assert!(credential.is_expired(credential.expires_at));
        assert_eq!(credential.expires_in(credential.expires_at + 5), Duration::ZERO);
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let debug = format!("{:?}", test_credential("secret"));
        assert!(!debug.contains("at_secret"));
        assert!(!debug.contains("rt_secret"));
        assert!(debug.contains("expires_at"));
    }

    #[tokio::test]
    async fn save_then_read_roundtrips_in_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = file_store(&dir).await;
        let store = CredentialStore::new(server.clone(), client.clone());

        let credential = test_credential("1");
        store.save(&credential).await.unwrap();

        assert_eq!(store.read().await, Some(credential.clone()));
        assert_eq!(client.load(), Some(credential.clone()));
        assert_eq!(server.load(), Some(credential.clone()));

        // A fresh process sees the same state on disk.
        let (client2, server2) = file_store(&dir).await;
        assert_eq!(client2.load(), Some(credential.clone()));
        assert_eq!(server2.load(), Some(credential));
    }

    #[tokio::test]
    async fn client_document_uses_local_storage_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        let client = ClientStore::open(path.clone()).await.unwrap();
        client.store(&test_credential("1")).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(raw["token"], "at_1");
        assert_eq!(raw["refreshToken"], "rt_1");
        assert_eq!(raw["tokenExpiry"], 4_102_444_800_000u64);
    }

    #[tokio::test]
    async fn is_authenticated_false_for_expired_credential() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = file_store(&dir).await;
        let store = CredentialStore::new(server, client);

        let mut credential = test_credential("old");
        credential.expires_at = now_millis() - 1;
        store.save(&credential).await.unwrap();

        assert!(store.read().await.is_some());
        assert!(!store.is_authenticated().await);

        store.save(&test_credential("new")).await.unwrap();
        assert!(store.is_authenticated().await);
    }

    #[tokio::test]
    async fn clear_is_idempotent_and_empties_both() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = file_store(&dir).await;
        let store = CredentialStore::new(server.clone(), client.clone());

        store.save(&test_credential("1")).await.unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();

        assert!(store.read().await.is_none());
        assert!(client.load().is_none());
        assert!(server.load().is_none());
    }

    #[tokio::test]
    async fn failed_client_write_rolls_back_server() {
        let server = Arc::new(FlakyBackend::default());
        let client = Arc::new(FlakyBackend::default());
        let store = CredentialStore::new(server.clone(), client.clone());

        let original = test_credential("orig");
        store.save(&original).await.unwrap();

        client.set_failing(true);
        let err = store.save(&test_credential("new")).await.unwrap_err();
        assert!(matches!(err, Error::PartialStoreWrite(_)), "got: {err:?}");

        assert_eq!(server.load(), Some(original.clone()));
        assert_eq!(client.load(), Some(original));
    }

    #[tokio::test]
    async fn failed_first_write_leaves_client_untouched() {
        let server = Arc::new(FlakyBackend::failing());
        let client = Arc::new(FlakyBackend::default());
        let store = CredentialStore::new(server.clone(), client.clone());

        let err = store.save(&test_credential("1")).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)), "got: {err:?}");
        assert!(client.load().is_none());
    }

    #[tokio::test]
    async fn read_resyncs_client_from_server() {
        let server = Arc::new(FlakyBackend::default());
        let client = Arc::new(FlakyBackend::default());
        let store = CredentialStore::new(server.clone(), client.clone());

        server.force(Some(test_credential("server")));
        client.force(Some(test_credential("stale")));

        assert_eq!(store.read().await, Some(test_credential("server")));
        assert_eq!(client.load(), Some(test_credential("server")));
    }

    #[tokio::test]
    async fn read_drops_client_copy_without_server_counterpart() {
        let server = Arc::new(FlakyBackend::default());
        let client = Arc::new(FlakyBackend::default());
        let store = CredentialStore::new(server.clone(), client.clone());

        client.force(Some(test_credential("orphan")));

        assert!(store.read().await.is_none());
        assert!(client.load().is_none());
    }

    #[tokio::test]
    async fn read_clears_both_when_resync_fails() {
        let server = Arc::new(FlakyBackend::default());
        let client = Arc::new(FlakyBackend::failing());
        let store = CredentialStore::new(server.clone(), client.clone());

        server.force(Some(test_credential("server")));

        assert!(store.read().await.is_none());
        assert!(server.load().is_none());
    }

    #[tokio::test]
    async fn state_token_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let client = ClientStore::open(dir.path().join("client.json")).await.unwrap();

        client.save_state("st4te").await.unwrap();
        assert_eq!(client.take_state().await.unwrap().as_deref(), Some("st4te"));
        assert_eq!(client.take_state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn state_token_survives_credential_save() {
        let dir = tempfile::tempdir().unwrap();
        let client = ClientStore::open(dir.path().join("client.json")).await.unwrap();

        client.save_state("st4te").await.unwrap();
        client.store(&test_credential("1")).await.unwrap();
        assert_eq!(client.take_state().await.unwrap().as_deref(), Some("st4te"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn client_store_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        let client = ClientStore::open(path.clone()).await.unwrap();
        client.store(&test_credential("1")).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "client store must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_saves_leave_stores_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = file_store(&dir).await;
        let store = Arc::new(CredentialStore::new(server.clone(), client.clone()));

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save(&test_credential(&i.to_string())).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(server.load().is_some());
        assert_eq!(server.load(), client.load());
    }
}
