//! Device registry (spec §4.3): IMEI -> session map plus cached status,
//! guarded by `DashMap`'s per-shard locking so lookups/inserts/removes
//! contend without a single giant mutex and without business logic ever
//! running while a shard is locked (spec §5).

use crate::domain::{Device, Fingerprint};
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::store::Store;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone)]
pub struct SessionHandle {
    pub writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl SessionHandle {
    pub async fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.lock().await.write_all(bytes).await
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }

    pub async fn shutdown(&self) {
        self.close().await;
    }
}

struct SessionEntry {
    session_id: u64,
    device_id: i64,
    fingerprint: Fingerprint,
    handle: SessionHandle,
    /// The most recently sent command awaiting a device-side ack (spec §9
    /// note 5: vendor command-response frames don't carry our command id
    /// back, so the registry tracks the single outstanding one per IMEI).
    pending_ack: Option<String>,
}

#[derive(Clone)]
pub struct CachedStatus {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub activity_count: u64,
}

pub struct Registry {
    sessions: DashMap<String, SessionEntry>,
    status: DashMap<String, CachedStatus>,
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
}

/// Result of a successful authentication: what the session needs to know
/// about the device it just became.
pub struct AuthOutcome {
    pub device_id: i64,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Registry { sessions: DashMap::new(), status: DashMap::new(), store, metrics })
    }

    /// Spec §4.3 `authenticate`. Displaces any existing session for the
    /// same IMEI (spec §3 invariant: at most one authenticated session
    /// per IMEI).
    pub async fn authenticate(
        &self,
        session_id: u64,
        imei: &str,
        handle: SessionHandle,
    ) -> Result<AuthOutcome, AppError> {
        let device: Device = match self.store.get_device_by_imei(imei).await? {
            Some(d) if d.active => d,
            _ => return Err(AppError::AuthUnknownImei(imei.to_string())),
        };

        if let Some(existing) = self.sessions.get(imei) {
            existing.handle.close().await;
            Metrics::inc(&self.metrics.auth_displaced);
        }

        self.sessions.insert(
            imei.to_string(),
            SessionEntry {
                session_id,
                device_id: device.id,
                fingerprint: Fingerprint::Generic,
                handle,
                pending_ack: None,
            },
        );

        let now = Utc::now();
        self.store.set_online(imei, true).await?;
        self.status
            .entry(imei.to_string())
            .and_modify(|s| {
                s.online = true;
                s.last_seen = now;
                s.last_activity = now;
                s.activity_count += 1;
            })
            .or_insert(CachedStatus {
                online: true,
                last_seen: now,
                last_heartbeat: None,
                last_login: None,
                last_activity: now,
                activity_count: 1,
            });

        Ok(AuthOutcome { device_id: device.id })
    }

    pub fn set_fingerprint(&self, imei: &str, fingerprint: Fingerprint) {
        if let Some(mut entry) = self.sessions.get_mut(imei) {
            entry.fingerprint = fingerprint;
        }
    }

    pub fn fingerprint_of(&self, imei: &str) -> Option<Fingerprint> {
        self.sessions.get(imei).map(|e| e.fingerprint)
    }

    pub fn device_id_of(&self, imei: &str) -> Option<i64> {
        self.sessions.get(imei).map(|e| e.device_id)
    }

    pub fn lookup(&self, imei: &str) -> Option<SessionHandle> {
        self.sessions.get(imei).map(|e| e.handle.clone())
    }

    pub fn note_command_sent(&self, imei: &str, command_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(imei) {
            entry.pending_ack = Some(command_id.to_string());
        }
    }

    pub fn take_pending_ack(&self, imei: &str) -> Option<String> {
        self.sessions.get_mut(imei).and_then(|mut e| e.pending_ack.take())
    }

    /// Only removes the registry entry if it still belongs to `session_id`
    /// — prevents a just-closed old session from racing a displacement's
    /// fresh insert (spec §3 invariant).
    pub async fn mark_offline(&self, imei: &str, session_id: u64) {
        let should_clear = self.sessions.get(imei).map(|e| e.session_id == session_id).unwrap_or(false);
        if !should_clear {
            return;
        }
        self.sessions.remove(imei);
        if let Err(e) = self.store.set_online(imei, false).await {
            tracing::warn!(imei, error = %e, "mark_offline_store_error");
        }
        if let Some(mut s) = self.status.get_mut(imei) {
            s.online = false;
        }
    }

    pub async fn touch_heartbeat(&self, imei: &str) -> Result<(), AppError> {
        self.store.touch_heartbeat(imei).await?;
        let now = Utc::now();
        self.status
            .entry(imei.to_string())
            .and_modify(|s| {
                s.online = true;
                s.last_seen = now;
                s.last_heartbeat = Some(now);
                s.last_activity = now;
                s.activity_count += 1;
            })
            .or_insert(CachedStatus {
                online: true,
                last_seen: now,
                last_heartbeat: Some(now),
                last_login: None,
                last_activity: now,
                activity_count: 1,
            });
        Ok(())
    }

    pub async fn touch_login(&self, imei: &str) -> Result<(), AppError> {
        self.store.touch_login(imei).await?;
        let now = Utc::now();
        self.status
            .entry(imei.to_string())
            .and_modify(|s| {
                s.online = true;
                s.last_seen = now;
                s.last_login = Some(now);
                s.last_activity = now;
                s.activity_count += 1;
            })
            .or_insert(CachedStatus {
                online: true,
                last_seen: now,
                last_heartbeat: None,
                last_login: Some(now),
                last_activity: now,
                activity_count: 1,
            });
        Ok(())
    }

    pub fn touch_activity(&self, imei: &str) {
        let now = Utc::now();
        if let Some(mut s) = self.status.get_mut(imei) {
            s.last_seen = now;
            s.last_activity = now;
            s.activity_count += 1;
        }
    }

    /// Spec §4.3: every 60s, mark offline any cached status whose
    /// `last_seen` is more than 300s stale.
    pub async fn sweep_offline(&self) {
        let now = Utc::now();
        let stale: Vec<String> = self
            .status
            .iter()
            .filter(|e| e.online && (now - e.last_seen).num_seconds() > 300)
            .map(|e| e.key().clone())
            .collect();
        for imei in stale {
            if let Some(mut s) = self.status.get_mut(&imei) {
                s.online = false;
            }
            self.sessions.remove(&imei);
            if let Err(e) = self.store.set_online(&imei, false).await {
                tracing::warn!(imei = %imei, error = %e, "offline_sweep_store_error");
            }
        }
    }

    /// Spec §4.3: every 600s, drop cached rows untouched within 3600s.
    pub fn compact_cache(&self) {
        let now = Utc::now();
        self.status.retain(|_, s| (now - s.last_activity).num_seconds() < 3600);
    }

    pub fn spawn_sweeps(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                registry.sweep_offline().await;
            }
        });
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                interval.tick().await;
                registry.compact_cache();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::FakeStore;

    fn fake_registry() -> Arc<Registry> {
        Registry::new(Arc::new(FakeStore::with_active_device(1, "123456789012345")), Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn offline_sweep_clears_stale_sessions() {
        let registry = fake_registry();
        registry
            .status
            .insert(
                "123456789012345".to_string(),
                CachedStatus {
                    online: true,
                    last_seen: Utc::now() - chrono::Duration::seconds(301),
                    last_heartbeat: None,
                    last_login: None,
                    last_activity: Utc::now(),
                    activity_count: 1,
                },
            );
        registry.sweep_offline().await;
        assert!(!registry.status.get("123456789012345").unwrap().online);
    }

    async fn loopback_handle() -> SessionHandle {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_, writer) = server.into_split();
        SessionHandle { writer: Arc::new(Mutex::new(writer)) }
    }

    /// Spec §3 S5: a stale session's `mark_offline` (observed after its
    /// socket was closed by a displacement) must not flip the store/cache
    /// back offline for the device the displacing session still owns.
    #[tokio::test]
    async fn mark_offline_after_displacement_leaves_device_online() {
        let registry = fake_registry();
        let imei = "123456789012345";

        registry.authenticate(1, imei, loopback_handle().await).await.unwrap();
        registry.authenticate(2, imei, loopback_handle().await).await.unwrap();
        assert_eq!(registry.sessions.get(imei).unwrap().session_id, 2);

        // Old session (id 1) discovers its socket was closed and reports in.
        registry.mark_offline(imei, 1).await;

        assert!(registry.sessions.get(imei).is_some(), "displacing session must remain registered");
        assert!(registry.status.get(imei).unwrap().online, "cached status must stay online");
        let device = registry.store.get_device_by_imei(imei).await.unwrap().unwrap();
        assert!(device.online, "store must stay online after a stale mark_offline");
    }

    #[tokio::test]
    async fn cache_compaction_drops_untouched_rows() {
        let registry = fake_registry();
        registry.status.insert(
            "123456789012345".to_string(),
            CachedStatus {
                online: false,
                last_seen: Utc::now(),
                last_heartbeat: None,
                last_login: None,
                last_activity: Utc::now() - chrono::Duration::seconds(3601),
                activity_count: 1,
            },
        );
        registry.compact_cache();
        assert!(registry.status.get("123456789012345").is_none());
    }
}
