//! Profile controller.
//!
//! Owns the saved profile list and the active index. Every mutation is
//! computed on a copy, persisted (both keys in one write), and only then
//! committed in memory, so the stored and in-memory copies never diverge.
//! Mutations queue on an async operation lock.
//!
//! Proxy changes go through the background as `SET_PROXY` messages. When a
//! change is applied but cannot be persisted, the previous configuration is
//! applied again.
//!
//! A connectivity test temporarily applies the profile under test and always
//! puts the previous configuration back. The apply, probe and restore run on
//! their own task, so the restore happens even if the caller is dropped
//! mid-test or the probe panics.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use skyproxy_core::{sanitize_collection, ProfileDraft, ProxyConfig, ProxyProfile};
use skyproxy_storage::{keys, StorageError};
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

use crate::error::{ControllerError, Result, StoreError};
use crate::protocol::{Ack, FailureReason, Messenger, ProxyReport, ProxyState, Request, Response};
use crate::store::KeyValueStore;

/// Saved profiles plus the active index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileState {
    pub profiles: Vec<ProxyProfile>,
    /// Index into `profiles` of the applied profile; `None` means direct.
    pub active: Option<usize>,
}

impl ProfileState {
    pub fn active_profile(&self) -> Option<&ProxyProfile> {
        self.active.and_then(|i| self.profiles.get(i))
    }

    /// True when a profile is active (the global switch is on).
    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }
}

/// What `load` had to repair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Profiles that survived sanitizing.
    pub loaded: usize,
    /// Corrupted records removed.
    pub dropped: usize,
    /// The stored active index was invalid and was cleared.
    pub active_reset: bool,
    /// Human-readable notes for each repair.
    pub warnings: Vec<String>,
}

/// Clears the in-flight test flag when dropped, including during unwinding.
struct TestGuard(Arc<AtomicBool>);

impl Drop for TestGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the profile collection and drives proxy changes.
pub struct ProfileController {
    store: Arc<dyn KeyValueStore>,
    messenger: Arc<dyn Messenger>,
    state: RwLock<ProfileState>,
    op_lock: Arc<Mutex<()>>,
    testing: Arc<AtomicBool>,
}

impl ProfileController {
    /// Creates a controller with an empty collection. Call [`load`](Self::load) next.
    pub fn new(store: Arc<dyn KeyValueStore>, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            store,
            messenger,
            state: RwLock::new(ProfileState::default()),
            op_lock: Arc::new(Mutex::new(())),
            testing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a snapshot of the collection.
    pub fn state(&self) -> ProfileState {
        self.state.read().clone()
    }

    pub fn profiles(&self) -> Vec<ProxyProfile> {
        self.state.read().profiles.clone()
    }

    pub fn active(&self) -> Option<usize> {
        self.state.read().active
    }

    /// True while a connectivity test is running.
    pub fn is_testing(&self) -> bool {
        self.testing.load(Ordering::Acquire)
    }

    /// Waits until no operation holds the lock, including a test whose
    /// caller has gone away but which is still restoring.
    pub async fn wait_idle(&self) {
        let _op = self.op_lock.lock().await;
    }

    /// Loads the collection from the store, repairing it if needed.
    ///
    /// Corrupted records are dropped and the trimmed list is written back.
    /// An invalid active index is cleared, persisted, and the proxy is
    /// switched to direct. Repairs are reported, never fatal.
    pub async fn load(&self) -> Result<LoadReport> {
        let _op = self.op_lock.lock().await;

        let records = self.store.get(keys::PROFILES).await?.unwrap_or(Value::Null);
        let active = self
            .store
            .get(keys::ACTIVE_PROFILE)
            .await?
            .unwrap_or(Value::Null);

        let sanitized = sanitize_collection(&records, &active);
        let mut report = LoadReport {
            loaded: sanitized.profiles.len(),
            dropped: sanitized.dropped,
            active_reset: sanitized.active_reset,
            warnings: Vec::new(),
        };

        let next = ProfileState {
            profiles: sanitized.profiles,
            active: sanitized.active,
        };

        if sanitized.dropped > 0 {
            report
                .warnings
                .push(format!("Removed {} corrupted profile(s)", sanitized.dropped));
        }

        if sanitized.needs_rewrite || sanitized.active_reset {
            self.persist(&next).await?;
        }

        if sanitized.active_reset {
            report
                .warnings
                .push("Active profile was invalid; switched to direct connection".to_string());
            if let Err(e) = self.set_proxy(ProxyConfig::Direct).await {
                warn!(error = %e, "Could not switch to direct after resetting active profile");
                report
                    .warnings
                    .push(format!("Could not switch to direct connection: {e}"));
            }
        }

        info!(
            profiles = report.loaded,
            dropped = report.dropped,
            active = ?next.active,
            "Profiles loaded"
        );

        let profiles = next.profiles.clone();
        self.commit(next);
        self.notify(profiles).await;

        Ok(report)
    }

    /// Validates and appends a profile. Returns its index.
    pub async fn add_profile(&self, draft: &ProfileDraft) -> Result<usize> {
        let profile = draft.validate()?;
        let _op = self.op_lock.lock().await;

        let mut next = self.state();
        info!(name = %profile.display_name(), server = %profile.server(), "Adding profile");
        next.profiles.push(profile);
        let index = next.profiles.len() - 1;

        self.persist(&next).await?;
        let profiles = next.profiles.clone();
        self.commit(next);
        self.notify(profiles).await;

        Ok(index)
    }

    /// Replaces the profile at `index`.
    ///
    /// When it is the active profile its new configuration is applied first;
    /// if that fails nothing is persisted.
    pub async fn edit_profile(&self, index: usize, draft: &ProfileDraft) -> Result<()> {
        let profile = draft.validate()?;
        let _op = self.op_lock.lock().await;

        let mut next = self.state();
        let slot = next
            .profiles
            .get_mut(index)
            .ok_or(ControllerError::ProfileNotFound(index))?;
        *slot = profile.clone();

        if next.active == Some(index) {
            self.apply_and_persist(profile.to_config(), &next).await?;
        } else {
            self.persist(&next).await?;
        }
        info!(index, name = %profile.display_name(), "Profile updated");
        let profiles = next.profiles.clone();
        self.commit(next);
        self.notify(profiles).await;

        Ok(())
    }

    /// Removes the profile at `index`.
    ///
    /// Deleting the active profile switches to direct. Deleting one before it
    /// shifts the active index so the same profile stays active.
    pub async fn delete_profile(&self, index: usize) -> Result<ProxyProfile> {
        let _op = self.op_lock.lock().await;

        let mut next = self.state();
        if index >= next.profiles.len() {
            return Err(ControllerError::ProfileNotFound(index));
        }

        let removed = next.profiles.remove(index);
        match next.active {
            Some(active) if active == index => {
                next.active = None;
                self.apply_and_persist(ProxyConfig::Direct, &next).await?;
            }
            Some(active) => {
                if active > index {
                    next.active = Some(active - 1);
                }
                self.persist(&next).await?;
            }
            None => self.persist(&next).await?,
        }
        info!(index, name = %removed.display_name(), "Profile deleted");
        let profiles = next.profiles.clone();
        self.commit(next);
        self.notify(profiles).await;

        Ok(removed)
    }

    /// Applies the profile at `index` and marks it active.
    pub async fn activate(&self, index: usize) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.activate_locked(index).await
    }

    /// Switches to a direct connection.
    pub async fn deactivate(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.deactivate_locked().await
    }

    /// Global on/off switch.
    ///
    /// Turning on re-applies the active profile, or the first profile when
    /// none is active.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let _op = self.op_lock.lock().await;

        if !enabled {
            return self.deactivate_locked().await;
        }

        let state = self.state();
        let index = state
            .active
            .or_else(|| (!state.profiles.is_empty()).then_some(0))
            .ok_or(ControllerError::NoProfiles)?;
        self.activate_locked(index).await
    }

    /// Tests connectivity through the profile at `index`. Returns the public IP.
    ///
    /// Only one test runs at a time; a second call fails immediately with
    /// [`ControllerError::TestInProgress`]. The configuration in effect before
    /// the test is restored on every exit path. Dropping the returned future
    /// stops the probe early, and the restore still runs to completion while
    /// the operation lock stays held.
    pub async fn test_profile(&self, index: usize) -> Result<String> {
        let guard = self.begin_test()?;
        let op = self.op_lock.clone().lock_owned().await;

        let profile = self
            .state
            .read()
            .profiles
            .get(index)
            .cloned()
            .ok_or(ControllerError::ProfileNotFound(index))?;

        let snapshot = self.get_proxy().await?;
        info!(server = %profile.server(), previous = %snapshot, "Testing profile");

        let (cancel, cancelled) = oneshot::channel::<()>();
        let messenger = self.messenger.clone();
        let task = tokio::spawn(async move {
            let _op = op;
            let _guard = guard;
            test_then_restore(&*messenger, profile.to_config(), snapshot, cancelled).await
        });

        let joined = task.await;
        drop(cancel);

        match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(ControllerError::RestoreFailed(e.to_string())),
        }
    }

    /// Asks the background for the active profile and applied configuration.
    pub async fn proxy_state(&self) -> Result<ProxyState> {
        match self.messenger.send(Request::GetProxyState).await {
            Response::State(state) => Ok(state),
            _ => Err(ControllerError::Protocol("GET_PROXY_STATE")),
        }
    }

    fn begin_test(&self) -> Result<TestGuard> {
        self.testing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ControllerError::TestInProgress)?;
        Ok(TestGuard(self.testing.clone()))
    }

    async fn activate_locked(&self, index: usize) -> Result<()> {
        let mut next = self.state();
        let profile = next
            .profiles
            .get(index)
            .cloned()
            .ok_or(ControllerError::ProfileNotFound(index))?;

        next.active = Some(index);
        self.apply_and_persist(profile.to_config(), &next).await?;
        info!(index, name = %profile.display_name(), "Profile activated");
        self.commit(next);

        Ok(())
    }

    async fn deactivate_locked(&self) -> Result<()> {
        let mut next = self.state();
        next.active = None;

        self.apply_and_persist(ProxyConfig::Direct, &next).await?;
        info!("Switched to direct connection");
        self.commit(next);

        Ok(())
    }

    /// Applies `config`, then persists `next`. If persisting fails the
    /// configuration implied by the committed state is applied again.
    async fn apply_and_persist(&self, config: ProxyConfig, next: &ProfileState) -> Result<()> {
        let previous = self
            .state
            .read()
            .active_profile()
            .map(ProxyProfile::to_config)
            .unwrap_or(ProxyConfig::Direct);

        self.set_proxy(config).await?;

        if let Err(e) = self.persist(next).await {
            warn!(error = %e, config = %previous, "Persist failed, re-applying previous settings");
            if let Err(rollback) = self.set_proxy(previous).await {
                error!(error = %rollback, "Failed to re-apply previous proxy settings");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn set_proxy(&self, config: ProxyConfig) -> Result<()> {
        send_set_proxy(&*self.messenger, config).await
    }

    async fn get_proxy(&self) -> Result<ProxyConfig> {
        match self.messenger.send(Request::GetProxy).await {
            Response::Proxy(ProxyReport {
                config: Some(config),
                ..
            }) => Ok(config),
            Response::Proxy(ProxyReport { error, .. }) => Err(ControllerError::Snapshot(
                error.unwrap_or_else(|| "no configuration reported".to_string()),
            )),
            _ => Err(ControllerError::Protocol("GET_PROXY")),
        }
    }

    async fn persist(&self, state: &ProfileState) -> Result<()> {
        let profiles = serde_json::to_value(&state.profiles)
            .map_err(|e| StoreError::from(StorageError::from(e)))?;
        let active = serde_json::to_value(state.active)
            .map_err(|e| StoreError::from(StorageError::from(e)))?;

        self.store
            .set_many(vec![
                (keys::PROFILES.to_string(), profiles),
                (keys::ACTIVE_PROFILE.to_string(), active),
            ])
            .await?;
        Ok(())
    }

    fn commit(&self, state: ProfileState) {
        *self.state.write() = state;
    }

    /// Best-effort `PROFILES_UPDATED`; failures are only logged.
    async fn notify(&self, profiles: Vec<ProxyProfile>) {
        match self
            .messenger
            .send(Request::ProfilesUpdated { profiles })
            .await
        {
            Response::Ack(Ack { success: true, .. }) => {}
            Response::Ack(Ack { error, .. }) => {
                warn!(error = ?error, "Profile update notification failed");
            }
            _ => warn!("Unexpected response to profile update notification"),
        }
    }
}

/// Applies the profile under test, probes, and restores `snapshot`.
///
/// The probe is abandoned when `cancelled` resolves, which happens when the
/// caller stops waiting. The restore runs on every path.
async fn test_then_restore(
    messenger: &dyn Messenger,
    config: ProxyConfig,
    snapshot: ProxyConfig,
    cancelled: oneshot::Receiver<()>,
) -> Result<String> {
    let outcome = AssertUnwindSafe(async {
        // The apply always completes so it cannot land after the restore
        send_set_proxy(messenger, config).await?;
        tokio::select! {
            outcome = send_test_proxy(messenger) => outcome,
            _ = cancelled => {
                warn!("Connectivity test abandoned by caller");
                Err(ControllerError::TestCancelled)
            }
        }
    })
    .catch_unwind()
    .await;

    let restored = send_set_proxy(messenger, snapshot.clone()).await;
    if let Err(e) = &restored {
        error!(config = %snapshot, error = %e, "Failed to restore proxy settings after test");
    }

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(panic) => {
            error!("Connectivity test panicked");
            std::panic::resume_unwind(panic);
        }
    };

    match restored {
        Err(ControllerError::Apply(detail)) => Err(ControllerError::RestoreFailed(detail)),
        Err(e) => Err(ControllerError::RestoreFailed(e.to_string())),
        Ok(()) => outcome,
    }
}

async fn send_set_proxy(messenger: &dyn Messenger, config: ProxyConfig) -> Result<()> {
    match messenger.send(Request::SetProxy { config }).await {
        Response::Ack(Ack { success: true, .. }) => Ok(()),
        Response::Ack(Ack { error, .. }) => Err(ControllerError::Apply(
            error.unwrap_or_else(|| "unknown error".to_string()),
        )),
        _ => Err(ControllerError::Protocol("SET_PROXY")),
    }
}

async fn send_test_proxy(messenger: &dyn Messenger) -> Result<String> {
    match messenger.send(Request::TestProxy).await {
        Response::Test(result) if result.success => Ok(result.ip.unwrap_or_default()),
        Response::Test(result) => match result.reason {
            Some(FailureReason::Timeout) => Err(ControllerError::TestTimedOut),
            reason => Err(ControllerError::TestFailed {
                reason: reason.unwrap_or(FailureReason::Connection),
                message: result.error.unwrap_or_default(),
            }),
        },
        _ => Err(ControllerError::Protocol("TEST_PROXY")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use skyproxy_core::{ProxyScheme, ValidationError};
    use skyproxy_storage::Database;
    use tokio::sync::Notify;

    use crate::background::Background;
    use crate::config::AgentConfig;
    use crate::testing::{FakeProbe, FlakyStore, MemorySink};

    struct Harness {
        db: Database,
        store: Arc<FlakyStore>,
        sink: Arc<MemorySink>,
        controller: Arc<ProfileController>,
    }

    fn harness_with(sink: MemorySink, probe: FakeProbe) -> Harness {
        harness_with_timeout(sink, probe, Duration::from_secs(5))
    }

    fn harness_with_timeout(sink: MemorySink, probe: FakeProbe, timeout: Duration) -> Harness {
        let db = Database::in_memory().unwrap();
        let store = Arc::new(FlakyStore::new(db.clone()));
        let sink = Arc::new(sink);
        let config = AgentConfig::default().with_probe_timeout(timeout);
        let background = Background::new(sink.clone(), Arc::new(probe), &config);
        let controller = Arc::new(ProfileController::new(
            store.clone(),
            Arc::new(background),
        ));
        Harness {
            db,
            store,
            sink,
            controller,
        }
    }

    fn harness() -> Harness {
        harness_with(MemorySink::new(), FakeProbe::ip("203.0.113.9"))
    }

    fn draft(host: &str, port: &str) -> ProfileDraft {
        ProfileDraft {
            name: String::new(),
            scheme: "http".to_string(),
            host: host.to_string(),
            port: port.to_string(),
            bypass: "localhost".to_string(),
        }
    }

    async fn seeded(h: &Harness, hosts: &[&str]) {
        h.controller.load().await.unwrap();
        for host in hosts {
            h.controller.add_profile(&draft(host, "8080")).await.unwrap();
        }
    }

    fn other_config() -> ProxyConfig {
        ProxyProfile::new("Other", ProxyScheme::Socks5, "192.0.2.50", 1080, vec![]).to_config()
    }

    // ==================== load ====================

    #[tokio::test]
    async fn test_load_empty_store() {
        let h = harness();
        let report = h.controller.load().await.unwrap();

        assert_eq!(report, LoadReport::default());
        assert_eq!(h.controller.state(), ProfileState::default());
        assert!(h.sink.applied().is_empty());
    }

    #[tokio::test]
    async fn test_load_drops_corrupt_records_and_writes_back() {
        let h = harness();
        h.db.set_value(
            keys::PROFILES,
            &json!([
                {"name": "Broken", "host": "a.example", "port": 99999},
                {"name": "Good", "scheme": "ftp", "host": "b.example", "port": 3128},
            ]),
        )
        .unwrap();
        h.db.set_value(keys::ACTIVE_PROFILE, &json!(1)).unwrap();

        let report = h.controller.load().await.unwrap();

        assert_eq!(report.loaded, 1);
        assert_eq!(report.dropped, 1);
        assert!(!report.active_reset);
        assert_eq!(report.warnings.len(), 1);

        let state = h.controller.state();
        assert_eq!(state.active, Some(0));
        assert_eq!(state.profiles[0].scheme, ProxyScheme::Http);

        let stored = h.db.get_value(keys::PROFILES).unwrap().unwrap();
        assert_eq!(stored.as_array().unwrap().len(), 1);
        assert_eq!(stored[0]["host"], json!("b.example"));
        assert_eq!(h.db.get_value(keys::ACTIVE_PROFILE).unwrap(), Some(json!(0)));
    }

    #[tokio::test]
    async fn test_load_resets_out_of_range_active_and_forces_direct() {
        let h = harness_with(
            MemorySink::with_config(other_config()),
            FakeProbe::ip("203.0.113.9"),
        );
        h.db.set_value(
            keys::PROFILES,
            &json!([{"name": "A", "scheme": "http", "host": "a.example", "port": 80}]),
        )
        .unwrap();
        h.db.set_value(keys::ACTIVE_PROFILE, &json!(5)).unwrap();

        let report = h.controller.load().await.unwrap();

        assert!(report.active_reset);
        assert_eq!(h.controller.active(), None);
        assert_eq!(
            h.db.get_value(keys::ACTIVE_PROFILE).unwrap(),
            Some(json!(null))
        );
        assert_eq!(h.sink.current(), ProxyConfig::Direct);
    }

    #[tokio::test]
    async fn test_load_reset_survives_sink_failure() {
        let sink = MemorySink::with_config(other_config());
        sink.reject_all(true);
        let h = harness_with(sink, FakeProbe::ip("203.0.113.9"));
        h.db.set_value(keys::ACTIVE_PROFILE, &json!("zero")).unwrap();

        let report = h.controller.load().await.unwrap();

        assert!(report.active_reset);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(h.controller.active(), None);
    }

    #[tokio::test]
    async fn test_load_read_error_writes_nothing() {
        let h = harness();
        h.db.set_value(
            keys::PROFILES,
            &json!([{"name": "A", "scheme": "http", "host": "a.example", "port": 80}]),
        )
        .unwrap();
        h.db.set_value(keys::ACTIVE_PROFILE, &json!(0)).unwrap();
        h.store.fail_reads_of(keys::PROFILES);

        let err = h.controller.load().await.unwrap_err();

        assert!(matches!(err, ControllerError::Storage(_)));
        assert_eq!(h.db.get_value(keys::ACTIVE_PROFILE).unwrap(), Some(json!(0)));
        let stored = h.db.get_value(keys::PROFILES).unwrap().unwrap();
        assert_eq!(stored.as_array().unwrap().len(), 1);
        assert!(h.sink.applied().is_empty());
        assert_eq!(h.controller.state(), ProfileState::default());
    }

    #[tokio::test]
    async fn test_load_accepts_legacy_records() {
        let h = harness();
        h.db.set_value(
            keys::PROFILES,
            &json!([{
                "name": "Legacy",
                "config": {
                    "mode": "fixed_servers",
                    "rules": {
                        "singleProxy": {"scheme": "socks5", "host": "10.0.0.8", "port": 1080},
                        "bypassList": ["localhost", "bad token!"]
                    }
                }
            }]),
        )
        .unwrap();

        let report = h.controller.load().await.unwrap();

        assert_eq!(report.loaded, 1);
        let profile = &h.controller.profiles()[0];
        assert_eq!(profile.host, "10.0.0.8");
        assert_eq!(profile.bypass_list, vec!["localhost"]);
    }

    // ==================== add / edit ====================

    #[tokio::test]
    async fn test_add_profile_persists() {
        let h = harness();
        seeded(&h, &["proxy.example.com"]).await;

        let stored = h.db.get_value(keys::PROFILES).unwrap().unwrap();
        assert_eq!(
            stored,
            json!([{
                "name": "proxy.example.com",
                "scheme": "http",
                "host": "proxy.example.com",
                "port": 8080,
                "bypassList": ["localhost"]
            }])
        );
        assert_eq!(
            h.db.get_value(keys::ACTIVE_PROFILE).unwrap(),
            Some(json!(null))
        );
    }

    #[tokio::test]
    async fn test_add_invalid_profile_mutates_nothing() {
        let h = harness();
        seeded(&h, &[]).await;

        let err = h
            .controller
            .add_profile(&draft("proxy.example.com", "70000"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ControllerError::Validation(ValidationError::InvalidPort(_))
        ));
        assert!(h.controller.profiles().is_empty());
        assert!(h.db.get_value(keys::PROFILES).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_edit_active_profile_reapplies() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.controller.activate(0).await.unwrap();

        h.controller
            .edit_profile(0, &draft("b.example", "9090"))
            .await
            .unwrap();

        let profile = &h.controller.profiles()[0];
        assert_eq!(profile.host, "b.example");
        assert_eq!(h.sink.current(), profile.to_config());
    }

    #[tokio::test]
    async fn test_edit_active_profile_apply_failure_persists_nothing() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.controller.activate(0).await.unwrap();
        h.sink.reject_all(true);

        let err = h
            .controller
            .edit_profile(0, &draft("b.example", "9090"))
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::Apply(_)));
        assert_eq!(h.controller.profiles()[0].host, "a.example");
        let stored = h.db.get_value(keys::PROFILES).unwrap().unwrap();
        assert_eq!(stored[0]["host"], json!("a.example"));
    }

    #[tokio::test]
    async fn test_edit_active_profile_persist_failure_reapplies_old_config() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.controller.activate(0).await.unwrap();
        let original = h.controller.profiles()[0].to_config();
        h.store.fail_writes(true);

        let err = h
            .controller
            .edit_profile(0, &draft("b.example", "9090"))
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::Storage(_)));
        assert_eq!(h.sink.current(), original);
        assert_eq!(h.controller.profiles()[0].host, "a.example");
    }

    #[tokio::test]
    async fn test_edit_missing_profile() {
        let h = harness();
        seeded(&h, &[]).await;

        let err = h
            .controller
            .edit_profile(3, &draft("a.example", "80"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ProfileNotFound(3)));
    }

    // ==================== delete ====================

    #[tokio::test]
    async fn test_delete_active_profile_goes_direct() {
        let h = harness();
        seeded(&h, &["a.example", "b.example"]).await;
        h.controller.activate(1).await.unwrap();

        h.controller.delete_profile(1).await.unwrap();

        assert_eq!(h.controller.active(), None);
        assert_eq!(h.sink.current(), ProxyConfig::Direct);
        assert_eq!(
            h.db.get_value(keys::ACTIVE_PROFILE).unwrap(),
            Some(json!(null))
        );
    }

    #[tokio::test]
    async fn test_delete_below_active_keeps_same_profile() {
        let h = harness();
        seeded(&h, &["a.example", "b.example", "c.example"]).await;
        h.controller.activate(2).await.unwrap();

        let removed = h.controller.delete_profile(0).await.unwrap();

        assert_eq!(removed.host, "a.example");
        let state = h.controller.state();
        assert_eq!(state.active, Some(1));
        assert_eq!(state.active_profile().unwrap().host, "c.example");
        assert_eq!(h.db.get_value(keys::ACTIVE_PROFILE).unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_delete_above_active_keeps_index() {
        let h = harness();
        seeded(&h, &["a.example", "b.example"]).await;
        h.controller.activate(0).await.unwrap();

        h.controller.delete_profile(1).await.unwrap();

        assert_eq!(h.controller.active(), Some(0));
        assert_eq!(h.controller.profiles().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_active_with_failing_sink_mutates_nothing() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.controller.activate(0).await.unwrap();
        h.sink.reject_all(true);

        let err = h.controller.delete_profile(0).await.unwrap_err();

        assert!(matches!(err, ControllerError::Apply(_)));
        assert_eq!(h.controller.profiles().len(), 1);
        assert_eq!(h.controller.active(), Some(0));
    }

    #[tokio::test]
    async fn test_delete_active_persist_failure_reapplies_profile() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.controller.activate(0).await.unwrap();
        let original = h.controller.profiles()[0].to_config();
        h.store.fail_writes(true);

        let err = h.controller.delete_profile(0).await.unwrap_err();

        assert!(matches!(err, ControllerError::Storage(_)));
        assert_eq!(h.sink.current(), original);
        assert_eq!(h.controller.active(), Some(0));
        assert_eq!(h.db.get_value(keys::ACTIVE_PROFILE).unwrap(), Some(json!(0)));
    }

    // ==================== activate / switch ====================

    #[tokio::test]
    async fn test_activate_applies_and_persists() {
        let h = harness();
        seeded(&h, &["a.example"]).await;

        h.controller.activate(0).await.unwrap();

        assert_eq!(h.sink.current(), h.controller.profiles()[0].to_config());
        assert_eq!(h.db.get_value(keys::ACTIVE_PROFILE).unwrap(), Some(json!(0)));
    }

    #[tokio::test]
    async fn test_activate_failure_mutates_nothing() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.sink.reject_fixed(true);

        let err = h.controller.activate(0).await.unwrap_err();

        assert!(matches!(err, ControllerError::Apply(ref detail) if detail.contains("rejected")));
        assert_eq!(h.controller.active(), None);
        assert_eq!(
            h.db.get_value(keys::ACTIVE_PROFILE).unwrap(),
            Some(json!(null))
        );
    }

    #[tokio::test]
    async fn test_activate_persist_failure_reverts_sink() {
        let h = harness();
        seeded(&h, &["a.example", "b.example"]).await;
        h.controller.activate(0).await.unwrap();
        h.store.fail_writes(true);

        let err = h.controller.activate(1).await.unwrap_err();

        assert!(matches!(err, ControllerError::Storage(_)));
        assert_eq!(h.sink.current(), h.controller.profiles()[0].to_config());
        assert_eq!(h.controller.active(), Some(0));
    }

    #[tokio::test]
    async fn test_deactivate_persist_failure_reverts_sink() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.controller.activate(0).await.unwrap();
        h.store.fail_writes(true);

        assert!(h.controller.deactivate().await.is_err());
        assert_eq!(h.sink.current(), h.controller.profiles()[0].to_config());
        assert_eq!(h.controller.active(), Some(0));
    }

    #[tokio::test]
    async fn test_activate_missing_profile() {
        let h = harness();
        seeded(&h, &[]).await;
        assert!(matches!(
            h.controller.activate(0).await,
            Err(ControllerError::ProfileNotFound(0))
        ));
    }

    #[tokio::test]
    async fn test_deactivate() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.controller.activate(0).await.unwrap();

        h.controller.deactivate().await.unwrap();

        assert_eq!(h.controller.active(), None);
        assert_eq!(h.sink.current(), ProxyConfig::Direct);
    }

    #[tokio::test]
    async fn test_set_enabled() {
        let h = harness();
        seeded(&h, &[]).await;
        assert!(matches!(
            h.controller.set_enabled(true).await,
            Err(ControllerError::NoProfiles)
        ));

        h.controller.add_profile(&draft("a.example", "80")).await.unwrap();
        h.controller.add_profile(&draft("b.example", "80")).await.unwrap();

        h.controller.set_enabled(true).await.unwrap();
        assert_eq!(h.controller.active(), Some(0));

        h.controller.activate(1).await.unwrap();
        h.controller.set_enabled(false).await.unwrap();
        assert!(!h.controller.state().is_enabled());

        h.controller.activate(1).await.unwrap();
        h.controller.set_enabled(true).await.unwrap();
        assert_eq!(h.controller.active(), Some(1));
    }

    #[tokio::test]
    async fn test_state_reaches_background() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.controller.activate(0).await.unwrap();

        let state = h.controller.proxy_state().await.unwrap();
        assert_eq!(state.active_profile.unwrap().host, "a.example");
    }

    struct DeafMessenger(Background);

    #[async_trait]
    impl Messenger for DeafMessenger {
        async fn send(&self, request: Request) -> Response {
            match request {
                Request::ProfilesUpdated { .. } => Response::Ack(Ack::failed("nobody listening")),
                other => self.0.dispatch(other).await,
            }
        }
    }

    #[tokio::test]
    async fn test_notification_failure_is_not_an_error() {
        let db = Database::in_memory().unwrap();
        let background = Background::new(
            Arc::new(MemorySink::new()),
            Arc::new(FakeProbe::ip("203.0.113.9")),
            &AgentConfig::default(),
        );
        let controller =
            ProfileController::new(Arc::new(db), Arc::new(DeafMessenger(background)));

        controller.load().await.unwrap();
        assert_eq!(
            controller.add_profile(&draft("a.example", "80")).await.unwrap(),
            0
        );
    }

    // ==================== test_profile ====================

    #[tokio::test]
    async fn test_profile_test_restores_previous_config() {
        let h = harness_with(
            MemorySink::with_config(other_config()),
            FakeProbe::ip("203.0.113.9"),
        );
        seeded(&h, &["a.example"]).await;

        let ip = h.controller.test_profile(0).await.unwrap();

        assert_eq!(ip, "203.0.113.9");
        assert_eq!(h.sink.current(), other_config());
        let applied = h.sink.applied();
        assert_eq!(applied[0], h.controller.profiles()[0].to_config());
        assert_eq!(applied[1], other_config());
    }

    #[tokio::test]
    async fn test_probe_failure_restores() {
        let h = harness_with(
            MemorySink::with_config(other_config()),
            FakeProbe::Fail("connection refused".into()),
        );
        seeded(&h, &["a.example"]).await;

        let err = h.controller.test_profile(0).await.unwrap_err();

        assert!(matches!(
            err,
            ControllerError::TestFailed {
                reason: FailureReason::Connection,
                ..
            }
        ));
        assert_eq!(h.sink.current(), other_config());
    }

    #[tokio::test]
    async fn test_apply_failure_mid_test_restores() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.sink.reject_fixed(true);

        let err = h.controller.test_profile(0).await.unwrap_err();

        assert!(matches!(err, ControllerError::Apply(_)));
        assert_eq!(h.sink.current(), ProxyConfig::Direct);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_distinct() {
        let h = harness_with_timeout(
            MemorySink::new(),
            FakeProbe::Hang,
            Duration::from_millis(100),
        );
        seeded(&h, &["a.example"]).await;

        let err = h.controller.test_profile(0).await.unwrap_err();

        assert!(matches!(err, ControllerError::TestTimedOut));
        assert_eq!(h.sink.current(), ProxyConfig::Direct);
        assert!(!h.controller.is_testing());
    }

    #[tokio::test]
    async fn test_concurrent_test_rejected() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let h = harness_with(
            MemorySink::with_config(other_config()),
            FakeProbe::Gated {
                entered: entered.clone(),
                release: release.clone(),
                ip: "203.0.113.9".to_string(),
            },
        );
        seeded(&h, &["a.example"]).await;

        let controller = h.controller.clone();
        let first = tokio::spawn(async move { controller.test_profile(0).await });
        entered.notified().await;

        assert!(h.controller.is_testing());
        let second = h.controller.test_profile(0).await;
        assert!(matches!(second, Err(ControllerError::TestInProgress)));

        release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), "203.0.113.9");
        assert_eq!(h.sink.current(), other_config());
        assert!(!h.controller.is_testing());
    }

    #[tokio::test]
    async fn test_restore_failure_reported() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let h = harness_with(
            MemorySink::new(),
            FakeProbe::Gated {
                entered: entered.clone(),
                release: release.clone(),
                ip: "203.0.113.9".to_string(),
            },
        );
        seeded(&h, &["a.example"]).await;

        let controller = h.controller.clone();
        let test = tokio::spawn(async move { controller.test_profile(0).await });
        entered.notified().await;
        h.sink.reject_all(true);
        release.notify_one();

        let err = test.await.unwrap().unwrap_err();
        assert!(matches!(err, ControllerError::RestoreFailed(_)));
    }

    #[tokio::test]
    async fn test_panicking_probe_still_restores() {
        let h = harness_with(MemorySink::with_config(other_config()), FakeProbe::Panic);
        seeded(&h, &["a.example"]).await;

        let controller = h.controller.clone();
        let joined = tokio::spawn(async move { controller.test_profile(0).await }).await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(h.sink.current(), other_config());
        assert!(!h.controller.is_testing());
    }

    #[tokio::test]
    async fn test_dropped_test_still_restores() {
        let h = harness_with(MemorySink::with_config(other_config()), FakeProbe::Hang);
        seeded(&h, &["a.example"]).await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), h.controller.test_profile(0)).await;
        assert!(abandoned.is_err());

        h.controller.wait_idle().await;
        assert_eq!(h.sink.current(), other_config());
        assert_eq!(
            h.sink.applied(),
            vec![h.controller.profiles()[0].to_config(), other_config()]
        );
        assert!(!h.controller.is_testing());
    }

    #[tokio::test]
    async fn test_activation_waits_for_abandoned_test() {
        let h = harness_with(MemorySink::with_config(other_config()), FakeProbe::Hang);
        seeded(&h, &["a.example", "b.example"]).await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), h.controller.test_profile(0)).await;
        assert!(abandoned.is_err());

        h.controller.activate(1).await.unwrap();
        assert_eq!(h.sink.current(), h.controller.profiles()[1].to_config());
    }

    #[tokio::test]
    async fn test_snapshot_failure_touches_nothing() {
        let h = harness();
        seeded(&h, &["a.example"]).await;
        h.sink.fail_query(true);

        let err = h.controller.test_profile(0).await.unwrap_err();

        assert!(matches!(err, ControllerError::Snapshot(_)));
        assert!(h.sink.applied().is_empty());
    }

    #[tokio::test]
    async fn test_test_missing_profile_releases_flag() {
        let h = harness();
        seeded(&h, &[]).await;

        assert!(matches!(
            h.controller.test_profile(0).await,
            Err(ControllerError::ProfileNotFound(0))
        ));
        tokio_test::assert_ok!(h.controller.add_profile(&draft("a.example", "80")).await);
        tokio_test::assert_ok!(h.controller.test_profile(0).await);
    }
}
