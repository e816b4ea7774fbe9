//! License prefetch queues.
//!
//! Protection records discovered ahead of playback are queued here and
//! licensed in the background. The normal queue suppresses duplicates and
//! keeps the item being processed at its front so failure escalation can see
//! it; the VSS queue accepts repeats and may defer each acquisition to spread
//! license traffic across a common key period.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::event::{DrmEventListener, DrmFailureEvent};
use crate::helper::DrmHelper;
use crate::session::{MediaType, TRACKED_MEDIA_TYPES};
use crate::session_manager::DrmSessionManager;
use crate::transport::AbortSignal;

const DEFER_OFFSET_FROM_START_S: u64 = 5;
const DEFER_OFFSET_TO_UPPER_BOUND_S: u64 = 5;

/// Delay before acquiring a VSS license with a common key duration of
/// `duration`.
///
/// Picks a random whole second in `[5, D - 5)`. Windows of ten seconds or
/// less have no room for that and use `D / 2`.
pub fn defer_interval(duration: Duration) -> Duration {
    let secs = duration.as_secs();
    let guard = DEFER_OFFSET_FROM_START_S + DEFER_OFFSET_TO_UPPER_BOUND_S;
    if secs <= guard {
        return duration / 2;
    }
    let jitter = rand::rng().random_range(0..secs - guard);
    Duration::from_secs(DEFER_OFFSET_FROM_START_S + jitter)
}

/// A queued protection record.
pub struct LicensePreFetchObject {
    pub helper: Arc<dyn DrmHelper>,
    pub period_id: String,
    pub adaptation_index: u32,
    pub media_type: MediaType,
    pub is_vss: bool,
    id: u64,
}

impl LicensePreFetchObject {
    /// Same media type and key identities.
    fn is_equivalent(&self, other: &LicensePreFetchObject) -> bool {
        self.media_type == other.media_type && self.helper.key_ids() == other.helper.key_ids()
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<LicensePreFetchObject>>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct FetchQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

struct Shared {
    manager: Arc<DrmSessionManager>,
    listener: Arc<dyn DrmEventListener>,
    normal: FetchQueue,
    vss: FetchQueue,
    exit: AtomicBool,
    /// Interrupts the VSS defer sleep on teardown.
    interrupt: AbortSignal,
    track_status: Mutex<[bool; TRACKED_MEDIA_TYPES]>,
    common_key_duration: Mutex<Duration>,
    send_error_on_failure: AtomicBool,
    next_id: AtomicU64,
}

/// Background license acquisition for queued protection records.
pub struct LicensePreFetcher {
    shared: Arc<Shared>,
}

impl LicensePreFetcher {
    pub fn new(manager: Arc<DrmSessionManager>, listener: Arc<dyn DrmEventListener>) -> Self {
        let config = manager.protocol().config();
        let common_key_duration = Duration::from_secs(config.common_key_duration_s);
        let send_error_on_failure = config.send_error_on_failure;
        Self {
            shared: Arc::new(Shared {
                manager,
                listener,
                normal: FetchQueue::default(),
                vss: FetchQueue::default(),
                exit: AtomicBool::new(false),
                interrupt: AbortSignal::new(),
                track_status: Mutex::new([false; TRACKED_MEDIA_TYPES]),
                common_key_duration: Mutex::new(common_key_duration),
                send_error_on_failure: AtomicBool::new(send_error_on_failure),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Re-arm the prefetcher after [`LicensePreFetcher::term`].
    pub fn init(&self) {
        if self.shared.normal.state.lock().worker.is_some()
            || self.shared.vss.state.lock().worker.is_some()
        {
            warn!("Prefetch worker is already started when calling init");
        }
        self.shared.track_status.lock().fill(false);
        self.shared.interrupt.reset();
        self.shared.exit.store(false, Ordering::SeqCst);
    }

    /// Queue a protection record for background acquisition.
    ///
    /// Returns `false` once the prefetcher was terminated. A record equivalent
    /// to one already waiting in the normal queue is accepted but not queued
    /// twice.
    pub fn queue_content_protection(
        &self,
        helper: Arc<dyn DrmHelper>,
        period_id: impl Into<String>,
        adaptation_index: u32,
        media_type: MediaType,
        is_vss: bool,
    ) -> bool {
        if self.shared.exit.load(Ordering::SeqCst) {
            warn!("Skipping license prefetch, the prefetcher was terminated");
            return false;
        }
        let object = Arc::new(LicensePreFetchObject {
            helper,
            period_id: period_id.into(),
            adaptation_index,
            media_type,
            is_vss,
            id: self.shared.next_id.fetch_add(1, Ordering::SeqCst),
        });

        let queue = if is_vss {
            &self.shared.vss
        } else {
            &self.shared.normal
        };
        let mut state = queue.state.lock();
        if !is_vss && state.items.iter().any(|queued| queued.is_equivalent(&object)) {
            info!("Key already queued for {}", media_type);
            return true;
        }
        state.items.push_back(object);

        if state.worker.is_some() {
            queue.cond.notify_one();
            return true;
        }
        let name = if is_vss { "drm-prefetch-vss" } else { "drm-prefetch" };
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if is_vss {
                    shared.run_vss_worker();
                } else {
                    shared.run_normal_worker();
                }
            });
        match spawned {
            Ok(handle) => {
                info!("Started {} worker", name);
                state.worker = Some(handle);
                true
            }
            Err(e) => {
                error!("Failed to start prefetch worker: {}", e);
                state.items.pop_back();
                false
            }
        }
    }

    pub fn set_common_key_duration(&self, duration: Duration) {
        *self.shared.common_key_duration.lock() = duration;
    }

    pub fn set_send_error_on_failure(&self, send: bool) {
        self.shared.send_error_on_failure.store(send, Ordering::SeqCst);
    }

    /// Whether a license was acquired for the track of `media_type`.
    pub fn track_status(&self, media_type: MediaType) -> bool {
        media_type
            .track_index()
            .is_some_and(|i| self.shared.track_status.lock()[i])
    }

    /// Records waiting in (or being processed from) the normal queue.
    pub fn pending(&self) -> usize {
        self.shared.normal.state.lock().items.len()
    }

    /// Drop queued records and join both workers.
    ///
    /// A record being processed completes first; a VSS defer sleep is cut
    /// short.
    pub fn term(&self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        self.shared.interrupt.abort();
        let workers = [&self.shared.normal, &self.shared.vss].map(|queue| {
            let mut state = queue.state.lock();
            state.items.clear();
            queue.cond.notify_all();
            state.worker.take()
        });
        for handle in workers.into_iter().flatten() {
            debug!("Joining prefetch worker");
            if handle.join().is_err() {
                error!("Prefetch worker panicked");
            }
        }
        self.shared.track_status.lock().fill(false);
    }
}

impl Drop for LicensePreFetcher {
    fn drop(&mut self) {
        self.term();
    }
}

impl Shared {
    fn exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    fn run_normal_worker(&self) {
        let mut state = self.normal.state.lock();
        while !self.exiting() {
            // The record stays queued while it is processed.
            let Some(object) = state.items.front().cloned() else {
                debug!("Waiting for new entry in the prefetch queue");
                self.normal.cond.wait(&mut state);
                continue;
            };
            MutexGuard::unlocked(&mut state, || self.process(&object, false));
            if state.items.front().is_some_and(|front| front.id == object.id) {
                state.items.pop_front();
            }
        }
    }

    fn run_vss_worker(&self) {
        let mut state = self.vss.state.lock();
        while !self.exiting() {
            let Some(object) = state.items.pop_front() else {
                debug!("Waiting for new entry in the VSS prefetch queue");
                self.vss.cond.wait(&mut state);
                continue;
            };
            MutexGuard::unlocked(&mut state, || self.process(&object, true));
        }
    }

    fn process(&self, object: &LicensePreFetchObject, defer: bool) {
        if self.exiting() {
            return;
        }
        let key_ids = object.helper.key_ids();
        let processed = key_ids
            .first()
            .and_then(|key_id| self.manager.is_key_id_processed(key_id));

        let succeeded = match processed {
            Some(status) => {
                warn!(
                    "Key already processed [status: {}] for {} adaptation set {}",
                    if status { "SUCCESS" } else { "FAIL" },
                    object.media_type,
                    object.adaptation_index
                );
                status
            }
            None => {
                if defer {
                    self.defer_acquisition();
                }
                if self.exiting() {
                    return;
                }
                if let Some(key_id) = key_ids.first() {
                    info!(
                        "Creating DRM session for {} period {} key id {}",
                        object.media_type, object.period_id, key_id
                    );
                }
                self.create_session(object)
            }
        };

        if succeeded {
            if let Some(index) = object.media_type.track_index() {
                debug!("Updating track status for {}", object.media_type);
                self.track_status.lock()[index] = true;
            }
        }
    }

    fn defer_acquisition(&self) {
        let duration = *self.common_key_duration.lock();
        if duration.is_zero() {
            return;
        }
        let wait = defer_interval(duration);
        info!("Deferring VSS license acquisition by {:?}", wait);
        if !self.interrupt.sleep(wait) {
            debug!("Deferred license acquisition interrupted");
        }
    }

    fn create_session(&self, object: &LicensePreFetchObject) -> bool {
        match self
            .manager
            .create_session(object.helper.as_ref(), object.media_type, false)
        {
            Ok(handle) => {
                self.listener.on_session_ready(object.media_type, handle.slot);
                true
            }
            Err(e) => {
                error!(
                    "Failed DRM session creation for {}: {}",
                    object.helper.system_id(),
                    e
                );
                self.notify_failure(object, &e);
                false
            }
        }
    }

    fn notify_failure(&self, object: &LicensePreFetchObject, err: &Error) {
        if err.is_self_abort() {
            info!("License request for {} was aborted", object.media_type);
            return;
        }
        let event = DrmFailureEvent::from_error(err, object.media_type);
        if self.should_escalate(object) {
            warn!(
                "DRM failure {:?} response {:?} retry enabled: {}",
                event.kind, event.response_code, event.is_retry_enabled
            );
            self.listener.on_drm_failure(&event);
        } else {
            self.listener.on_failure_suppressed(&event);
        }
    }

    fn should_escalate(&self, object: &LicensePreFetchObject) -> bool {
        if self.send_error_on_failure.load(Ordering::SeqCst) {
            return true;
        }
        let acquired = object
            .media_type
            .track_index()
            .is_some_and(|i| self.track_status.lock()[i]);
        if acquired {
            warn!(
                "Skipping DRM failure event, license already acquired for {}",
                object.media_type
            );
            return false;
        }
        let pending = self
            .normal
            .state
            .lock()
            .items
            .iter()
            .any(|queued| queued.id != object.id && queued.media_type == object.media_type);
        if pending {
            warn!(
                "Skipping DRM failure event, a pending request exists for {}",
                object.media_type
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{defer_interval, LicensePreFetcher};
    use crate::cdm::NoOutputProtection;
    use crate::config::DrmConfig;
    use crate::error::FailureKind;
    use crate::helper::{DrmHelper, GenericDrmHelper, SystemId};
    use crate::protocol::LicenseProtocol;
    use crate::session::{KeyIdentity, MediaType};
    use crate::session_manager::DrmSessionManager;
    use crate::testing::{
        ok_response, status_response, wait_for, CdmBehavior, CountingTokenProvider,
        MockCdmFactory, RecordingListener, ScriptedTransport,
    };
    use crate::token::TokenCache;
    use crate::transport::AbortSignal;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        prefetcher: LicensePreFetcher,
        manager: Arc<DrmSessionManager>,
        transport: Arc<ScriptedTransport>,
        listener: Arc<RecordingListener>,
    }

    fn fixture(transport: ScriptedTransport, send_error_on_failure: bool) -> Fixture {
        let config = DrmConfig {
            max_sessions: 4,
            license_retry_wait_ms: 1,
            send_error_on_failure,
            ..DrmConfig::default()
        };
        let transport = Arc::new(transport);
        let listener = Arc::new(RecordingListener::default());
        let protocol = LicenseProtocol::new(
            config,
            transport.clone(),
            TokenCache::new(Arc::new(CountingTokenProvider::new("tok"))),
            Arc::new(NoOutputProtection),
            Arc::new(AbortSignal::new()),
        );
        let manager = Arc::new(DrmSessionManager::new(
            protocol,
            Arc::new(MockCdmFactory::new(CdmBehavior::default())),
            listener.clone(),
        ));
        let prefetcher = LicensePreFetcher::new(Arc::clone(&manager), listener.clone());
        Fixture {
            prefetcher,
            manager,
            transport,
            listener,
        }
    }

    fn helper(key: u8) -> Arc<dyn DrmHelper> {
        Arc::new(GenericDrmHelper::new(
            SystemId::Widevine,
            vec![key],
            vec![KeyIdentity::new(vec![key; 16])],
        ))
    }

    #[test]
    fn defer_interval_bounds() {
        for _ in 0..100 {
            let wait = defer_interval(Duration::from_secs(60));
            assert!(wait >= Duration::from_secs(5));
            assert!(wait < Duration::from_secs(55));
        }
        assert_eq!(defer_interval(Duration::from_secs(11)), Duration::from_secs(5));
        assert_eq!(defer_interval(Duration::from_secs(6)), Duration::from_secs(3));
    }

    #[test]
    fn acquires_queued_license() {
        let f = fixture(ScriptedTransport::repeating(ok_response(b"lic")), true);
        assert!(f
            .prefetcher
            .queue_content_protection(helper(1), "p0", 0, MediaType::Video, false));
        assert!(wait_for(WAIT, || f.prefetcher.track_status(MediaType::Video)));
        assert_eq!(f.listener.ready().len(), 1);
        assert_eq!(f.manager.is_key_id_processed(&KeyIdentity::new(vec![1; 16])), Some(true));
        assert!(!f.prefetcher.track_status(MediaType::Audio));
    }

    #[test]
    fn duplicate_records_are_not_queued_twice() {
        let transport = ScriptedTransport::repeating(ok_response(b"lic"));
        transport.set_delay(Duration::from_millis(200));
        let f = fixture(transport, true);

        f.prefetcher
            .queue_content_protection(helper(1), "p0", 0, MediaType::Video, false);
        assert!(wait_for(WAIT, || f.transport.calls() == 1));
        assert!(f
            .prefetcher
            .queue_content_protection(helper(1), "p1", 0, MediaType::Video, false));
        assert_eq!(f.prefetcher.pending(), 1);
        f.prefetcher
            .queue_content_protection(helper(1), "p1", 1, MediaType::Audio, false);
        assert_eq!(f.prefetcher.pending(), 2);

        assert!(wait_for(WAIT, || f.prefetcher.pending() == 0));
        // The audio record reuses the processed key.
        assert_eq!(f.transport.calls(), 1);
        assert!(f.prefetcher.track_status(MediaType::Audio));
    }

    #[test]
    fn failure_after_track_success_is_suppressed() {
        let f = fixture(
            ScriptedTransport::new(vec![ok_response(b"lic"), status_response(403)]),
            false,
        );
        f.prefetcher
            .queue_content_protection(helper(1), "p0", 0, MediaType::Video, false);
        f.prefetcher
            .queue_content_protection(helper(2), "p1", 0, MediaType::Video, false);

        assert!(wait_for(WAIT, || f.listener.suppressed().len() == 1));
        assert!(f.listener.failures().is_empty());
        assert_eq!(f.listener.suppressed()[0].kind, FailureKind::LicenceRequestFailed);
    }

    #[test]
    fn failure_with_pending_record_is_suppressed() {
        let transport = ScriptedTransport::new(vec![status_response(403), ok_response(b"lic")]);
        transport.set_delay(Duration::from_millis(100));
        let f = fixture(transport, false);

        f.prefetcher
            .queue_content_protection(helper(1), "p0", 0, MediaType::Video, false);
        assert!(wait_for(WAIT, || f.transport.calls() == 1));
        f.prefetcher
            .queue_content_protection(helper(2), "p1", 0, MediaType::Video, false);

        assert!(wait_for(WAIT, || f.listener.ready().len() == 1));
        assert_eq!(f.listener.suppressed().len(), 1);
        assert!(f.listener.failures().is_empty());
    }

    #[test]
    fn failure_is_escalated() {
        let f = fixture(ScriptedTransport::repeating(status_response(403)), false);
        f.prefetcher
            .queue_content_protection(helper(1), "p0", 0, MediaType::Audio, false);
        assert!(wait_for(WAIT, || f.listener.failures().len() == 1));
        let event = &f.listener.failures()[0];
        assert_eq!(event.media_type, MediaType::Audio);
        assert!(!event.is_retry_enabled);
    }

    #[test]
    fn send_error_on_failure_always_escalates() {
        let f = fixture(
            ScriptedTransport::new(vec![ok_response(b"lic"), status_response(403)]),
            true,
        );
        f.prefetcher
            .queue_content_protection(helper(1), "p0", 0, MediaType::Video, false);
        f.prefetcher
            .queue_content_protection(helper(2), "p1", 0, MediaType::Video, false);
        assert!(wait_for(WAIT, || f.listener.failures().len() == 1));
        assert!(f.listener.suppressed().is_empty());
    }

    #[test]
    fn vss_records_are_not_deduplicated() {
        let f = fixture(ScriptedTransport::repeating(ok_response(b"lic")), true);
        assert!(f
            .prefetcher
            .queue_content_protection(helper(1), "vss0", 0, MediaType::Video, true));
        assert!(f
            .prefetcher
            .queue_content_protection(helper(1), "vss1", 0, MediaType::Video, true));
        assert!(wait_for(WAIT, || f.prefetcher.track_status(MediaType::Video)));
        assert!(wait_for(WAIT, || f.transport.calls() == 1));
        assert_eq!(f.listener.ready().len(), 1);
    }

    #[test]
    fn term_interrupts_deferred_vss_acquisition() {
        let f = fixture(ScriptedTransport::repeating(ok_response(b"lic")), true);
        f.prefetcher.set_common_key_duration(Duration::from_secs(60));
        f.prefetcher
            .queue_content_protection(helper(1), "vss0", 0, MediaType::Video, true);
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        f.prefetcher.term();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(f.transport.calls(), 0);
        assert!(!f
            .prefetcher
            .queue_content_protection(helper(2), "p0", 0, MediaType::Video, false));

        f.prefetcher.init();
        f.prefetcher.set_common_key_duration(Duration::ZERO);
        assert!(f
            .prefetcher
            .queue_content_protection(helper(2), "p0", 0, MediaType::Video, false));
        assert!(wait_for(WAIT, || f.prefetcher.track_status(MediaType::Video)));
    }

    #[test]
    fn processed_key_skips_acquisition() {
        let f = fixture(ScriptedTransport::repeating(status_response(403)), false);
        f.manager
            .create_session(helper(1).as_ref(), MediaType::Video, false)
            .expect_err("fails");
        let calls = f.transport.calls();

        f.prefetcher
            .queue_content_protection(helper(1), "p0", 0, MediaType::Video, false);
        assert!(wait_for(WAIT, || f.prefetcher.pending() == 0));
        assert_eq!(f.transport.calls(), calls);
        assert!(f.listener.failures().is_empty());
        assert!(!f.prefetcher.track_status(MediaType::Video));
    }
}
