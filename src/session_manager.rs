//! DRM session manager.
//!
//! Composes the key cache, the session slots and the acquisition protocol.
//! The cache lock is held only while a slot is selected; each slot has its
//! own lock held across session initialization, license acquisition and
//! renewal, so work on different slots never blocks each other. Locks are
//! always taken slot first, cache second.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cdm::{CdmFactory, CdmSession};
use crate::error::{Error, Result};
use crate::event::DrmEventListener;
use crate::helper::DrmHelper;
use crate::key_cache::KeyCache;
use crate::protocol::LicenseProtocol;
use crate::session::{KeyIdentity, MediaType, SessionHandle, SessionState, SlotIndex};

/// Process-wide state of the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionManagerState {
    Active,
    Inactive,
}

#[derive(Default)]
struct SlotContext {
    session: Option<Arc<dyn CdmSession>>,
    /// Primary key identity the live session was created for.
    key_id: Option<KeyIdentity>,
}

#[derive(Default)]
struct SessionSlot {
    context: Mutex<SlotContext>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

/// What a locked slot holds for the requested key.
enum SlotBinding {
    /// A usable session; no acquisition needed.
    Ready(Arc<dyn CdmSession>),
    /// A session that still needs initialization and a license.
    Init(Arc<dyn CdmSession>),
}

/// Bounded pool of CDM sessions keyed by key identity.
pub struct DrmSessionManager {
    slots: Vec<SessionSlot>,
    cache: Mutex<KeyCache>,
    active: AtomicBool,
    protocol: LicenseProtocol,
    factory: Arc<dyn CdmFactory>,
    listener: Arc<dyn DrmEventListener>,
}

impl DrmSessionManager {
    pub fn new(
        protocol: LicenseProtocol,
        factory: Arc<dyn CdmFactory>,
        listener: Arc<dyn DrmEventListener>,
    ) -> Self {
        let max_sessions = protocol.config().max_sessions;
        Self {
            slots: (0..max_sessions).map(|_| SessionSlot::default()).collect(),
            cache: Mutex::new(KeyCache::new(max_sessions)),
            active: AtomicBool::new(true),
            protocol,
            factory,
            listener,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.slots.len()
    }

    pub fn protocol(&self) -> &LicenseProtocol {
        &self.protocol
    }

    pub fn state(&self) -> SessionManagerState {
        if self.active.load(Ordering::SeqCst) {
            SessionManagerState::Active
        } else {
            SessionManagerState::Inactive
        }
    }

    pub fn set_state(&self, state: SessionManagerState) {
        info!("DRM session manager state set to {:?}", state);
        self.active
            .store(state == SessionManagerState::Active, Ordering::SeqCst);
    }

    /// Raise or clear the abort flag for in-flight license requests.
    pub fn set_license_request_abort(&self, abort: bool) {
        self.protocol.abort_signal().set(abort);
    }

    /// Get a ready session for the protection record described by `helper`.
    ///
    /// Reuses a session that already serves one of the helper's key
    /// identities; otherwise allocates a slot, creates a session and runs the
    /// acquisition protocol on it. Any failure marks the slot's cache entry
    /// failed so the same key identity fails fast until cleared, unless a
    /// concurrent caller reassigned the slot in the meantime.
    pub fn create_session(
        &self,
        helper: &dyn DrmHelper,
        media_type: MediaType,
        is_primary: bool,
    ) -> Result<SessionHandle> {
        if self.state() == SessionManagerState::Inactive {
            error!("Session manager inactive, aborting request");
            return Err(Error::SessionManagerInactive);
        }

        let key_ids = helper.key_ids();
        let primary_key = key_ids
            .first()
            .filter(|k| !k.is_empty())
            .cloned()
            .ok_or(Error::FailedToGetKeyId)?;
        info!(
            "Creating DRM session for {} key system {} key id {}",
            media_type,
            helper.friendly_name(),
            primary_key
        );

        // A concurrent caller may rebind the slot between selection and
        // locking; retry selection a bounded number of times.
        for _ in 0..=self.slots.len() {
            let slot = self.cache.lock().allocate(&key_ids, is_primary)?.slot();
            let mut context = self.slots[slot].context.lock();
            if !self.verify_binding(slot, &key_ids)? {
                debug!("Slot {} was rebound before it could be locked", slot);
                continue;
            }

            let result = self.acquire_in_slot(&mut context, helper, slot, &primary_key, media_type);
            return match result {
                Ok(session) => Ok(SessionHandle { slot, session }),
                Err(e) => {
                    warn!("Unable to get ready DRM session at slot {}: {}", slot, e);
                    if !self.cache.lock().set_failed_for(slot, &key_ids) {
                        warn!("Slot {} was reassigned during acquisition, failure not recorded", slot);
                    }
                    Err(e)
                }
            };
        }
        Err(Error::NoCapacity {
            max: self.slots.len(),
        })
    }

    /// Whether the cache entry of `slot` still serves `key_ids`.
    fn verify_binding(&self, slot: SlotIndex, key_ids: &[KeyIdentity]) -> Result<bool> {
        let cache = self.cache.lock();
        match cache.entry(slot) {
            Some(entry) if entry.matches(key_ids) && entry.is_failed => {
                Err(Error::KeyPreviouslyFailed {
                    key_id: key_ids.first().map(ToString::to_string).unwrap_or_default(),
                    slot,
                })
            }
            Some(entry) => Ok(entry.matches(key_ids)),
            None => Ok(false),
        }
    }

    fn acquire_in_slot(
        &self,
        context: &mut SlotContext,
        helper: &dyn DrmHelper,
        slot: SlotIndex,
        primary_key: &KeyIdentity,
        media_type: MediaType,
    ) -> Result<Arc<dyn CdmSession>> {
        let session = match self.bind_slot(context, helper, slot, primary_key)? {
            SlotBinding::Ready(session) => return Ok(session),
            SlotBinding::Init(session) => session,
        };

        self.initialize_session(helper, session.as_ref())?;

        match self
            .protocol
            .acquire_license(helper, session.as_ref(), slot, media_type, false)?
        {
            SessionState::Ready => Ok(session),
            SessionState::Pending if helper.is_external_license() => {
                info!("Session at slot {} awaits out-of-band key delivery", slot);
                Ok(session)
            }
            state => {
                error!("Unexpected key state {} after license acquisition", state);
                Err(Error::InvalidKey)
            }
        }
    }

    /// Reuse the slot's live session when it serves the same key and DRM
    /// system, otherwise replace it with a fresh one.
    fn bind_slot(
        &self,
        context: &mut SlotContext,
        helper: &dyn DrmHelper,
        slot: SlotIndex,
        primary_key: &KeyIdentity,
    ) -> Result<SlotBinding> {
        if let Some(existing) = context.session.clone() {
            let same_key = context.key_id.as_ref() == Some(primary_key)
                || self
                    .cache
                    .lock()
                    .entry(slot)
                    .zip(context.key_id.as_ref())
                    .is_some_and(|(entry, key)| entry.matches(std::slice::from_ref(key)));

            if existing.key_system() != helper.system_id() {
                warn!(
                    "Changing DRM session at slot {} from {} to {}",
                    slot,
                    existing.key_system(),
                    helper.system_id()
                );
            } else if same_key {
                match existing.state() {
                    SessionState::Ready => {
                        info!("Found DRM session READY with key id {}, reusing", primary_key);
                        return Ok(SlotBinding::Ready(existing));
                    }
                    SessionState::Init => {
                        info!("Found DRM session in INIT state with key id {}, reusing", primary_key);
                        return Ok(SlotBinding::Init(existing));
                    }
                    SessionState::Pending => {
                        if existing.wait_for_state(SessionState::Ready, helper.key_process_timeout()) {
                            info!("Waited for DRM session READY with key id {}", primary_key);
                            return Ok(SlotBinding::Ready(existing));
                        }
                        warn!("Key was never ready for {}", existing.key_system());
                        return Err(Error::LicenceTimeout);
                    }
                    state => {
                        warn!("Existing DRM session at slot {} has error state {}", slot, state);
                        return Err(Error::KeyPreviouslyFailed {
                            key_id: primary_key.to_string(),
                            slot,
                        });
                    }
                }
            } else {
                warn!("Existing DRM session at slot {} has a different key", slot);
            }
            info!("Deleting existing DRM session at slot {}", slot);
            context.session = None;
            context.key_id = None;
        }

        let session = self.factory.create_session(helper).map_err(|e| {
            warn!("Unable to create DRM session for {}: {}", helper.system_id(), e);
            match e {
                Error::DrmInitFailed(_) => e,
                other => Error::DrmInitFailed(other.to_string()),
            }
        })?;
        info!("Created new DRM session for {}", helper.system_id());
        context.session = Some(Arc::clone(&session));
        context.key_id = Some(primary_key.clone());
        Ok(SlotBinding::Init(session))
    }

    fn initialize_session(&self, helper: &dyn DrmHelper, session: &dyn CdmSession) -> Result<()> {
        let init_data = helper.create_init_data();
        let custom_data = self.protocol.config().license_custom_data.as_deref();
        session.initialize(&init_data, custom_data);
        match session.state() {
            // Externally licensed systems may go straight to pending.
            SessionState::Init | SessionState::Pending => Ok(()),
            SessionState::ErrorEmptySessionId => {
                error!("DRM session id is empty");
                Err(Error::SessionIdEmpty)
            }
            state => {
                error!("DRM session was not initialized: key state {}", state);
                Err(Error::DataBindFailed)
            }
        }
    }

    /// Schedule a license renewal for `slot` on a background thread.
    ///
    /// A renewal already running for the slot is joined first. Failures are
    /// reported to the listener as warnings.
    pub fn renew_license(self: &Arc<Self>, helper: Arc<dyn DrmHelper>, slot: SlotIndex) -> Result<()> {
        let Some(session_slot) = self.slots.get(slot) else {
            error!("Failed to renew license, slot {} is not available", slot);
            return Err(Error::Other(format!("Invalid session slot {}", slot)));
        };

        let mut renewal = session_slot.renewal.lock();
        if let Some(previous) = renewal.take() {
            if previous.join().is_err() {
                error!("Previous license renewal thread for slot {} panicked", slot);
            }
        }

        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("drm-renewal-{}", slot))
            .spawn(move || manager.renew_in_slot(helper.as_ref(), slot))?;
        *renewal = Some(handle);
        info!("Scheduled license renewal for slot {}", slot);
        Ok(())
    }

    fn renew_in_slot(&self, helper: &dyn DrmHelper, slot: SlotIndex) {
        let context = self.slots[slot].context.lock();
        let Some(session) = context.session.clone() else {
            warn!("No DRM session to renew at slot {}", slot);
            self.listener
                .on_renewal_failed(slot, &Error::Other("no session in slot".to_string()));
            return;
        };

        match self
            .protocol
            .acquire_license(helper, session.as_ref(), slot, MediaType::License, true)
        {
            Ok(SessionState::Ready) => info!("License renewal done for slot {}", slot),
            Ok(state) => {
                error!("Unable to renew license: key state {}", state);
                self.listener
                    .on_renewal_failed(slot, &Error::Other(format!("key state {}", state)));
            }
            Err(e) => {
                error!("Unable to renew license at slot {}: {}", slot, e);
                self.listener.on_renewal_failed(slot, &e);
            }
        }
    }

    /// Join every renewal thread.
    pub fn join_renewals(&self) {
        for (slot, session_slot) in self.slots.iter().enumerate() {
            let handle = session_slot.renewal.lock().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("License renewal thread for slot {} panicked", slot);
                }
            }
        }
    }

    /// Whether `key_id` was processed, and if so whether it succeeded.
    pub fn is_key_id_processed(&self, key_id: &KeyIdentity) -> Option<bool> {
        self.cache.lock().is_key_id_processed(key_id)
    }

    /// Slot holding `session`, if any.
    ///
    /// Blocks while another thread works on a slot.
    pub fn slot_for_session(&self, session: &Arc<dyn CdmSession>) -> Option<SlotIndex> {
        let target = Arc::as_ptr(session) as *const ();
        let slot = self.slots.iter().position(|s| {
            s.context
                .lock()
                .session
                .as_ref()
                .is_some_and(|live| Arc::as_ptr(live) as *const () == target)
        });
        if slot.is_none() {
            warn!("DRM session not found");
        }
        slot
    }

    /// Drop the primary mark of the slot serving `key_id`.
    pub fn release_primary(&self, key_id: &KeyIdentity) -> Option<SlotIndex> {
        self.cache.lock().release_primary(key_id)
    }

    /// Forget failed key identities and release every primary mark.
    pub fn clear_failed_key_ids(&self) {
        let cleared = self.cache.lock().clear_failed();
        if !cleared.is_empty() {
            info!("Cleared failed key ids at slots {:?}", cleared);
        }
    }

    /// Drop sessions whose key failed, or every session when `force` is set.
    pub fn clear_drm_session(&self, force: bool) {
        for (slot, session_slot) in self.slots.iter().enumerate() {
            let failed = self
                .cache
                .lock()
                .entry(slot)
                .is_some_and(|entry| entry.is_failed);
            if failed || force {
                let mut context = session_slot.context.lock();
                if context.session.take().is_some() {
                    warn!("Clearing DRM session data at slot {}", slot);
                }
                context.key_id = None;
            }
        }
    }

    /// Drop every session and reset the key cache.
    pub fn clear_session_data(&self) {
        warn!("Clearing DRM session data");
        for (slot, session_slot) in self.slots.iter().enumerate() {
            *session_slot.context.lock() = SlotContext::default();
            self.cache.lock().reset(slot);
        }
    }

    pub fn clear_access_token(&self) {
        self.protocol.tokens().clear();
    }
}
