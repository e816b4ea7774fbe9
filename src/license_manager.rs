//! DRM license manager.
//!
//! Owns the session manager and the prefetcher and is the entry point
//! players use: queue protection records for background acquisition, create
//! a session synchronously on the playback-critical path, and tear
//! everything down.
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cdm::{CdmFactory, NoOutputProtection, OutputProtection};
use crate::config::DrmConfig;
use crate::error::Result;
use crate::event::DrmEventListener;
use crate::helper::DrmHelper;
use crate::prefetch::LicensePreFetcher;
use crate::protocol::LicenseProtocol;
use crate::session::{KeyIdentity, MediaType, SessionHandle, SlotIndex};
use crate::session_manager::{DrmSessionManager, SessionManagerState};
use crate::token::{AccessTokenProvider, HttpAccessTokenProvider, TokenCache};
use crate::transport::{create_transport, AbortSignal, LicenseTransport};

/// External collaborators of a [`DrmLicenseManager`].
pub struct Collaborators {
    pub factory: Arc<dyn CdmFactory>,
    pub transport: Arc<dyn LicenseTransport>,
    pub token_provider: Arc<dyn AccessTokenProvider>,
    pub output_protection: Arc<dyn OutputProtection>,
    pub listener: Arc<dyn DrmEventListener>,
}

pub struct DrmLicenseManager {
    manager: Arc<DrmSessionManager>,
    prefetcher: LicensePreFetcher,
}

impl DrmLicenseManager {
    /// Build a manager talking to license servers over HTTP as configured.
    pub fn new(
        config: DrmConfig,
        factory: Arc<dyn CdmFactory>,
        listener: Arc<dyn DrmEventListener>,
    ) -> Result<Self> {
        let transport = create_transport(&config)?;
        let token_provider = Arc::new(HttpAccessTokenProvider::new(&config)?);
        Self::with_collaborators(
            config,
            Collaborators {
                factory,
                transport,
                token_provider,
                output_protection: Arc::new(NoOutputProtection),
                listener,
            },
        )
    }

    pub fn with_collaborators(config: DrmConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        info!(
            "Initializing DRM license manager with {} session slots",
            config.max_sessions
        );
        let protocol = LicenseProtocol::new(
            config,
            collaborators.transport,
            TokenCache::new(collaborators.token_provider),
            collaborators.output_protection,
            Arc::new(AbortSignal::new()),
        );
        let manager = Arc::new(DrmSessionManager::new(
            protocol,
            collaborators.factory,
            Arc::clone(&collaborators.listener),
        ));
        let prefetcher = LicensePreFetcher::new(Arc::clone(&manager), collaborators.listener);
        Ok(Self {
            manager,
            prefetcher,
        })
    }

    pub fn session_manager(&self) -> &Arc<DrmSessionManager> {
        &self.manager
    }

    /// Queue a protection record for background license acquisition.
    pub fn queue_content_protection(
        &self,
        helper: Arc<dyn DrmHelper>,
        period_id: impl Into<String>,
        adaptation_index: u32,
        media_type: MediaType,
        is_vss: bool,
    ) -> bool {
        self.prefetcher
            .queue_content_protection(helper, period_id, adaptation_index, media_type, is_vss)
    }

    /// Get a ready session for playback.
    ///
    /// Sessions created here are primary and survive eviction until
    /// [`DrmLicenseManager::release_primary`] is called for their key.
    pub fn create_session(
        &self,
        helper: &dyn DrmHelper,
        media_type: MediaType,
    ) -> Result<SessionHandle> {
        self.manager.create_session(helper, media_type, true)
    }

    pub fn renew_license(&self, helper: Arc<dyn DrmHelper>, slot: SlotIndex) -> Result<()> {
        self.manager.renew_license(helper, slot)
    }

    pub fn release_primary(&self, key_id: &KeyIdentity) -> Option<SlotIndex> {
        self.manager.release_primary(key_id)
    }

    pub fn set_common_key_duration(&self, duration: Duration) {
        self.prefetcher.set_common_key_duration(duration);
    }

    pub fn set_send_error_on_failure(&self, send: bool) {
        self.prefetcher.set_send_error_on_failure(send);
    }

    pub fn is_key_id_processed(&self, key_id: &KeyIdentity) -> Option<bool> {
        self.manager.is_key_id_processed(key_id)
    }

    /// Abort in-flight license requests without tearing down.
    ///
    /// The abort stays raised: every later acquisition fails with
    /// [`Error::SelfAbort`](crate::Error::SelfAbort) until
    /// [`DrmLicenseManager::resume_license_requests`] or
    /// [`DrmLicenseManager::init`] is called.
    pub fn abort_license_requests(&self) {
        self.manager.set_license_request_abort(true);
    }

    /// Lower the abort raised by [`DrmLicenseManager::abort_license_requests`].
    ///
    /// Keys whose acquisition was aborted stay failed until
    /// [`DrmSessionManager::clear_failed_key_ids`] runs.
    pub fn resume_license_requests(&self) {
        self.manager.set_license_request_abort(false);
    }

    /// Make the manager usable again after [`DrmLicenseManager::term`].
    pub fn init(&self) {
        self.manager.set_license_request_abort(false);
        self.manager.set_state(SessionManagerState::Active);
        self.prefetcher.init();
    }

    /// Abort in-flight requests, drain the queues, join every worker and
    /// drop all sessions.
    pub fn term(&self) {
        info!("Terminating DRM license manager");
        self.manager.set_state(SessionManagerState::Inactive);
        self.manager.set_license_request_abort(true);
        self.prefetcher.term();
        self.manager.join_renewals();
        self.manager.clear_session_data();
        self.manager.clear_access_token();
    }
}

impl Drop for DrmLicenseManager {
    fn drop(&mut self) {
        self.term();
    }
}
