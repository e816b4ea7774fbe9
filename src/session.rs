//! Session data types shared by the key cache, the session manager and the
//! prefetch queues.
//!
//! A slot owns at most one live CDM session; callers receive a
//! [`SessionHandle`] that shares it.
use std::fmt;
use std::sync::Arc;

use crate::cdm::CdmSession;

/// Index of a session slot (0..max_sessions).
pub type SlotIndex = usize;

/// Number of media types that carry per-track acquisition status.
pub const TRACKED_MEDIA_TYPES: usize = 4;

/// License state of a CDM session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Session created, no license requested yet.
    Init,
    /// License challenge generated or license exchange in flight.
    Pending,
    /// License installed, keys usable for decryption.
    Ready,
    /// Terminal failure.
    Error,
    /// Terminal failure: the CDM created a session without a session id.
    ErrorEmptySessionId,
}

impl SessionState {
    /// Whether the state is one of the terminal error states.
    pub fn is_error(self) -> bool {
        matches!(self, SessionState::Error | SessionState::ErrorEmptySessionId)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::Pending => "PENDING",
            SessionState::Ready => "READY",
            SessionState::Error => "ERROR",
            SessionState::ErrorEmptySessionId => "ERROR_EMPTY_SESSION_ID",
        };
        f.write_str(name)
    }
}

/// Opaque key identity advertised by a content-protection record.
///
/// Equality is byte-wise. Displayed as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KeyIdentity(Vec<u8>);

impl KeyIdentity {
    /// Wrap raw key id bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for KeyIdentity {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for KeyIdentity {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyIdentity({})", hex::encode(&self.0))
    }
}

/// Media type of the track a protection record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
    AuxAudio,
    Iframe,
    /// License traffic that belongs to no track (renewals).
    License,
}

impl MediaType {
    /// Slot in the per-track status table, or `None` for untracked types.
    pub fn track_index(self) -> Option<usize> {
        match self {
            MediaType::Video => Some(0),
            MediaType::Audio => Some(1),
            MediaType::Subtitle => Some(2),
            MediaType::AuxAudio => Some(3),
            MediaType::Iframe | MediaType::License => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaType::Video => "VIDEO",
            MediaType::Audio => "AUDIO",
            MediaType::Subtitle => "SUBTITLE",
            MediaType::AuxAudio => "AUX_AUDIO",
            MediaType::Iframe => "IFRAME",
            MediaType::License => "LICENSE",
        };
        f.write_str(name)
    }
}

/// A ready (or externally licensed, pending) session bound to a slot.
#[derive(Clone)]
pub struct SessionHandle {
    /// Slot the session lives in.
    pub slot: SlotIndex,
    /// Shared reference to the slot's CDM session.
    pub session: Arc<dyn CdmSession>,
}

impl SessionHandle {
    /// Current license state of the session.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("slot", &self.slot)
            .field("state", &self.session.state())
            .finish()
    }
}
