//! In-memory collaborators for unit tests.
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cdm::{CdmFactory, CdmSession, Challenge};
use crate::error::{Error, Result};
use crate::event::{DrmEventListener, DrmFailureEvent};
use crate::helper::{DrmHelper, LicenseRequest, SystemId};
use crate::session::{MediaType, SessionState, SlotIndex};
use crate::token::AccessTokenProvider;
use crate::transport::{AbortSignal, LicenseTransport, TransportFailure, TransportResponse};

pub(crate) fn ok_response(body: &[u8]) -> TransportResponse {
    TransportResponse::Completed {
        status: 200,
        extended_status: None,
        body: body.to_vec(),
    }
}

pub(crate) fn status_response(status: i32) -> TransportResponse {
    TransportResponse::Completed {
        status,
        extended_status: None,
        body: Vec::new(),
    }
}

/// How a [`MockCdmSession`] reacts to calls.
#[derive(Debug, Clone)]
pub(crate) struct CdmBehavior {
    /// Challenge returned by `generate_challenge`; `None` leaves the state alone.
    pub challenge: Option<Vec<u8>>,
    /// State and CDM error code after `install_key`.
    pub install_result: (SessionState, i32),
    /// State after `initialize`.
    pub init_result: SessionState,
}

impl Default for CdmBehavior {
    fn default() -> Self {
        Self {
            challenge: Some(b"challenge".to_vec()),
            install_result: (SessionState::Ready, 0),
            init_result: SessionState::Init,
        }
    }
}

pub(crate) struct MockCdmSession {
    system: SystemId,
    behavior: CdmBehavior,
    state: Mutex<SessionState>,
    changed: Condvar,
    installed: Mutex<Vec<Vec<u8>>>,
}

impl MockCdmSession {
    pub fn new(system: SystemId, behavior: CdmBehavior) -> Self {
        Self {
            system,
            behavior,
            state: Mutex::new(SessionState::Init),
            changed: Condvar::new(),
            installed: Mutex::new(Vec::new()),
        }
    }

    pub fn installed(&self) -> Vec<Vec<u8>> {
        self.installed.lock().clone()
    }

    /// Simulate out-of-band key delivery.
    pub fn deliver_keys(&self) {
        self.set_state(SessionState::Ready);
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }
}

impl CdmSession for MockCdmSession {
    fn key_system(&self) -> SystemId {
        self.system
    }

    fn initialize(&self, _init_data: &[u8], _custom_data: Option<&str>) {
        self.set_state(self.behavior.init_result);
    }

    fn generate_challenge(&self, _timeout: Duration) -> Option<Challenge> {
        let data = self.behavior.challenge.clone()?;
        self.set_state(SessionState::Pending);
        Some(Challenge {
            data,
            destination_url: "https://license.test/default".to_string(),
        })
    }

    fn install_key(&self, license: &[u8], _timeout: Duration) -> i32 {
        self.installed.lock().push(license.to_vec());
        let (state, code) = self.behavior.install_result;
        self.set_state(state);
        code
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.state.lock();
        while *current != state {
            if self.changed.wait_until(&mut current, deadline).timed_out() {
                return *current == state;
            }
        }
        true
    }
}

/// Creates [`MockCdmSession`]s and keeps them for inspection.
pub(crate) struct MockCdmFactory {
    behavior: CdmBehavior,
    fail: AtomicBool,
    sessions: Mutex<Vec<Arc<MockCdmSession>>>,
}

impl MockCdmFactory {
    pub fn new(behavior: CdmBehavior) -> Self {
        Self {
            behavior,
            fail: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_creation(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn sessions(&self) -> Vec<Arc<MockCdmSession>> {
        self.sessions.lock().clone()
    }
}

impl CdmFactory for MockCdmFactory {
    fn create_session(&self, helper: &dyn DrmHelper) -> Result<Arc<dyn CdmSession>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::DrmInitFailed("mock factory failure".to_string()));
        }
        let session = Arc::new(MockCdmSession::new(helper.system_id(), self.behavior.clone()));
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Transport that replays scripted responses and records requests.
pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<TransportResponse>>,
    repeat: Option<TransportResponse>,
    requests: Mutex<Vec<LicenseRequest>>,
    calls: AtomicUsize,
    delay: Mutex<Duration>,
}

impl ScriptedTransport {
    /// Replay `responses` in order, then fail.
    pub fn new(responses: Vec<TransportResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Answer every request with `response`.
    pub fn repeating(response: TransportResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(Vec::new())
        }
    }

    /// Hold each request for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<LicenseRequest> {
        self.requests.lock().clone()
    }
}

impl LicenseTransport for ScriptedTransport {
    fn send(&self, request: &LicenseRequest, abort: &AbortSignal) -> TransportResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let delay = *self.delay.lock();
        if !delay.is_zero() && !abort.sleep(delay) {
            return TransportResponse::Failed(TransportFailure::Aborted);
        }
        let scripted = self.responses.lock().pop_front();
        scripted
            .or_else(|| self.repeat.clone())
            .unwrap_or_else(|| TransportResponse::Failed(TransportFailure::Other("script exhausted".to_string())))
    }
}

/// Token provider that hands out `<prefix>-1`, `<prefix>-2`, ...
pub(crate) struct CountingTokenProvider {
    prefix: String,
    failure: Option<i32>,
    calls: AtomicUsize,
}

impl CountingTokenProvider {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Provider whose every fetch fails with `code`.
    pub fn failing(code: i32) -> Self {
        Self {
            failure: Some(code),
            ..Self::new("")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AccessTokenProvider for CountingTokenProvider {
    fn fetch(&self) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.failure {
            Some(code) => Err(Error::AccessTokenUnavailable { code }),
            None => Ok(format!("{}-{}", self.prefix, n)),
        }
    }
}

/// Listener that records every notification.
#[derive(Default)]
pub(crate) struct RecordingListener {
    ready: Mutex<Vec<(MediaType, SlotIndex)>>,
    failures: Mutex<Vec<DrmFailureEvent>>,
    suppressed: Mutex<Vec<DrmFailureEvent>>,
    renewal_failures: Mutex<Vec<SlotIndex>>,
}

impl RecordingListener {
    pub fn ready(&self) -> Vec<(MediaType, SlotIndex)> {
        self.ready.lock().clone()
    }

    pub fn failures(&self) -> Vec<DrmFailureEvent> {
        self.failures.lock().clone()
    }

    pub fn suppressed(&self) -> Vec<DrmFailureEvent> {
        self.suppressed.lock().clone()
    }

    pub fn renewal_failures(&self) -> Vec<SlotIndex> {
        self.renewal_failures.lock().clone()
    }
}

impl DrmEventListener for RecordingListener {
    fn on_session_ready(&self, media_type: MediaType, slot: SlotIndex) {
        self.ready.lock().push((media_type, slot));
    }

    fn on_drm_failure(&self, event: &DrmFailureEvent) {
        self.failures.lock().push(event.clone());
    }

    fn on_failure_suppressed(&self, event: &DrmFailureEvent) {
        self.suppressed.lock().push(event.clone());
    }

    fn on_renewal_failed(&self, slot: SlotIndex, _err: &Error) {
        self.renewal_failures.lock().push(slot);
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub(crate) fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// One-shot HTTP server on a loopback port.
pub(crate) struct HttpStub {
    pub url: String,
    handle: Option<JoinHandle<String>>,
}

impl HttpStub {
    /// Answer the first request with `status` and a JSON `body`.
    pub fn respond(status: u16, body: &str) -> Self {
        Self::spawn(Some((status, body.to_string())), Duration::ZERO)
    }

    /// Accept the first request and hold it unanswered for `hold`.
    pub fn stall(hold: Duration) -> Self {
        Self::spawn(None, hold)
    }

    fn spawn(reply: Option<(u16, String)>, hold: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub");
        let url = format!("http://{}", listener.local_addr().expect("stub address"));
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_http_request(&mut stream);
            match reply {
                Some((status, body)) => {
                    let response = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    stream.write_all(response.as_bytes()).expect("write response");
                }
                None => thread::sleep(hold),
            }
            request
        });
        Self {
            url,
            handle: Some(handle),
        }
    }

    /// The raw request the stub received.
    pub fn request(mut self) -> String {
        self.handle
            .take()
            .expect("stub handle")
            .join()
            .expect("join stub")
    }
}

/// URL of a loopback port nothing listens on.
pub(crate) fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("address");
    drop(listener);
    format!("http://{}/license", address)
}

fn read_http_request(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).expect("read request");
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}
