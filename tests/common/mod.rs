#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::rc::Rc;

use uuid::Uuid;

use rsmediadrm::cdm::{
    CdmEngine, EngineError, EngineEvent, EngineResult, KeyRequest, KeyScope, KeySetId,
    NativeHandle, OptionalParameters, ProvisionRequest, RequestType, WIDEVINE_UUID,
};
use rsmediadrm::key::{KeyStatus, KeyStatusCode};
use rsmediadrm::store::{LicenseRecord, MemoryStore, PersistentStore, StoreError, StoreResult};
use rsmediadrm::{ClientEvent, KeyType, ManagerConfig, PromiseId, SessionManager, SessionToken};

pub const PROVISION_URL: &str = "https://provisioning.example/certificate";
pub const GOOD_PROVISION_RESPONSE: &[u8] = b"good";

/// Observable state of [`FakeCdm`], shared with the test.
#[derive(Debug, Default)]
pub struct FakeState {
    pub provisioned: bool,
    pub reports_key_status: bool,
    pub next_handle: u32,
    pub next_key_set: u32,
    pub open: HashSet<Vec<u8>>,
    pub closed: Vec<Vec<u8>>,
    pub key_sets: HashSet<Vec<u8>>,
    pub properties: BTreeMap<String, String>,
    pub byte_properties: BTreeMap<String, Vec<u8>>,
    pub events: VecDeque<EngineEvent>,
    pub crypto_contexts: u32,
    pub provision_requests: u32,
    pub released: bool,
    /// Fail every `open_session` with this error.
    pub open_error: Option<EngineError>,
    /// Fail every `get_key_request` with this error.
    pub key_request_error: Option<EngineError>,
}

/// Scripted engine.
///
/// - Responses equal to `b"deny"` are refused by the server.
/// - Offline responses yield keyset ids `ks-1`, `ks-2`, ...
/// - Restoring an unknown keyset fails with an invalid-state error; a known
///   one raises a key status change.
/// - Only [`GOOD_PROVISION_RESPONSE`] provisions the device.
#[derive(Clone)]
pub struct FakeCdm {
    pub state: Rc<RefCell<FakeState>>,
}

impl FakeCdm {
    pub fn provisioned() -> Self {
        Self::with_state(true)
    }

    pub fn unprovisioned() -> Self {
        Self::with_state(false)
    }

    fn with_state(provisioned: bool) -> Self {
        let state = FakeState {
            provisioned,
            reports_key_status: true,
            ..Default::default()
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn without_key_status(self) -> Self {
        self.state.borrow_mut().reports_key_status = false;
        self
    }

    pub fn push_event(&self, event: EngineEvent) {
        self.state.borrow_mut().events.push_back(event);
    }
}

impl CdmEngine for FakeCdm {
    fn is_crypto_scheme_supported(&self, scheme: Uuid, _container_mime_type: &str) -> bool {
        scheme == WIDEVINE_UUID
    }

    fn open_session(&mut self) -> EngineResult<NativeHandle> {
        let mut state = self.state.borrow_mut();
        if let Some(e) = state.open_error.clone() {
            return Err(e);
        }
        if !state.provisioned {
            return Err(EngineError::NotProvisioned);
        }
        state.next_handle += 1;
        let handle = format!("h{}", state.next_handle).into_bytes();
        state.open.insert(handle.clone());
        Ok(NativeHandle::new(handle))
    }

    fn close_session(&mut self, handle: NativeHandle) -> EngineResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.open.remove(handle.as_bytes()) {
            return Err(EngineError::InvalidState("session not open".into()));
        }
        state.closed.push(handle.as_bytes().to_vec());
        Ok(())
    }

    fn remove_keys(&mut self, _handle: &NativeHandle) -> EngineResult<()> {
        Ok(())
    }

    fn get_key_request(
        &mut self,
        scope: KeyScope<'_>,
        init_data: &[u8],
        _mime_type: &str,
        key_type: KeyType,
        _optional_parameters: &OptionalParameters,
    ) -> EngineResult<KeyRequest> {
        let state = self.state.borrow();
        if let Some(e) = state.key_request_error.clone() {
            return Err(e);
        }
        if !state.provisioned {
            return Err(EngineError::NotProvisioned);
        }
        match (scope, key_type) {
            (KeyScope::KeySet(ks), KeyType::Release) => {
                if !state.key_sets.contains(ks.as_bytes()) {
                    return Err(EngineError::InvalidState("unknown keyset".into()));
                }
                let mut data = b"release:".to_vec();
                data.extend_from_slice(ks.as_bytes());
                Ok(KeyRequest {
                    data,
                    default_url: String::new(),
                    request_type: Some(RequestType::Release),
                })
            }
            (KeyScope::Session(_), KeyType::Streaming | KeyType::Offline) => {
                let mut data = b"request:".to_vec();
                data.extend_from_slice(init_data);
                Ok(KeyRequest {
                    data,
                    default_url: String::new(),
                    request_type: None,
                })
            }
            _ => Err(EngineError::InvalidState("scope mismatch".into())),
        }
    }

    fn provide_key_response(
        &mut self,
        scope: KeyScope<'_>,
        response: &[u8],
    ) -> EngineResult<Option<KeySetId>> {
        let mut state = self.state.borrow_mut();
        if response == b"deny" {
            return Err(EngineError::DeniedByServer("license refused".into()));
        }
        if response == b"crash" {
            return Err(EngineError::Internal("engine crashed".into()));
        }
        match scope {
            KeyScope::KeySet(ks) => {
                state.key_sets.remove(ks.as_bytes());
                Ok(None)
            }
            KeyScope::Session(handle) => {
                if response.starts_with(b"offline") {
                    state.next_key_set += 1;
                    let ks = format!("ks-{}", state.next_key_set).into_bytes();
                    state.key_sets.insert(ks.clone());
                    Ok(Some(KeySetId::new(ks)))
                } else {
                    if state.reports_key_status {
                        state.events.push_back(EngineEvent::KeyStatusChange {
                            session: handle.as_bytes().to_vec(),
                            keys: vec![KeyStatus::new(b"kid-1".to_vec(), KeyStatusCode::Usable)],
                            has_new_usable_key: true,
                        });
                    }
                    Ok(None)
                }
            }
        }
    }

    fn restore_keys(&mut self, handle: &NativeHandle, key_set_id: &KeySetId) -> EngineResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.key_sets.contains(key_set_id.as_bytes()) {
            return Err(EngineError::InvalidState("keyset unknown to engine".into()));
        }
        if state.reports_key_status {
            state.events.push_back(EngineEvent::KeyStatusChange {
                session: handle.as_bytes().to_vec(),
                keys: vec![KeyStatus::new(b"kid-1".to_vec(), KeyStatusCode::Usable)],
                has_new_usable_key: true,
            });
        }
        state.events.push_back(EngineEvent::ExpirationUpdate {
            session: handle.as_bytes().to_vec(),
            expiration_ms: 1_700_000_000_000,
        });
        Ok(())
    }

    fn get_provision_request(&mut self) -> EngineResult<ProvisionRequest> {
        let mut state = self.state.borrow_mut();
        state.provision_requests += 1;
        Ok(ProvisionRequest {
            default_url: PROVISION_URL.to_string(),
            data: format!("provision-{}", state.provision_requests).into_bytes(),
        })
    }

    fn provide_provision_response(&mut self, response: &[u8]) -> EngineResult<()> {
        if response != GOOD_PROVISION_RESPONSE {
            return Err(EngineError::InvalidResponse("bad certificate".into()));
        }
        self.state.borrow_mut().provisioned = true;
        Ok(())
    }

    fn create_crypto_context(&mut self, _scheme: Uuid, _handle: &NativeHandle) -> EngineResult<()> {
        self.state.borrow_mut().crypto_contexts += 1;
        Ok(())
    }

    fn property_string(&self, name: &str) -> EngineResult<String> {
        self.state
            .borrow()
            .properties
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Unsupported(name.to_string()))
    }

    fn set_property_string(&mut self, name: &str, value: &str) -> EngineResult<()> {
        self.state
            .borrow_mut()
            .properties
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn set_property_bytes(&mut self, name: &str, value: &[u8]) -> EngineResult<()> {
        self.state
            .borrow_mut()
            .byte_properties
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn reports_key_status(&self) -> bool {
        self.state.borrow().reports_key_status
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.state.borrow_mut().events.pop_front()
    }

    fn release(&mut self) {
        self.state.borrow_mut().released = true;
    }
}

/// Store whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_writes: bool,
}

impl FlakyStore {
    fn check(&self) -> StoreResult<()> {
        if self.fail_writes {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        Ok(())
    }
}

impl PersistentStore for FlakyStore {
    fn save_keyset(
        &mut self,
        origin: &str,
        token: SessionToken,
        record: &LicenseRecord,
    ) -> StoreResult<()> {
        self.check()?;
        self.inner.save_keyset(origin, token, record)
    }

    fn load_keyset(&self, origin: &str, token: SessionToken) -> StoreResult<Option<LicenseRecord>> {
        self.inner.load_keyset(origin, token)
    }

    fn clear_keyset(&mut self, origin: &str, token: SessionToken) -> StoreResult<()> {
        self.check()?;
        self.inner.clear_keyset(origin, token)
    }

    fn mark_origin_provisioned(&mut self, origin: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.mark_origin_provisioned(origin)
    }

    fn is_origin_provisioned(&self, origin: &str) -> StoreResult<bool> {
        self.inner.is_origin_provisioned(origin)
    }
}

pub type Manager<S = MemoryStore> = SessionManager<FakeCdm, S, Vec<ClientEvent>>;

pub const ORIGIN: &str = "https://media.example";

/// Config whose origin is not provisioned proactively, so the device's own
/// state decides whether provisioning runs.
pub fn config() -> ManagerConfig {
    ManagerConfig::new(WIDEVINE_UUID)
        .with_origin(ORIGIN)
        .with_provision_unprovisioned_origins(false)
}

pub fn open_manager(engine: &FakeCdm) -> Manager {
    open_with_store(engine, MemoryStore::new())
}

pub fn open_with_store<S: PersistentStore>(engine: &FakeCdm, store: S) -> Manager<S> {
    let mut manager =
        SessionManager::open(engine.clone(), store, Vec::new(), config()).expect("open manager");
    manager.client_mut().clear();
    manager
}

pub fn take_events<S: PersistentStore>(manager: &mut Manager<S>) -> Vec<ClientEvent> {
    std::mem::take(manager.client_mut())
}

/// Create a session and return its token, asserting the happy path.
pub fn create<S: PersistentStore>(
    manager: &mut Manager<S>,
    promise: u64,
    key_type: KeyType,
) -> SessionToken {
    manager.create_session(
        PromiseId(promise),
        b"abc",
        "video/mp4",
        key_type,
        OptionalParameters::new(),
    );
    let events = take_events(manager);
    match events.first() {
        Some(ClientEvent::PromiseResolvedWithSession { promise_id, token })
            if *promise_id == PromiseId(promise) =>
        {
            *token
        }
        other => panic!("create {} did not resolve: {:?}", promise, other),
    }
}

pub fn resolved_token(events: &[ClientEvent], promise: u64) -> Option<SessionToken> {
    events.iter().find_map(|event| match event {
        ClientEvent::PromiseResolvedWithSession { promise_id, token }
            if *promise_id == PromiseId(promise) =>
        {
            Some(*token)
        }
        _ => None,
    })
}

pub fn rejection_code(events: &[ClientEvent], promise: u64) -> Option<rsmediadrm::ErrorCode> {
    events.iter().find_map(|event| match event {
        ClientEvent::PromiseRejected {
            promise_id,
            rejection,
        } if *promise_id == PromiseId(promise) => Some(rejection.code),
        _ => None,
    })
}

pub fn is_resolved(events: &[ClientEvent], promise: u64) -> bool {
    events.iter().any(|event| {
        matches!(
            event,
            ClientEvent::PromiseResolved { promise_id } if *promise_id == PromiseId(promise)
        )
    })
}
