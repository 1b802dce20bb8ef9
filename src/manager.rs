//! Session manager façade.
//!
//! [`SessionManager`] owns the engine for its whole lifetime and implements
//! the promise-style session operations on top of it. Each operation takes a
//! caller-chosen [`PromiseId`] and settles it exactly once through the
//! [`Client`], either synchronously or (for creates deferred behind
//! provisioning) after [`SessionManager::process_provision_response`].
//!
//! Engines report "not provisioned" as an ordinary result. Creates that hit it
//! are parked in the pending queue and replayed in order once provisioning
//! completes. Every other operation starts provisioning but is not retried.

use uuid::Uuid;

use crate::cdm::{
    CdmEngine, EngineError, EngineEvent, EngineResult, KeyScope, NativeHandle,
    OptionalParameters, RequestType, PROPERTY_ENABLE, PROPERTY_ORIGIN, PROPERTY_PRIVACY_MODE,
    PROPERTY_SECURITY_LEVEL, PROPERTY_SERVER_CERTIFICATE, PROPERTY_SESSION_SHARING,
};
use crate::client::{Client, ClientEvent, PromiseId};
use crate::config::ManagerConfig;
use crate::deferrer::EventDeferrer;
use crate::error::{Error, ErrorCode, Rejection, Result};
use crate::key::{KeyStatus, KeyStatusCode};
use crate::pending::{PendingCreateSessionData, PendingOperationQueue};
use crate::provisioning::{ProvisioningCoordinator, ProvisioningState, StartOutcome};
use crate::registry::SessionRegistry;
use crate::session::{KeyType, SessionId, SessionInfo, SessionToken};
use crate::store::{LicenseRecord, PersistentStore, StoreError};

/// Where a create that has to wait for provisioning goes in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requeue {
    /// A new call, behind everything already waiting.
    Back,
    /// A call taken off the queue while draining, back in its old place.
    Front,
}

/// Whether `engine` supports `scheme` for the given container mime type
/// (empty means any).
pub fn is_crypto_scheme_supported<E: CdmEngine>(
    engine: &E,
    scheme: Uuid,
    container_mime_type: &str,
) -> bool {
    engine.is_crypto_scheme_supported(scheme, container_mime_type)
}

/// Promise-style license session manager over one CDM engine.
pub struct SessionManager<E: CdmEngine, S: PersistentStore, C: Client> {
    /// `None` once released.
    engine: Option<E>,
    store: S,
    client: C,
    config: ManagerConfig,
    /// Internal session backing the crypto context. Never in the registry.
    crypto_session: Option<NativeHandle>,
    crypto_context_reported: bool,
    registry: SessionRegistry,
    pending: PendingOperationQueue,
    provisioning: ProvisioningCoordinator,
    deferrer: Option<EventDeferrer<ClientEvent>>,
    origin_set: bool,
    reset_credentials_pending: bool,
}

impl<E: CdmEngine, S: PersistentStore, C: Client> SessionManager<E, S, C> {
    /// Take ownership of `engine` and prepare it for `config`.
    ///
    /// A device that is not provisioned yet does not fail the open: a
    /// provisioning request is emitted and the crypto context is created once
    /// it completes.
    pub fn open(mut engine: E, store: S, client: C, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        if !is_crypto_scheme_supported(&engine, config.scheme, "") {
            log!(error, "Unsupported crypto scheme {}", config.scheme);
            return Err(Error::UnsupportedScheme(config.scheme));
        }

        if config.is_widevine() {
            engine.set_property_string(PROPERTY_PRIVACY_MODE, PROPERTY_ENABLE)?;
            engine.set_property_string(PROPERTY_SESSION_SHARING, PROPERTY_ENABLE)?;
        }

        if let Some(level) = &config.security_level {
            let current = engine.property_string(PROPERTY_SECURITY_LEVEL).ok();
            if current.as_deref() == Some(level.as_str()) {
                log!(debug, "Security level already {}", level);
            } else {
                log!(info, "Setting security level to {}", level);
                engine.set_property_string(PROPERTY_SECURITY_LEVEL, level.as_str())?;
            }
        }

        let origin_set = if config.has_origin() {
            engine.set_property_string(PROPERTY_ORIGIN, &config.origin)?;
            true
        } else {
            false
        };

        let mut manager = Self {
            engine: Some(engine),
            store,
            client,
            config,
            crypto_session: None,
            crypto_context_reported: false,
            registry: SessionRegistry::new(),
            pending: PendingOperationQueue::new(),
            provisioning: ProvisioningCoordinator::new(),
            deferrer: None,
            origin_set,
            reset_credentials_pending: false,
        };

        if let Some(certificate) = manager.config.server_certificate.clone() {
            manager.set_server_certificate(&certificate)?;
        }

        if manager.origin_needs_provisioning() {
            log!(info, "Origin '{}' was never provisioned", manager.config.origin);
            manager.start_provisioning()?;
        } else {
            manager.create_crypto_context()?;
        }

        log!(
            info,
            "Opened session manager for scheme {} (origin '{}')",
            manager.config.scheme,
            manager.config.origin
        );
        Ok(manager)
    }

    fn origin_needs_provisioning(&self) -> bool {
        if !self.origin_set || !self.config.provision_unprovisioned_origins {
            return false;
        }
        match self.store.is_origin_provisioned(&self.config.origin) {
            Ok(provisioned) => !provisioned,
            Err(e) => {
                log!(warn, "Could not read provisioning flag: {}", e);
                false
            }
        }
    }

    /// Whether the manager has been torn down.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.engine.is_none()
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Direct store access for maintenance. Records of live sessions must not
    /// be touched.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[must_use]
    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// Live sessions, keyed by token.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Creates waiting for provisioning to finish.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn provisioning_state(&self) -> ProvisioningState {
        self.provisioning.state()
    }

    /// Whether the crypto context has been created.
    #[must_use]
    pub fn has_crypto_context(&self) -> bool {
        self.crypto_session.is_some()
    }

    /// Whether the store records the configured origin as provisioned.
    pub fn is_origin_provisioned(&self) -> Result<bool> {
        Ok(self.store.is_origin_provisioned(&self.config.origin)?)
    }

    /// Install a service certificate. Only Widevine engines use one; other
    /// schemes accept and ignore it.
    pub fn set_server_certificate(&mut self, certificate: &[u8]) -> Result<()> {
        if !self.config.is_widevine() {
            log!(debug, "Ignoring server certificate for non-Widevine scheme");
            return Ok(());
        }
        let engine = self.engine.as_mut().ok_or(Error::Released)?;
        engine.set_property_bytes(PROPERTY_SERVER_CERTIFICATE, certificate)?;
        log!(debug, "Server certificate set ({} bytes)", certificate.len());
        Ok(())
    }

    /// Current engine security level. `None` for non-Widevine schemes or when
    /// the engine cannot tell.
    #[must_use]
    pub fn security_level(&self) -> Option<String> {
        if !self.config.is_widevine() {
            return None;
        }
        match self.engine.as_ref()?.property_string(PROPERTY_SECURITY_LEVEL) {
            Ok(level) => Some(level),
            Err(e) => {
                log!(error, "Failed to read security level: {}", e);
                None
            }
        }
    }

    /// Open a session and generate its first license request. The promise
    /// resolves with the new token before the request message is sent.
    pub fn create_session(
        &mut self,
        promise_id: PromiseId,
        init_data: &[u8],
        mime_type: &str,
        key_type: KeyType,
        optional_parameters: OptionalParameters,
    ) {
        log!(
            debug,
            "create_session {} ({}, {}, {} bytes)",
            promise_id,
            mime_type,
            key_type,
            init_data.len()
        );
        let data = PendingCreateSessionData {
            init_data: init_data.to_vec(),
            mime_type: mime_type.to_string(),
            key_type,
            optional_parameters,
            promise_id,
        };
        self.create_session_internal(data, Requeue::Back);
    }

    fn create_session_internal(&mut self, data: PendingCreateSessionData, requeue: Requeue) {
        let promise_id = data.promise_id;
        if self.is_released() {
            self.reject(promise_id, ErrorCode::InvalidState, "Manager has been released");
            return;
        }
        if data.key_type == KeyType::Release {
            self.reject(
                promise_id,
                ErrorCode::NotSupported,
                "Release sessions cannot be created directly",
            );
            return;
        }
        if self.provisioning.is_active() {
            log!(debug, "Provisioning in progress, deferring {}", promise_id);
            self.park(data, requeue);
            return;
        }

        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let handle = match engine.open_session() {
            Ok(handle) => handle,
            Err(EngineError::NotProvisioned) => {
                log!(info, "Device not provisioned, deferring {}", promise_id);
                self.park(data, requeue);
                self.start_provisioning_or_fail();
                return;
            }
            Err(e) => {
                self.reject_engine_error(promise_id, "Open session failed", e);
                return;
            }
        };

        let request = engine.get_key_request(
            KeyScope::Session(&handle),
            &data.init_data,
            &data.mime_type,
            data.key_type,
            &data.optional_parameters,
        );
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                self.close_native(handle);
                if e == EngineError::NotProvisioned {
                    log!(info, "Device not provisioned, deferring {}", promise_id);
                    self.park(data, requeue);
                    self.start_provisioning_or_fail();
                } else {
                    self.reject_engine_error(promise_id, "Generate request failed", e);
                }
                return;
            }
        };

        let token = self.registry.fresh_token();
        log!(
            debug,
            "Session {} opened with native handle {:?}",
            token,
            handle
        );
        let id = SessionId::open(token, handle);
        if let Err(e) = self
            .registry
            .insert(id, SessionInfo::new(data.mime_type, data.key_type))
        {
            self.reject(promise_id, ErrorCode::Fatal, e.to_string());
            self.fail(format!("Session registry rejected new session: {}", e));
            return;
        }

        self.client.notify(ClientEvent::PromiseResolvedWithSession { promise_id, token });
        let request_type = request.request_type();
        self.client.notify(ClientEvent::Message {
            token,
            request_type,
            message: request.data,
        });
        self.pump_engine_events();
    }

    fn park(&mut self, data: PendingCreateSessionData, requeue: Requeue) {
        match requeue {
            Requeue::Back => self.pending.enqueue(data),
            Requeue::Front => self.pending.requeue_front(data),
        }
    }

    /// Install a license server response into the session of `token`.
    pub fn update_session(&mut self, promise_id: PromiseId, token: SessionToken, response: &[u8]) {
        log!(debug, "update_session {} for {} ({} bytes)", promise_id, token, response.len());
        if self.is_released() {
            self.reject(promise_id, ErrorCode::InvalidState, "Manager has been released");
            return;
        }
        let Some(entry) = self.registry.get(token) else {
            self.reject_not_found(promise_id, token);
            return;
        };
        let key_type = entry.info.key_type;
        let mime_type = entry.info.mime_type.clone();

        let result = self.with_scope(token, |engine, scope| {
            engine.provide_key_response(scope, response)
        });
        let key_set_id = match result {
            Some(Ok(key_set_id)) => key_set_id,
            Some(Err(EngineError::NotProvisioned)) => {
                self.reject(promise_id, ErrorCode::InvalidState, "Device not provisioned");
                self.start_provisioning_or_fail();
                return;
            }
            Some(Err(e)) => {
                self.reject_engine_error(promise_id, "Update session failed", e);
                return;
            }
            None => {
                self.reject(
                    promise_id,
                    ErrorCode::InvalidState,
                    format!("Session {} has nothing to update", token),
                );
                return;
            }
        };

        match key_type {
            KeyType::Release => {
                if let Err(e) = self.store.clear_keyset(&self.config.origin, token) {
                    self.reject_storage(promise_id, "Failed to clear persistent license", &e);
                    return;
                }
                if let Err(e) = self.registry.clear_key_set_id(token) {
                    log!(warn, "Session vanished during release: {}", e);
                }
                log!(info, "Released persistent license for {}", token);
                self.resolve(promise_id);
                self.pump_engine_events();
                self.finish_release(token);
            }
            KeyType::Offline => {
                match key_set_id.filter(|k| !k.is_empty()) {
                    Some(key_set_id) => {
                        let record = LicenseRecord::new(key_set_id.clone(), mime_type);
                        if let Err(e) = self.store.save_keyset(&self.config.origin, token, &record) {
                            self.reject_storage(promise_id, "Failed to persist license", &e);
                            return;
                        }
                        if let Err(e) = self.registry.set_key_set_id(token, key_set_id) {
                            log!(warn, "Session vanished during update: {}", e);
                        }
                        log!(info, "Persisted license for {}", token);
                    }
                    None => {
                        log!(debug, "Offline update for {} returned no keyset id", token);
                    }
                }
                self.resolve(promise_id);
                self.after_keys_installed(token);
            }
            KeyType::Streaming => {
                self.resolve(promise_id);
                self.after_keys_installed(token);
            }
        }
    }

    /// Restore a persisted offline license. Resolves with the nil token when
    /// there is nothing to load.
    pub fn load_session(&mut self, promise_id: PromiseId, token: SessionToken) {
        log!(debug, "load_session {} for {}", promise_id, token);
        if self.is_released() {
            self.reject(promise_id, ErrorCode::InvalidState, "Manager has been released");
            return;
        }
        if self.provisioning.is_active() {
            log!(debug, "Provisioning in progress, no license for {}", token);
            self.resolve_with_no_license(promise_id);
            return;
        }
        if self.registry.contains(token) {
            self.reject(
                promise_id,
                ErrorCode::InvalidState,
                format!("Session {} is already loaded", token),
            );
            return;
        }

        let record = match self.store.load_keyset(&self.config.origin, token) {
            Ok(Some(record)) => record,
            Ok(None) => {
                log!(debug, "No persistent license for {}", token);
                self.resolve_with_no_license(promise_id);
                return;
            }
            Err(e @ StoreError::Corrupt { .. }) => {
                log!(warn, "Discarding unusable license record: {}", e);
                if let Err(clear) = self.store.clear_keyset(&self.config.origin, token) {
                    log!(warn, "Failed to clear unusable license record: {}", clear);
                }
                self.reject_storage(promise_id, "Persistent license is corrupt", &e);
                return;
            }
            Err(e) => {
                self.reject_storage(promise_id, "Failed to read persistent license", &e);
                return;
            }
        };

        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let handle = match engine.open_session() {
            Ok(handle) => handle,
            Err(EngineError::NotProvisioned) => {
                self.reject(promise_id, ErrorCode::InvalidState, "Device not provisioned");
                self.start_provisioning_or_fail();
                return;
            }
            Err(e) => {
                self.reject_engine_error(promise_id, "Open session failed", e);
                return;
            }
        };

        if let Err(e) = engine.restore_keys(&handle, &record.key_set_id) {
            self.close_native(handle);
            self.pump_engine_events();
            match e {
                EngineError::InvalidState(detail) => {
                    log!(warn, "Persistent license for {} is gone: {}", token, detail);
                    if let Err(clear) = self.store.clear_keyset(&self.config.origin, token) {
                        log!(warn, "Failed to clear stale license record: {}", clear);
                    }
                    self.resolve_with_no_license(promise_id);
                }
                EngineError::NotProvisioned => {
                    self.reject(promise_id, ErrorCode::InvalidState, "Device not provisioned");
                    self.start_provisioning_or_fail();
                }
                other => self.reject_engine_error(promise_id, "Restore keys failed", other),
            }
            return;
        }

        // Key status raised by the restore must not reach the caller before
        // the load resolves.
        self.deferrer = Some(EventDeferrer::bind(&handle));
        let id = SessionId::persisted(token, record.key_set_id);
        let inserted = match self
            .registry
            .insert(id, SessionInfo::new(record.mime_type, KeyType::Offline))
        {
            Ok(()) => self.registry.attach_handle(token, handle).inspect_err(|_| {
                self.registry.remove(token);
            }),
            Err(e) => Err(e),
        };
        if let Err(e) = inserted {
            self.deferrer = None;
            self.reject(promise_id, ErrorCode::Fatal, e.to_string());
            self.fail(format!("Session registry rejected loaded session: {}", e));
            return;
        }
        self.pump_engine_events();

        self.client
            .notify(ClientEvent::PromiseResolvedWithSession { promise_id, token });
        if let Some(deferrer) = self.deferrer.take() {
            log!(debug, "Releasing {} deferred event(s) for {}", deferrer.len(), token);
            for event in deferrer.release() {
                self.client.notify(event);
            }
        }
        self.after_keys_installed(token);
    }

    /// Begin revoking the offline license of `token`. The release request is
    /// emitted as a message; the revocation completes with an update.
    pub fn remove_session(&mut self, promise_id: PromiseId, token: SessionToken) {
        log!(debug, "remove_session {} for {}", promise_id, token);
        if self.is_released() {
            self.reject(promise_id, ErrorCode::InvalidState, "Manager has been released");
            return;
        }
        let Some(entry) = self.registry.get(token) else {
            self.reject_not_found(promise_id, token);
            return;
        };
        match entry.info.key_type {
            KeyType::Offline => {}
            KeyType::Streaming => {
                self.reject(
                    promise_id,
                    ErrorCode::NotSupported,
                    "Removing temporary sessions is not supported",
                );
                return;
            }
            KeyType::Release => {
                self.reject(
                    promise_id,
                    ErrorCode::InvalidState,
                    format!("Session {} is already being removed", token),
                );
                return;
            }
        }
        let mime_type = entry.info.mime_type.clone();

        let previous = match self.registry.mark_key_released(token) {
            Ok(previous) => previous,
            Err(e) => {
                self.reject(promise_id, e.code(), e.to_string());
                return;
            }
        };

        let result = self.with_scope(token, |engine, scope| {
            engine.get_key_request(
                scope,
                &[],
                &mime_type,
                KeyType::Release,
                &OptionalParameters::new(),
            )
        });
        match result {
            Some(Ok(request)) => {
                self.resolve(promise_id);
                self.client.notify(ClientEvent::Message {
                    token,
                    request_type: request.request_type.unwrap_or(RequestType::Release),
                    message: request.data,
                });
                self.pump_engine_events();
            }
            Some(Err(e)) => {
                self.restore_key_type(token, previous);
                if e == EngineError::NotProvisioned {
                    self.reject(promise_id, ErrorCode::InvalidState, "Device not provisioned");
                    self.start_provisioning_or_fail();
                } else {
                    self.reject_engine_error(promise_id, "Generate release request failed", e);
                }
            }
            None => {
                self.restore_key_type(token, previous);
                self.reject(promise_id, ErrorCode::InvalidState, "Session has no keyset");
            }
        }
    }

    fn restore_key_type(&mut self, token: SessionToken, key_type: KeyType) {
        if let Err(e) = self.registry.set_key_type(token, key_type) {
            log!(warn, "Could not restore key type of {}: {}", token, e);
        }
    }

    /// Close the session of `token` without touching its persisted license.
    pub fn close_session(&mut self, promise_id: PromiseId, token: SessionToken) {
        log!(debug, "close_session {} for {}", promise_id, token);
        if self.is_released() {
            self.reject(promise_id, ErrorCode::InvalidState, "Manager has been released");
            return;
        }
        let Some(entry) = self.registry.remove(token) else {
            self.reject_not_found(promise_id, token);
            return;
        };
        if let Some(handle) = entry.id.into_native_handle() {
            self.close_native(handle);
        }
        self.resolve(promise_id);
        self.client.notify(ClientEvent::Closed { token });
    }

    /// Destroy a session whose offline license was just revoked.
    fn finish_release(&mut self, token: SessionToken) {
        let Some(entry) = self.registry.remove(token) else {
            return;
        };
        if let Some(handle) = entry.id.into_native_handle() {
            self.close_native(handle);
        }
        self.client.notify(ClientEvent::Closed { token });
    }

    /// Best-effort key removal and close of a native session.
    fn close_native(&mut self, handle: NativeHandle) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        close_handle(engine, handle);
    }

    /// Run `f` against the engine and the key scope of `token`. `None` when
    /// the manager is released, the session is unknown or it has no scope.
    fn with_scope<T, F>(&mut self, token: SessionToken, f: F) -> Option<EngineResult<T>>
    where
        F: FnOnce(&mut E, KeyScope<'_>) -> EngineResult<T>,
    {
        let engine = self.engine.as_mut()?;
        let scope = self.registry.get(token)?.key_scope()?;
        Some(f(engine, scope))
    }

    fn reports_key_status(&self) -> bool {
        self.engine
            .as_ref()
            .map_or(true, |engine| engine.reports_key_status())
    }

    /// Placeholder key status for engines that never report their own.
    fn after_keys_installed(&mut self, token: SessionToken) {
        self.pump_engine_events();
        if self.reports_key_status() {
            return;
        }
        let Some(entry) = self.registry.get(token) else {
            return;
        };
        let is_release = entry.info.key_type == KeyType::Release;
        self.client.notify(ClientEvent::KeysChange {
            token,
            keys: KeyStatus::placeholder(KeyStatusCode::Usable),
            has_new_usable_key: true,
            is_release,
        });
    }

    /// Deliver an event the engine raised outside of any manager call.
    pub fn on_engine_event(&mut self, event: EngineEvent) {
        if self.is_released() {
            log!(debug, "Dropping engine event after release");
            return;
        }
        self.handle_engine_event(event);
        self.pump_engine_events();
    }

    fn pump_engine_events(&mut self) {
        loop {
            let Some(engine) = self.engine.as_mut() else {
                return;
            };
            let Some(event) = engine.poll_event() else {
                return;
            };
            self.handle_engine_event(event);
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        let handle = event.session().to_vec();
        let Some(entry) = self.registry.get_by_handle(&handle) else {
            log!(debug, "Engine event for unknown session {}", crate::utils::to_hex(&handle));
            return;
        };
        let token = entry.id.token();
        let key_type = entry.info.key_type;
        let mime_type = entry.info.mime_type.clone();
        let is_release = key_type == KeyType::Release;

        match event {
            EngineEvent::KeyStatusChange {
                keys,
                has_new_usable_key,
                ..
            } => {
                log!(debug, "Key status change for {} ({} key(s))", token, keys.len());
                self.dispatch(
                    &handle,
                    ClientEvent::KeysChange {
                        token,
                        keys,
                        has_new_usable_key,
                        is_release,
                    },
                );
            }
            EngineEvent::ExpirationUpdate { expiration_ms, .. } => {
                log!(debug, "Expiration update for {}: {}", token, expiration_ms);
                self.dispatch(&handle, ClientEvent::ExpirationUpdate { token, expiration_ms });
            }
            EngineEvent::KeyRequired { data, .. } => {
                self.handle_key_required(&handle, token, key_type, &mime_type, &data);
            }
            EngineEvent::KeyExpired { .. } => {
                log!(debug, "Keys expired for {}", token);
                if !self.reports_key_status() {
                    self.dispatch(
                        &handle,
                        ClientEvent::KeysChange {
                            token,
                            keys: KeyStatus::placeholder(KeyStatusCode::Expired),
                            has_new_usable_key: false,
                            is_release,
                        },
                    );
                }
            }
            EngineEvent::VendorDefined { code, .. } => {
                log!(debug, "Ignoring vendor event {} for {}", code, token);
            }
        }
    }

    fn handle_key_required(
        &mut self,
        handle: &[u8],
        token: SessionToken,
        key_type: KeyType,
        mime_type: &str,
        data: &[u8],
    ) {
        if self.provisioning.is_active() {
            log!(debug, "Key required for {} during provisioning, ignored", token);
            return;
        }
        let result = self.with_scope(token, |engine, scope| {
            engine.get_key_request(scope, data, mime_type, key_type, &OptionalParameters::new())
        });
        match result {
            Some(Ok(request)) => {
                let request_type = request.request_type();
                self.client.notify(ClientEvent::Message {
                    token,
                    request_type,
                    message: request.data,
                });
            }
            Some(Err(EngineError::NotProvisioned)) => {
                log!(info, "Key required for {} but device is not provisioned", token);
                self.start_provisioning_or_fail();
            }
            other => {
                if let Some(Err(e)) = other {
                    log!(error, "Key request for {} failed: {}", token, e);
                }
                if !self.reports_key_status() {
                    self.dispatch(
                        handle,
                        ClientEvent::KeysChange {
                            token,
                            keys: KeyStatus::placeholder(KeyStatusCode::InternalError),
                            has_new_usable_key: false,
                            is_release: key_type == KeyType::Release,
                        },
                    );
                }
            }
        }
    }

    /// Send a session event now, or hold it if its session's load has not
    /// resolved yet.
    fn dispatch(&mut self, handle: &[u8], event: ClientEvent) {
        if let Some(deferrer) = self.deferrer.as_mut() {
            if deferrer.should_defer(handle) {
                deferrer.defer(event);
                return;
            }
        }
        self.client.notify(event);
    }

    fn create_crypto_context(&mut self) -> Result<()> {
        if self.crypto_session.is_some() {
            return Ok(());
        }
        let engine = self.engine.as_mut().ok_or(Error::Released)?;
        let handle = match engine.open_session() {
            Ok(handle) => handle,
            Err(EngineError::NotProvisioned) => {
                log!(info, "Device not provisioned, crypto context deferred");
                return self.start_provisioning();
            }
            Err(e) => {
                log!(error, "Failed to open crypto session: {}", e);
                return Err(e.into());
            }
        };
        if let Err(e) = engine.create_crypto_context(self.config.scheme, &handle) {
            close_handle(engine, handle);
            if e == EngineError::NotProvisioned {
                log!(info, "Device not provisioned, crypto context deferred");
                return self.start_provisioning();
            }
            log!(error, "Failed to create crypto context: {}", e);
            return Err(e.into());
        }
        log!(debug, "Crypto context ready on {:?}", handle);
        self.crypto_session = Some(handle);
        self.report_crypto_context(true);
        self.pump_engine_events();
        Ok(())
    }

    fn report_crypto_context(&mut self, available: bool) {
        if self.crypto_context_reported {
            return;
        }
        self.crypto_context_reported = true;
        self.client.notify(ClientEvent::CryptoContextReady { available });
    }

    fn start_provisioning(&mut self) -> Result<()> {
        let engine = self.engine.as_mut().ok_or(Error::Released)?;
        if let StartOutcome::Started(request) = self.provisioning.start(engine)? {
            self.client.notify(ClientEvent::StartProvisioning {
                url: request.default_url,
                request: request.data,
            });
        }
        Ok(())
    }

    fn start_provisioning_or_fail(&mut self) {
        if let Err(e) = self.start_provisioning() {
            self.finish_reset(false);
            self.fail(format!("Failed to start provisioning: {}", e));
        }
    }

    /// Hand the provisioning server's answer to the engine.
    ///
    /// `response_received = false` means the exchange itself failed. Any
    /// failure is fatal. On success the crypto context is created if it was
    /// waiting, the origin is recorded as provisioned and deferred creates are
    /// replayed in order.
    pub fn process_provision_response(&mut self, response_received: bool, response: &[u8]) {
        log!(
            debug,
            "process_provision_response (received: {}, {} bytes)",
            response_received,
            response.len()
        );
        let Some(engine) = self.engine.as_mut() else {
            log!(warn, "Provisioning response after release ignored");
            return;
        };
        match self
            .provisioning
            .apply_response(engine, response_received, response)
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.finish_reset(false);
                self.fail(format!("Provisioning failed: {}", e));
                return;
            }
        }
        self.finish_reset(true);

        if let Err(e) = self.provisioning.complete() {
            self.fail(e.to_string());
            return;
        }

        if self.crypto_session.is_none() {
            if let Err(e) = self.create_crypto_context() {
                self.fail(format!("Failed to create crypto context: {}", e));
                return;
            }
            if self.provisioning.is_active() {
                return;
            }
        }

        if self.origin_set {
            if let Err(e) = self.store.mark_origin_provisioned(&self.config.origin) {
                self.fail(format!("Failed to record origin as provisioned: {}", e));
                return;
            }
            log!(info, "Origin '{}' provisioned", self.config.origin);
        }

        self.drain_pending();
    }

    fn drain_pending(&mut self) {
        if !self.pending.is_empty() {
            log!(debug, "Replaying {} deferred create(s)", self.pending.len());
        }
        while !self.is_released() && !self.provisioning.is_active() {
            let Some(data) = self.pending.next() else {
                break;
            };
            self.create_session_internal(data, Requeue::Front);
        }
    }

    /// Force a fresh provisioning cycle. Completion is reported through
    /// [`ClientEvent::ResetDeviceCredentialsCompleted`].
    pub fn reset_device_credentials(&mut self) {
        log!(debug, "reset_device_credentials");
        if self.is_released() {
            self.client
                .notify(ClientEvent::ResetDeviceCredentialsCompleted { success: false });
            return;
        }
        self.reset_credentials_pending = true;
        self.start_provisioning_or_fail();
    }

    fn finish_reset(&mut self, success: bool) {
        if self.reset_credentials_pending {
            self.reset_credentials_pending = false;
            self.client
                .notify(ClientEvent::ResetDeviceCredentialsCompleted { success });
        }
    }

    /// Tear everything down: queued creates are aborted, sessions closed and
    /// the engine released. Later calls are rejected.
    pub fn release(&mut self) {
        self.teardown(false, "Released by caller".to_string());
    }

    fn fail(&mut self, detail: String) {
        log!(error, "Fatal error, releasing manager: {}", detail);
        self.teardown(true, detail);
    }

    fn teardown(&mut self, fatal: bool, detail: String) {
        let Some(mut engine) = self.engine.take() else {
            return;
        };
        log!(
            info,
            "Releasing manager ({} session(s), {} queued create(s))",
            self.registry.len(),
            self.pending.len()
        );

        for data in self.pending.drain() {
            self.client.notify(ClientEvent::PromiseRejected {
                promise_id: data.promise_id,
                rejection: Rejection::new(ErrorCode::Aborted, "Create session aborted."),
            });
        }

        for entry in self.registry.drain() {
            let token = entry.id.token();
            if let Some(handle) = entry.id.into_native_handle() {
                close_handle(&mut engine, handle);
            }
            self.client.notify(ClientEvent::Closed { token });
        }
        self.deferrer = None;

        match self.crypto_session.take() {
            Some(handle) => {
                if let Err(e) = engine.close_session(handle) {
                    log!(warn, "Failed to close crypto session: {}", e);
                }
            }
            None => self.report_crypto_context(false),
        }

        self.finish_reset(false);
        self.provisioning.reset();
        engine.release();
        self.client
            .notify(ClientEvent::ManagerReleased { fatal, detail });
    }

    fn resolve(&mut self, promise_id: PromiseId) {
        self.client.notify(ClientEvent::PromiseResolved { promise_id });
    }

    fn resolve_with_no_license(&mut self, promise_id: PromiseId) {
        self.client.notify(ClientEvent::PromiseResolvedWithSession {
            promise_id,
            token: SessionToken::no_license(),
        });
    }

    fn reject(&mut self, promise_id: PromiseId, code: ErrorCode, message: impl Into<String>) {
        let rejection = Rejection::new(code, message);
        log!(warn, "Rejecting {}: {}", promise_id, rejection);
        self.client
            .notify(ClientEvent::PromiseRejected { promise_id, rejection });
    }

    fn reject_not_found(&mut self, promise_id: PromiseId, token: SessionToken) {
        let error = Error::SessionNotFound(token);
        self.reject(promise_id, error.code(), error.to_string());
    }

    fn reject_storage(&mut self, promise_id: PromiseId, context: &str, error: &StoreError) {
        self.reject(
            promise_id,
            ErrorCode::StorageError,
            format!("{}: {}", context, error),
        );
    }

    /// Reject with the engine's error code, releasing the manager if it is
    /// fatal.
    fn reject_engine_error(&mut self, promise_id: PromiseId, context: &str, error: EngineError) {
        let message = format!("{}: {}", context, error);
        self.reject(promise_id, error.code(), message.clone());
        if error.is_fatal() {
            self.fail(message);
        }
    }
}

impl<E: CdmEngine, S: PersistentStore, C: Client> Drop for SessionManager<E, S, C> {
    fn drop(&mut self) {
        self.teardown(false, "Manager dropped".to_string());
    }
}

fn close_handle<E: CdmEngine>(engine: &mut E, handle: NativeHandle) {
    if let Err(e) = engine.remove_keys(&handle) {
        log!(debug, "remove_keys on {:?} failed: {}", handle, e);
    }
    if let Err(e) = engine.close_session(handle) {
        log!(warn, "Failed to close native session: {}", e);
    }
}
