//! Device state machine
//!
//! [`Client`] owns every collaborator for the lifetime of the process and
//! decides, once per wake cycle, which network or display action to take.
//! Transient failures bump the error counter; crossing the threshold is
//! reported to the driver, which shows the error screen and sleeps.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use alloc::{format, vec};

use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::api::{self, ContentDescriptor};
use crate::cache::{CacheError, CacheStore, ImageCache};
use crate::config::{
    Config, DEFAULT_REFRESH_RATE_SECS, DISPLAY_ENDPOINT, ERROR_THRESHOLD, LOGS_ENDPOINT,
    MAX_API_BODY, MIN_SLEEP_SECS, OFFLINE_RETRY_MS, WifiCredentials,
};
use crate::error::ClientError;
use crate::http::{
    self, BodyBuffer, Discard, Header, HttpTransport, Method, Request, TransportError,
};
use crate::identity::DeviceId;
use crate::image::{HeapStats, ImageDownload, ImagePipeline, RenderOutcome};
use crate::kv::{Key, KvStore, Settings};
use crate::render::RenderSink;

/// Connectivity state; exactly one at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Uninitialized,
    WifiSetup,
    DeviceSetup,
    Operational,
    Error,
    Offline,
}

impl ConnectivityState {
    pub fn label(self) -> &'static str {
        match self {
            ConnectivityState::Uninitialized => "Uninitialized",
            ConnectivityState::WifiSetup => "WiFi Setup",
            ConnectivityState::DeviceSetup => "Device Setup",
            ConnectivityState::Operational => "Operational",
            ConnectivityState::Error => "Error",
            ConnectivityState::Offline => "Offline",
        }
    }
}

/// Result of one [`Client::advance`] call, for the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// No credentials; provisioning must run before anything else
    NeedsWifiSetup,
    /// Registration is present, either already or just now
    Registered,
    /// Registration failed and will be retried next cycle
    RegistrationFailed,
    /// Operational; content may be refreshed
    Ready,
    /// Still offline
    Offline,
    /// Connectivity confirmed after being offline
    Reconnected,
    /// Error counter crossed the threshold
    Escalate { errors: u32 },
}

/// Outcome of a content refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Nothing new to show
    Unchanged,
    /// Fresh content from the server
    Updated(RenderOutcome),
    /// Server unreachable; the cached copy of the last image was redrawn
    FromCache(RenderOutcome),
}

/// TRMNL client over the board collaborators
pub struct Client<T, K, C, D, H>
where
    T: HttpTransport,
    K: KvStore,
    C: CacheStore,
    D: DelayNs,
    H: HeapStats,
{
    config: Config,
    device: DeviceId,
    transport: T,
    settings: Settings<K>,
    cache: ImageCache<C>,
    delay: D,
    heap: H,
    pipeline: ImagePipeline,

    state: ConnectivityState,
    credentials: Option<WifiCredentials>,
    api_key: Option<String>,
    friendly_id: Option<String>,
    refresh_rate_secs: u32,
    invert: bool,
    last_image: Option<String>,
    last_update_ms: Option<u64>,
    last_offline_check_ms: Option<u64>,
    firmware_url: Option<String>,
    consecutive_errors: u32,
    last_error: String,
}

impl<T, K, C, D, H> Client<T, K, C, D, H>
where
    T: HttpTransport,
    K: KvStore,
    C: CacheStore,
    D: DelayNs,
    H: HeapStats,
{
    pub fn new(
        config: Config,
        device: DeviceId,
        transport: T,
        kv: K,
        cache: C,
        delay: D,
        heap: H,
    ) -> Self {
        let pipeline = ImagePipeline::new(config.display_width, config.display_height);
        let cache = ImageCache::new(cache, config.cache_enabled, config.max_cached_images);
        Self {
            device,
            transport,
            settings: Settings::new(kv),
            cache,
            delay,
            heap,
            pipeline,
            state: ConnectivityState::Uninitialized,
            credentials: None,
            api_key: None,
            friendly_id: None,
            refresh_rate_secs: DEFAULT_REFRESH_RATE_SECS,
            invert: false,
            last_image: None,
            last_update_ms: None,
            last_offline_check_ms: None,
            firmware_url: None,
            consecutive_errors: 0,
            last_error: String::new(),
            config,
        }
    }

    /// Load persisted settings. Build-time overrides win over stored values.
    pub fn begin(&mut self) {
        self.credentials = match &self.config.wifi_override {
            Some(creds) => {
                info!("client: using build-time WiFi credentials");
                Some(creds.clone())
            }
            None => self.settings.string(Key::WifiSsid).map(|ssid| WifiCredentials {
                ssid,
                password: self.settings.string(Key::WifiPassword).unwrap_or_default(),
            }),
        };
        self.api_key = self
            .config
            .api_key_override
            .clone()
            .or_else(|| self.settings.string(Key::ApiKey));
        self.friendly_id = self
            .config
            .friendly_id_override
            .clone()
            .or_else(|| self.settings.string(Key::FriendlyId));
        self.refresh_rate_secs = self
            .settings
            .number(Key::RefreshRate)
            .filter(|rate| *rate > 0)
            .unwrap_or(DEFAULT_REFRESH_RATE_SECS);
        self.invert = self.settings.flag(Key::InvertDisplay).unwrap_or(false);
        self.last_image = self.settings.string(Key::LastImage);
        self.state = ConnectivityState::Uninitialized;

        info!("client: device {}", self.device.as_str());
        info!(
            "client: api key {}, friendly id {:?}, refresh {}s",
            if self.api_key.is_some() { "set" } else { "not set" },
            self.friendly_id,
            self.refresh_rate_secs
        );
    }

    /// Resolve the initial state from what is stored
    pub fn start(&mut self) -> ConnectivityState {
        let state = if !self.has_wifi_credentials() {
            ConnectivityState::WifiSetup
        } else if !self.is_registered() {
            ConnectivityState::DeviceSetup
        } else {
            ConnectivityState::Operational
        };
        self.set_state(state);
        state
    }

    /// Run one state-machine step
    pub async fn advance(&mut self, now_ms: u64) -> Step {
        if self.state == ConnectivityState::Uninitialized
            || (self.state == ConnectivityState::Error && !self.should_escalate())
        {
            self.start();
        }
        if self.state == ConnectivityState::WifiSetup {
            if !self.has_wifi_credentials() {
                return Step::NeedsWifiSetup;
            }
            self.set_state(ConnectivityState::DeviceSetup);
        }

        match self.state {
            ConnectivityState::DeviceSetup | ConnectivityState::Operational
                if self.should_escalate() =>
            {
                Step::Escalate {
                    errors: self.consecutive_errors,
                }
            }
            ConnectivityState::DeviceSetup => {
                self.ensure_connected().await;
                match self.register_device().await {
                    Ok(()) => Step::Registered,
                    Err(_) => Step::RegistrationFailed,
                }
            }
            ConnectivityState::Operational => {
                self.ensure_connected().await;
                Step::Ready
            }
            ConnectivityState::Offline => {
                if self.poll_offline(now_ms).await {
                    Step::Reconnected
                } else {
                    Step::Offline
                }
            }
            ConnectivityState::Error => Step::Escalate {
                errors: self.consecutive_errors,
            },
            ConnectivityState::Uninitialized | ConnectivityState::WifiSetup => {
                Step::NeedsWifiSetup
            }
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectivityState) {
        if state != self.state {
            info!("client: {} -> {}", self.state.label(), state.label());
            self.state = state;
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // Connectivity

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn has_wifi_credentials(&self) -> bool {
        self.credentials.as_ref().is_some_and(WifiCredentials::is_valid)
    }

    pub fn wifi_credentials(&self) -> Option<&WifiCredentials> {
        self.credentials.as_ref()
    }

    /// Join the configured network
    pub async fn connect_wifi(&mut self) -> Result<(), ClientError> {
        let credentials = self
            .credentials
            .clone()
            .filter(WifiCredentials::is_valid)
            .ok_or(ClientError::NoCredentials)?;
        info!("client: connecting to {}", credentials.ssid);
        self.transport
            .connect(&credentials)
            .await
            .map_err(ClientError::WifiConnect)?;
        info!("client: WiFi connected");
        Ok(())
    }

    async fn ensure_connected(&mut self) {
        if self.transport.is_connected() || !self.has_wifi_credentials() {
            return;
        }
        if let Err(e) = self.connect_wifi().await {
            warn!("client: {}", e);
            self.last_error = e.to_string();
        }
    }

    /// Persist new credentials; a build-time override still wins
    pub fn save_wifi_credentials(&mut self, ssid: &str, password: &str) {
        self.settings.put_string(Key::WifiSsid, ssid);
        self.settings.put_string(Key::WifiPassword, password);
        if self.config.wifi_override.is_none() {
            self.credentials = Some(WifiCredentials::new(ssid, password));
        }
        info!("client: WiFi credentials saved for {}", ssid);
    }

    pub fn clear_wifi_credentials(&mut self) {
        self.settings.remove(Key::WifiSsid);
        self.settings.remove(Key::WifiPassword);
        self.credentials = self.config.wifi_override.clone();
        info!("client: WiFi credentials cleared");
    }

    // Registration

    /// Registered iff both the access key and the friendly id are known
    pub fn is_registered(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.friendly_id.as_deref().is_some_and(|f| !f.is_empty())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn friendly_id(&self) -> Option<&str> {
        self.friendly_id.as_deref()
    }

    /// Obtain an access key and friendly id, unless already held.
    ///
    /// Failure leaves the state in `DeviceSetup` and bumps the error counter.
    pub async fn register_device(&mut self) -> Result<(), ClientError> {
        if self.is_registered() {
            debug!("client: already registered, skipping setup call");
            self.set_state(ConnectivityState::Operational);
            self.consecutive_errors = 0;
            return Ok(());
        }

        match self.call_setup().await {
            Ok(()) => {
                self.set_state(ConnectivityState::Operational);
                self.clear_errors();
                Ok(())
            }
            Err(e) => {
                error!("client: registration failed: {}", e);
                self.record_error(&e);
                Err(e)
            }
        }
    }

    async fn call_setup(&mut self) -> Result<(), ClientError> {
        if !self.transport.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let url = api::setup_url(&self.config, &self.device);
        let user_agent = api::user_agent();
        let headers: [Header<'_>; 4] = [
            ("Accept", "application/json"),
            ("Accept-Encoding", "identity"),
            ("User-Agent", user_agent.as_str()),
            ("Connection", "close"),
        ];
        let request = Request::get(&url, &headers, self.config.api_timeout_ms);
        let mut body = BodyBuffer::new(MAX_API_BODY);
        http::send_with_retry(&mut self.transport, &mut self.delay, &request, &mut body).await?;
        if body.overflowed() {
            return Err(api::ApiError::Truncated.into());
        }

        let setup = api::parse_setup(body.as_slice())?;
        info!(
            "client: setup status {}, image {:?}, filename {:?}",
            setup.status, setup.image_url, setup.filename
        );
        if !setup.success || !setup.has_identity() {
            return Err(ClientError::RegistrationRejected);
        }

        self.settings.put_string(Key::ApiKey, &setup.api_key);
        self.settings.put_string(Key::FriendlyId, &setup.friendly_id);
        info!("client: registered as {}", setup.friendly_id);
        self.api_key = Some(setup.api_key);
        self.friendly_id = Some(setup.friendly_id);
        Ok(())
    }

    /// Forget the access key and friendly id
    pub fn clear_registration(&mut self) {
        self.settings.remove(Key::ApiKey);
        self.settings.remove(Key::FriendlyId);
        self.api_key = None;
        self.friendly_id = None;
        info!("client: registration cleared");
    }

    // Content

    /// Always true; there is no server-side change detection
    pub fn has_new_content(&self) -> bool {
        true
    }

    /// Fetch and show new content, falling back to the cache on failure
    pub async fn refresh<S: RenderSink>(
        &mut self,
        sink: &mut S,
        now_ms: u64,
    ) -> Result<Refresh, ClientError> {
        if !self.has_new_content() {
            return Ok(Refresh::Unchanged);
        }
        match self.update_content(sink).await {
            Ok(outcome) => {
                self.last_update_ms = Some(now_ms);
                Ok(Refresh::Updated(outcome))
            }
            Err(e) => {
                warn!("client: content update failed: {}", e);
                if self.has_cached_content() {
                    match self.display_cached_content(sink) {
                        Ok(outcome) => return Ok(Refresh::FromCache(outcome)),
                        Err(cache_err) => warn!("client: cache replay failed: {}", cache_err),
                    }
                }
                Err(e)
            }
        }
    }

    /// Fetch the display descriptor, download the image and render it.
    ///
    /// Without a link the state becomes `Offline` and nothing is drawn.
    pub async fn update_content<S: RenderSink>(
        &mut self,
        sink: &mut S,
    ) -> Result<RenderOutcome, ClientError> {
        if !self.transport.is_connected() {
            warn!("client: no network, going offline");
            self.set_state(ConnectivityState::Offline);
            self.last_offline_check_ms = None;
            self.last_error = ClientError::NotConnected.to_string();
            return Err(ClientError::NotConnected);
        }

        match self.fetch_and_show(sink).await {
            Ok(outcome) => {
                self.clear_errors();
                Ok(outcome)
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    async fn fetch_and_show<S: RenderSink>(
        &mut self,
        sink: &mut S,
    ) -> Result<RenderOutcome, ClientError> {
        // A reset in the response clears the key, but this cycle's image was
        // served for it.
        let token = self.api_key.clone().unwrap_or_default();
        let descriptor = self.fetch_display().await?;
        if !descriptor.success() {
            warn!(
                "client: display rejected, status {} error {:?}",
                descriptor.status, descriptor.error
            );
            return Err(ClientError::ContentRejected(descriptor.status));
        }
        if descriptor.image_url.is_empty() {
            return Err(ClientError::NoImageUrl);
        }

        let bytes = self.download_with_token(&descriptor.image_url, &token).await?;
        let outcome = self
            .pipeline
            .render(&bytes, sink, self.invert)
            .map_err(|e| {
                error!("client: render failed: {:?}", e);
                ClientError::Render
            })?;

        if outcome.is_image() {
            if self.cache.is_enabled() && !descriptor.filename.is_empty() {
                if let Err(e) = self.cache.store(&descriptor.filename, &bytes) {
                    warn!("client: caching {} failed: {:?}", descriptor.filename, e);
                }
            }
            self.remember_last_image(&descriptor.filename);
        }
        Ok(outcome)
    }

    /// Call the display endpoint and apply its control flags
    pub async fn fetch_display(&mut self) -> Result<ContentDescriptor, ClientError> {
        let api_key = self.api_key.clone().ok_or(ClientError::NotRegistered)?;
        let friendly_id = self.friendly_id.clone().unwrap_or_default();
        let url = self.config.endpoint(DISPLAY_ENDPOINT);
        let user_agent = api::user_agent();

        let mut headers: Vec<Header<'_>> = vec![
            ("Accept", "image/*, application/json"),
            ("Accept-Encoding", "identity"),
            ("access-token", api_key.as_str()),
            ("User-Agent", user_agent.as_str()),
            ("Connection", "close"),
        ];
        if !friendly_id.is_empty() {
            headers.push(("X-Friendly-Id", friendly_id.as_str()));
        }
        let request = Request::get(&url, &headers, self.config.api_timeout_ms);
        let mut body = BodyBuffer::new(MAX_API_BODY);
        http::send_with_retry(&mut self.transport, &mut self.delay, &request, &mut body).await?;

        let bytes = body.as_slice();
        if body.overflowed() && api::looks_like_json(bytes) {
            return Err(api::ApiError::Truncated.into());
        }
        let descriptor = api::parse_display(bytes, &url)?;
        info!(
            "client: display status {}, image {:?}, filename {:?}",
            descriptor.status, descriptor.image_url, descriptor.filename
        );
        self.apply_display_controls(&descriptor);
        Ok(descriptor)
    }

    /// Refresh rate, firmware offer and reset flag. A reset forgets the
    /// registration now; the rest of the cycle still runs.
    fn apply_display_controls(&mut self, descriptor: &ContentDescriptor) {
        if let Some(rate) = descriptor.refresh_rate_secs
            && rate != self.refresh_rate_secs
        {
            self.set_refresh_rate(rate);
        }

        self.firmware_url = if descriptor.update_firmware {
            info!("client: firmware update offered: {}", descriptor.firmware_url);
            Some(descriptor.firmware_url.clone())
        } else {
            None
        };

        if descriptor.reset_firmware {
            warn!("client: server requested reset, clearing registration");
            self.clear_registration();
            self.set_state(ConnectivityState::DeviceSetup);
        }
    }

    /// Single-attempt image download into an adaptively sized buffer
    pub async fn download_image(&mut self, url: &str) -> Result<Vec<u8>, ClientError> {
        let api_key = self.api_key.clone().unwrap_or_default();
        self.download_with_token(url, &api_key).await
    }

    async fn download_with_token(&mut self, url: &str, api_key: &str) -> Result<Vec<u8>, ClientError> {
        let user_agent = api::user_agent();
        let headers: [Header<'_>; 5] = [
            ("Accept", "image/*"),
            ("Accept-Encoding", "identity"),
            ("access-token", api_key),
            ("User-Agent", user_agent.as_str()),
            ("Connection", "close"),
        ];
        let request = Request::get(url, &headers, self.config.image_timeout_ms);
        info!("client: downloading {}", url);

        let mut download = ImageDownload::new(&self.heap, self.config.max_image_size);
        let head = self.transport.send(&request, &mut download).await?;
        Ok(download.finish(&head)?)
    }

    fn remember_last_image(&mut self, filename: &str) {
        self.settings.put_string(Key::LastImage, filename);
        self.last_image = Some(filename.to_string()).filter(|f| !f.is_empty());
    }

    pub fn last_image(&self) -> Option<&str> {
        self.last_image.as_deref()
    }

    pub fn last_update_ms(&self) -> Option<u64> {
        self.last_update_ms
    }

    // Offline

    /// Enter `Offline` and redraw the cached copy of the last image
    pub fn enter_offline_mode<S: RenderSink>(
        &mut self,
        sink: &mut S,
    ) -> Result<RenderOutcome, ClientError> {
        self.set_state(ConnectivityState::Offline);
        self.last_offline_check_ms = None;
        self.display_cached_content(sink)
    }

    /// Storage is present, a last image is recorded and its file exists
    pub fn has_cached_content(&mut self) -> bool {
        match &self.last_image {
            Some(name) => self.cache.is_available() && self.cache.contains(name),
            None => false,
        }
    }

    pub fn display_cached_content<S: RenderSink>(
        &mut self,
        sink: &mut S,
    ) -> Result<RenderOutcome, ClientError> {
        let name = self
            .last_image
            .clone()
            .ok_or(ClientError::NoCachedContent)?;
        let bytes = self.cache.load(&name).map_err(|e| match e {
            CacheError::NotFound | CacheError::Unavailable => ClientError::NoCachedContent,
            other => ClientError::Cache(other),
        })?;
        info!("client: showing cached {}", name);
        self.pipeline
            .render(&bytes, sink, self.invert)
            .map_err(|e| {
                error!("client: render failed: {:?}", e);
                ClientError::Render
            })
    }

    /// Check connectivity at most every five minutes while offline.
    ///
    /// Returns true once the link is confirmed and the state is back to
    /// `Operational`.
    pub async fn poll_offline(&mut self, now_ms: u64) -> bool {
        if self.state != ConnectivityState::Offline {
            return false;
        }
        let last = *self.last_offline_check_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(last) < OFFLINE_RETRY_MS {
            return false;
        }
        self.last_offline_check_ms = Some(now_ms);

        self.ensure_connected().await;
        if self.transport.is_connected() {
            info!("client: connectivity restored");
            self.set_state(ConnectivityState::Operational);
            true
        } else {
            debug!("client: still offline");
            false
        }
    }

    /// Remove cache entries beyond the bound, keeping the last shown image
    pub fn cleanup_cache(&mut self) -> Result<usize, ClientError> {
        let protect = self.last_image.clone();
        Ok(self.cache.cleanup(protect.as_deref())?)
    }

    pub fn cache_available(&self) -> bool {
        self.cache.is_available()
    }

    // Auxiliary calls

    /// Upload a log excerpt. Single attempt.
    pub async fn send_logs(&mut self, logs: &str, timestamp: u64) -> Result<(), ClientError> {
        if !self.transport.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let api_key = self.api_key.clone().ok_or(ClientError::NotRegistered)?;
        let url = self.config.endpoint(LOGS_ENDPOINT);
        let body = api::logs_body(&self.device, logs, timestamp)?;
        let authorization = format!("Bearer {}", api_key);
        let user_agent = api::user_agent();
        let headers: [Header<'_>; 4] = [
            ("Content-Type", "application/json"),
            ("Authorization", authorization.as_str()),
            ("User-Agent", user_agent.as_str()),
            ("Connection", "close"),
        ];
        let request = Request {
            method: Method::Post,
            url: &url,
            headers: &headers,
            body: Some(body.as_slice()),
            timeout_ms: self.config.api_timeout_ms,
        };

        let head = self.transport.send(&request, &mut Discard).await?;
        if !(200..300).contains(&head.status) {
            warn!("client: log upload rejected with {}", head.status);
            return Err(ClientError::Status(head.status));
        }
        info!("client: uploaded {} bytes of logs", logs.len());
        Ok(())
    }

    /// Declared size of a remote resource, from a `HEAD` request
    pub async fn remote_content_length(&mut self, url: &str) -> Result<Option<usize>, ClientError> {
        if !self.transport.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let api_key = self.api_key.clone().unwrap_or_default();
        let user_agent = api::user_agent();
        let headers: [Header<'_>; 4] = [
            ("Accept", "image/*"),
            ("access-token", api_key.as_str()),
            ("User-Agent", user_agent.as_str()),
            ("Connection", "close"),
        ];
        let request = Request {
            method: Method::Head,
            url,
            headers: &headers,
            body: None,
            timeout_ms: self.config.image_timeout_ms,
        };
        let head = self
            .transport
            .send(&request, &mut Discard)
            .await
            .map_err(|e| match e {
                TransportError::NotConnected => ClientError::NotConnected,
                other => ClientError::Transport(other),
            })?;
        if head.status != 200 {
            return Err(ClientError::Status(head.status));
        }
        Ok(head.content_length)
    }

    /// Firmware URL offered by the last display response
    pub fn check_for_firmware_update(&self) -> Option<&str> {
        self.firmware_url.as_deref().filter(|url| !url.is_empty())
    }

    /// Over-the-air updates are not supported on this device
    pub async fn perform_firmware_update(&mut self, url: &str) -> Result<(), ClientError> {
        warn!("client: firmware update to {} not supported", url);
        Err(ClientError::Unsupported)
    }

    // Settings

    pub fn refresh_rate_secs(&self) -> u32 {
        self.refresh_rate_secs
    }

    pub fn set_refresh_rate(&mut self, seconds: u32) {
        info!("client: refresh rate {}s -> {}s", self.refresh_rate_secs, seconds);
        self.refresh_rate_secs = seconds;
        self.settings.put_number(Key::RefreshRate, seconds);
    }

    /// Deep sleep length for the next cycle
    pub fn sleep_duration_secs(&self) -> u32 {
        self.refresh_rate_secs.max(MIN_SLEEP_SECS)
    }

    pub fn invert_display(&self) -> bool {
        self.invert
    }

    pub fn set_invert_display(&mut self, invert: bool) {
        self.invert = invert;
        self.settings.put_flag(Key::InvertDisplay, invert);
    }

    pub fn toggle_invert_display(&mut self) -> bool {
        self.set_invert_display(!self.invert);
        self.invert
    }

    /// Erase credentials, registration, every stored key and the cache
    pub fn factory_reset(&mut self) -> usize {
        warn!("client: factory reset");
        self.clear_wifi_credentials();
        self.clear_registration();
        self.settings.clear();
        let removed = match self.cache.clear() {
            Ok(removed) => removed,
            Err(e) => {
                warn!("client: cache clear skipped: {:?}", e);
                0
            }
        };
        self.refresh_rate_secs = DEFAULT_REFRESH_RATE_SECS;
        self.invert = false;
        self.last_image = None;
        self.firmware_url = None;
        self.clear_errors();
        self.set_state(ConnectivityState::Uninitialized);
        removed
    }

    // Errors

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Restore a counter carried over from before deep sleep
    pub fn restore_errors(&mut self, errors: u32, last_error: &str) {
        self.consecutive_errors = errors;
        self.last_error = last_error.to_string();
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn clear_errors(&mut self) {
        self.consecutive_errors = 0;
        self.last_error.clear();
    }

    /// More consecutive errors than the threshold allows
    pub fn should_escalate(&self) -> bool {
        self.consecutive_errors > ERROR_THRESHOLD
    }

    fn record_error(&mut self, e: &ClientError) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error = e.to_string();
        warn!(
            "client: error {} ({} in a row)",
            self.last_error, self.consecutive_errors
        );
    }

    // Diagnostics

    pub fn status_string(&self) -> String {
        format!("State: {}", self.state.label())
    }

    /// Connected and registered
    pub fn self_test(&self) -> bool {
        self.transport.is_connected() && self.is_registered()
    }
}
