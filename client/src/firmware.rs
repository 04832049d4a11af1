//! Firmware-over-the-air update session.
//!
//! [`FirmwareSession`] is a pure state machine: every input returns the
//! [`FirmwareAction`]s the connection has to carry out (publishes, the
//! install hook). It never touches the transport itself, which keeps the
//! chunk bookkeeping testable without a broker.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tb_shared::{
    filters, fw_keys, ClientError, CurrentFirmware, FirmwareInfo, FirmwareReportState, PlatformTopic,
    DEFAULT_MAX_FIRMWARE_SIZE,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checksum::verify_checksum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareState {
    Idle,
    RequestingInfo,
    Downloading,
    Verifying,
    Updating,
    Failed,
}

impl FirmwareState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            FirmwareState::RequestingInfo
                | FirmwareState::Downloading
                | FirmwareState::Verifying
                | FirmwareState::Updating
        )
    }
}

/// Side effects requested by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum FirmwareAction {
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: String },
    /// Telemetry on the device's own telemetry topic.
    Report(Value),
    /// Ask the server for the firmware shared attributes.
    RequestInfo,
    Install { info: FirmwareInfo, image: Vec<u8> },
}

/// Receives a verified image.
#[async_trait]
pub trait FirmwareInstaller: Send + Sync + 'static {
    async fn install(&self, info: &FirmwareInfo, image: &[u8]) -> anyhow::Result<()>;
}

/// Writes the image to `<dir>/<fw_title>`. Only the last component of the
/// title is used, so the image always lands inside `dir`.
pub struct FileInstaller {
    dir: PathBuf,
}

impl FileInstaller {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, info: &FirmwareInfo) -> anyhow::Result<PathBuf> {
        match Path::new(&info.title).file_name() {
            Some(name) => Ok(self.dir.join(name)),
            None => anyhow::bail!("firmware title {:?} is not a file name", info.title),
        }
    }
}

#[async_trait]
impl FirmwareInstaller for FileInstaller {
    async fn install(&self, info: &FirmwareInfo, image: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(info)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, image).await?;
        info!("Firmware {} {} written to {}", info.title, info.version, path.display());
        Ok(())
    }
}

fn telemetry(entries: &[(&str, Value)]) -> FirmwareAction {
    let map: Map<String, Value> = entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
    FirmwareAction::Report(Value::Object(map))
}

fn state_value(state: FirmwareReportState) -> Value {
    serde_json::to_value(state).unwrap_or(Value::Null)
}

fn report(state: FirmwareReportState) -> FirmwareAction {
    telemetry(&[(fw_keys::STATE, state_value(state))])
}

fn unsubscribe() -> FirmwareAction {
    FirmwareAction::Unsubscribe(filters::FIRMWARE_RESPONSE.to_string())
}

pub struct FirmwareSession {
    state: FirmwareState,
    current: CurrentFirmware,
    target: Option<FirmwareInfo>,
    buffer: Vec<u8>,
    request_id: u32,
    next_chunk: u32,
    chunk_size: usize,
    chunk_timeout: Duration,
    chunk_deadline: Option<Instant>,
    max_retries: u32,
    retries: u32,
    max_image_size: usize,
    last_error: Option<String>,
}

impl FirmwareSession {
    pub fn new(chunk_size: usize, chunk_timeout: Duration, max_retries: u32) -> Self {
        Self {
            state: FirmwareState::Idle,
            current: CurrentFirmware::default(),
            target: None,
            buffer: Vec::new(),
            request_id: 0,
            next_chunk: 0,
            chunk_size: chunk_size.max(1),
            chunk_timeout,
            chunk_deadline: None,
            max_retries,
            retries: 0,
            max_image_size: DEFAULT_MAX_FIRMWARE_SIZE,
            last_error: None,
        }
    }

    /// Images announced larger than `max` fail before any download.
    pub fn with_max_image_size(mut self, max: usize) -> Self {
        self.max_image_size = max;
        self
    }

    pub fn state(&self) -> FirmwareState {
        self.state
    }

    pub fn current(&self) -> &CurrentFirmware {
        &self.current
    }

    pub fn set_current(&mut self, current: CurrentFirmware) {
        self.current = current;
    }

    pub fn target(&self) -> Option<&FirmwareInfo> {
        self.target.as_ref()
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn next_chunk(&self) -> u32 {
        self.next_chunk
    }

    pub fn received_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Explicit update request: report what is installed and fetch the
    /// firmware attributes.
    pub fn begin_request(&mut self) -> Vec<FirmwareAction> {
        if self.state.is_active() {
            debug!("Firmware session already in {:?}, ignoring request", self.state);
            return Vec::new();
        }

        self.state = FirmwareState::RequestingInfo;
        let mut actions = vec![FirmwareAction::Subscribe(filters::FIRMWARE_RESPONSE.to_string())];
        if let Ok(current) = serde_json::to_value(&self.current) {
            actions.push(FirmwareAction::Report(current));
        }
        actions.push(FirmwareAction::RequestInfo);
        actions
    }

    /// The server has no firmware for this device, or did not answer.
    pub fn on_info_unavailable(&mut self) -> Vec<FirmwareAction> {
        if self.state == FirmwareState::RequestingInfo {
            self.state = FirmwareState::Idle;
            return vec![unsubscribe()];
        }
        Vec::new()
    }

    /// New firmware metadata. `request_id` becomes the correlation id of
    /// every chunk request of the download it starts.
    pub fn on_info(&mut self, info: FirmwareInfo, request_id: u32, now: Instant) -> Vec<FirmwareAction> {
        if self.current.matches(&info) {
            info!("Firmware {} {} is already installed", info.title, info.version);
            return self.on_info_unavailable();
        }

        let mut actions = Vec::new();

        if info.size > self.max_image_size {
            let error = ClientError::Protocol(format!(
                "firmware {} {} announces {} bytes, limit is {}",
                info.title, info.version, info.size, self.max_image_size
            ));
            if self.state.is_active() && self.state != FirmwareState::RequestingInfo {
                warn!("Ignoring {}, a download is in progress", error);
                return actions;
            }
            return self.fail(&error.to_string());
        }

        if self.state.is_active() && self.state != FirmwareState::RequestingInfo {
            if self.target.as_ref() == Some(&info) {
                debug!("Firmware {} {} already in progress", info.title, info.version);
                return actions;
            }
            warn!("Firmware update superseded by {} {}", info.title, info.version);
            actions.extend(self.fail("superseded"));
        }

        info!(
            "Starting firmware update to {} {} ({} bytes, {})",
            info.title, info.version, info.size, info.checksum_algorithm
        );

        self.state = FirmwareState::Downloading;
        self.buffer = Vec::with_capacity(info.size.min(self.chunk_size));
        self.request_id = request_id;
        self.next_chunk = 0;
        self.retries = 0;
        self.last_error = None;
        let empty = info.size == 0;
        self.target = Some(info);

        actions.push(FirmwareAction::Subscribe(filters::FIRMWARE_RESPONSE.to_string()));
        actions.push(report(FirmwareReportState::Downloading));

        if empty {
            actions.extend(self.finish_download());
        } else {
            actions.push(self.request_chunk(now));
        }
        actions
    }

    fn request_chunk(&mut self, now: Instant) -> FirmwareAction {
        self.chunk_deadline = Some(now + self.chunk_timeout);
        let topic = PlatformTopic::FirmwareRequest {
            request_id: self.request_id,
            chunk: self.next_chunk,
        };
        debug!("Requesting firmware chunk {} on {}", self.next_chunk, topic);
        FirmwareAction::Publish {
            topic: topic.to_string(),
            payload: self.chunk_size.to_string(),
        }
    }

    /// A chunk response. Stale, duplicate or out-of-order chunks are discarded.
    pub fn on_chunk(&mut self, request_id: u32, chunk: u32, data: &[u8], now: Instant) -> Vec<FirmwareAction> {
        if self.state != FirmwareState::Downloading || request_id != self.request_id {
            debug!("Discarding firmware chunk {} for request {}", chunk, request_id);
            return Vec::new();
        }
        if chunk != self.next_chunk {
            debug!("Discarding firmware chunk {}, expecting {}", chunk, self.next_chunk);
            return Vec::new();
        }

        let size = self.target.as_ref().map(|t| t.size).unwrap_or(0);

        if data.is_empty() {
            warn!("Empty firmware chunk {} at {} of {} bytes", chunk, self.buffer.len(), size);
            return self.retry(now);
        }

        let remaining = size.saturating_sub(self.buffer.len());
        self.buffer.extend_from_slice(&data[..data.len().min(remaining)]);
        self.next_chunk += 1;
        self.retries = 0;
        debug!("Firmware progress {}/{} bytes", self.buffer.len(), size);

        if self.buffer.len() >= size {
            self.finish_download()
        } else {
            vec![self.request_chunk(now)]
        }
    }

    fn finish_download(&mut self) -> Vec<FirmwareAction> {
        self.chunk_deadline = None;
        self.state = FirmwareState::Verifying;

        let Some(info) = self.target.clone() else {
            return self.fail("no firmware metadata");
        };

        let mut actions = vec![report(FirmwareReportState::Downloaded)];

        if let Err(e) = verify_checksum(&self.buffer, &info.checksum_algorithm, &info.checksum) {
            error!("Firmware {} {} failed verification: {}", info.title, info.version, e);
            actions.extend(self.fail(&e.to_string()));
            return actions;
        }

        info!("Firmware {} {} verified", info.title, info.version);
        self.state = FirmwareState::Updating;
        actions.push(report(FirmwareReportState::Verified));
        actions.push(report(FirmwareReportState::Updating));
        actions.push(FirmwareAction::Install {
            info,
            image: std::mem::take(&mut self.buffer),
        });
        actions
    }

    fn retry(&mut self, now: Instant) -> Vec<FirmwareAction> {
        self.retries += 1;
        if self.retries > self.max_retries {
            let reason = format!("chunk {} not received after {} retries", self.next_chunk, self.max_retries);
            return self.fail(&reason);
        }
        warn!("Retrying firmware chunk {} ({}/{})", self.next_chunk, self.retries, self.max_retries);
        vec![self.request_chunk(now)]
    }

    /// Re-requests the expected chunk once its deadline has passed.
    pub fn check_timeout(&mut self, now: Instant) -> Vec<FirmwareAction> {
        match self.chunk_deadline {
            Some(deadline) if self.state == FirmwareState::Downloading && now >= deadline => self.retry(now),
            _ => Vec::new(),
        }
    }

    /// Outcome of the install hook.
    pub fn on_installed(&mut self, result: anyhow::Result<()>) -> Vec<FirmwareAction> {
        if self.state != FirmwareState::Updating {
            return Vec::new();
        }

        match (result, self.target.take()) {
            (Ok(()), Some(info)) => {
                info!("Firmware {} {} installed", info.title, info.version);
                self.current = CurrentFirmware {
                    title: Some(info.title.clone()),
                    version: Some(info.version.clone()),
                };
                let updated = telemetry(&[
                    (fw_keys::STATE, state_value(FirmwareReportState::Updated)),
                    (fw_keys::CURRENT_TITLE, Value::from(info.title)),
                    (fw_keys::CURRENT_VERSION, Value::from(info.version)),
                ]);
                self.state = FirmwareState::Idle;
                vec![updated, unsubscribe()]
            }
            (Ok(()), None) => self.fail("no firmware metadata"),
            (Err(e), _) => self.fail(&format!("install failed: {}", e)),
        }
    }

    fn fail(&mut self, reason: &str) -> Vec<FirmwareAction> {
        error!("Firmware update failed: {}", reason);
        self.state = FirmwareState::Failed;
        self.target = None;
        self.buffer.clear();
        self.chunk_deadline = None;
        self.last_error = Some(reason.to_string());
        vec![
            telemetry(&[
                (fw_keys::STATE, state_value(FirmwareReportState::Failed)),
                (fw_keys::ERROR, Value::from(reason)),
            ]),
            unsubscribe(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumAlgorithm;

    fn image() -> Vec<u8> {
        (0..10u8).collect()
    }

    fn info_for(image: &[u8], version: &str) -> FirmwareInfo {
        FirmwareInfo {
            title: "fw".to_string(),
            version: version.to_string(),
            size: image.len(),
            checksum: ChecksumAlgorithm::Sha256.digest(image),
            checksum_algorithm: "SHA256".to_string(),
        }
    }

    fn states(actions: &[FirmwareAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                FirmwareAction::Report(v) => v.get(fw_keys::STATE).and_then(|s| s.as_str()).map(str::to_string),
                _ => None,
            })
            .collect()
    }

    fn chunk_requests(actions: &[FirmwareAction]) -> Vec<(String, String)> {
        actions
            .iter()
            .filter_map(|a| match a {
                FirmwareAction::Publish { topic, payload } => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_full_download_installs() {
        let image = image();
        let mut session = FirmwareSession::new(4, Duration::from_secs(10), 3);
        let now = Instant::now();

        let actions = session.on_info(info_for(&image, "1.1"), 7, now);
        assert_eq!(session.state(), FirmwareState::Downloading);
        assert_eq!(states(&actions), vec!["DOWNLOADING"]);
        assert_eq!(chunk_requests(&actions), vec![("v2/fw/request/7/chunk/0".to_string(), "4".to_string())]);

        let actions = session.on_chunk(7, 0, &image[0..4], now);
        assert_eq!(chunk_requests(&actions)[0].0, "v2/fw/request/7/chunk/1");
        session.on_chunk(7, 1, &image[4..8], now);
        let actions = session.on_chunk(7, 2, &image[8..], now);

        assert_eq!(session.state(), FirmwareState::Updating);
        assert_eq!(states(&actions), vec!["DOWNLOADED", "VERIFIED", "UPDATING"]);
        let installed = actions.iter().find_map(|a| match a {
            FirmwareAction::Install { image, .. } => Some(image.clone()),
            _ => None,
        });
        assert_eq!(installed, Some(image));

        let actions = session.on_installed(Ok(()));
        assert_eq!(states(&actions), vec!["UPDATED"]);
        match &actions[0] {
            FirmwareAction::Report(v) => assert_eq!(v[fw_keys::CURRENT_VERSION], "1.1"),
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(actions.last(), Some(&unsubscribe()));
        assert_eq!(session.state(), FirmwareState::Idle);
        assert_eq!(session.current().version.as_deref(), Some("1.1"));
    }

    #[test]
    fn test_duplicate_chunk_is_discarded() {
        let image = image();
        let mut session = FirmwareSession::new(4, Duration::from_secs(10), 3);
        let now = Instant::now();
        session.on_info(info_for(&image, "1.1"), 1, now);

        session.on_chunk(1, 0, &image[0..4], now);
        assert!(session.on_chunk(1, 0, &image[0..4], now).is_empty());
        assert_eq!(session.next_chunk(), 1);
        assert_eq!(session.received_bytes(), 4);

        // stale request id
        assert!(session.on_chunk(99, 1, &image[4..8], now).is_empty());
        assert_eq!(session.received_bytes(), 4);
    }

    #[test]
    fn test_flipped_byte_fails_verification() {
        let image = image();
        let info = info_for(&image, "1.1");
        let mut corrupted = image.clone();
        corrupted[3] ^= 0xff;

        let mut session = FirmwareSession::new(16, Duration::from_secs(10), 3);
        let now = Instant::now();
        session.on_info(info, 1, now);
        let actions = session.on_chunk(1, 0, &corrupted, now);

        assert_eq!(session.state(), FirmwareState::Failed);
        assert_eq!(states(&actions), vec!["DOWNLOADED", "FAILED"]);
        assert!(!actions.iter().any(|a| matches!(a, FirmwareAction::Install { .. })));
    }

    #[test]
    fn test_unknown_algorithm_fails() {
        let image = image();
        let mut info = info_for(&image, "1.1");
        info.checksum_algorithm = "MURMUR3_128".to_string();

        let mut session = FirmwareSession::new(16, Duration::from_secs(10), 3);
        let now = Instant::now();
        session.on_info(info, 1, now);
        session.on_chunk(1, 0, &image, now);
        assert_eq!(session.state(), FirmwareState::Failed);
    }

    #[test]
    fn test_chunk_retry_budget() {
        let image = image();
        let mut session = FirmwareSession::new(4, Duration::from_secs(5), 2);
        let start = Instant::now();
        session.on_info(info_for(&image, "1.1"), 1, start);

        assert!(session.check_timeout(start + Duration::from_secs(1)).is_empty());

        let first = session.check_timeout(start + Duration::from_secs(5));
        assert_eq!(chunk_requests(&first)[0].0, "v2/fw/request/1/chunk/0");
        let second = session.check_timeout(start + Duration::from_secs(10));
        assert_eq!(chunk_requests(&second).len(), 1);

        let last = session.check_timeout(start + Duration::from_secs(15));
        assert_eq!(states(&last), vec!["FAILED"]);
        assert_eq!(session.state(), FirmwareState::Failed);
    }

    #[test]
    fn test_new_title_supersedes_session() {
        let image = image();
        let mut session = FirmwareSession::new(4, Duration::from_secs(10), 3);
        let now = Instant::now();
        session.on_info(info_for(&image, "1.1"), 1, now);

        let mut other = info_for(&image, "2.0");
        other.title = "other".to_string();
        let actions = session.on_info(other, 2, now);

        assert_eq!(states(&actions), vec!["FAILED", "DOWNLOADING"]);
        match &actions[0] {
            FirmwareAction::Report(v) => assert_eq!(v[fw_keys::ERROR], "superseded"),
            a => panic!("unexpected action {:?}", a),
        }
        assert_eq!(session.request_id(), 2);
        assert_eq!(session.state(), FirmwareState::Downloading);
    }

    #[test]
    fn test_same_version_is_not_downloaded() {
        let image = image();
        let mut session = FirmwareSession::new(4, Duration::from_secs(10), 3);
        session.set_current(CurrentFirmware {
            title: Some("fw".to_string()),
            version: Some("1.1".to_string()),
        });

        assert_eq!(session.begin_request().last(), Some(&FirmwareAction::RequestInfo));
        let actions = session.on_info(info_for(&image, "1.1"), 1, Instant::now());
        assert_eq!(actions, vec![unsubscribe()]);
        assert_eq!(session.state(), FirmwareState::Idle);
    }

    #[test]
    fn test_oversized_image_fails_without_download() {
        let image = image();
        let mut session = FirmwareSession::new(4, Duration::from_secs(10), 3).with_max_image_size(1024);
        let mut info = info_for(&image, "1.1");
        info.size = usize::MAX;

        let actions = session.on_info(info, 1, Instant::now());
        assert_eq!(states(&actions), vec!["FAILED"]);
        assert!(chunk_requests(&actions).is_empty());
        assert_eq!(session.state(), FirmwareState::Failed);
        assert!(session.last_error().unwrap_or_default().contains("limit is 1024"));
        assert_eq!(session.received_bytes(), 0);

        // a sane announcement afterwards still downloads
        let actions = session.on_info(info_for(&image, "1.2"), 2, Instant::now());
        assert_eq!(states(&actions), vec!["DOWNLOADING"]);
    }

    #[tokio::test]
    async fn test_file_installer_writes_image() {
        let dir = tempfile::tempdir().unwrap();
        let installer = FileInstaller::new(dir.path());
        let image = image();
        let info = info_for(&image, "1.1");

        installer.install(&info, &image).await.unwrap();
        assert_eq!(tokio::fs::read(dir.path().join("fw")).await.unwrap(), image);
    }

    #[test]
    fn test_file_installer_stays_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let installer = FileInstaller::new(dir.path());
        let mut info = info_for(&image(), "1.1");

        info.title = "/etc/x".to_string();
        assert_eq!(installer.path_for(&info).unwrap(), dir.path().join("x"));
        info.title = "../../escape".to_string();
        assert_eq!(installer.path_for(&info).unwrap(), dir.path().join("escape"));

        for bad in ["", "..", "/"] {
            info.title = bad.to_string();
            assert!(installer.path_for(&info).is_err(), "accepted {:?}", bad);
        }
    }
}
