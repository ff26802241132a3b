use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Name every download is offered under, whatever its type.
pub const DOWNLOAD_FILENAME: &str = "compressed_file";

/// In-memory handle to a compressed file the user can download.
#[derive(Clone)]
pub struct DownloadLink {
    url: String,
    mime_type: String,
    bytes: Arc<[u8]>,
}

impl DownloadLink {
    pub fn new(url: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        DownloadLink {
            url: url.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn filename(&self) -> &'static str {
        DOWNLOAD_FILENAME
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Writes the content to `dir/compressed_file`.
    pub fn save_into(&self, dir: impl AsRef<Path>) -> io::Result<PathBuf> {
        let path = dir.as_ref().join(DOWNLOAD_FILENAME);
        std::fs::write(&path, &self.bytes)?;
        Ok(path)
    }
}

impl PartialEq for DownloadLink {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl fmt::Debug for DownloadLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadLink")
            .field("url", &self.url)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Which of several in-flight submissions gets to update the state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SettlePolicy {
    /// Every completion is applied; the one finishing last is shown.
    #[default]
    LastCompleted,
    /// Completions of submissions superseded by a newer one are dropped.
    LastSubmitted,
}

/// Generation number handed out when a transform starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket(u64);

/// What the presentation layer renders.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct View {
    pub link: Option<DownloadLink>,
    pub error: Option<String>,
}

#[derive(Default)]
struct Slots {
    result: Option<DownloadLink>,
    error: String,
    submitted: u64,
}

impl Slots {
    fn set_result(&mut self, link: DownloadLink) {
        self.result = Some(link);
        self.error.clear();
    }

    fn set_error(&mut self, message: String, keep_result: bool) {
        if !keep_result {
            self.result = None;
        }
        self.error = message;
    }
}

/// The two UI-facing fields: the current download and the current error message.
#[derive(Default)]
pub struct IntakeState {
    slots: Mutex<Slots>,
}

impl IntakeState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn result(&self) -> Option<DownloadLink> {
        self.lock().result.clone()
    }

    /// Empty when no error is shown.
    pub fn error_message(&self) -> String {
        self.lock().error.clone()
    }

    pub fn view(&self) -> View {
        let slots = self.lock();
        View {
            link: slots.result.clone(),
            error: (!slots.error.is_empty()).then(|| slots.error.clone()),
        }
    }

    /// Shows `link` and clears the error.
    pub fn set_result(&self, link: DownloadLink) {
        self.lock().set_result(link);
    }

    /// Shows `message`; the current download is dropped unless `keep_result`.
    pub fn set_error(&self, message: impl Into<String>, keep_result: bool) {
        self.lock().set_error(message.into(), keep_result);
    }

    pub fn begin(&self) -> Ticket {
        let mut slots = self.lock();
        slots.submitted += 1;
        Ticket(slots.submitted)
    }

    /// Applies a completion unless `policy` says it is stale. Returns whether it was applied.
    pub fn settle_result(&self, ticket: Ticket, policy: SettlePolicy, link: DownloadLink) -> bool {
        let mut slots = self.lock();
        if is_stale(&slots, ticket, policy) {
            return false;
        }
        slots.set_result(link);
        true
    }

    pub fn settle_error(
        &self,
        ticket: Ticket,
        policy: SettlePolicy,
        message: impl Into<String>,
        keep_result: bool,
    ) -> bool {
        let mut slots = self.lock();
        if is_stale(&slots, ticket, policy) {
            return false;
        }
        slots.set_error(message.into(), keep_result);
        true
    }
}

fn is_stale(slots: &Slots, ticket: Ticket, policy: SettlePolicy) -> bool {
    let stale = policy == SettlePolicy::LastSubmitted && ticket.0 != slots.submitted;
    if stale {
        log::debug!(
            "dropping completion of submission {} (latest is {})",
            ticket.0,
            slots.submitted
        );
    }
    stale
}

impl fmt::Debug for IntakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntakeState")
            .field("view", &self.view())
            .finish()
    }
}
