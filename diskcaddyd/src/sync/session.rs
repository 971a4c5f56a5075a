use std::time::{Duration, Instant};

use diskcaddy_core::{DiskRef, Hello};

/// How long SUCCESS, ERROR and transient labels stay on screen.
pub const OVERLAY_DURATION: Duration = Duration::from_millis(5000);

pub const UPLOAD_FAIL_LABEL: &str = "UPLOAD FAIL";
pub const EXPORT_FAIL_LABEL: &str = "EXPORT FAIL";
pub const FILE_ERROR_LABEL: &str = "FILE ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Searching,
    Ready,
    Uploading,
    WaitingForReconnect,
}

#[derive(Debug, Clone)]
struct TransientLabel {
    text: String,
    until: Instant,
}

/// Device-reported set of disks modified since the last sync.
#[derive(Debug, Clone, Default)]
pub struct DirtyDisks {
    pub id: u64,
    pub count: u32,
    pub items: Vec<DiskRef>,
    /// Identifier the cached `items` were listed for; 0 when none.
    pub list_id: u64,
    pub fetch_in_flight: bool,
    pub dismissed_id: u64,
    pub prompt_visible: bool,
}

/// Readiness and transaction flags of one device session.
///
/// `uploading` and `waiting_for_reconnect` never hold together, and `ready`
/// is false while either does.
#[derive(Debug, Clone, Default)]
pub struct SyncSession {
    nonce: u64,
    ready: bool,
    uploading: bool,
    waiting_for_reconnect: bool,
    waiting_since: Option<Instant>,
    error_until: Option<Instant>,
    success_until: Option<Instant>,
    transient: Option<TransientLabel>,
    hello_in_flight: bool,
    dirty: DirtyDisks,
}

impl SyncSession {
    pub fn state(&self) -> SyncState {
        if self.uploading {
            SyncState::Uploading
        } else if self.waiting_for_reconnect {
            SyncState::WaitingForReconnect
        } else if self.ready {
            SyncState::Ready
        } else {
            SyncState::Searching
        }
    }

    /// Claims the poll slot. False while uploading or while a poll is in flight.
    pub fn begin_poll(&mut self) -> bool {
        if self.uploading || self.hello_in_flight {
            return false;
        }
        self.hello_in_flight = true;
        true
    }

    /// Applies a successful hello. Returns the dirty-set identifier whose
    /// listing should be fetched now, if any.
    pub fn finish_poll(&mut self, hello: &Hello, now: Instant, grace: Duration) -> Option<u64> {
        self.hello_in_flight = false;
        self.nonce = hello.nonce;
        let fetch = self.apply_dirty_state(hello);

        // An upload owns readiness until it finishes.
        if !self.uploading {
            if self.waiting_for_reconnect {
                let elapsed = self
                    .waiting_since
                    .map(|since| now.saturating_duration_since(since))
                    .unwrap_or(grace);
                if elapsed >= grace {
                    self.waiting_for_reconnect = false;
                    self.waiting_since = None;
                    self.ready = true;
                } else {
                    self.ready = false;
                }
            } else {
                self.ready = true;
            }
        }
        fetch
    }

    pub fn fail_poll(&mut self) {
        self.hello_in_flight = false;
        self.ready = false;
    }

    fn apply_dirty_state(&mut self, hello: &Hello) -> Option<u64> {
        let dirty = &mut self.dirty;
        if hello.modified_count == 0 {
            let fetch_in_flight = dirty.fetch_in_flight;
            *dirty = DirtyDisks {
                fetch_in_flight,
                ..DirtyDisks::default()
            };
            return None;
        }

        dirty.count = hello.modified_count;
        if hello.modified_id != dirty.id {
            dirty.id = hello.modified_id;
            dirty.items.clear();
            dirty.list_id = 0;
            dirty.dismissed_id = 0;
        }
        if dirty.dismissed_id != dirty.id {
            dirty.prompt_visible = true;
        }
        if dirty.list_id != dirty.id && !dirty.fetch_in_flight {
            dirty.fetch_in_flight = true;
            return Some(dirty.id);
        }
        None
    }

    /// Stores the outcome of a `/modified/list` fetch started for `requested_id`.
    pub fn finish_modified_fetch(&mut self, requested_id: u64, files: Option<Vec<DiskRef>>) {
        let dirty = &mut self.dirty;
        dirty.fetch_in_flight = false;
        match files {
            Some(files) if requested_id == dirty.id => {
                dirty.items = files;
                dirty.list_id = requested_id;
            }
            // The identifier moved on meanwhile; the next poll lists again.
            Some(_) => {}
            None => {
                dirty.items.clear();
                dirty.list_id = 0;
            }
        }
    }

    pub fn dismiss_dirty_prompt(&mut self) {
        self.dirty.prompt_visible = false;
        self.dirty.dismissed_id = self.dirty.id;
    }

    /// Enters `Uploading` and returns the nonce scoping the transaction.
    pub fn begin_upload(&mut self) -> Option<u64> {
        if !self.ready || self.uploading {
            return None;
        }
        self.uploading = true;
        self.ready = false;
        Some(self.nonce)
    }

    pub fn finish_upload(&mut self, committed: bool, now: Instant) {
        self.uploading = false;
        if committed {
            self.success_until = Some(now + OVERLAY_DURATION);
            self.waiting_for_reconnect = true;
            self.waiting_since = Some(now);
            self.ready = false;
        } else {
            self.mark_error(UPLOAD_FAIL_LABEL, now);
        }
    }

    pub fn mark_error(&mut self, label: &str, now: Instant) {
        self.error_until = Some(now + OVERLAY_DURATION);
        self.set_transient(label, now);
    }

    pub fn set_transient(&mut self, text: &str, now: Instant) {
        let text = text.trim().to_uppercase();
        if text.is_empty() {
            return;
        }
        self.transient = Some(TransientLabel {
            text,
            until: now + OVERLAY_DURATION,
        });
    }

    /// Drops expired overlays.
    pub fn expire(&mut self, now: Instant) {
        if self.transient.as_ref().is_some_and(|t| t.until <= now) {
            self.transient = None;
        }
        if self.error_until.is_some_and(|until| until <= now) {
            self.error_until = None;
        }
        if self.success_until.is_some_and(|until| until <= now) {
            self.success_until = None;
        }
    }

    pub fn status_label(&self, now: Instant) -> String {
        if let Some(transient) = self.transient.as_ref().filter(|t| t.until > now) {
            return transient.text.clone();
        }
        let label = if self.error_until.is_some_and(|until| until > now) {
            "ERROR"
        } else if self.success_until.is_some_and(|until| until > now) {
            "SUCCESS"
        } else {
            match self.state() {
                SyncState::Uploading => "SENDING",
                SyncState::Ready => "READY",
                SyncState::WaitingForReconnect | SyncState::Searching => "SEARCHING",
            }
        };
        label.to_string()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading
    }

    pub fn is_waiting_for_reconnect(&self) -> bool {
        self.waiting_for_reconnect
    }

    pub fn dirty(&self) -> &DirtyDisks {
        &self.dirty
    }

    #[cfg(test)]
    pub(crate) fn force_uploading(&mut self) {
        self.uploading = true;
        self.ready = false;
    }
}
