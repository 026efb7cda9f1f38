//! Foreground state for the "download all pages" control.

use anyhow::{Result, bail};
use log::debug;

use crate::asset::Tier;
use crate::protocol::{Command, WorkerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadState {
    #[default]
    Idle,
    Downloading { downloaded: u32, total: u32, errors: u32 },
    Complete { downloaded: u32, total: u32, errors: u32 },
}

#[derive(Debug, Default)]
pub struct DownloadControl {
    state: DownloadState,
}

impl DownloadControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, DownloadState::Downloading { .. })
    }

    /// Begin a session. Re-running after completion is how failed pages
    /// are retried.
    pub fn start(&mut self, total_pages: u32, tier: Tier) -> Result<Command> {
        if self.is_busy() {
            bail!("a download is already in progress");
        }
        self.state = DownloadState::Downloading {
            downloaded: 0,
            total: total_pages,
            errors: 0,
        };
        Ok(Command::DownloadAll {
            total_pages: Some(total_pages),
            tier: Some(tier),
        })
    }

    /// Apply a worker message. Returns whether the state changed.
    pub fn handle(&mut self, msg: WorkerMessage) -> bool {
        let (downloaded, total, errors) = msg.counts();
        let next = match msg {
            WorkerMessage::DownloadProgress { .. } => {
                if matches!(self.state, DownloadState::Complete { .. }) {
                    debug!("control: progress after completion ignored");
                    return false;
                }
                DownloadState::Downloading { downloaded, total, errors }
            }
            WorkerMessage::DownloadComplete { .. } => {
                DownloadState::Complete { downloaded, total, errors }
            }
        };
        let changed = next != self.state;
        self.state = next;
        changed
    }

    pub fn status_line(&self) -> String {
        match self.state {
            DownloadState::Idle => "Download all pages for offline reading".to_string(),
            DownloadState::Downloading {
                downloaded,
                total,
                errors,
            } => {
                let done = downloaded + errors;
                let pct = if total == 0 {
                    100
                } else {
                    u64::from(done) * 100 / u64::from(total)
                };
                let mut line = format!("Downloading... {pct}% ({done}/{total})");
                if errors > 0 {
                    line.push_str(&format!(", {errors} failed"));
                }
                line
            }
            DownloadState::Complete {
                downloaded,
                total,
                errors: 0,
            } => format!("Downloaded {downloaded}/{total} pages"),
            DownloadState::Complete {
                downloaded,
                total,
                errors,
            } => format!(
                "Downloaded {downloaded}/{total} pages, {errors} failed. Run again to retry"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(downloaded: u32, total: u32, errors: u32) -> WorkerMessage {
        WorkerMessage::DownloadProgress { downloaded, total, errors }
    }

    fn complete(downloaded: u32, total: u32, errors: u32) -> WorkerMessage {
        WorkerMessage::DownloadComplete { downloaded, total, errors }
    }

    #[test]
    fn idle_to_complete() {
        let mut c = DownloadControl::new();
        assert_eq!(c.status_line(), "Download all pages for offline reading");
        let cmd = c.start(847, Tier::Medium).unwrap();
        assert_eq!(
            cmd,
            Command::DownloadAll { total_pages: Some(847), tier: Some(Tier::Medium) }
        );
        assert!(c.is_busy());
        assert!(c.handle(progress(420, 847, 0)));
        assert_eq!(c.status_line(), "Downloading... 49% (420/847)");
        assert!(c.handle(complete(847, 847, 0)));
        assert_eq!(c.status_line(), "Downloaded 847/847 pages");
    }

    #[test]
    fn cannot_start_twice() {
        let mut c = DownloadControl::new();
        c.start(10, Tier::Thumb).unwrap();
        assert!(c.start(10, Tier::Thumb).is_err());
    }

    #[test]
    fn errors_show_retry_hint_and_allow_rerun() {
        let mut c = DownloadControl::new();
        c.start(847, Tier::Medium).unwrap();
        c.handle(progress(400, 847, 1));
        assert_eq!(c.status_line(), "Downloading... 47% (401/847), 1 failed");
        c.handle(complete(846, 847, 1));
        assert!(c.status_line().contains("1 failed. Run again to retry"));
        assert!(c.start(847, Tier::Medium).is_ok());
    }

    #[test]
    fn late_progress_is_ignored() {
        let mut c = DownloadControl::new();
        c.start(20, Tier::Medium).unwrap();
        c.handle(complete(20, 20, 0));
        assert!(!c.handle(progress(10, 20, 0)));
        assert_eq!(c.state(), DownloadState::Complete { downloaded: 20, total: 20, errors: 0 });
    }

    #[test]
    fn zero_total_is_complete_percentage() {
        let mut c = DownloadControl::new();
        c.start(0, Tier::Medium).unwrap();
        assert_eq!(c.status_line(), "Downloading... 100% (0/0)");
    }
}
