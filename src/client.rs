use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::message::MessageRecord;

/// Opaque mailbox message identifier.
pub type MessageId = String;

/// Transport-level failures. These are the only errors that propagate out of
/// metric resolution; decode and parse problems are handled where they occur.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("mailbox unavailable: {0}")]
    Connect(String),
    #[error("search rejected: {0}")]
    Search(String),
    #[error("fetch failed for message {id}: {reason}")]
    Fetch { id: String, reason: String },
}

/// Minimal mailbox capability the engine consumes: search by sender/date/subject
/// and fetch a raw message by id. Implementations are blocking and fallible.
pub trait MailClient {
    /// Return ids of messages from any of `addresses`, received on or after
    /// `since`, optionally filtered by a subject substring.
    fn search(
        &self,
        addresses: &[String],
        since: NaiveDate,
        subject: Option<&str>,
    ) -> Result<Vec<MessageId>, MailError>;

    /// Return the raw RFC822 content of one message.
    fn fetch(&self, id: &MessageId) -> Result<Vec<u8>, MailError>;
}

/// Mail client backed by a directory of `.eml` files. Used by the CLI for
/// offline evaluation and by integration tests; search filters on the
/// From/Date/Subject headers the way an IMAP FROM/SINCE/SUBJECT search would.
#[derive(Debug)]
pub struct FileMailClient {
    dir: PathBuf,
}

impl FileMailClient {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, MailError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(MailError::Connect(format!(
                "not a directory: {}",
                dir.display()
            )));
        }
        Ok(FileMailClient { dir })
    }

    fn entries(&self) -> Result<Vec<PathBuf>, MailError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(|e| MailError::Search(e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "eml").unwrap_or(false))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

impl MailClient for FileMailClient {
    fn search(
        &self,
        addresses: &[String],
        since: NaiveDate,
        subject: Option<&str>,
    ) -> Result<Vec<MessageId>, MailError> {
        let mut ids = Vec::new();

        for path in self.entries()? {
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    log::debug!("Skipping unreadable file {}: {}", path.display(), e);
                    continue;
                }
            };
            let record = MessageRecord::parse(&raw);

            let from_lower = record.from.to_lowercase();
            if !addresses
                .iter()
                .any(|a| from_lower.contains(&a.to_lowercase()))
            {
                continue;
            }

            // Messages without a parseable Date header are kept; the search
            // date is a lower bound, not a validity check.
            if let Some(date) = record.date {
                if date < since {
                    continue;
                }
            }

            if let Some(filter) = subject {
                if !record
                    .subject
                    .to_lowercase()
                    .contains(&filter.to_lowercase())
                {
                    continue;
                }
            }

            let id = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            ids.push(id);
        }

        log::debug!(
            "File search from {:?} since {} subject {:?}: {} message(s)",
            addresses,
            crate::dates::format_search_date(since),
            subject,
            ids.len()
        );
        Ok(ids)
    }

    fn fetch(&self, id: &MessageId) -> Result<Vec<u8>, MailError> {
        fs::read(self.dir.join(id)).map_err(|e| MailError::Fetch {
            id: id.clone(),
            reason: e.to_string(),
        })
    }
}
