//! Sender allowlist + pairing-code store.
//!
//! Two JSON files under the data directory: `senders.json` (approved
//! senders) and `pairing-codes.json` (outstanding codes). Both are small and
//! rewritten whole under a single lock. Expired codes are dropped lazily on
//! read and on approval.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

use rand::RngCore;
use tracing::{info, warn};

use haya_core::config::SenderAuthMode;

use crate::error::{Result, SenderError};
use crate::types::{ApprovedSender, PairingCode, SenderDecision};

/// Pairing codes live for ten minutes.
const CODE_TTL_MS: i64 = 10 * 60 * 1000;

pub struct SenderStore {
    mode: SenderAuthMode,
    senders_path: PathBuf,
    codes_path: PathBuf,
    lock: Mutex<()>,
}

impl SenderStore {
    pub fn new(mode: SenderAuthMode, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = data_dir.into();
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        Ok(Self {
            mode,
            senders_path: dir.join("senders.json"),
            codes_path: dir.join("pairing-codes.json"),
            lock: Mutex::new(()),
        })
    }

    pub fn mode(&self) -> SenderAuthMode {
        self.mode
    }

    /// Decide what to do with an inbound sender.
    ///
    /// Open mode accepts everyone. Allowlist accepts only registered
    /// senders. Pairing issues a fresh code for unknown senders; any
    /// still-unexpired code for the same sender remains valid alongside it.
    pub fn check(
        &self,
        channel: &str,
        sender_id: &str,
        sender_name: Option<&str>,
    ) -> Result<SenderDecision> {
        match self.mode {
            SenderAuthMode::Open => Ok(SenderDecision::Allowed),
            SenderAuthMode::Allowlist => {
                if self.is_approved(channel, sender_id)? {
                    Ok(SenderDecision::Allowed)
                } else {
                    Ok(SenderDecision::Denied)
                }
            }
            SenderAuthMode::Pairing => {
                if self.is_approved(channel, sender_id)? {
                    return Ok(SenderDecision::Allowed);
                }
                let code = self.issue_code(channel, sender_id, sender_name)?;
                Ok(SenderDecision::PairingRequired { code })
            }
        }
    }

    fn is_approved(&self, channel: &str, sender_id: &str) -> Result<bool> {
        let senders = self.load_senders()?;
        Ok(senders
            .iter()
            .any(|s| s.channel == channel && s.sender_id == sender_id))
    }

    fn issue_code(
        &self,
        channel: &str,
        sender_id: &str,
        sender_name: Option<&str>,
    ) -> Result<String> {
        let _guard = self.lock.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();

        let mut codes = self.load_codes()?;
        codes.retain(|c| !c.is_expired(now));

        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        let code = hex::encode(bytes);

        codes.push(PairingCode {
            code: code.clone(),
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.map(String::from),
            created_at: now,
            expires_at: now + CODE_TTL_MS,
        });
        self.save_codes(&codes)?;
        info!(channel, sender = sender_id, "pairing code issued");
        Ok(code)
    }

    /// Admin approval: consume the matched code and append its sender to the
    /// allowlist. Unknown or expired codes are a typed error.
    pub fn approve(&self, code: &str) -> Result<ApprovedSender> {
        let _guard = self.lock.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();

        let mut codes = self.load_codes()?;
        codes.retain(|c| !c.is_expired(now));

        let idx = codes
            .iter()
            .position(|c| c.code == code)
            .ok_or_else(|| SenderError::CodeNotFound(code.to_string()))?;
        let matched = codes.remove(idx);
        self.save_codes(&codes)?;

        let approved = ApprovedSender {
            channel: matched.channel,
            sender_id: matched.sender_id,
            sender_name: matched.sender_name,
            approved_at: now,
        };
        let mut senders = self.load_senders()?;
        let duplicate = senders
            .iter()
            .any(|s| s.channel == approved.channel && s.sender_id == approved.sender_id);
        if !duplicate {
            senders.push(approved.clone());
            self.save_senders(&senders)?;
        }
        info!(channel = %approved.channel, sender = %approved.sender_id, "sender approved");
        Ok(approved)
    }

    pub fn list_approved(&self) -> Result<Vec<ApprovedSender>> {
        self.load_senders()
    }

    // --- file helpers ------------------------------------------------------

    fn load_senders(&self) -> Result<Vec<ApprovedSender>> {
        load_json(&self.senders_path)
    }

    fn save_senders(&self, senders: &[ApprovedSender]) -> Result<()> {
        save_json(&self.senders_path, senders)
    }

    fn load_codes(&self) -> Result<Vec<PairingCode>> {
        load_json(&self.codes_path)
    }

    fn save_codes(&self, codes: &[PairingCode]) -> Result<()> {
        save_json(&self.codes_path, codes)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<Vec<T>> {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "sender file unreadable, starting empty");
                Ok(Vec::new())
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn save_json<T: serde::Serialize>(path: &PathBuf, value: &[T]) -> Result<()> {
    let existed = path.exists();
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    if !existed {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(mode: SenderAuthMode) -> (tempfile::TempDir, SenderStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SenderStore::new(mode, dir.path().join("data")).unwrap();
        (dir, store)
    }

    #[test]
    fn open_mode_allows_everyone() {
        let (_dir, store) = store(SenderAuthMode::Open);
        let decision = store.check("telegram", "u1", None).unwrap();
        assert_eq!(decision, SenderDecision::Allowed);
    }

    #[test]
    fn allowlist_denies_unknown() {
        let (_dir, store) = store(SenderAuthMode::Allowlist);
        assert_eq!(
            store.check("telegram", "u1", None).unwrap(),
            SenderDecision::Denied
        );
    }

    #[test]
    fn pairing_flow_end_to_end() {
        let (_dir, store) = store(SenderAuthMode::Pairing);

        let code = match store.check("discord", "u7", Some("Sam")).unwrap() {
            SenderDecision::PairingRequired { code } => code,
            other => panic!("expected pairing, got {other:?}"),
        };
        assert_eq!(code.len(), 8);

        let approved = store.approve(&code).unwrap();
        assert_eq!(approved.sender_id, "u7");

        // Same sender is now allowed without a new code.
        assert_eq!(
            store.check("discord", "u7", None).unwrap(),
            SenderDecision::Allowed
        );
    }

    #[test]
    fn multiple_unexpired_codes_all_work() {
        let (_dir, store) = store(SenderAuthMode::Pairing);
        let c1 = match store.check("slack", "u1", None).unwrap() {
            SenderDecision::PairingRequired { code } => code,
            _ => unreachable!(),
        };
        let c2 = match store.check("slack", "u1", None).unwrap() {
            SenderDecision::PairingRequired { code } => code,
            _ => unreachable!(),
        };
        assert_ne!(c1, c2);
        // The older code still approves.
        assert!(store.approve(&c1).is_ok());
    }

    #[test]
    fn unknown_code_is_not_found() {
        let (_dir, store) = store(SenderAuthMode::Pairing);
        assert!(matches!(
            store.approve("deadbeef"),
            Err(SenderError::CodeNotFound(_))
        ));
    }
}
