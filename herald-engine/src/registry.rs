//! Recipient registry.
//!
//! Stamped on every SMTP acceptance so accounting rows that carry nothing
//! but a recipient address can still find their job.

use ahash::AHashMap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub job_id: String,
    pub campaign_id: String,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

#[derive(Debug, Default)]
pub struct RecipientRegistry {
    /// recipient → entries, most recent job last.
    by_recipient: DashMap<String, Vec<RegistryEntry>>,
    /// job → recipient → entry, for persistence and deletion.
    by_job: DashMap<String, AHashMap<String, RegistryEntry>>,
}

impl RecipientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one acceptance.
    pub fn record(&self, job_id: &str, campaign_id: &str, recipient: &str) {
        let now = chrono::Utc::now().timestamp();

        let mut per_job = self.by_job.entry(job_id.to_string()).or_default();
        per_job
            .entry(recipient.to_string())
            .and_modify(|entry| entry.last_seen_at = now)
            .or_insert_with(|| RegistryEntry {
                job_id: job_id.to_string(),
                campaign_id: campaign_id.to_string(),
                first_seen_at: now,
                last_seen_at: now,
            });
        drop(per_job);

        let mut entries = self.by_recipient.entry(recipient.to_string()).or_default();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.job_id == job_id) {
            entry.last_seen_at = now;
        } else {
            entries.push(RegistryEntry {
                job_id: job_id.to_string(),
                campaign_id: campaign_id.to_string(),
                first_seen_at: now,
                last_seen_at: now,
            });
        }
    }

    /// Candidate jobs for a bare recipient address, most recent first.
    #[must_use]
    pub fn candidates(&self, recipient: &str) -> Vec<RegistryEntry> {
        self.by_recipient
            .get(recipient)
            .map(|entries| {
                let mut entries = entries.clone();
                entries.reverse();
                entries
            })
            .unwrap_or_default()
    }

    /// All entries for one job (persistence).
    #[must_use]
    pub fn entries_for_job(&self, job_id: &str) -> AHashMap<String, RegistryEntry> {
        self.by_job
            .get(job_id)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Seed entries for one job (rehydration).
    pub fn load(&self, job_id: &str, entries: AHashMap<String, RegistryEntry>) {
        for (recipient, entry) in &entries {
            let mut per_recipient = self.by_recipient.entry(recipient.clone()).or_default();
            if !per_recipient.iter().any(|e| e.job_id == entry.job_id) {
                per_recipient.push(entry.clone());
            }
        }
        self.by_job.insert(job_id.to_string(), entries);
    }

    /// Remove every entry for one job (job deletion).
    pub fn remove_job(&self, job_id: &str) {
        if let Some((_, entries)) = self.by_job.remove(job_id) {
            for recipient in entries.keys() {
                if let Some(mut per_recipient) = self.by_recipient.get_mut(recipient) {
                    per_recipient.retain(|entry| entry.job_id != job_id);
                }
            }
        }
    }
}
