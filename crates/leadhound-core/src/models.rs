use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::util::normalize_url;

/// One extracted record for a target entity.
///
/// Extractors are site-specific, so a lead is an open JSON object rather
/// than a fixed struct.
pub type Lead = serde_json::Value;

/// Returns true if the lead carries a non-empty value for `field`.
///
/// `null`, empty strings and empty arrays/objects count as missing.
pub fn lead_has_field(lead: &Lead, field: &str) -> bool {
    match lead.get(field) {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
        Some(serde_json::Value::Array(a)) => !a.is_empty(),
        Some(serde_json::Value::Object(o)) => !o.is_empty(),
        Some(_) => true,
    }
}

/// Smallest schedulable item in the producer/worker queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// URL or site-specific identifier handed to the extractor.
    pub target: String,
    /// Identity used for deduplication within a job.
    pub dedup_key: String,
}

impl WorkUnit {
    pub fn new(target: impl Into<String>, dedup_key: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            dedup_key: dedup_key.into(),
        }
    }

    /// Unit keyed by the SHA-256 of the normalized URL, so trivially
    /// different spellings of the same page dedup together.
    pub fn from_url(url: &str) -> Self {
        let key_source = normalize_url(url).unwrap_or_else(|| url.trim().to_string());
        Self {
            target: url.trim().to_string(),
            dedup_key: compute_hash(&key_source),
        }
    }
}

/// Contact fields the site investigator knows how to fill in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadField {
    Email,
    Phone,
    Handle,
    RegistryId,
}

impl LeadField {
    pub const ALL: [LeadField; 4] = [
        LeadField::Email,
        LeadField::Phone,
        LeadField::Handle,
        LeadField::RegistryId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadField::Email => "email",
            LeadField::Phone => "phone",
            LeadField::Handle => "handle",
            LeadField::RegistryId => "registry_id",
        }
    }
}

impl fmt::Display for LeadField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LeadField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "email" => Ok(LeadField::Email),
            "phone" => Ok(LeadField::Phone),
            "handle" | "instagram" | "social" => Ok(LeadField::Handle),
            "registry_id" | "registry" | "cnpj" => Ok(LeadField::RegistryId),
            _ => Err(format!("Unknown lead field: {}", s)),
        }
    }
}

pub type FieldSet = BTreeSet<LeadField>;

/// Partial contact record assembled by one investigation call tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestigationResult {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub handle: Option<String>,
    pub registry_id: Option<String>,
    pub phones: Vec<String>,
    pub links: Vec<String>,
}

impl InvestigationResult {
    pub fn get(&self, field: LeadField) -> Option<&str> {
        match field {
            LeadField::Email => self.email.as_deref(),
            LeadField::Phone => self.phone.as_deref(),
            LeadField::Handle => self.handle.as_deref(),
            LeadField::RegistryId => self.registry_id.as_deref(),
        }
    }

    /// Sets `field` unless it already holds a value. First found wins.
    pub fn set_if_empty(&mut self, field: LeadField, value: impl Into<String>) -> bool {
        let slot = match field {
            LeadField::Email => &mut self.email,
            LeadField::Phone => &mut self.phone,
            LeadField::Handle => &mut self.handle,
            LeadField::RegistryId => &mut self.registry_id,
        };
        if slot.is_some() {
            return false;
        }
        let value = value.into();
        if value.is_empty() {
            return false;
        }
        *slot = Some(value);
        true
    }

    pub fn add_phone(&mut self, phone: impl Into<String>) {
        let phone = phone.into();
        if phone.is_empty() {
            return;
        }
        if !self.phones.contains(&phone) {
            self.phones.push(phone.clone());
        }
        self.set_if_empty(LeadField::Phone, phone);
    }

    pub fn add_link(&mut self, link: impl Into<String>) {
        let link = link.into();
        if !self.links.contains(&link) {
            self.links.push(link);
        }
    }

    /// Fields of `wanted` that are still empty.
    pub fn missing(&self, wanted: &FieldSet) -> FieldSet {
        wanted
            .iter()
            .copied()
            .filter(|f| self.get(*f).is_none())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        LeadField::ALL.iter().all(|f| self.get(*f).is_none())
            && self.phones.is_empty()
            && self.links.is_empty()
    }

    /// Merges a child result: scalars keep the first value found, lists union.
    pub fn merge(&mut self, other: InvestigationResult) {
        for field in LeadField::ALL {
            if let Some(value) = other.get(field) {
                let value = value.to_string();
                self.set_if_empty(field, value);
            }
        }
        for phone in other.phones {
            self.add_phone(phone);
        }
        for link in other.links {
            self.add_link(link);
        }
    }
}

/// A cookie handed to a page session, typically supplied by an operator
/// after an interactive login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line of a job's log, kept for observers and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_work_unit_dedup_key_ignores_cosmetic_differences() {
        let a = WorkUnit::from_url("https://www.Biz.example/contact/#top");
        let b = WorkUnit::from_url("https://biz.example/contact");
        assert_eq!(a.dedup_key, b.dedup_key);
        assert_ne!(a.target, b.target);
    }

    #[test]
    fn test_lead_has_field() {
        let lead = serde_json::json!({
            "email": "a@b.example",
            "phone": "",
            "tags": [],
            "rating": 4.5,
            "owner": null
        });
        assert!(lead_has_field(&lead, "email"));
        assert!(lead_has_field(&lead, "rating"));
        assert!(!lead_has_field(&lead, "phone"));
        assert!(!lead_has_field(&lead, "tags"));
        assert!(!lead_has_field(&lead, "owner"));
        assert!(!lead_has_field(&lead, "website"));
    }

    #[test]
    fn test_merge_first_found_wins_and_lists_union() {
        let mut parent = InvestigationResult {
            email: Some("first@biz.example".into()),
            ..Default::default()
        };
        parent.add_phone("+55 11 4000-0000");

        let mut child = InvestigationResult {
            email: Some("second@biz.example".into()),
            handle: Some("bizhandle".into()),
            ..Default::default()
        };
        child.add_phone("+55 11 4000-0000");
        child.add_phone("+55 11 98888-7777");
        child.add_link("https://linktr.ee/biz");

        parent.merge(child);

        assert_eq!(parent.email.as_deref(), Some("first@biz.example"));
        assert_eq!(parent.handle.as_deref(), Some("bizhandle"));
        assert_eq!(parent.phone.as_deref(), Some("+55 11 4000-0000"));
        assert_eq!(parent.phones.len(), 2);
        assert_eq!(parent.links, vec!["https://linktr.ee/biz".to_string()]);
    }

    #[test]
    fn test_missing_fields() {
        let wanted: FieldSet = [LeadField::Email, LeadField::Phone].into_iter().collect();
        let mut result = InvestigationResult::default();
        assert_eq!(result.missing(&wanted), wanted);
        result.set_if_empty(LeadField::Phone, "123");
        let still: FieldSet = [LeadField::Email].into_iter().collect();
        assert_eq!(result.missing(&wanted), still);
    }

    #[test]
    fn test_lead_field_parse() {
        assert_eq!("Email".parse::<LeadField>().unwrap(), LeadField::Email);
        assert_eq!("cnpj".parse::<LeadField>().unwrap(), LeadField::RegistryId);
        assert!("fax".parse::<LeadField>().is_err());
    }
}
