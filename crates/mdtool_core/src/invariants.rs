use anyhow::Result;
use chrono::{Local, NaiveDate};
use serde_yaml::{Mapping, Value};
use uuid::Uuid;

use crate::filesystem::content_digest;
use crate::frontmatter::{get_str, key, render_mapping, scalar_text};

pub const UID_KEY: &str = "uid";
pub const ALIASES_KEY: &str = "aliases";
pub const FINGERPRINT_KEY: &str = "fingerprint";
pub const LASTMOD_KEY: &str = "lastmod";
pub const UID_ALIAS_PREFIX: &str = "/_uid/";
pub const LASTMOD_FORMAT: &str = "%Y-%m-%d";

const VOLATILE_KEYS: &[&str] = &[FINGERPRINT_KEY, LASTMOD_KEY, UID_KEY, ALIASES_KEY];

pub trait Clock {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UidState {
    Missing,
    Valid(String),
    /// Present but not a UUID. Kept verbatim: stability outranks correctness.
    Malformed(String),
}

pub fn uid_state(mapping: &Mapping) -> UidState {
    match mapping.get(key(UID_KEY)) {
        None | Some(Value::Null) => UidState::Missing,
        Some(Value::String(text)) if Uuid::parse_str(text.trim()).is_ok() => {
            UidState::Valid(text.clone())
        }
        Some(other) => UidState::Malformed(scalar_text(other)),
    }
}

pub fn alias_for(uid: &str) -> String {
    format!("{UID_ALIAS_PREFIX}{}/", uid.trim())
}

pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

pub fn ensure_uid(mapping: &mut Mapping, generate: impl FnOnce() -> String) -> Option<String> {
    if uid_state(mapping) != UidState::Missing {
        return None;
    }
    let uid = generate();
    mapping.insert(key(UID_KEY), Value::String(uid.clone()));
    ensure_alias(mapping, &uid);
    Some(uid)
}

pub fn has_alias(mapping: &Mapping, uid: &str) -> bool {
    let wanted = alias_for(uid);
    match mapping.get(key(ALIASES_KEY)) {
        Some(Value::String(alias)) => alias == &wanted,
        Some(Value::Sequence(items)) => items
            .iter()
            .any(|item| item.as_str() == Some(wanted.as_str())),
        _ => false,
    }
}

/// Add the `/_uid/<uid>/` alias without disturbing other aliases.
pub fn ensure_alias(mapping: &mut Mapping, uid: &str) -> bool {
    if has_alias(mapping, uid) {
        return false;
    }
    let alias = Value::String(alias_for(uid));
    let aliases_key = key(ALIASES_KEY);
    if let Some(existing) = mapping.get_mut(&aliases_key) {
        if let Value::Sequence(items) = existing {
            items.push(alias);
        } else {
            let previous = std::mem::replace(existing, Value::Null);
            *existing = if previous.is_null() {
                Value::Sequence(vec![alias])
            } else {
                Value::Sequence(vec![previous, alias])
            };
        }
    } else {
        mapping.insert(aliases_key, Value::Sequence(vec![alias]));
    }
    true
}

/// Hash of the frontmatter minus volatile keys, followed by the raw body.
pub fn compute_fingerprint(mapping: &Mapping, body: &str) -> Result<String> {
    // Filter by iteration so the remaining keys keep their order.
    let content: Mapping = mapping
        .iter()
        .filter(|(name, _)| {
            !name
                .as_str()
                .is_some_and(|name| VOLATILE_KEYS.contains(&name))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let serialized = render_mapping(&content)?;
    let mut payload = String::with_capacity(serialized.len() + body.len() + 8);
    payload.push_str(&serialized);
    payload.push_str("\n---\n");
    payload.push_str(body);
    Ok(content_digest(payload.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintChange {
    pub previous: Option<String>,
    pub fingerprint: String,
    pub lastmod: String,
}

pub fn stored_fingerprint(mapping: &Mapping) -> Option<&str> {
    get_str(mapping, FINGERPRINT_KEY)
}

pub fn refresh_fingerprint(
    mapping: &mut Mapping,
    body: &str,
    clock: &dyn Clock,
) -> Result<Option<FingerprintChange>> {
    let fingerprint = compute_fingerprint(mapping, body)?;
    let previous = stored_fingerprint(mapping).map(ToString::to_string);
    if previous.as_deref() == Some(fingerprint.as_str()) {
        return Ok(None);
    }
    let lastmod = clock.today().format(LASTMOD_FORMAT).to_string();
    mapping.insert(key(FINGERPRINT_KEY), Value::String(fingerprint.clone()));
    mapping.insert(key(LASTMOD_KEY), Value::String(lastmod.clone()));
    Ok(Some(FingerprintChange {
        previous,
        fingerprint,
        lastmod,
    }))
}
