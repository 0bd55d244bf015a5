//! Cookie jar backing every upstream session.
//!
//! Records carry the full attribute set persisted in the Credential Store, so
//! the jar can be snapshotted and rebuilt without losing creation or access
//! times. The jar plugs into reqwest through [`reqwest::cookie::CookieStore`].

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use reqwest::Url;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};

/// Cookie holding the anti-forgery token.
pub const CSRF_COOKIE: &str = "kl_csrftoken";

/// One cookie with the attributes kept across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub key: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// `None` is a session cookie, written as `"Infinity"`.
    #[serde(default, with = "expiry")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
    #[serde(default)]
    pub host_only: bool,
    #[serde(default = "Utc::now")]
    pub creation: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
}

fn default_path() -> String {
    "/".to_string()
}

impl StoredCookie {
    /// Build a host-only session cookie for `host`.
    pub fn new(key: impl Into<String>, value: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            domain: host.into().to_ascii_lowercase(),
            path: default_path(),
            expires: None,
            http_only: false,
            secure: false,
            same_site: None,
            host_only: true,
            creation: Utc::now(),
            last_accessed: None,
        }
    }

    /// Parse a `Set-Cookie` header received from `url`.
    ///
    /// Returns `None` for malformed headers and for `Domain` attributes the
    /// request host is not allowed to set.
    pub fn from_set_cookie(header: &str, url: &Url, now: DateTime<Utc>) -> Option<Self> {
        let parsed = cookie::Cookie::parse(header.to_string()).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();

        let (domain, host_only) = match parsed
            .domain()
            .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
        {
            Some(domain) => {
                if !domain_matches(&host, &domain) {
                    tracing::debug!(host = %host, domain = %domain, "rejecting cookie for foreign domain");
                    return None;
                }
                (domain, false)
            }
            None => (host, true),
        };

        let path = match parsed.path() {
            Some(p) if p.starts_with('/') => p.to_string(),
            _ => default_cookie_path(url),
        };

        let expires = match parsed.max_age() {
            Some(max_age) => Some(
                TimeDelta::try_seconds(max_age.whole_seconds())
                    .and_then(|delta| now.checked_add_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            ),
            None => parsed
                .expires_datetime()
                .and_then(|t| DateTime::from_timestamp(t.unix_timestamp(), 0)),
        };

        Some(Self {
            key: parsed.name().to_string(),
            value: parsed.value().to_string(),
            domain,
            path,
            expires,
            http_only: parsed.http_only().unwrap_or(false),
            secure: parsed.secure().unwrap_or(false),
            same_site: parsed.same_site().map(|s| s.to_string().to_ascii_lowercase()),
            host_only,
            creation: now,
            last_accessed: None,
        })
    }

    /// Identity triple: at most one record per `(key, domain, path)`.
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.key, &self.domain, &self.path)
    }

    /// Whether the cookie has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e <= now)
    }

    /// Whether this cookie belongs to `domain` or one of its subdomains.
    pub fn belongs_to(&self, domain: &str) -> bool {
        domain_matches(&self.domain, &domain.trim_start_matches('.').to_ascii_lowercase())
    }

    /// Whether the cookie should be sent with a request to `url`.
    pub fn matches(&self, url: &Url, now: DateTime<Utc>) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };

        domain_ok
            && path_matches(url.path(), &self.path)
            && (!self.secure || url.scheme() == "https")
            && !self.is_expired(now)
    }

    fn observed_at(&self) -> DateTime<Utc> {
        self.last_accessed.unwrap_or(self.creation)
    }
}

/// RFC 6265 domain match: `host` equals `domain` or is a subdomain of it.
fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// RFC 6265 path match.
fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// RFC 6265 default-path: the directory of the request path.
fn default_cookie_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Keep one record per `(key, domain, path)`, the most recently observed.
///
/// Observation time is `lastAccessed`, falling back to `creation`; on a tie
/// the later record in the input wins. Output keeps first-seen order.
pub fn dedup_latest<I>(records: I) -> Vec<StoredCookie>
where
    I: IntoIterator<Item = StoredCookie>,
{
    let mut out: Vec<StoredCookie> = Vec::new();
    let mut index: HashMap<(String, String, String), usize> = HashMap::new();

    for record in records {
        let key = (
            record.key.clone(),
            record.domain.clone(),
            record.path.clone(),
        );
        match index.get(&key) {
            Some(&pos) => {
                if record.observed_at() >= out[pos].observed_at() {
                    out[pos] = record;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(record);
            }
        }
    }

    out
}

/// Thread-safe cookie jar shared between a reqwest client and the session.
#[derive(Debug, Default)]
pub struct SessionJar {
    cookies: RwLock<Vec<StoredCookie>>,
}

impl SessionJar {
    /// Create an empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a jar pre-filled with `cookies` (deduplicated).
    pub fn from_cookies<I>(cookies: I) -> Self
    where
        I: IntoIterator<Item = StoredCookie>,
    {
        Self {
            cookies: RwLock::new(dedup_latest(cookies)),
        }
    }

    /// Insert or replace a cookie. A replaced record keeps its `creation`.
    pub fn insert(&self, mut cookie: StoredCookie) {
        let mut cookies = self.cookies.write();
        if let Some(existing) = cookies
            .iter_mut()
            .find(|c| c.identity() == cookie.identity())
        {
            cookie.creation = existing.creation;
            *existing = cookie;
        } else {
            cookies.push(cookie);
        }
    }

    /// Remove the record with the given identity.
    pub fn remove(&self, key: &str, domain: &str, path: &str) -> bool {
        let mut cookies = self.cookies.write();
        let before = cookies.len();
        cookies.retain(|c| c.identity() != (key, domain, path));
        cookies.len() != before
    }

    /// Apply one `Set-Cookie` header received from `url`.
    pub fn store_response_cookie(&self, header: &str, url: &Url) {
        let now = Utc::now();
        let Some(cookie) = StoredCookie::from_set_cookie(header, url, now) else {
            return;
        };

        if cookie.is_expired(now) {
            self.remove(&cookie.key, &cookie.domain, &cookie.path);
        } else {
            self.insert(cookie);
        }
    }

    /// Snapshot of every record, in insertion order.
    pub fn all(&self) -> Vec<StoredCookie> {
        self.cookies.read().clone()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.cookies.read().len()
    }

    /// Whether the jar is empty.
    pub fn is_empty(&self) -> bool {
        self.cookies.read().is_empty()
    }

    /// Value of the first unexpired cookie named `key`, any domain.
    pub fn value(&self, key: &str) -> Option<String> {
        let now = Utc::now();
        self.cookies
            .read()
            .iter()
            .find(|c| c.key == key && !c.is_expired(now))
            .map(|c| c.value.clone())
    }

    /// `Cookie` header value for a request to `url`.
    ///
    /// Longer paths come first, then older cookies. Matching records get
    /// their `lastAccessed` bumped. The header is built under the read lock;
    /// the write lock is held only for the timestamp update.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let now = Utc::now();

        let (header, sent) = {
            let cookies = self.cookies.read();
            let mut matching: Vec<&StoredCookie> =
                cookies.iter().filter(|c| c.matches(url, now)).collect();
            if matching.is_empty() {
                return None;
            }

            matching.sort_by(|a, b| {
                b.path
                    .len()
                    .cmp(&a.path.len())
                    .then(a.creation.cmp(&b.creation))
            });

            let header = matching
                .iter()
                .map(|c| format!("{}={}", c.key, c.value))
                .collect::<Vec<_>>()
                .join("; ");
            let sent: Vec<(String, String, String)> = matching
                .iter()
                .map(|c| (c.key.clone(), c.domain.clone(), c.path.clone()))
                .collect();
            (header, sent)
        };

        // Records replaced or removed in between are simply skipped.
        let mut cookies = self.cookies.write();
        for cookie in cookies.iter_mut() {
            let identity = cookie.identity();
            if sent
                .iter()
                .any(|(k, d, p)| identity == (k.as_str(), d.as_str(), p.as_str()))
            {
                cookie.last_accessed = Some(now);
            }
        }

        Some(header)
    }
}

impl reqwest::cookie::CookieStore for SessionJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        for header in cookie_headers {
            if let Ok(value) = header.to_str() {
                self.store_response_cookie(value, url);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.header_for(url)
            .and_then(|h| HeaderValue::from_str(&h).ok())
    }
}

/// `expires` as RFC 3339, or `"Infinity"` for session cookies.
mod expiry {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_str("Infinity"),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref() {
            None | Some("") | Some("Infinity") => Ok(None),
            Some(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}
