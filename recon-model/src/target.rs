use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ModelError, Result};

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// A syntactically valid scan target: an IPv4/IPv6 address or an RFC 1123
/// hostname. Construction is the only validation point; a `Target` that exists
/// is always valid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Target(String);

impl Target {
    /// Normalizes and validates user input.
    ///
    /// URLs are reduced to their host (`https://example.com/login` becomes
    /// `example.com`), bracketed IPv6 literals are unwrapped, hostnames are
    /// lower-cased and a single trailing dot is dropped.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ModelError::invalid_target(input, "target is empty"));
        }

        let candidate = if trimmed.contains("://") {
            let url = Url::parse(trimmed).map_err(|err| {
                ModelError::invalid_target(input, format!("malformed url: {err}"))
            })?;
            url.host_str()
                .map(str::to_string)
                .ok_or_else(|| ModelError::invalid_target(input, "url has no host"))?
        } else {
            trimmed.to_string()
        };

        let unbracketed = candidate
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(&candidate);

        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return Ok(Target(ip.to_string()));
        }

        let host = unbracketed.strip_suffix('.').unwrap_or(unbracketed);
        validate_hostname(input, host)?;
        Ok(Target(host.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.0.parse().ok()
    }

    pub fn is_ip(&self) -> bool {
        self.ip().is_some()
    }
}

fn validate_hostname(input: &str, host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(ModelError::invalid_target(input, "hostname is empty"));
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(ModelError::invalid_target(
            input,
            format!("hostname exceeds {MAX_HOSTNAME_LEN} characters"),
        ));
    }

    for label in host.split('.') {
        if label.is_empty() {
            return Err(ModelError::invalid_target(input, "empty hostname label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(ModelError::invalid_target(
                input,
                format!("label {label:?} exceeds {MAX_LABEL_LEN} characters"),
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(ModelError::invalid_target(
                input,
                format!("label {label:?} starts or ends with a hyphen"),
            ));
        }
        if let Some(bad) = label
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
        {
            return Err(ModelError::invalid_target(
                input,
                format!("invalid character {bad:?}"),
            ));
        }
    }

    // A dotted all-numeric name that failed IP parsing (e.g. 10.0.0.256) is
    // almost certainly a typo for an address, not a hostname.
    if host
        .split('.')
        .all(|label| label.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(ModelError::invalid_target(input, "not a valid IPv4 address"));
    }

    Ok(())
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Target {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Target::parse(s)
    }
}

impl TryFrom<String> for Target {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self> {
        Target::parse(&value)
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        value.0
    }
}

impl AsRef<str> for Target {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_addresses_and_hostnames() {
        assert_eq!(Target::parse("10.0.0.5").unwrap().as_str(), "10.0.0.5");
        assert_eq!(Target::parse(" ::1 ").unwrap().as_str(), "::1");
        assert_eq!(Target::parse("[fe80::1]").unwrap().as_str(), "fe80::1");
        assert_eq!(Target::parse("Example.COM.").unwrap().as_str(), "example.com");
        assert_eq!(Target::parse("target.local").unwrap().as_str(), "target.local");
        assert!(Target::parse("192.168.1.1").unwrap().is_ip());
    }

    #[test]
    fn reduces_urls_to_host() {
        let target = Target::parse("https://Example.com:8443/login?next=/").unwrap();
        assert_eq!(target.as_str(), "example.com");
        assert!(!target.is_ip());
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in [
            "",
            "   ",
            "exa mple.com",
            "-leading.example.com",
            "trailing-.example.com",
            "double..dot",
            "10.0.0.256",
            "under_score.example.com",
            "https://",
        ] {
            assert!(
                matches!(Target::parse(bad), Err(ModelError::InvalidTarget { .. })),
                "expected {bad:?} to be rejected"
            );
        }

        let long_label = format!("{}.com", "a".repeat(64));
        assert!(Target::parse(&long_label).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: Target = serde_json::from_str("\"Scanme.Example.org\"").unwrap();
        assert_eq!(ok.as_str(), "scanme.example.org");
        assert!(serde_json::from_str::<Target>("\"not valid!\"").is_err());
    }
}
