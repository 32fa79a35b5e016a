//! NVMe qualified names
//!
//! Two forms are accepted, both at most [`NQN_MAX_LEN`] bytes:
//!
//! - `nqn.2014-08.org.nvmexpress:uuid:` followed by a UUID in its
//!   hyphenated 36-character form.
//! - `nqn.` prefix (case-insensitive), a `yyyy-mm.` date code, a reverse
//!   domain name, then an optional free-form `:` suffix.

use crate::error::{Error, Result};
use crate::types::NQN_MAX_LEN;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

/// Prefix of NQNs derived from a UUID
pub const UUID_NQN_PREFIX: &str = "nqn.2014-08.org.nvmexpress:uuid:";

const UUID_STR_LEN: usize = 36;

/// Well-known NQN of the discovery subsystem
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// A validated NVMe qualified name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Nqn(String);

impl Nqn {
    /// Validate and wrap a qualified name
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        Self::validate(&s)?;
        Ok(Self(s))
    }

    /// Check a qualified name without taking ownership
    pub fn validate(s: &str) -> Result<()> {
        if s.len() > NQN_MAX_LEN {
            return Err(Error::invalid_argument(format!(
                "Invalid NQN \"{s}\": length {} > max {NQN_MAX_LEN}",
                s.len()
            )));
        }

        let bytes = s.as_bytes();
        if bytes.len() < 4 || !bytes[..4].eq_ignore_ascii_case(b"nqn.") {
            return Err(Error::invalid_argument(format!(
                "Invalid NQN \"{s}\": NQN must begin with \"nqn.\""
            )));
        }

        if let Some(id) = s.strip_prefix(UUID_NQN_PREFIX) {
            if id.len() != UUID_STR_LEN || Uuid::try_parse(id).is_err() {
                return Err(Error::invalid_argument(format!(
                    "Invalid NQN \"{s}\": uuid is not formatted correctly"
                )));
            }
            return Ok(());
        }

        // yyyy-mm.
        let date = &bytes[4..];
        let well_formed = date.len() >= 8
            && date[..4].iter().all(u8::is_ascii_digit)
            && date[4] == b'-'
            && date[5..7].iter().all(u8::is_ascii_digit)
            && date[7] == b'.';
        if !well_formed {
            return Err(Error::invalid_argument(format!(
                "Invalid date code in NQN \"{s}\""
            )));
        }

        let rest = &s[12..];
        let domain = rest.split_once(':').map_or(rest, |(domain, _)| domain);
        if domain.is_empty() || !domain.split('.').all(valid_label) {
            return Err(Error::invalid_argument(format!(
                "Invalid domain name in NQN \"{s}\""
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host NQN used when a request does not name one. Generated once per
    /// process from a random UUID.
    #[must_use]
    pub fn default_host() -> &'static Self {
        static HOST: OnceLock<Nqn> = OnceLock::new();
        HOST.get_or_init(|| Self(format!("{UUID_NQN_PREFIX}{}", Uuid::new_v4())))
    }
}

/// A domain label starts with a letter, ends with a letter or digit and
/// holds only letters, digits and hyphens.
fn valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphabetic()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        }
        _ => false,
    }
}

impl FromStr for Nqn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Nqn {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<Nqn> for String {
    fn from(nqn: Nqn) -> Self {
        nqn.0
    }
}

impl AsRef<str> for Nqn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_nqn() {
        assert!(Nqn::validate("nqn.2014-08.org.example:test").is_ok());
        assert!(Nqn::validate("NQN.2016-06.io.spdk:cnode1").is_ok());
        assert!(Nqn::validate(DISCOVERY_NQN).is_ok());
    }

    #[test]
    fn test_bad_date_code() {
        let err = Nqn::validate("nqn.20a4-08.org.example").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert!(Nqn::validate("nqn.2014-8.org.example").is_err());
        assert!(Nqn::validate("nqn.2014-08").is_err());
        assert!(Nqn::validate("nqn.2014/08.org").is_err());
    }

    #[test]
    fn test_missing_prefix() {
        let err = Nqn::validate("iqn.2014-08.org.example:test").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(Nqn::validate("").is_err());
    }

    #[test]
    fn test_uuid_form() {
        assert!(Nqn::validate("nqn.2014-08.org.nvmexpress:uuid:11111111-2222-3333-4444-555555555555").is_ok());

        let err = Nqn::validate("nqn.2014-08.org.nvmexpress:uuid:not-a-uuid").unwrap_err();
        assert!(err.message().contains("uuid is not formatted correctly"));
        // Simple form is not accepted in place of the hyphenated one
        assert!(Nqn::validate("nqn.2014-08.org.nvmexpress:uuid:11111111222233334444555555555555").is_err());
    }

    #[test]
    fn test_domain_labels() {
        assert!(Nqn::validate("nqn.2016-06.io.spdk-test:cnode1").is_ok());
        assert!(Nqn::validate("nqn.2016-06.io.spdk").is_ok());

        for bad in [
            "nqn.2016-06.:cnode1",
            "nqn.2016-06.io..spdk:cnode1",
            "nqn.2016-06.1io.spdk:cnode1",
            "nqn.2016-06.io.spdk-:cnode1",
            "nqn.2016-06.io.sp_dk:cnode1",
        ] {
            let err = Nqn::validate(bad).unwrap_err();
            assert!(err.message().contains("Invalid domain name"), "{bad}");
        }
    }

    #[test]
    fn test_length_limit() {
        let base = "nqn.2014-08.org.example:";
        let ok = format!("{base}{}", "a".repeat(NQN_MAX_LEN - base.len()));
        assert!(Nqn::validate(&ok).is_ok());

        let too_long = format!("{ok}a");
        assert!(Nqn::validate(&too_long).is_err());
    }

    #[test]
    fn test_default_host_is_stable() {
        let a = Nqn::default_host();
        let b = Nqn::default_host();
        assert_eq!(a, b);
        assert!(Nqn::validate(a.as_str()).is_ok());
    }
}
