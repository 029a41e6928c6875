// Shared identifier types used across the transport crates.
use std::fmt;
use std::str::FromStr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid ivorn: {0}")]
    InvalidIvorn(String),
    #[error("ivorn has no per-event local id: {0}")]
    MissingLocalId(String),
}

const SCHEME: &str = "ivo://";
const MIN_AUTHORITY_LEN: usize = 3;

// Punctuation allowed by the IVOA identifier grammar in each component.
const AUTHORITY_EXTRA: &str = "-_.!~*'()";
const RESOURCE_EXTRA: &str = "-_.!~*'()/";
const LOCAL_ID_EXTRA: &str = "-_.!~*'()/?:@&=+$,;";

/// Parsed IVOA resource name, `ivo://authority/resource#local_id`.
///
/// ```
/// use comet_common::Ivorn;
///
/// let ivorn: Ivorn = "ivo://x.y/z#1".parse().expect("ivorn");
/// assert_eq!(ivorn.authority(), "x.y");
/// assert_eq!(ivorn.resource(), Some("/z"));
/// assert_eq!(ivorn.local_id(), Some("1"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ivorn {
    raw: String,
    authority_end: usize,
    resource_end: usize,
}

impl Ivorn {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || Error::InvalidIvorn(input.to_string());
        let rest = input.strip_prefix(SCHEME).ok_or_else(invalid)?;
        let (path, local_id) = match rest.split_once('#') {
            Some((path, local_id)) => (path, Some(local_id)),
            None => (rest, None),
        };
        let (authority, resource) = match path.find('/') {
            Some(idx) => path.split_at(idx),
            None => (path, ""),
        };

        let first_ok = authority
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if !first_ok
            || authority.chars().count() < MIN_AUTHORITY_LEN
            || !all_allowed(authority, AUTHORITY_EXTRA)
            || !all_allowed(resource, RESOURCE_EXTRA)
            || !local_id.is_none_or(|id| all_allowed(id, LOCAL_ID_EXTRA))
        {
            return Err(invalid());
        }

        let authority_end = SCHEME.len() + authority.len();
        Ok(Self {
            raw: input.to_string(),
            authority_end,
            resource_end: authority_end + resource.len(),
        })
    }

    pub fn authority(&self) -> &str {
        &self.raw[SCHEME.len()..self.authority_end]
    }

    pub fn resource(&self) -> Option<&str> {
        let resource = &self.raw[self.authority_end..self.resource_end];
        (!resource.is_empty()).then_some(resource)
    }

    pub fn local_id(&self) -> Option<&str> {
        self.raw[self.resource_end..]
            .strip_prefix('#')
            .filter(|id| !id.is_empty())
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Ivorn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Ivorn {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        Self::parse(input)
    }
}

/// Checks that an event IVORN is well formed and carries a local id.
///
/// Runs upstream of the protocol roles, before an event is accepted for
/// onward delivery.
pub fn validate_ivorn(ivorn: &str) -> Result<Ivorn> {
    let parsed = Ivorn::parse(ivorn)?;
    if parsed.local_id().is_none() {
        return Err(Error::MissingLocalId(ivorn.to_string()));
    }
    Ok(parsed)
}

fn all_allowed(component: &str, extra: &str) -> bool {
    component
        .chars()
        .all(|c| c.is_alphanumeric() || extra.contains(c))
}
