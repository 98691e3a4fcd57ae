//! Address masks a slave must connect from.
//!
//! A mask is either a network in CIDR notation (`10.0.0.0/8`) or a glob over
//! the textual address (`192.168.1.*`). An optional `ident@` prefix is
//! accepted for compatibility with older records and ignored.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};

#[derive(Debug, Clone)]
enum Matcher {
    Network(IpNetwork),
    Glob(Regex),
}

#[derive(Debug, Clone)]
pub struct HostMask {
    source: String,
    matcher: Matcher,
}

impl HostMask {
    pub fn parse(mask: &str) -> Result<HostMask> {
        let host = match mask.rsplit_once('@') {
            Some((_, host)) => host,
            None => mask,
        };
        if host.is_empty() {
            return Err(MasterError::InvalidMask {
                mask: mask.to_string(),
                reason: "empty host".to_string(),
            });
        }
        let matcher = if host.contains('/') {
            let net = IpNetwork::from_str(host).map_err(|e| MasterError::InvalidMask {
                mask: mask.to_string(),
                reason: e.to_string(),
            })?;
            Matcher::Network(net)
        } else {
            Matcher::Glob(glob_to_regex(host).map_err(|e| MasterError::InvalidMask {
                mask: mask.to_string(),
                reason: e.to_string(),
            })?)
        };
        Ok(HostMask {
            source: mask.to_string(),
            matcher,
        })
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        match &self.matcher {
            Matcher::Network(net) => net.contains(addr),
            Matcher::Glob(re) => re.is_match(&addr.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn glob_to_regex(glob: &str) -> std::result::Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push_str("(?i)^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

impl fmt::Display for HostMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Ordered set of masks, stored in slave records as plain strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct HostMaskCollection {
    masks: Vec<HostMask>,
}

impl HostMaskCollection {
    pub fn add_mask(&mut self, mask: &str) -> Result<()> {
        if self.masks.iter().any(|m| m.source == mask) {
            return Err(MasterError::DuplicateMask(mask.to_string()));
        }
        self.masks.push(HostMask::parse(mask)?);
        Ok(())
    }

    pub fn remove_mask(&mut self, mask: &str) -> bool {
        let before = self.masks.len();
        self.masks.retain(|m| m.source != mask);
        self.masks.len() != before
    }

    /// `true` if any mask admits `addr`. An empty collection admits nothing.
    pub fn check(&self, addr: IpAddr) -> bool {
        self.masks.iter().any(|m| m.matches(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostMask> {
        self.masks.iter()
    }
}

impl TryFrom<Vec<String>> for HostMaskCollection {
    type Error = MasterError;

    fn try_from(masks: Vec<String>) -> Result<Self> {
        let mut collection = HostMaskCollection::default();
        for mask in masks {
            collection.add_mask(&mask)?;
        }
        Ok(collection)
    }
}

impl From<HostMaskCollection> for Vec<String> {
    fn from(c: HostMaskCollection) -> Self {
        c.masks.into_iter().map(|m| m.source).collect()
    }
}
