//! Address management fabric: the address string grammar, `AddressEntry`,
//! and the reference list tying an MP-level address handle to a particular
//! transport method's own addressing.
//!
//! One global reference list, a string-keyed hash table for fast repeat
//! lookups by address string, and alloc/dealloc routines that
//! register/unregister the address's id as a side effect of
//! construction/destruction.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::error::{BmiError, BmiErrorKind};
use crate::ids::IdRegistry;

/// An opaque handle to an address as known to the message-passing shim.
/// Stable across the lifetime of the address regardless of which transport
/// method backs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MpAddr(pub u64);

/// An opaque handle a transport method uses internally to identify one of
/// its own peers. Never interpreted outside the owning transport method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddr(pub u64);

/// A parsed `scheme[-zone]://host:port` address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddr {
    pub scheme: String,
    pub zone: Option<String>,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ParsedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.zone {
            Some(zone) => write!(
                f,
                "{}-{}://{}:{}",
                self.scheme, zone, self.host, self.port
            ),
            None => write!(f, "{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

impl ParsedAddr {
    /// Parse the external address grammar `scheme[-zone]://host:port`.
    pub fn parse(raw: &str) -> Result<Self, BmiError> {
        let (scheme_part, rest) = raw
            .split_once("://")
            .ok_or_else(|| BmiError::invalid(format!("missing '://' in address '{raw}'")))?;

        let (scheme, zone) = match scheme_part.split_once('-') {
            Some((s, z)) => (s.to_string(), Some(z.to_string())),
            None => (scheme_part.to_string(), None),
        };

        let (host, port_str) = rest
            .rsplit_once(':')
            .ok_or_else(|| BmiError::invalid(format!("missing port in address '{raw}'")))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| BmiError::invalid(format!("invalid port in address '{raw}'")))?;

        if scheme.is_empty() || host.is_empty() {
            return Err(BmiError::invalid(format!(
                "empty scheme or host in address '{raw}'"
            )));
        }

        Ok(ParsedAddr {
            scheme,
            zone,
            host: host.to_string(),
            port,
        })
    }
}

/// The record held per known address. `primary`/`secondary` implement the
/// failover-swap behavior of `op_list_cmp_key` (see `op_list.rs`): a search
/// against either alias is expected to find this entry and rewrite the
/// searching op to point at the alias that actually matched.
#[derive(Debug, Clone)]
pub struct AddressEntry {
    pub raw: String,
    pub parsed: ParsedAddr,
    pub method_addr: TransportAddr,
    pub method_name: String,
    pub refcount: u32,
    pub primary: Option<MpAddr>,
    pub secondary: Option<MpAddr>,
}

/// The global reference list: one [`IdRegistry`] of [`AddressEntry`] plus a
/// string-keyed index for repeat lookups by address string, matching the
/// `str_table` hash table in `reference-list.c`.
pub struct RefList {
    entries: IdRegistry<AddressEntry>,
    by_string: Mutex<HashMap<String, MpAddr>>,
    by_method_addr: Mutex<HashMap<TransportAddr, MpAddr>>,
}

impl Default for RefList {
    fn default() -> Self {
        Self::new()
    }
}

impl RefList {
    pub fn new() -> Self {
        RefList {
            entries: IdRegistry::new(),
            by_string: Mutex::new(HashMap::new()),
            by_method_addr: Mutex::new(HashMap::new()),
        }
    }

    /// Register a newly resolved address, returning its MP-level handle.
    pub fn add(&self, raw: &str, method_addr: TransportAddr, method_name: &str) -> Result<MpAddr, BmiError> {
        let parsed = ParsedAddr::parse(raw)?;
        let entry = AddressEntry {
            raw: raw.to_string(),
            parsed,
            method_addr,
            method_name: method_name.to_string(),
            refcount: 1,
            primary: None,
            secondary: None,
        };
        let id = self.entries.register(entry);
        let handle = MpAddr(id);
        self.by_string.lock().insert(raw.to_string(), handle);
        self.by_method_addr.lock().insert(method_addr, handle);
        Ok(handle)
    }

    pub fn search_str(&self, raw: &str) -> Option<MpAddr> {
        self.by_string.lock().get(raw).copied()
    }

    /// Mirrors `ref_list_search_method_addr`'s back-pointer lookup: a
    /// transport method knows only its own `TransportAddr`; this maps it
    /// back to the MP-level handle in O(1).
    pub fn search_method_addr(&self, method_addr: TransportAddr) -> Option<MpAddr> {
        self.by_method_addr.lock().get(&method_addr).copied()
    }

    pub fn inc_ref(&self, addr: MpAddr) {
        self.entries.with_mut(addr.0, |e| e.refcount += 1);
    }

    /// Decrement the refcount, returning `true` if it reached zero (the
    /// caller should then issue a drop-query to the owning transport method
    /// before finally removing the entry, per `dealloc_ref_st`'s
    /// `BMI_DROP_ADDR` info-query step).
    pub fn dec_ref(&self, addr: MpAddr) -> bool {
        self.entries
            .with_mut(addr.0, |e| {
                e.refcount = e.refcount.saturating_sub(1);
                e.refcount == 0
            })
            .unwrap_or(false)
    }

    pub fn remove(&self, addr: MpAddr) -> Option<AddressEntry> {
        if let Some(entry) = self.entries.unregister(addr.0) {
            self.by_string.lock().remove(&entry.raw);
            self.by_method_addr.lock().remove(&entry.method_addr);
            Some(entry)
        } else {
            None
        }
    }

    pub fn get(&self, addr: MpAddr) -> Option<AddressEntry> {
        self.entries.lookup(addr.0)
    }

    pub fn set_primary(&self, addr: MpAddr, primary: MpAddr) {
        self.entries.with_mut(addr.0, |e| e.primary = Some(primary));
    }

    pub fn set_secondary(&self, addr: MpAddr, secondary: MpAddr) {
        self.entries
            .with_mut(addr.0, |e| e.secondary = Some(secondary));
    }
}

pub fn unsupported_scheme(scheme: &str) -> BmiError {
    BmiError::new(
        BmiErrorKind::ProtoNoSupport,
        format!("no transport method registered for scheme '{scheme}'"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_zone_host_port() {
        let p = ParsedAddr::parse("tcp-eth0://10.0.0.1:3334").unwrap();
        assert_eq!(p.scheme, "tcp");
        assert_eq!(p.zone.as_deref(), Some("eth0"));
        assert_eq!(p.host, "10.0.0.1");
        assert_eq!(p.port, 3334);
    }

    #[test]
    fn parses_without_zone() {
        let p = ParsedAddr::parse("gm://node07:7000").unwrap();
        assert_eq!(p.scheme, "gm");
        assert_eq!(p.zone, None);
        assert_eq!(p.host, "node07");
        assert_eq!(p.port, 7000);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(ParsedAddr::parse("tcp://10.0.0.1").is_err());
    }

    #[test]
    fn ref_list_add_search_and_refcount() {
        let list = RefList::new();
        let handle = list.add("tcp://host:1234", TransportAddr(42), "tcp").unwrap();
        assert_eq!(list.search_str("tcp://host:1234"), Some(handle));
        assert_eq!(list.get(handle).unwrap().refcount, 1);
        list.inc_ref(handle);
        assert_eq!(list.get(handle).unwrap().refcount, 2);
        assert!(!list.dec_ref(handle));
        assert!(list.dec_ref(handle));
    }
}
