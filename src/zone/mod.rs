//! Zone and record model.
//!
//! Records are stored as JSON documents inside their zone (see
//! [`repository`]) using a flat schema: common fields `name`, `type`,
//! `ttl`, `disabled`, a `value` field for the simple types, and typed
//! fields for MX/SRV/SOA/CAA. Every record can also render its canonical
//! wire line `name TTL IN TYPE rdata` and be parsed back from it.
//!
//! Unknown record types are a validation error when writing and are
//! skipped with a warning when reading, so documents written by a newer
//! server stay loadable.

pub mod repository;

pub use repository::ZoneRepository;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::rr::rdata;
use hickory_proto::rr::{Name, RData, RecordType as WireType};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::warn;

/// Error type for zone and record validation.
#[derive(Debug, Error)]
pub enum ZoneError {
    /// A record field is malformed or inconsistent with its type.
    #[error("invalid record {name}: {reason}")]
    InvalidRecord {
        /// Owner name of the offending record.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The record type string is not one this server knows.
    #[error("unknown record type: {0}")]
    UnknownType(String),

    /// The zone as a whole violates an invariant.
    #[error("invalid zone {domain}: {reason}")]
    InvalidZone {
        /// Zone domain.
        domain: String,
        /// The violated invariant.
        reason: String,
    },
}

/// Normalize a domain name to its lookup form: lower-case, dot-terminated.
#[must_use]
pub fn fqdn(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with('.') {
        lower
    } else {
        format!("{lower}.")
    }
}

/// The record types this server stores and serves.
///
/// ALIAS is a storage-level type with no wire representation: it is
/// flattened to the target's address records at lookup time, and unlike
/// CNAME it is legal at the zone apex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// IPv4 address.
    A,
    /// IPv6 address.
    Aaaa,
    /// Canonical name.
    Cname,
    /// Apex-safe alias, flattened at lookup time.
    Alias,
    /// Name server.
    Ns,
    /// Reverse pointer.
    Ptr,
    /// Free-form text.
    Txt,
    /// Mail exchanger.
    Mx,
    /// Service locator.
    Srv,
    /// Start of authority.
    Soa,
    /// Certification authority authorization.
    Caa,
}

impl RecordType {
    /// All known types, for validation and iteration.
    pub const ALL: [RecordType; 11] = [
        Self::A,
        Self::Aaaa,
        Self::Cname,
        Self::Alias,
        Self::Ns,
        Self::Ptr,
        Self::Txt,
        Self::Mx,
        Self::Srv,
        Self::Soa,
        Self::Caa,
    ];

    /// The canonical upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Cname => "CNAME",
            Self::Alias => "ALIAS",
            Self::Ns => "NS",
            Self::Ptr => "PTR",
            Self::Txt => "TXT",
            Self::Mx => "MX",
            Self::Srv => "SRV",
            Self::Soa => "SOA",
            Self::Caa => "CAA",
        }
    }

    /// The wire-protocol record type, if one exists.
    ///
    /// ALIAS returns `None`; it never appears in an answer section.
    #[must_use]
    pub fn wire_type(&self) -> Option<WireType> {
        match self {
            Self::A => Some(WireType::A),
            Self::Aaaa => Some(WireType::AAAA),
            Self::Cname => Some(WireType::CNAME),
            Self::Alias => None,
            Self::Ns => Some(WireType::NS),
            Self::Ptr => Some(WireType::PTR),
            Self::Txt => Some(WireType::TXT),
            Self::Mx => Some(WireType::MX),
            Self::Srv => Some(WireType::SRV),
            Self::Soa => Some(WireType::SOA),
            Self::Caa => Some(WireType::CAA),
        }
    }

    /// Map a wire-protocol query type onto a storage type.
    #[must_use]
    pub fn from_wire(qtype: WireType) -> Option<Self> {
        match qtype {
            WireType::A => Some(Self::A),
            WireType::AAAA => Some(Self::Aaaa),
            WireType::CNAME => Some(Self::Cname),
            WireType::NS => Some(Self::Ns),
            WireType::PTR => Some(Self::Ptr),
            WireType::TXT => Some(Self::Txt),
            WireType::MX => Some(Self::Mx),
            WireType::SRV => Some(Self::Srv),
            WireType::SOA => Some(Self::Soa),
            WireType::CAA => Some(Self::Caa),
            _ => None,
        }
    }

    /// Whether this type addresses a host (A or AAAA).
    #[must_use]
    pub fn is_address(&self) -> bool {
        matches!(self, Self::A | Self::Aaaa)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = ZoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "AAAA" => Ok(Self::Aaaa),
            "CNAME" => Ok(Self::Cname),
            "ALIAS" => Ok(Self::Alias),
            "NS" => Ok(Self::Ns),
            "PTR" => Ok(Self::Ptr),
            "TXT" => Ok(Self::Txt),
            "MX" => Ok(Self::Mx),
            "SRV" => Ok(Self::Srv),
            "SOA" => Ok(Self::Soa),
            "CAA" => Ok(Self::Caa),
            other => Err(ZoneError::UnknownType(other.to_string())),
        }
    }
}

/// Type-tagged record value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// Single-string value: address literal, target FQDN, or text.
    Value(String),
    /// Mail exchanger.
    Mx {
        /// Preference; lower wins.
        priority: u16,
        /// Exchange host FQDN.
        host: String,
    },
    /// Service locator.
    Srv {
        /// Priority; lower wins.
        priority: u16,
        /// Relative weight among same-priority targets.
        weight: u16,
        /// Service port.
        port: u16,
        /// Target host FQDN.
        target: String,
    },
    /// Start of authority.
    Soa {
        /// Primary name server.
        mname: String,
        /// Responsible mailbox, dot-encoded.
        rname: String,
        /// Zone serial.
        serial: u32,
        /// Secondary refresh interval.
        refresh: u32,
        /// Retry interval after failed refresh.
        retry: u32,
        /// Expiry of unrefreshed zone data.
        expire: u32,
        /// Negative-caching TTL.
        minimum: u32,
    },
    /// Certification authority authorization.
    Caa {
        /// Flags; bit 0x80 is issuer-critical.
        flags: u8,
        /// Property tag (issue, issuewild, iodef, ...).
        tag: String,
        /// Property value.
        value: String,
    },
}

/// One DNS record as stored in a zone document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Owner name, fully qualified and dot-terminated.
    pub name: String,
    /// Record type.
    pub rtype: RecordType,
    /// Time to live, seconds.
    pub ttl: u32,
    /// Disabled records are treated as absent by lookups.
    pub disabled: bool,
    /// Type-tagged value.
    pub data: RecordData,
}

impl Record {
    /// Create a simple-valued record (A, AAAA, CNAME, ALIAS, NS, PTR, TXT).
    pub fn simple(name: &str, rtype: RecordType, value: &str, ttl: u32) -> Self {
        Self {
            name: fqdn(name),
            rtype,
            ttl,
            disabled: false,
            data: RecordData::Value(value.to_string()),
        }
    }

    /// Create an A record.
    pub fn a(name: &str, addr: &str, ttl: u32) -> Self {
        Self::simple(name, RecordType::A, addr, ttl)
    }

    /// Create an AAAA record.
    pub fn aaaa(name: &str, addr: &str, ttl: u32) -> Self {
        Self::simple(name, RecordType::Aaaa, addr, ttl)
    }

    /// Create a CNAME record.
    pub fn cname(name: &str, target: &str, ttl: u32) -> Self {
        Self::simple(name, RecordType::Cname, &fqdn(target), ttl)
    }

    /// Create an ALIAS record.
    pub fn alias(name: &str, target: &str, ttl: u32) -> Self {
        Self::simple(name, RecordType::Alias, &fqdn(target), ttl)
    }

    /// Create an NS record.
    pub fn ns(name: &str, target: &str, ttl: u32) -> Self {
        Self::simple(name, RecordType::Ns, &fqdn(target), ttl)
    }

    /// Create a TXT record.
    pub fn txt(name: &str, text: &str, ttl: u32) -> Self {
        Self::simple(name, RecordType::Txt, text, ttl)
    }

    /// Create an MX record.
    pub fn mx(name: &str, priority: u16, host: &str, ttl: u32) -> Self {
        Self {
            name: fqdn(name),
            rtype: RecordType::Mx,
            ttl,
            disabled: false,
            data: RecordData::Mx {
                priority,
                host: fqdn(host),
            },
        }
    }

    /// Create an SRV record.
    pub fn srv(name: &str, priority: u16, weight: u16, port: u16, target: &str, ttl: u32) -> Self {
        Self {
            name: fqdn(name),
            rtype: RecordType::Srv,
            ttl,
            disabled: false,
            data: RecordData::Srv {
                priority,
                weight,
                port,
                target: fqdn(target),
            },
        }
    }

    /// Create an SOA record.
    #[allow(clippy::too_many_arguments)]
    pub fn soa(
        name: &str,
        mname: &str,
        rname: &str,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: u32,
    ) -> Self {
        Self {
            name: fqdn(name),
            rtype: RecordType::Soa,
            ttl,
            disabled: false,
            data: RecordData::Soa {
                mname: fqdn(mname),
                rname: fqdn(rname),
                serial,
                refresh,
                retry,
                expire,
                minimum,
            },
        }
    }

    /// Create a CAA record.
    pub fn caa(name: &str, flags: u8, tag: &str, value: &str, ttl: u32) -> Self {
        Self {
            name: fqdn(name),
            rtype: RecordType::Caa,
            ttl,
            disabled: false,
            data: RecordData::Caa {
                flags,
                tag: tag.to_string(),
                value: value.to_string(),
            },
        }
    }

    /// Mark this record disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Return this record with a different owner name, as wildcard
    /// expansion does.
    #[must_use]
    pub fn with_name(&self, name: &str) -> Self {
        let mut out = self.clone();
        out.name = fqdn(name);
        out
    }

    /// The simple string value, if this record has one.
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        match &self.data {
            RecordData::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The type-specific rdata serialization used in the wire line.
    #[must_use]
    pub fn rdata_string(&self) -> String {
        match &self.data {
            RecordData::Value(v) => match self.rtype {
                RecordType::Txt => format!("\"{v}\""),
                _ => v.clone(),
            },
            RecordData::Mx { priority, host } => format!("{priority} {host}"),
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => format!("{priority} {weight} {port} {target}"),
            RecordData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => format!("{mname} {rname} {serial} {refresh} {retry} {expire} {minimum}"),
            RecordData::Caa { flags, tag, value } => format!("{flags} {tag} \"{value}\""),
        }
    }

    /// Render the canonical wire form: `name TTL IN TYPE rdata`.
    #[must_use]
    pub fn to_wire_line(&self) -> String {
        format!(
            "{} {} IN {} {}",
            self.name,
            self.ttl,
            self.rtype,
            self.rdata_string()
        )
    }

    /// Parse a record from its canonical wire line.
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError`] when the line does not have the
    /// `name TTL IN TYPE rdata` shape or the rdata does not match the type.
    pub fn parse_wire_line(line: &str) -> Result<Self, ZoneError> {
        let bad = |reason: &str| ZoneError::InvalidRecord {
            name: line.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = line.split_whitespace();
        let name = parts.next().ok_or_else(|| bad("missing name"))?;
        let ttl: u32 = parts
            .next()
            .ok_or_else(|| bad("missing TTL"))?
            .parse()
            .map_err(|_| bad("TTL is not a number"))?;
        let class = parts.next().ok_or_else(|| bad("missing class"))?;
        if !class.eq_ignore_ascii_case("IN") {
            return Err(bad("class must be IN"));
        }
        let rtype: RecordType = parts.next().ok_or_else(|| bad("missing type"))?.parse()?;

        let rest: Vec<&str> = parts.collect();
        let unquote = |s: &str| s.trim_matches('"').to_string();

        let data = match rtype {
            RecordType::Txt => {
                if rest.is_empty() {
                    return Err(bad("TXT needs a value"));
                }
                RecordData::Value(unquote(&rest.join(" ")))
            }
            RecordType::A
            | RecordType::Aaaa
            | RecordType::Cname
            | RecordType::Alias
            | RecordType::Ns
            | RecordType::Ptr => {
                let [value] = rest.as_slice() else {
                    return Err(bad("expected a single rdata token"));
                };
                RecordData::Value((*value).to_string())
            }
            RecordType::Mx => {
                let [priority, host] = rest.as_slice() else {
                    return Err(bad("MX rdata is `priority host`"));
                };
                RecordData::Mx {
                    priority: priority.parse().map_err(|_| bad("bad MX priority"))?,
                    host: (*host).to_string(),
                }
            }
            RecordType::Srv => {
                let [priority, weight, port, target] = rest.as_slice() else {
                    return Err(bad("SRV rdata is `priority weight port target`"));
                };
                RecordData::Srv {
                    priority: priority.parse().map_err(|_| bad("bad SRV priority"))?,
                    weight: weight.parse().map_err(|_| bad("bad SRV weight"))?,
                    port: port.parse().map_err(|_| bad("bad SRV port"))?,
                    target: (*target).to_string(),
                }
            }
            RecordType::Soa => {
                let [mname, rname, serial, refresh, retry, expire, minimum] = rest.as_slice()
                else {
                    return Err(bad("SOA rdata has seven fields"));
                };
                RecordData::Soa {
                    mname: (*mname).to_string(),
                    rname: (*rname).to_string(),
                    serial: serial.parse().map_err(|_| bad("bad SOA serial"))?,
                    refresh: refresh.parse().map_err(|_| bad("bad SOA refresh"))?,
                    retry: retry.parse().map_err(|_| bad("bad SOA retry"))?,
                    expire: expire.parse().map_err(|_| bad("bad SOA expire"))?,
                    minimum: minimum.parse().map_err(|_| bad("bad SOA minimum"))?,
                }
            }
            RecordType::Caa => {
                if rest.len() < 3 {
                    return Err(bad("CAA rdata is `flags tag \"value\"`"));
                }
                RecordData::Caa {
                    flags: rest[0].parse().map_err(|_| bad("bad CAA flags"))?,
                    tag: rest[1].to_string(),
                    value: unquote(&rest[2..].join(" ")),
                }
            }
        };

        Ok(Self {
            name: fqdn(name),
            rtype,
            ttl,
            disabled: false,
            data,
        })
    }

    /// Convert this record into wire rdata.
    ///
    /// Returns `Ok(None)` for records that cannot appear on the wire
    /// (ALIAS, and CAA tags hickory cannot express); those are handled or
    /// skipped by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::InvalidRecord`] when the stored value does not
    /// parse as its type demands (for example a malformed IPv4 literal).
    pub fn to_rdata(&self) -> Result<Option<RData>, ZoneError> {
        let bad = |reason: String| ZoneError::InvalidRecord {
            name: self.name.clone(),
            reason,
        };
        let parse_name = |s: &str| {
            Name::from_ascii(s).map_err(|e| bad(format!("invalid name {s}: {e}")))
        };

        let rdata = match (&self.rtype, &self.data) {
            (RecordType::A, RecordData::Value(v)) => {
                let addr: Ipv4Addr = v
                    .parse()
                    .map_err(|_| bad(format!("invalid IPv4 literal: {v}")))?;
                RData::A(rdata::A(addr))
            }
            (RecordType::Aaaa, RecordData::Value(v)) => {
                let addr: Ipv6Addr = v
                    .parse()
                    .map_err(|_| bad(format!("invalid IPv6 literal: {v}")))?;
                RData::AAAA(rdata::AAAA(addr))
            }
            (RecordType::Cname, RecordData::Value(v)) => {
                RData::CNAME(rdata::CNAME(parse_name(v)?))
            }
            (RecordType::Ns, RecordData::Value(v)) => RData::NS(rdata::NS(parse_name(v)?)),
            (RecordType::Ptr, RecordData::Value(v)) => RData::PTR(rdata::PTR(parse_name(v)?)),
            (RecordType::Txt, RecordData::Value(v)) => RData::TXT(rdata::TXT::new(vec![v.clone()])),
            (RecordType::Mx, RecordData::Mx { priority, host }) => {
                RData::MX(rdata::MX::new(*priority, parse_name(host)?))
            }
            (
                RecordType::Srv,
                RecordData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                },
            ) => RData::SRV(rdata::SRV::new(*priority, *weight, *port, parse_name(target)?)),
            (
                RecordType::Soa,
                RecordData::Soa {
                    mname,
                    rname,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                },
            ) => RData::SOA(rdata::SOA::new(
                parse_name(mname)?,
                parse_name(rname)?,
                *serial,
                *refresh as i32,
                *retry as i32,
                *expire as i32,
                *minimum,
            )),
            (RecordType::Caa, RecordData::Caa { flags, tag, value }) => {
                let critical = flags & 0x80 != 0;
                match tag.as_str() {
                    "issue" => RData::CAA(rdata::CAA::new_issue(
                        critical,
                        Some(parse_name(value)?),
                        Vec::new(),
                    )),
                    "issuewild" => RData::CAA(rdata::CAA::new_issuewild(
                        critical,
                        Some(parse_name(value)?),
                        Vec::new(),
                    )),
                    other => {
                        warn!(name = %self.name, tag = other, "unsupported CAA tag, skipping");
                        return Ok(None);
                    }
                }
            }
            (RecordType::Alias, _) => return Ok(None),
            (rtype, _) => {
                return Err(bad(format!("value does not match record type {rtype}")));
            }
        };

        Ok(Some(rdata))
    }

    /// Build a wire answer record under `owner`.
    ///
    /// Returns `None` for records with no wire form.
    #[must_use]
    pub fn to_answer(&self, owner: &Name) -> Option<hickory_proto::rr::Record> {
        let rdata = self.to_rdata().ok().flatten()?;
        Some(hickory_proto::rr::Record::from_rdata(
            owner.clone(),
            self.ttl,
            rdata,
        ))
    }

    /// Validate this record's internal consistency.
    pub fn validate(&self) -> Result<(), ZoneError> {
        if self.name.is_empty() {
            return Err(ZoneError::InvalidRecord {
                name: self.name.clone(),
                reason: "name cannot be empty".to_string(),
            });
        }

        // Reuse the rdata conversion as the value check. ALIAS and exotic
        // CAA tags legitimately convert to nothing.
        self.to_rdata()?;
        Ok(())
    }
}

// Flat JSON schema. The typed fields only appear for their own record
// type; everything else round-trips through `value`.
#[derive(Serialize, Deserialize)]
struct RecordJson {
    name: String,
    #[serde(rename = "type")]
    rtype: String,
    ttl: u32,
    #[serde(default)]
    disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mx_priority: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mx_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    srv_priority: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    srv_weight: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    srv_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    srv_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    soa_mname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    soa_rname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    soa_serial: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    soa_refresh: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    soa_retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    soa_expire: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    soa_minimum: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caa_flags: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caa_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caa_value: Option<String>,
}

impl From<&Record> for RecordJson {
    fn from(r: &Record) -> Self {
        let mut json = RecordJson {
            name: r.name.clone(),
            rtype: r.rtype.to_string(),
            ttl: r.ttl,
            disabled: r.disabled,
            value: None,
            mx_priority: None,
            mx_host: None,
            srv_priority: None,
            srv_weight: None,
            srv_port: None,
            srv_target: None,
            soa_mname: None,
            soa_rname: None,
            soa_serial: None,
            soa_refresh: None,
            soa_retry: None,
            soa_expire: None,
            soa_minimum: None,
            caa_flags: None,
            caa_tag: None,
            caa_value: None,
        };

        match &r.data {
            RecordData::Value(v) => json.value = Some(v.clone()),
            RecordData::Mx { priority, host } => {
                json.mx_priority = Some(*priority);
                json.mx_host = Some(host.clone());
            }
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                json.srv_priority = Some(*priority);
                json.srv_weight = Some(*weight);
                json.srv_port = Some(*port);
                json.srv_target = Some(target.clone());
            }
            RecordData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                json.soa_mname = Some(mname.clone());
                json.soa_rname = Some(rname.clone());
                json.soa_serial = Some(*serial);
                json.soa_refresh = Some(*refresh);
                json.soa_retry = Some(*retry);
                json.soa_expire = Some(*expire);
                json.soa_minimum = Some(*minimum);
            }
            RecordData::Caa { flags, tag, value } => {
                json.caa_flags = Some(*flags);
                json.caa_tag = Some(tag.clone());
                json.caa_value = Some(value.clone());
            }
        }

        json
    }
}

impl TryFrom<RecordJson> for Record {
    type Error = ZoneError;

    fn try_from(json: RecordJson) -> Result<Self, Self::Error> {
        let rtype: RecordType = json.rtype.parse()?;
        let missing = |field: &str| ZoneError::InvalidRecord {
            name: json.name.clone(),
            reason: format!("missing field {field} for type {rtype}"),
        };

        let data = match rtype {
            RecordType::A
            | RecordType::Aaaa
            | RecordType::Cname
            | RecordType::Alias
            | RecordType::Ns
            | RecordType::Ptr
            | RecordType::Txt => RecordData::Value(json.value.ok_or_else(|| missing("value"))?),
            RecordType::Mx => RecordData::Mx {
                priority: json.mx_priority.ok_or_else(|| missing("mx_priority"))?,
                host: json.mx_host.ok_or_else(|| missing("mx_host"))?,
            },
            RecordType::Srv => RecordData::Srv {
                priority: json.srv_priority.ok_or_else(|| missing("srv_priority"))?,
                weight: json.srv_weight.ok_or_else(|| missing("srv_weight"))?,
                port: json.srv_port.ok_or_else(|| missing("srv_port"))?,
                target: json.srv_target.ok_or_else(|| missing("srv_target"))?,
            },
            RecordType::Soa => RecordData::Soa {
                mname: json.soa_mname.ok_or_else(|| missing("soa_mname"))?,
                rname: json.soa_rname.ok_or_else(|| missing("soa_rname"))?,
                serial: json.soa_serial.ok_or_else(|| missing("soa_serial"))?,
                refresh: json.soa_refresh.ok_or_else(|| missing("soa_refresh"))?,
                retry: json.soa_retry.ok_or_else(|| missing("soa_retry"))?,
                expire: json.soa_expire.ok_or_else(|| missing("soa_expire"))?,
                minimum: json.soa_minimum.ok_or_else(|| missing("soa_minimum"))?,
            },
            RecordType::Caa => RecordData::Caa {
                flags: json.caa_flags.ok_or_else(|| missing("caa_flags"))?,
                tag: json.caa_tag.ok_or_else(|| missing("caa_tag"))?,
                value: json.caa_value.ok_or_else(|| missing("caa_value"))?,
            },
        };

        Ok(Record {
            name: fqdn(&json.name),
            rtype,
            ttl: json.ttl,
            disabled: json.disabled,
            data,
        })
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RecordJson::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = RecordJson::deserialize(deserializer)?;
        Record::try_from(json).map_err(D::Error::custom)
    }
}

/// A zone: a domain, an enabled flag, and its records.
#[derive(Debug, Clone, Serialize)]
pub struct Zone {
    /// Zone apex, fully qualified and dot-terminated.
    pub domain: String,
    /// Disabled zones answer nothing (the handler responds NXDOMAIN).
    pub enabled: bool,
    /// Records in this zone.
    pub records: Vec<Record>,
}

fn default_enabled() -> bool {
    true
}

// Lenient decode: records with unknown types are skipped with a warning so
// newer writers do not break older readers.
#[derive(Deserialize)]
struct ZoneJson {
    domain: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    records: Vec<serde_json::Value>,
}

impl<'de> Deserialize<'de> for Zone {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = ZoneJson::deserialize(deserializer)?;
        let mut records = Vec::with_capacity(raw.records.len());
        for value in raw.records {
            match serde_json::from_value::<Record>(value) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(zone = %raw.domain, error = %err, "skipping unreadable record");
                }
            }
        }
        Ok(Zone {
            domain: fqdn(&raw.domain),
            enabled: raw.enabled,
            records,
        })
    }
}

impl Zone {
    /// Create an enabled zone.
    pub fn new(domain: &str, records: Vec<Record>) -> Self {
        Self {
            domain: fqdn(domain),
            enabled: true,
            records,
        }
    }

    /// Whether `name` is the apex or a subdomain of this zone.
    #[must_use]
    pub fn covers(&self, name: &str) -> bool {
        let name = fqdn(name);
        name == self.domain || name.ends_with(&format!(".{}", self.domain))
    }

    /// Validate the zone invariants:
    ///
    /// 1. every record name is the apex or ends with `.<domain>`;
    /// 2. no two records share (name, type, rdata); A/AAAA may repeat a
    ///    (name, type) pair with different addresses (that record set is
    ///    what the load balancer selects from), other types may not;
    /// 3. CNAME is exclusive with any other type at the same name and may
    ///    not sit at the apex (ALIAS may).
    pub fn validate(&self) -> Result<(), ZoneError> {
        let invalid = |reason: String| ZoneError::InvalidZone {
            domain: self.domain.clone(),
            reason,
        };

        if self.domain.is_empty() || self.domain == "." {
            return Err(invalid("domain cannot be empty".to_string()));
        }

        let mut seen_exact = std::collections::HashSet::new();
        let mut seen_pair = std::collections::HashSet::new();
        for record in &self.records {
            record.validate()?;

            if !self.covers(&record.name) {
                return Err(invalid(format!(
                    "record {} is outside the zone",
                    record.name
                )));
            }

            if !seen_exact.insert((record.name.clone(), record.rtype, record.rdata_string())) {
                return Err(invalid(format!(
                    "duplicate record ({}, {})",
                    record.name, record.rtype
                )));
            }

            if !seen_pair.insert((record.name.clone(), record.rtype)) && !record.rtype.is_address()
            {
                return Err(invalid(format!(
                    "duplicate record ({}, {})",
                    record.name, record.rtype
                )));
            }

            if record.rtype == RecordType::Cname && record.name == self.domain {
                return Err(invalid("CNAME is not allowed at the zone apex".to_string()));
            }
        }

        // CNAME exclusivity against every other type at the same name.
        for record in &self.records {
            if record.rtype == RecordType::Cname {
                let conflict = self.records.iter().any(|other| {
                    other.name == record.name && other.rtype != RecordType::Cname
                });
                if conflict {
                    return Err(invalid(format!(
                        "CNAME at {} conflicts with another record type",
                        record.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Records matching `name` exactly, disabled ones included.
    #[must_use]
    pub fn records_at(&self, name: &str) -> Vec<&Record> {
        let name = fqdn(name);
        self.records.iter().filter(|r| r.name == name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Name normalization
    // ========================================================================

    #[test]
    fn test_fqdn() {
        assert_eq!(fqdn("Example.LAN"), "example.lan.");
        assert_eq!(fqdn("example.lan."), "example.lan.");
        assert_eq!(fqdn("WWW.Example.lan."), "www.example.lan.");
    }

    // ========================================================================
    // RecordType
    // ========================================================================

    #[test]
    fn test_record_type_round_trip() {
        for rtype in RecordType::ALL {
            let parsed: RecordType = rtype.as_str().parse().unwrap();
            assert_eq!(parsed, rtype);
        }
    }

    #[test]
    fn test_record_type_unknown() {
        assert!(matches!(
            "SPF".parse::<RecordType>(),
            Err(ZoneError::UnknownType(_))
        ));
    }

    #[test]
    fn test_record_type_wire_mapping() {
        assert_eq!(RecordType::A.wire_type(), Some(WireType::A));
        assert_eq!(RecordType::Alias.wire_type(), None);
        assert_eq!(RecordType::from_wire(WireType::AAAA), Some(RecordType::Aaaa));
        assert_eq!(RecordType::from_wire(WireType::OPT), None);
    }

    // ========================================================================
    // JSON round trip
    // ========================================================================

    #[test]
    fn test_json_round_trip_simple() {
        let record = Record::a("www.example.lan.", "192.0.2.10", 300);
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
        assert!(json.contains("\"value\":\"192.0.2.10\""));
        assert!(!json.contains("mx_priority"));
    }

    #[test]
    fn test_json_round_trip_mx_srv_soa_caa() {
        let records = vec![
            Record::mx("example.lan.", 10, "mail.example.lan.", 300),
            Record::srv("_http._tcp.example.lan.", 10, 60, 80, "web.example.lan.", 300),
            Record::soa(
                "example.lan.",
                "ns1.example.lan.",
                "hostmaster.example.lan.",
                2024110601,
                3600,
                1800,
                604800,
                300,
                3600,
            ),
            Record::caa("example.lan.", 0, "issue", "ca.example.net", 3600),
        ];

        for record in records {
            let json = serde_json::to_string(&record).unwrap();
            let back: Record = serde_json::from_str(&json).unwrap();
            assert_eq!(record, back, "round trip failed for {}", record.rtype);
        }
    }

    #[test]
    fn test_json_disabled_defaults_false() {
        let json = r#"{"name":"www.example.lan.","type":"A","ttl":300,"value":"192.0.2.1"}"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert!(!record.disabled);
    }

    #[test]
    fn test_json_unknown_type_fails() {
        let json = r#"{"name":"x.example.lan.","type":"NAPTR","ttl":300,"value":"v"}"#;
        assert!(serde_json::from_str::<Record>(json).is_err());
    }

    #[test]
    fn test_zone_decode_skips_unknown_record_types() {
        let json = r#"{
            "domain": "example.lan.",
            "enabled": true,
            "records": [
                {"name":"www.example.lan.","type":"A","ttl":300,"value":"192.0.2.10"},
                {"name":"odd.example.lan.","type":"NAPTR","ttl":300,"value":"whatever"}
            ]
        }"#;
        let zone: Zone = serde_json::from_str(json).unwrap();
        assert_eq!(zone.records.len(), 1);
        assert_eq!(zone.records[0].name, "www.example.lan.");
    }

    // ========================================================================
    // Wire line round trip
    // ========================================================================

    #[test]
    fn test_wire_line_a() {
        let record = Record::a("www.example.lan.", "192.0.2.10", 300);
        assert_eq!(
            record.to_wire_line(),
            "www.example.lan. 300 IN A 192.0.2.10"
        );
        let back = Record::parse_wire_line(&record.to_wire_line()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_wire_line_round_trip_all_types() {
        let records = vec![
            Record::a("a.example.lan.", "192.0.2.1", 60),
            Record::aaaa("a.example.lan.", "2001:db8::1", 60),
            Record::cname("www.example.lan.", "a.example.lan.", 60),
            Record::alias("example.lan.", "a.example.lan.", 60),
            Record::ns("example.lan.", "ns1.example.lan.", 3600),
            Record::simple("1.2.0.192.in-addr.arpa.", RecordType::Ptr, "a.example.lan.", 60),
            Record::txt("example.lan.", "v=spf1 -all", 300),
            Record::mx("example.lan.", 10, "mail.example.lan.", 300),
            Record::srv("_sip._tcp.example.lan.", 5, 10, 5060, "sip.example.lan.", 300),
            Record::soa(
                "example.lan.",
                "ns1.example.lan.",
                "hostmaster.example.lan.",
                1,
                2,
                3,
                4,
                5,
                3600,
            ),
            Record::caa("example.lan.", 128, "issue", "ca.example.net", 3600),
        ];

        for record in records {
            let line = record.to_wire_line();
            let back = Record::parse_wire_line(&line).unwrap();
            assert_eq!(back, record, "wire round trip failed: {line}");
        }
    }

    #[test]
    fn test_wire_line_rejects_garbage() {
        assert!(Record::parse_wire_line("").is_err());
        assert!(Record::parse_wire_line("name ttl IN A 1.2.3.4").is_err());
        assert!(Record::parse_wire_line("name 300 CH A 1.2.3.4").is_err());
        assert!(Record::parse_wire_line("name 300 IN MX onlyhost").is_err());
    }

    // ========================================================================
    // Wire rdata conversion
    // ========================================================================

    #[test]
    fn test_to_rdata_a() {
        let record = Record::a("www.example.lan.", "192.0.2.10", 300);
        let rdata = record.to_rdata().unwrap().unwrap();
        assert!(matches!(rdata, RData::A(_)));
    }

    #[test]
    fn test_to_rdata_invalid_address() {
        let record = Record::a("www.example.lan.", "not-an-ip", 300);
        assert!(record.to_rdata().is_err());
    }

    #[test]
    fn test_to_rdata_alias_is_none() {
        let record = Record::alias("example.lan.", "www.example.lan.", 300);
        assert!(record.to_rdata().unwrap().is_none());
    }

    #[test]
    fn test_to_answer_sets_owner_and_ttl() {
        let record = Record::a("www.example.lan.", "192.0.2.10", 300);
        let owner = Name::from_ascii("www.example.lan.").unwrap();
        let answer = record.to_answer(&owner).unwrap();
        assert_eq!(answer.ttl(), 300);
        assert_eq!(answer.name(), &owner);
    }

    // ========================================================================
    // Zone invariants
    // ========================================================================

    fn zone_with(records: Vec<Record>) -> Zone {
        Zone::new("example.lan.", records)
    }

    #[test]
    fn test_zone_validate_ok() {
        let zone = zone_with(vec![
            Record::soa(
                "example.lan.",
                "ns1.example.lan.",
                "hostmaster.example.lan.",
                1,
                3600,
                1800,
                604800,
                300,
                3600,
            ),
            Record::ns("example.lan.", "ns1.example.lan.", 3600),
            Record::a("www.example.lan.", "192.0.2.10", 300),
            Record::alias("example.lan.", "www.example.lan.", 300),
        ]);
        assert!(zone.validate().is_ok());
    }

    #[test]
    fn test_zone_rejects_foreign_record() {
        let zone = zone_with(vec![Record::a("www.other.lan.", "192.0.2.1", 300)]);
        assert!(zone.validate().is_err());
    }

    #[test]
    fn test_zone_allows_multiple_a_records_at_one_name() {
        let zone = zone_with(vec![
            Record::a("api.example.lan.", "192.0.2.10", 300),
            Record::a("api.example.lan.", "192.0.2.11", 300),
            Record::a("api.example.lan.", "192.0.2.12", 300),
        ]);
        assert!(zone.validate().is_ok());
    }

    #[test]
    fn test_zone_rejects_exact_duplicate() {
        let zone = zone_with(vec![
            Record::a("www.example.lan.", "192.0.2.1", 300),
            Record::a("www.example.lan.", "192.0.2.1", 300),
        ]);
        assert!(zone.validate().is_err());
    }

    #[test]
    fn test_zone_rejects_duplicate_txt_pair() {
        let zone = zone_with(vec![
            Record::txt("example.lan.", "one", 300),
            Record::txt("example.lan.", "two", 300),
        ]);
        assert!(zone.validate().is_err());
    }

    #[test]
    fn test_zone_rejects_cname_at_apex() {
        let zone = zone_with(vec![Record::cname("example.lan.", "www.example.lan.", 300)]);
        assert!(zone.validate().is_err());
    }

    #[test]
    fn test_zone_rejects_cname_conflict() {
        let zone = zone_with(vec![
            Record::cname("www.example.lan.", "a.example.lan.", 300),
            Record::txt("www.example.lan.", "hello", 300),
        ]);
        assert!(zone.validate().is_err());
    }

    #[test]
    fn test_zone_allows_alias_at_apex() {
        let zone = zone_with(vec![
            Record::alias("example.lan.", "www.example.lan.", 300),
            Record::a("www.example.lan.", "192.0.2.10", 300),
        ]);
        assert!(zone.validate().is_ok());
    }

    #[test]
    fn test_zone_covers() {
        let zone = zone_with(vec![]);
        assert!(zone.covers("example.lan."));
        assert!(zone.covers("www.example.lan."));
        assert!(zone.covers("deep.sub.example.lan."));
        assert!(!zone.covers("example.com."));
        assert!(!zone.covers("badexample.lan."));
    }
}
