//! Answer synthesis for registered services.
//!
//! Every hostname of the matched service is answered, not only the one that
//! was queried:
//!
//! ```text
//! CNAME query              -> CNAME <hostname>. -> <target>.
//! A query, IPv4 target     -> A     <hostname>. -> <target>
//! A query, symbolic target -> CNAME <hostname>. -> <target>.   (resolution continues downstream)
//! anything else            -> nothing
//! ```

use hickory_proto::rr::rdata::{A, CNAME};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use std::net::IpAddr;

/// Fully-qualified form of a domain name (single trailing dot).
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Build the answer records for a matched service.
///
/// Returns an empty set when the query cannot be answered here, which tells
/// the caller to defer to the next handler.
pub fn synthesize(
    query_type: RecordType,
    target: &str,
    hostnames: &[String],
    ttl: u32,
) -> Vec<Record> {
    let rdata = match query_type {
        RecordType::CNAME => cname_rdata(target),
        RecordType::A => match target.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Some(RData::A(A::from(ip))),
            // An A answer cannot carry an IPv6 address.
            Ok(IpAddr::V6(_)) => None,
            Err(_) => cname_rdata(target),
        },
        _ => None,
    };

    let Some(rdata) = rdata else {
        return Vec::new();
    };

    hostnames
        .iter()
        .filter_map(|hostname| Name::from_ascii(fqdn(hostname)).ok())
        .map(|name| {
            let mut record = Record::from_rdata(name, ttl, rdata.clone());
            record.set_dns_class(DNSClass::IN);
            record
        })
        .collect()
}

/// CNAME data pointing at `target`, if it is a usable name.
fn cname_rdata(target: &str) -> Option<RData> {
    if target.is_empty() {
        return None;
    }
    Name::from_ascii(fqdn(target))
        .ok()
        .map(|name| RData::CNAME(CNAME(name)))
}
