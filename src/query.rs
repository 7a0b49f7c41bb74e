//! Per-query input to the selection policies.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::hash::jenkins_ci;

/// Everything a policy may look at for one query.
///
/// Built once per query on the receive path and passed by reference; never
/// persisted. The hashes are computed with the global perturbation seed so
/// that deployments with different seeds shard names differently.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Hash of the lower-cased query name.
    pub qname_hash: u32,
    /// Hash of the client identity (source address).
    pub client_hash: u32,
    /// DNS query type.
    pub qtype: u16,
    /// DNS query class.
    pub qclass: u16,
    /// Optional tags for policy extensions.
    pub tags: Option<HashMap<String, String>>,
}

impl QueryContext {
    /// Build a context for a query name and client address.
    ///
    /// The name's trailing dot, if any, is ignored so `a.example.com.` and
    /// `a.example.com` hash identically; case folding happens inside the
    /// hash itself.
    pub fn new(qname: &str, client: IpAddr, qtype: u16, qclass: u16, perturbation: u32) -> Self {
        let name = qname.trim_end_matches('.');
        let client_bytes = match client {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };

        Self {
            qname_hash: jenkins_ci(name.as_bytes(), perturbation),
            client_hash: jenkins_ci(&client_bytes, perturbation),
            qtype,
            qclass,
            tags: None,
        }
    }

    /// Build a context from a precomputed name hash (tests, replay tools).
    pub fn from_hash(qname_hash: u32) -> Self {
        Self {
            qname_hash,
            client_hash: 0,
            qtype: 1,  // A
            qclass: 1, // IN
            tags: None,
        }
    }

    /// Attach a tag map for tag-matching policies.
    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = Some(tags);
        self
    }
}
