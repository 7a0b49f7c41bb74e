//! Hickory DNS authority backed by the selection engine.
//!
//! Address queries for `<pool>.<zone>` (or the bare zone, which maps to
//! the default pool) are answered with the address of the backend the
//! pool's policy picks for that query. A pool with no healthy member
//! answers SERVFAIL; names that do not map to a pool answer NXDOMAIN.

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{A, AAAA, NS, SOA};
use hickory_proto::rr::{LowerName, Name, RData, Record, RecordSet, RecordType};
use hickory_server::authority::{
    Authority, LookupControlFlow, LookupError, LookupOptions, LookupRecords, MessageRequest,
    UpdateResult, ZoneType,
};
use hickory_server::server::RequestInfo;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::balancer::{Balancer, SelectResult};
use crate::config::DnsConfig;
use crate::error::SteerError;
use crate::metrics::{self, QueryResult, Timer};

/// Authority answering address queries with load-balancing decisions.
pub struct SteerAuthority {
    origin: LowerName,
    balancer: Balancer,
    config: Arc<DnsConfig>,
}

impl SteerAuthority {
    /// Create an authority for the configured zone over the given balancer.
    pub fn new(config: DnsConfig, balancer: Balancer) -> Result<Self, hickory_proto::ProtoError> {
        let origin = Name::from_ascii(&config.zone)?.into();

        Ok(Self {
            origin,
            balancer,
            config: Arc::new(config),
        })
    }

    /// Map a query name to a pool: the bare zone uses the default pool,
    /// one label under the zone names the pool directly. Anything deeper
    /// does not exist.
    fn pool_for_name(&self, name: &str) -> Option<String> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let zone = self.config.zone.trim_end_matches('.').to_ascii_lowercase();

        if name == zone {
            return Some(self.config.default_pool.clone());
        }
        let prefix = name.strip_suffix(&format!(".{zone}"))?;
        if prefix.is_empty() || prefix.contains('.') {
            return None;
        }
        Some(prefix.to_string())
    }

    /// Build the answer record set for a selected backend address, honoring
    /// the queried record type. A v6 backend on an A query (and vice versa)
    /// yields an empty set: the name exists, the type does not.
    fn build_address_records(&self, name: Name, rtype: RecordType, ip: IpAddr) -> RecordSet {
        let mut record_set = RecordSet::new(name.clone(), rtype, 0);
        let rdata = match (rtype, ip) {
            (RecordType::A, IpAddr::V4(v4)) => Some(RData::A(A::from(v4))),
            (RecordType::AAAA, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA::from(v6))),
            _ => None,
        };

        if let Some(rdata) = rdata {
            let mut record = Record::from_rdata(name, self.config.ttl, rdata);
            record.set_dns_class(hickory_proto::rr::DNSClass::IN);
            record_set.insert(record, 0);
        }

        record_set
    }

    /// Build the SOA record for this zone.
    fn build_soa_record(&self) -> RecordSet {
        let soa = SOA::new(
            Name::from_ascii(&self.config.soa.mname).unwrap_or_else(|_| Name::root()),
            Name::from_ascii(&self.config.soa.rname).unwrap_or_else(|_| Name::root()),
            self.balancer.generation(),
            self.config.soa.refresh as i32,
            self.config.soa.retry as i32,
            self.config.soa.expire as i32,
            self.config.soa.minimum,
        );

        let name = Name::from(self.origin.clone());
        let mut record_set = RecordSet::new(name.clone(), RecordType::SOA, 0);
        let mut record = Record::from_rdata(name, self.config.ttl, RData::SOA(soa));
        record.set_dns_class(hickory_proto::rr::DNSClass::IN);
        record_set.insert(record, 0);

        record_set
    }

    /// Build an NS record for this zone.
    fn build_ns_record(&self) -> RecordSet {
        let name = Name::from(self.origin.clone());
        let ns_name = Name::from_ascii(&self.config.soa.mname).unwrap_or_else(|_| Name::root());

        let mut record_set = RecordSet::new(name.clone(), RecordType::NS, 0);
        let mut record = Record::from_rdata(name, self.config.ttl, RData::NS(NS(ns_name)));
        record.set_dns_class(hickory_proto::rr::DNSClass::IN);
        record_set.insert(record, 0);

        record_set
    }

    /// Answer an address query by running the selection engine.
    fn lookup_address(
        &self,
        name: &LowerName,
        rtype: RecordType,
        client: IpAddr,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<LookupRecords> {
        let timer = Timer::start();
        let rtype_str = format!("{rtype:?}");
        let name_str = name.to_string();
        let lookup_name = name_str.trim_end_matches('.');

        let Some(pool) = self.pool_for_name(&name_str) else {
            debug!(name = %lookup_name, "no pool for name");
            metrics::record_query(&rtype_str, QueryResult::NxDomain, timer.elapsed());
            return LookupControlFlow::Break(Err(LookupError::ResponseCode(
                ResponseCode::NXDomain,
            )));
        };

        match self
            .balancer
            .select(&pool, lookup_name, client, u16::from(rtype))
        {
            Ok(SelectResult::Backend(selected)) => {
                debug!(
                    name = %lookup_name,
                    pool = %pool,
                    backend = %selected.id,
                    address = %selected.address,
                    policy = selected.reason,
                    "steering query"
                );
                metrics::record_query(&rtype_str, QueryResult::Success, timer.elapsed());
                let dns_name = Name::from(name.clone());
                let record_set = Arc::new(self.build_address_records(
                    dns_name,
                    rtype,
                    selected.address.ip(),
                ));
                LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, record_set)))
            }
            Ok(SelectResult::NoBackend) => {
                debug!(name = %lookup_name, pool = %pool, "no healthy backend, SERVFAIL");
                metrics::record_query(&rtype_str, QueryResult::ServFail, timer.elapsed());
                LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::ServFail)))
            }
            Err(SteerError::UnknownPool(_)) => {
                debug!(name = %lookup_name, pool = %pool, "unknown pool");
                metrics::record_query(&rtype_str, QueryResult::NxDomain, timer.elapsed());
                LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NXDomain)))
            }
            Err(e) => {
                debug!(name = %lookup_name, error = %e, "selection error");
                metrics::record_query(&rtype_str, QueryResult::Error, timer.elapsed());
                LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::ServFail)))
            }
        }
    }

    fn lookup_with_client(
        &self,
        name: &LowerName,
        rtype: RecordType,
        client: IpAddr,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<LookupRecords> {
        trace!(name = %name, rtype = ?rtype, client = %client, "DNS lookup");

        match rtype {
            RecordType::A | RecordType::AAAA => {
                self.lookup_address(name, rtype, client, lookup_options)
            }
            RecordType::SOA => {
                let timer = Timer::start();
                metrics::record_query("SOA", QueryResult::Success, timer.elapsed());
                let record_set = Arc::new(self.build_soa_record());
                LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, record_set)))
            }
            RecordType::NS => {
                let timer = Timer::start();
                metrics::record_query("NS", QueryResult::Success, timer.elapsed());
                let record_set = Arc::new(self.build_ns_record());
                LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, record_set)))
            }
            _ => {
                trace!(name = %name, rtype = ?rtype, "unsupported record type");
                LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
            }
        }
    }
}

#[async_trait]
impl Authority for SteerAuthority {
    type Lookup = LookupRecords;

    fn zone_type(&self) -> ZoneType {
        ZoneType::Primary
    }

    fn is_axfr_allowed(&self) -> bool {
        false
    }

    fn origin(&self) -> &LowerName {
        &self.origin
    }

    async fn lookup(
        &self,
        name: &LowerName,
        rtype: RecordType,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        // no request context here; hash the client as unspecified
        self.lookup_with_client(name, rtype, IpAddr::from([0u8, 0, 0, 0]), lookup_options)
    }

    async fn search(
        &self,
        request_info: RequestInfo<'_>,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        self.lookup_with_client(
            request_info.query.name(),
            request_info.query.query_type(),
            request_info.src.ip(),
            lookup_options,
        )
    }

    async fn get_nsec_records(
        &self,
        _name: &LowerName,
        _lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        // DNSSEC not supported
        LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
    }

    async fn update(&self, _update: &MessageRequest) -> UpdateResult<bool> {
        // Dynamic updates not supported
        Err(ResponseCode::NotImp)
    }
}
