//! Query processing pipeline.
//!
//! One handler instance serves every listener. Per query it composes, in
//! order: rate limiting, cache lookup, zone lookup (with load-balanced
//! answer selection), the allow-list gate plus upstream forwarding, cache
//! insertion, and finally query logging and metrics.
//!
//! ```text
//! query
//!   │
//!   ├─ rate limit ── deny ──▶ REFUSED
//!   │
//!   ├─ cache ── hit ──▶ cached response (id substituted)
//!   │
//!   ├─ zone lookup ── match ──▶ answers (load balancer may pick one)
//!   │
//!   ├─ allow-list + forward ── answer ──▶ upstream response
//!   │
//!   └─ otherwise ──▶ NXDOMAIN
//! ```
//!
//! No error escapes: every branch, including store outages, upstream
//! failures, and malformed input, ends in exactly one DNS response.
//! Queries carrying anything other than a single QUERY-opcode question
//! are answered with FORMERR.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::RecordType as WireType;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tracing::{debug, warn};

use crate::allowlist::{unmap, AllowedLans};
use crate::cache::{CacheKey, ResponseCache};
use crate::error::DnsResult;
use crate::lb::LoadBalancer;
use crate::metrics::Metrics;
use crate::querylog::QueryLogService;
use crate::upstream::UpstreamForwarder;
use crate::zone::{fqdn, Record, RecordType, Zone, ZoneRepository};

use super::rate_limit::RateLimiter;

/// Deadline for one query through the whole pipeline.
pub const QUERY_DEADLINE: Duration = Duration::from_secs(30);

/// The components a handler composes. All are shared references; the
/// handler owns nothing but its wiring.
pub struct HandlerParts {
    /// Zone storage.
    pub repository: ZoneRepository,
    /// Source allow-list for the forwarding path.
    pub allowed_lans: Arc<AllowedLans>,
    /// Upstream forwarder.
    pub upstream: Arc<UpstreamForwarder>,
    /// Response cache.
    pub cache: Arc<ResponseCache>,
    /// Per-source rate limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Query logger.
    pub query_log: Arc<QueryLogService>,
    /// Metrics sink.
    pub metrics: Metrics,
    /// Optional backend selection for multi-record answers.
    pub load_balancer: Option<Arc<LoadBalancer>>,
    /// Whether non-local queries require an allow-listed source.
    pub enable_allowed_lans_check: bool,
}

/// What a query resolved to, for logging and metrics.
struct Resolution {
    response: Message,
    cache_hit: bool,
    upstream: bool,
    blocked: bool,
}

impl Resolution {
    fn local(response: Message) -> Self {
        Self {
            response,
            cache_hit: false,
            upstream: false,
            blocked: false,
        }
    }
}

/// The query pipeline.
pub struct DnsHandler {
    repository: ZoneRepository,
    allowed_lans: Arc<AllowedLans>,
    upstream: Arc<UpstreamForwarder>,
    cache: Arc<ResponseCache>,
    rate_limiter: Arc<RateLimiter>,
    query_log: Arc<QueryLogService>,
    metrics: Metrics,
    load_balancer: Option<Arc<LoadBalancer>>,
    enable_allowed_lans_check: bool,
}

impl DnsHandler {
    /// Assemble a handler from its parts.
    #[must_use]
    pub fn new(parts: HandlerParts) -> Self {
        Self {
            repository: parts.repository,
            allowed_lans: parts.allowed_lans,
            upstream: parts.upstream,
            cache: parts.cache,
            rate_limiter: parts.rate_limiter,
            query_log: parts.query_log,
            metrics: parts.metrics,
            load_balancer: parts.load_balancer,
            enable_allowed_lans_check: parts.enable_allowed_lans_check,
        }
    }

    /// Handle raw query bytes; the returned bytes are the one response.
    ///
    /// Returns `None` only when the input is too short to carry a query
    /// id, in which case there is nothing sensible to answer.
    pub async fn handle_bytes(&self, client: SocketAddr, query_bytes: &[u8]) -> Option<Vec<u8>> {
        let query = match Message::from_bytes(query_bytes) {
            Ok(query) => query,
            Err(err) => {
                debug!(client = %client, error = %err, "unparseable query");
                return formerr_from_raw(query_bytes);
            }
        };

        let response = self.handle(client, &query).await;
        match response.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(client = %client, error = %err, "failed to serialize response");
                let servfail = response_from(&query, ResponseCode::ServFail, true);
                servfail.to_bytes().ok()
            }
        }
    }

    /// Handle a parsed query and produce exactly one response message.
    pub async fn handle(&self, client: SocketAddr, query: &Message) -> Message {
        let started = Instant::now();
        let source = unmap(client.ip());

        let (qname, qtype_str) = question_labels(query);

        // Rate limit before any other work.
        if self.rate_limiter.is_enabled() && !self.rate_limiter.allow(source) {
            self.metrics.record_rate_limited();
            let resolution = Resolution {
                response: response_from(query, ResponseCode::Refused, false),
                cache_hit: false,
                upstream: false,
                blocked: true,
            };
            return self.finish(source, &qname, &qtype_str, started, resolution);
        }

        let resolution = match self.resolve(source, query).await {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!(client = %client, qname = %qname, error = %err, "pipeline error");
                self.metrics.record_query_error(&qtype_str, "internal");
                Resolution::local(response_from(query, ResponseCode::ServFail, true))
            }
        };

        self.finish(source, &qname, &qtype_str, started, resolution)
    }

    /// Record metrics and the query log entry, then hand the response out.
    fn finish(
        &self,
        source: std::net::IpAddr,
        qname: &str,
        qtype: &str,
        started: Instant,
        resolution: Resolution,
    ) -> Message {
        let latency = started.elapsed();
        let rcode = rcode_name(resolution.response.response_code());

        self.metrics
            .record_query(qtype, &rcode, latency.as_secs_f64());
        self.metrics.set_cache_size(self.cache.len());
        self.metrics
            .set_active_rate_limiters(self.rate_limiter.active_sources() as u64);

        self.query_log.log_query(
            source,
            qname,
            qtype,
            &rcode,
            resolution.response.answers().len(),
            latency,
            resolution.cache_hit,
            resolution.upstream,
            resolution.blocked,
        );

        resolution.response
    }

    /// The pipeline proper; the caller coerces any error to SERVFAIL.
    async fn resolve(&self, source: std::net::IpAddr, query: &Message) -> DnsResult<Resolution> {
        if query.header().op_code() != OpCode::Query {
            return Ok(Resolution::local(response_from(
                query,
                ResponseCode::Refused,
                false,
            )));
        }

        // Exactly one question; anything else is malformed in practice.
        let questions = query.queries();
        let [question] = questions else {
            return Ok(Resolution::local(response_from(
                query,
                ResponseCode::FormErr,
                false,
            )));
        };

        let qname = fqdn(&question.name().to_ascii());
        let qtype = question.query_type();

        // Cache lookup.
        let cache_key = CacheKey::new(&qname, qtype);
        if let Some(cached) = self.cache.get(&cache_key, query.id()) {
            debug!(qname = %qname, qtype = %qtype, "cache hit");
            self.metrics.record_cache_hit();
            return Ok(Resolution {
                response: cached,
                cache_hit: true,
                upstream: false,
                blocked: false,
            });
        }
        self.metrics.record_cache_miss();

        // Zone lookup; a store outage degrades to "no zone" so the query
        // can still fall through to the forwarding branch.
        let zone = match self.repository.find_zone(&qname).await {
            Ok(zone) => zone,
            Err(err) => {
                warn!(qname = %qname, error = %err, "zone lookup failed, treating as no zone");
                self.metrics
                    .record_query_error(&qtype.to_string(), "store_unavailable");
                None
            }
        };

        if let Some(zone) = zone {
            if !zone.enabled {
                debug!(zone = %zone.domain, "zone disabled");
                return Ok(Resolution::local(response_from(
                    query,
                    ResponseCode::NXDomain,
                    true,
                )));
            }
            return Ok(self.answer_from_zone(query, &zone, &qname, qtype, &cache_key));
        }

        // No local zone: forward when the source is allowed.
        let allowed = !self.enable_allowed_lans_check || self.allowed_lans.contains(source);
        if allowed {
            let forward_started = Instant::now();
            match self.upstream.forward(query).await {
                Ok(response) => {
                    self.metrics
                        .record_upstream_query(forward_started.elapsed().as_secs_f64());
                    if response.response_code() == ResponseCode::NoError {
                        self.cache.insert(cache_key, &response);
                    }
                    return Ok(Resolution {
                        response,
                        cache_hit: false,
                        upstream: true,
                        blocked: false,
                    });
                }
                Err(err) => {
                    warn!(qname = %qname, error = %err, "upstream forward failed");
                    self.metrics.record_upstream_error();
                    self.metrics
                        .record_query_error(&qtype.to_string(), "upstream");
                }
            }
        } else {
            debug!(source = %source, qname = %qname, "source not in allow-list");
        }

        Ok(Resolution::local(response_from(
            query,
            ResponseCode::NXDomain,
            true,
        )))
    }

    /// Build the authoritative answer for a zone-covered name.
    fn answer_from_zone(
        &self,
        query: &Message,
        zone: &Zone,
        qname: &str,
        qtype: WireType,
        cache_key: &CacheKey,
    ) -> Resolution {
        let records = if qtype == WireType::ANY {
            self.repository.lookup_any(zone, qname)
        } else {
            match RecordType::from_wire(qtype) {
                Some(rtype) => self.repository.lookup_record(zone, qname, rtype),
                None => Vec::new(),
            }
        };

        if records.is_empty() {
            // The name may still exist with other types; answer NODATA
            // then instead of NXDOMAIN.
            let name_exists = zone
                .records_at(qname)
                .iter()
                .any(|r| !r.disabled);
            let rcode = if name_exists {
                ResponseCode::NoError
            } else {
                ResponseCode::NXDomain
            };
            return Resolution::local(response_from(query, rcode, true));
        }

        let answers = self.select_answers(qname, qtype, records);

        let mut response = response_from(query, ResponseCode::NoError, true);
        for record in &answers {
            let owner = match hickory_proto::rr::Name::from_ascii(&record.name) {
                Ok(owner) => owner,
                Err(err) => {
                    warn!(name = %record.name, error = %err, "unrepresentable owner name");
                    continue;
                }
            };
            if let Some(answer) = record.to_answer(&owner) {
                response.add_answer(answer);
            }
        }

        self.cache.insert(cache_key.clone(), &response);
        Resolution::local(response)
    }

    /// Let the load balancer pick one backend when the answer is a
    /// multi-record address set; otherwise answer with everything.
    fn select_answers(
        &self,
        qname: &str,
        qtype: WireType,
        records: Vec<Record>,
    ) -> Vec<Record> {
        let Some(lb) = &self.load_balancer else {
            return records;
        };

        let is_address_set = matches!(qtype, WireType::A | WireType::AAAA)
            && records.len() >= 2
            && records.iter().all(|r| r.rtype.is_address());
        if !is_address_set {
            return records;
        }

        let rtype = match RecordType::from_wire(qtype) {
            Some(rtype) => rtype,
            None => return records,
        };

        lb.sync_backends(qname, rtype, &records);
        match lb.next(qname, rtype) {
            Some(selected) => {
                self.metrics
                    .record_backend_request(&selected.rdata_string(), "selected");
                let (total, healthy) = lb.backend_counts();
                self.metrics.set_backend_counts(total as u64, healthy as u64);
                vec![selected]
            }
            None => {
                debug!(qname = %qname, "no healthy backend, answering with full record set");
                records
            }
        }
    }
}

/// First-question labels for logging, tolerating empty queries.
fn question_labels(query: &Message) -> (String, String) {
    match query.queries().first() {
        Some(question) => (
            fqdn(&question.name().to_ascii()),
            question.query_type().to_string(),
        ),
        None => (".".to_string(), "NONE".to_string()),
    }
}

/// Build a response skeleton echoing the question section.
fn response_from(query: &Message, rcode: ResponseCode, authoritative: bool) -> Message {
    let mut response = Message::new();
    let mut header = Header::response_from_request(query.header());
    header.set_message_type(MessageType::Response);
    header.set_response_code(rcode);
    header.set_authoritative(authoritative);
    header.set_recursion_available(true);
    response.set_header(header);

    for question in query.queries() {
        response.add_query(question.clone());
    }
    response
}

/// Build a FORMERR response from raw bytes when full parsing failed.
/// Needs at least the two id bytes.
fn formerr_from_raw(query_bytes: &[u8]) -> Option<Vec<u8>> {
    if query_bytes.len() < 2 {
        return None;
    }
    let id = u16::from_be_bytes([query_bytes[0], query_bytes[1]]);

    let mut response = Message::new();
    let mut header = Header::new();
    header.set_id(id);
    header.set_message_type(MessageType::Response);
    header.set_op_code(OpCode::Query);
    header.set_response_code(ResponseCode::FormErr);
    response.set_header(header);
    response.to_bytes().ok()
}

/// Stable upper-case rcode label for metrics and the query log.
fn rcode_name(rcode: ResponseCode) -> String {
    match rcode {
        ResponseCode::NoError => "NOERROR".to_string(),
        ResponseCode::NXDomain => "NXDOMAIN".to_string(),
        ResponseCode::Refused => "REFUSED".to_string(),
        ResponseCode::ServFail => "SERVFAIL".to_string(),
        ResponseCode::FormErr => "FORMERR".to_string(),
        other => other.to_string().to_ascii_uppercase(),
    }
}
