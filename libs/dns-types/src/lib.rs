//! DNS message wrappers for the resolver and the in-flow interceptor.
//!
//! Thin layer over the `domain` crate, shaped for how the router consumes
//! DNS: a [`Query`] is parsed exactly once (name and qtype are extracted up
//! front, every later access is free), and a [`Response`] knows its minimum
//! answer TTL from the moment it is parsed or built, because that TTL is
//! what drives the resolver's cache.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::IpAddr;
use std::time::Duration;

use domain::{
    base::{
        Header, HeaderCounts, Message, MessageBuilder, Ttl, message_builder::AnswerBuilder,
        name::FlattenInto as _,
    },
    dep::octseq::OctetsInto as _,
    rdata::AllRecordData,
};

pub type RecordType = domain::base::iana::Rtype;
pub type ResponseCode = domain::base::iana::Rcode;

pub type DomainName = domain::base::Name<Vec<u8>>;
pub type OwnedRecord = domain::base::Record<DomainName, AllRecordData<Vec<u8>, DomainName>>;
pub type OwnedRecordData = AllRecordData<Vec<u8>, DomainName>;

/// A single-question DNS query.
///
/// Parsing validates the shape once; multi-question queries don't exist in
/// practice and rejecting them here keeps every consumer simple.
#[derive(Clone)]
pub struct Query {
    inner: Message<Vec<u8>>,
    domain: DomainName,
    qtype: RecordType,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("qid", &self.id())
            .field("type", &self.qtype)
            .field("domain", &self.domain)
            .finish()
    }
}

impl Query {
    pub fn parse(slice: &[u8]) -> Result<Self, ParseError> {
        let message = Message::from_octets(slice).map_err(|_| ParseError::Malformed)?;

        if message.header().qr() {
            return Err(ParseError::NotAQuery);
        }

        let question = message.sole_question()?;

        let qtype = question.qtype();
        let domain = question.into_qname().flatten_into();

        Ok(Self {
            inner: message.octets_into(),
            domain,
            qtype,
        })
    }

    pub fn new(domain: DomainName, qtype: RecordType) -> Self {
        let mut builder = MessageBuilder::new_vec().question();
        builder.header_mut().set_qr(false);
        builder.header_mut().set_rd(true); // Default to recursion desired.
        builder.header_mut().set_random_id();

        builder
            .push((domain.clone(), qtype))
            .expect("Vec-backed message builder never fails");

        Self {
            inner: builder.into_message(),
            domain,
            qtype,
        }
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    pub fn qtype(&self) -> RecordType {
        self.qtype
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

/// A single-question DNS response.
///
/// Parsing walks the answer section once, both to validate every record and
/// to compute the minimum TTL; building tracks the TTL as records are pushed.
#[derive(Clone)]
pub struct Response {
    inner: Message<Vec<u8>>,
    domain: DomainName,
    qtype: RecordType,
    min_ttl: Option<Ttl>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("qid", &self.id())
            .field("domain", &self.domain)
            .field("type", &self.qtype)
            .field("response_code", &self.response_code())
            .field("ttl", &self.ttl())
            .finish_non_exhaustive()
    }
}

impl Response {
    /// Creates an empty, "NOERROR" response for the given query.
    pub fn no_error(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::NOERROR).build()
    }

    pub fn servfail(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::SERVFAIL).build()
    }

    pub fn nxdomain(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::NXDOMAIN).build()
    }

    pub fn parse(slice: &[u8]) -> Result<Self, ParseError> {
        let message = Message::from_octets(slice).map_err(|_| ParseError::Malformed)?;

        if !message.header().qr() {
            return Err(ParseError::NotAResponse);
        }

        let question = message.sole_question()?;
        let qtype = question.qtype();
        let domain = question.into_qname().flatten_into();

        // One pass over the answers: every record must parse, and the cache
        // wants the smallest TTL among them.
        let mut min_ttl = None;

        for record in message.answer()? {
            let record = record?.into_any_record::<AllRecordData<_, _>>()?;

            min_ttl = match min_ttl {
                None => Some(record.ttl()),
                Some(ttl) => Some(ttl.min(record.ttl())),
            };
        }

        Ok(Self {
            inner: message.octets_into(),
            domain,
            qtype,
            min_ttl,
        })
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn truncated(&self) -> bool {
        self.inner.header().tc()
    }

    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    pub fn qtype(&self) -> RecordType {
        self.qtype
    }

    pub fn response_code(&self) -> ResponseCode {
        self.inner.header().rcode()
    }

    /// The smallest TTL among the answer records.
    pub fn ttl(&self) -> Option<Duration> {
        self.min_ttl.map(|ttl| Duration::from_secs(ttl.as_secs().into()))
    }

    pub fn answer_count(&self) -> usize {
        self.inner.header_counts().ancount().into()
    }

    /// The A/AAAA addresses in the answer section.
    #[expect(
        clippy::wildcard_enum_match_arm,
        reason = "Only address records carry an IP."
    )]
    pub fn ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.inner
            .answer()
            .expect("verified in ctor")
            .map(|record| {
                record
                    .expect("verified in ctor")
                    .into_any_record::<AllRecordData<_, _>>()
                    .expect("verified in ctor")
            })
            .filter_map(|record| match record.data() {
                AllRecordData::A(a) => Some(IpAddr::from(a.addr())),
                AllRecordData::Aaaa(aaaa) => Some(IpAddr::from(aaaa.addr())),
                _ => None,
            })
    }

    /// Serializes the response, truncating it to at most `max_len` bytes.
    ///
    /// An over-long response loses its entire answer section and gets the TC
    /// bit set; the client's real resolver will retry over TCP.
    pub fn into_bytes(self, max_len: usize) -> Vec<u8> {
        let answer_start = self
            .inner
            .answer()
            .expect("verified in ctor")
            .pos();

        let mut bytes = self.inner.into_octets();

        if bytes.len() <= max_len {
            return bytes;
        }

        tracing::debug!(
            len = bytes.len(),
            %max_len,
            domain = %self.domain,
            "Truncating DNS response"
        );

        bytes.truncate(answer_start);

        Header::for_message_slice_mut(&mut bytes).set_tc(true);

        // Everything after the question is gone; the counts must say so.
        let counts = HeaderCounts::for_message_slice_mut(&mut bytes);
        counts.as_slice_mut().fill(0);
        counts.set_qdcount(1);

        bytes
    }
}

/// Assembles a [`Response`] for a query, tracking the answer TTL as records
/// are pushed so the finished response carries it without a re-parse.
pub struct ResponseBuilder {
    inner: AnswerBuilder<Vec<u8>>,
    domain: DomainName,
    qtype: RecordType,
    min_ttl: Option<Ttl>,
}

impl ResponseBuilder {
    pub fn for_query(query: &Query, code: ResponseCode) -> Self {
        let inner = MessageBuilder::new_vec()
            .start_answer(&query.inner, code)
            .expect("Vec-backed message builder never fails");

        Self {
            inner,
            domain: query.domain.clone(),
            qtype: query.qtype,
            min_ttl: None,
        }
    }

    pub fn with_answers(mut self, records: impl IntoIterator<Item: Into<OwnedRecord>>) -> Self {
        for record in records {
            let record = record.into();

            self.min_ttl = match self.min_ttl {
                None => Some(record.ttl()),
                Some(ttl) => Some(ttl.min(record.ttl())),
            };

            self.inner
                .push(record)
                .expect("Vec-backed message builder never fails");
        }

        self
    }

    pub fn build(self) -> Response {
        Response {
            inner: self.inner.into_message(),
            domain: self.domain,
            qtype: self.qtype,
            min_ttl: self.min_ttl,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Byte slice does not hold a DNS message")]
    Malformed,
    #[error("DNS message is not a query")]
    NotAQuery,
    #[error("DNS message is not a response")]
    NotAResponse,
    #[error(transparent)]
    Wire(#[from] domain::base::wire::ParseError),
}

/// Record data constructors for the answer types the resolver produces.
pub mod rdata {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use domain::rdata::{A, Aaaa, Ptr};

    use super::{DomainName, OwnedRecordData};

    pub fn a(ip: Ipv4Addr) -> OwnedRecordData {
        OwnedRecordData::A(A::new(ip))
    }

    pub fn aaaa(ip: Ipv6Addr) -> OwnedRecordData {
        OwnedRecordData::Aaaa(Aaaa::new(ip))
    }

    pub fn ip(ip: IpAddr) -> OwnedRecordData {
        match ip {
            IpAddr::V4(ip) => a(ip),
            IpAddr::V6(ip) => aaaa(ip),
        }
    }

    pub fn ptr(domain: DomainName) -> OwnedRecordData {
        OwnedRecordData::Ptr(Ptr::new(domain))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn query(name: &str) -> Query {
        Query::new(DomainName::vec_from_str(name).unwrap(), RecordType::A)
    }

    #[test]
    fn parse_rejects_responses_as_queries() {
        let response = Response::no_error(&query("echo.default.svc"));

        let error = Query::parse(&response.into_bytes(512)).unwrap_err();

        assert!(matches!(error, ParseError::NotAQuery));
    }

    #[test]
    fn query_round_trips_name_and_type() {
        let original = query("echo.default.svc");

        let reparsed = Query::parse(original.as_bytes()).unwrap();

        assert_eq!(reparsed.domain(), original.domain());
        assert_eq!(reparsed.qtype(), RecordType::A);
        assert_eq!(reparsed.id(), original.id());
    }

    #[test]
    fn builder_tracks_minimum_ttl() {
        let query = query("echo.default.svc");
        let domain = query.domain().clone();

        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_answers([
                (domain.clone(), 30, rdata::a(Ipv4Addr::new(10, 0, 0, 1))),
                (domain, 5, rdata::a(Ipv4Addr::new(10, 0, 0, 2))),
            ])
            .build();

        assert_eq!(response.ttl(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parse_recovers_ttl_and_ips() {
        let query = query("echo.default.svc");
        let domain = query.domain().clone();

        let bytes = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_answers([(domain, 30, rdata::a(Ipv4Addr::new(10, 96, 0, 7)))])
            .build()
            .into_bytes(512);

        let response = Response::parse(&bytes).unwrap();

        assert_eq!(response.ttl(), Some(Duration::from_secs(30)));
        assert_eq!(
            response.ips().collect::<Vec<_>>(),
            vec![IpAddr::from(Ipv4Addr::new(10, 96, 0, 7))]
        );
    }

    #[test]
    fn oversized_response_is_truncated() {
        let query = query("example.com");
        let domain = query.domain().clone();

        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_answers(std::iter::repeat_n(
                (domain.clone(), 1, rdata::a(Ipv4Addr::LOCALHOST)),
                1000,
            ))
            .build();

        let bytes = response.into_bytes(1000);

        let truncated = Response::parse(&bytes).unwrap();

        assert!(truncated.truncated());
        assert_eq!(truncated.answer_count(), 0);
        assert_eq!(truncated.domain(), &domain);
    }
}
