//! Minimal DNS client for A and SRV lookups.
//!
//! Messages are encoded and decoded with `hickory-proto`; the exchange itself
//! is a single UDP request/response owned by this module so that the response
//! transaction id can be checked against the query before any record is
//! trusted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

/// Default time to wait for a DNS response.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive buffer for a single UDP response.
const MAX_RESPONSE_SIZE: usize = 4096;

/// DNS lookup errors. The resolver treats all of them as "no change".
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("invalid name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("malformed DNS message: {0}")]
    Malformed(String),

    #[error("DNS ID mismatch, request: {request}, response: {response}")]
    IdMismatch { request: u16, response: u16 },

    #[error("server answered {0}")]
    ServerFailure(ResponseCode),

    #[error("no system name server: {0}")]
    NoSystemServer(String),
}

/// One SRV answer: where the service lives and on which port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub target: String,
    pub port: u16,
}

/// DNS lookups needed by the resolver.
#[async_trait]
pub trait DnsClient: Send + Sync + 'static {
    /// IPv4 addresses for `name`, in answer order. Empty when there are none.
    async fn lookup_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError>;

    /// SRV answers for `name`, in answer order. Empty when there are none.
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>, DnsError>;
}

/// DNS client that talks to one server over UDP.
#[derive(Debug, Clone)]
pub struct UdpDnsClient {
    server: SocketAddr,
    query_timeout: Duration,
}

impl UdpDnsClient {
    pub fn new(server: SocketAddr) -> Self {
        Self::with_timeout(server, DEFAULT_QUERY_TIMEOUT)
    }

    pub fn with_timeout(server: SocketAddr, query_timeout: Duration) -> Self {
        Self {
            server,
            query_timeout,
        }
    }

    async fn exchange(&self, name: &str, record_type: RecordType) -> Result<Message, DnsError> {
        let id: u16 = rand::random();
        let request = build_query(id, name, record_type)?;

        let bind_addr = match self.server.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.server).await?;

        debug!(name, record_type = %record_type, server = %self.server, "Querying DNS");
        socket.send(&request).await?;

        let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
        let len = timeout(self.query_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::Timeout(self.query_timeout))??;

        parse_response(id, &buf[..len])
    }
}

#[async_trait]
impl DnsClient for UdpDnsClient {
    async fn lookup_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let response = self.exchange(name, RecordType::A).await?;
        Ok(a_records(&response))
    }

    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>, DnsError> {
        let response = self.exchange(name, RecordType::SRV).await?;
        Ok(srv_records(&response))
    }
}

/// Turn a configured host into a fully qualified name.
pub fn fqdn(name: &str) -> Result<Name, DnsError> {
    let mut fqdn = Name::from_ascii(name).map_err(|e| DnsError::InvalidName {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    fqdn.set_fqdn(true);
    Ok(fqdn)
}

/// Encode a recursive single-question query with the given transaction id.
pub fn build_query(id: u16, name: &str, record_type: RecordType) -> Result<Vec<u8>, DnsError> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(fqdn(name)?, record_type));

    message
        .to_vec()
        .map_err(|e| DnsError::Malformed(e.to_string()))
}

/// Decode a response and verify it answers the query with `request_id`.
///
/// A response carrying another id is rejected outright: it is either stale or
/// injected by someone who did not see the query.
pub fn parse_response(request_id: u16, bytes: &[u8]) -> Result<Message, DnsError> {
    let message = Message::from_vec(bytes).map_err(|e| DnsError::Malformed(e.to_string()))?;

    if message.id() != request_id {
        return Err(DnsError::IdMismatch {
            request: request_id,
            response: message.id(),
        });
    }

    if message.message_type() != MessageType::Response {
        return Err(DnsError::Malformed("expected a response".to_string()));
    }

    match message.response_code() {
        // NXDOMAIN is an empty answer, not a failure.
        ResponseCode::NoError | ResponseCode::NXDomain => Ok(message),
        code => Err(DnsError::ServerFailure(code)),
    }
}

/// A records in the answer section. CNAMEs and other types are skipped.
pub fn a_records(message: &Message) -> Vec<Ipv4Addr> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .collect()
}

/// SRV records in the answer section.
pub fn srv_records(message: &Message) -> Vec<SrvTarget> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::SRV(srv)) => Some(SrvTarget {
                target: srv.target().to_utf8(),
                port: srv.port(),
            }),
            _ => None,
        })
        .collect()
}

/// First name server from the system resolver configuration.
pub fn system_name_server() -> Result<SocketAddr, DnsError> {
    let (config, _opts) = hickory_resolver::system_conf::read_system_conf()
        .map_err(|e| DnsError::NoSystemServer(e.to_string()))?;

    config
        .name_servers()
        .first()
        .map(|ns| ns.socket_addr)
        .ok_or_else(|| DnsError::NoSystemServer("no nameserver entries".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, CNAME, SRV};
    use hickory_proto::rr::Record;

    fn response_for(query: &[u8], id: u16, answers: Vec<RData>) -> Vec<u8> {
        let request = Message::from_vec(query).unwrap();
        let name = request.queries()[0].name().clone();

        let mut response = Message::new();
        response
            .set_id(id)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError);
        response.add_query(request.queries()[0].clone());
        for rdata in answers {
            response.add_answer(Record::from_rdata(name.clone(), 60, rdata));
        }
        response.to_vec().unwrap()
    }

    #[test]
    fn test_build_query_is_fully_qualified() {
        let bytes = build_query(4242, "backend.internal", RecordType::A).unwrap();
        let message = Message::from_vec(&bytes).unwrap();

        assert_eq!(message.id(), 4242);
        assert!(message.recursion_desired());
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].query_type(), RecordType::A);
        assert!(message.queries()[0].name().is_fqdn());
    }

    #[test]
    fn test_parse_response_rejects_mismatched_id() {
        let query = build_query(100, "backend.internal", RecordType::A).unwrap();
        let response = response_for(&query, 101, vec![RData::A(A::new(10, 0, 0, 1))]);

        match parse_response(100, &response) {
            Err(DnsError::IdMismatch { request, response }) => {
                assert_eq!(request, 100);
                assert_eq!(response, 101);
            }
            other => panic!("expected IdMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_a_records_skip_other_types() {
        let query = build_query(7, "backend.internal", RecordType::A).unwrap();
        let response = response_for(
            &query,
            7,
            vec![
                RData::CNAME(CNAME(Name::from_ascii("alias.internal.").unwrap())),
                RData::A(A::new(10, 0, 0, 2)),
                RData::A(A::new(10, 0, 0, 1)),
            ],
        );

        let message = parse_response(7, &response).unwrap();
        assert_eq!(
            a_records(&message),
            vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1)]
        );
    }

    #[test]
    fn test_srv_records() {
        let query = build_query(9, "_svc._tcp.example.test", RecordType::SRV).unwrap();
        let response = response_for(
            &query,
            9,
            vec![RData::SRV(SRV::new(
                10,
                5,
                8443,
                Name::from_ascii("node1.example.test.").unwrap(),
            ))],
        );

        let message = parse_response(9, &response).unwrap();
        assert_eq!(
            srv_records(&message),
            vec![SrvTarget {
                target: "node1.example.test.".to_string(),
                port: 8443,
            }]
        );
    }

    #[test]
    fn test_server_failure_is_an_error() {
        let query = build_query(11, "backend.internal", RecordType::A).unwrap();
        let request = Message::from_vec(&query).unwrap();
        let mut response = Message::new();
        response
            .set_id(11)
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::ServFail);
        response.add_query(request.queries()[0].clone());

        assert!(matches!(
            parse_response(11, &response.to_vec().unwrap()),
            Err(DnsError::ServerFailure(ResponseCode::ServFail))
        ));
    }

    #[tokio::test]
    async fn test_lookup_times_out_without_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client =
            UdpDnsClient::with_timeout(silent.local_addr().unwrap(), Duration::from_millis(50));

        assert!(matches!(
            client.lookup_a("backend.internal").await,
            Err(DnsError::Timeout(_))
        ));
    }
}
