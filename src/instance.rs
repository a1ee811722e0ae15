//! Service Instance Records
//!
//! The endpoint descriptor stored in every member and candidate node.
//! Records are JSON so that non-Rust consumers of the same group path
//! can read them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A network endpoint (host:port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("endpoint must be host:port, got {:?}", s)))?;
        if host.is_empty() {
            return Err(Error::Config(format!("endpoint host is empty in {:?}", s)));
        }
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in endpoint {:?}", s)))?;
        Ok(Self::new(host, port))
    }
}

/// Advertised status of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Dead,
    Starting,
    Alive,
    Stopping,
    Stopped,
    Warning,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Dead => write!(f, "DEAD"),
            Status::Starting => write!(f, "STARTING"),
            Status::Alive => write!(f, "ALIVE"),
            Status::Stopping => write!(f, "STOPPING"),
            Status::Stopped => write!(f, "STOPPED"),
            Status::Warning => write!(f, "WARNING"),
        }
    }
}

/// A process's advertised presence in a server set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// Primary endpoint
    pub service_endpoint: Endpoint,
    /// Named auxiliary endpoints (e.g. "http", "health")
    #[serde(default)]
    pub additional_endpoints: BTreeMap<String, Endpoint>,
    /// Advertised status
    pub status: Status,
    /// Shard identifier, when the service is sharded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<u32>,
}

impl ServiceInstance {
    /// Create an alive instance with a single endpoint
    pub fn new(service_endpoint: Endpoint) -> Self {
        Self {
            service_endpoint,
            additional_endpoints: BTreeMap::new(),
            status: Status::Alive,
            shard: None,
        }
    }

    pub fn with_additional_endpoint(mut self, name: impl Into<String>, endpoint: Endpoint) -> Self {
        self.additional_endpoints.insert(name.into(), endpoint);
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_shard(mut self, shard: u32) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Serialize for storage in a node
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse node data read from `path`
    pub fn decode(path: &str, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::MalformedRecord {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.service_endpoint, self.status)?;
        if let Some(shard) = self.shard {
            write!(f, " shard {}", shard)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let endpoint: Endpoint = "scheduler-1.example.com:8081".parse().unwrap();
        assert_eq!(endpoint.host, "scheduler-1.example.com");
        assert_eq!(endpoint.port, 8081);
        assert_eq!(endpoint.to_string(), "scheduler-1.example.com:8081");

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":8081".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_decode_wire_format() {
        let json = br#"{
            "serviceEndpoint": {"host": "10.0.0.5", "port": 8081},
            "additionalEndpoints": {"http": {"host": "10.0.0.5", "port": 8080}},
            "status": "ALIVE",
            "shard": 3
        }"#;

        let instance = ServiceInstance::decode("/aurora/member_0000000001", json).unwrap();
        assert_eq!(instance.service_endpoint, Endpoint::new("10.0.0.5", 8081));
        assert_eq!(instance.additional_endpoints["http"].port, 8080);
        assert_eq!(instance.status, Status::Alive);
        assert_eq!(instance.shard, Some(3));
    }

    #[test]
    fn test_decode_minimal_record() {
        let json = br#"{"serviceEndpoint": {"host": "a", "port": 1}, "status": "STARTING"}"#;
        let instance = ServiceInstance::decode("/p/member_0000000001", json).unwrap();
        assert!(instance.additional_endpoints.is_empty());
        assert_eq!(instance.shard, None);
        assert_eq!(instance.status, Status::Starting);
    }

    #[test]
    fn test_decode_malformed() {
        let err = ServiceInstance::decode("/aurora/member_0000000002", b"not json").unwrap_err();
        match err {
            Error::MalformedRecord { path, .. } => assert_eq!(path, "/aurora/member_0000000002"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_encode_uses_camel_case() {
        let instance = ServiceInstance::new(Endpoint::new("h", 1))
            .with_additional_endpoint("health", Endpoint::new("h", 2));
        let text = String::from_utf8(instance.encode().unwrap()).unwrap();
        assert!(text.contains("\"serviceEndpoint\""));
        assert!(text.contains("\"additionalEndpoints\""));
        assert!(text.contains("\"ALIVE\""));
        assert!(!text.contains("shard"));
    }
}
