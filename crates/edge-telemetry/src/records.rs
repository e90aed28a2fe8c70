//! Decoded telemetry record types.
//!
//! Logs, info, metrics, requests and app logs travel as JSON projections of
//! the node's structured messages. Flow logs travel protobuf-encoded. Every
//! record embeds a timestamp; [`timestamp_of`] extracts just that for the
//! cachers, and [`canonicalize`] turns a JSON value received from the remote
//! controller into the canonical byte form of its kind.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use prost::Message;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TelemetryError};
use crate::types::{LoaderObjectType, RecordTimestamp};

/// A decoded record that the query engine and handlers can work with.
pub trait Record: Serialize + Sized + Send + 'static {
    /// Decodes one record from its canonical byte form.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Decode`] if the payload is malformed.
    fn decode(data: &[u8]) -> Result<Self>;

    /// The timestamp embedded in the record, if present.
    fn timestamp(&self) -> Option<RecordTimestamp>;
}

fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

// protojson renders 64-bit integers as strings
fn int_from_number_or_string<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr<T> {
        Number(T),
        Text(String),
    }
    match Repr::<T>::deserialize(deserializer)? {
        Repr::Number(n) => Ok(n),
        Repr::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

/// One log line emitted by a device or an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogEntry {
    /// Severity label, e.g. `ERROR`.
    pub severity: String,
    /// Emitting agent.
    pub source: String,
    /// Process id of the emitter.
    pub iid: String,
    /// Log message body.
    pub content: String,
    /// Message sequence number.
    #[serde(deserialize_with = "int_from_number_or_string")]
    pub msgid: u64,
    /// Free-form tags.
    pub tags: BTreeMap<String, String>,
    /// Time the entry was produced.
    pub timestamp: Option<DateTime<Utc>>,
    /// Source file of the emitter.
    pub filename: String,
    /// Function of the emitter.
    pub function: String,
    /// Software image the entry was emitted from.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image: String,
    /// Node software version.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub eve_version: String,
}

impl Record for LogEntry {
    fn decode(data: &[u8]) -> Result<Self> {
        decode_json(data)
    }

    fn timestamp(&self) -> Option<RecordTimestamp> {
        self.timestamp.map(RecordTimestamp::from)
    }
}

/// A device info snapshot.
///
/// Only the envelope is typed; the kind-specific body stays a JSON map so
/// queries can reach any field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InfoMsg {
    /// Info message type, e.g. `ZiDevice`.
    pub ztype: String,
    /// Device UUID as reported by the node.
    pub dev_id: String,
    /// Time the snapshot was taken.
    pub at_time_stamp: Option<DateTime<Utc>>,
    /// Remaining message fields.
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

impl Record for InfoMsg {
    fn decode(data: &[u8]) -> Result<Self> {
        decode_json(data)
    }

    fn timestamp(&self) -> Option<RecordTimestamp> {
        self.at_time_stamp.map(RecordTimestamp::from)
    }
}

/// A device metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricMsg {
    /// Device UUID as reported by the node.
    pub dev_id: String,
    /// Time the snapshot was taken.
    pub at_time_stamp: Option<DateTime<Utc>>,
    /// Remaining message fields.
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

impl Record for MetricMsg {
    fn decode(data: &[u8]) -> Result<Self> {
        decode_json(data)
    }

    fn timestamp(&self) -> Option<RecordTimestamp> {
        self.at_time_stamp.map(RecordTimestamp::from)
    }
}

/// An API call the node made against the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiRequest {
    /// Device UUID of the caller, if known.
    pub uuid: String,
    /// Caller address.
    #[serde(alias = "client-ip")]
    pub client_ip: String,
    /// `X-Forwarded-For` value.
    pub forwarded: String,
    /// HTTP method.
    pub method: String,
    /// Requested URL.
    pub url: String,
    /// Time the request was received.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record for ApiRequest {
    fn decode(data: &[u8]) -> Result<Self> {
        decode_json(data)
    }

    fn timestamp(&self) -> Option<RecordTimestamp> {
        self.timestamp.map(RecordTimestamp::from)
    }
}

/// Wire-compatible mirror of `google.protobuf.Timestamp`.
///
/// Deserializes from RFC 3339 text, as protojson writes it, or from a
/// `{"seconds", "nanos"}` object.
#[derive(Clone, Copy, PartialEq, Eq, Message, Serialize)]
pub struct ProtoTimestamp {
    /// Seconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    /// Sub-second nanoseconds.
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl<'de> Deserialize<'de> for ProtoTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Default, Deserialize)]
        #[serde(default)]
        struct Parts {
            #[serde(deserialize_with = "int_from_number_or_string")]
            seconds: i64,
            nanos: i32,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(DateTime<Utc>),
            Parts(Parts),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(at) => Ok(Self {
                seconds: at.timestamp(),
                nanos: i32::try_from(at.timestamp_subsec_nanos()).map_err(de::Error::custom)?,
            }),
            Repr::Parts(parts) => Ok(Self {
                seconds: parts.seconds,
                nanos: parts.nanos,
            }),
        }
    }
}

/// Network instance a flow was observed on.
#[derive(Clone, PartialEq, Eq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopeInfo {
    /// Application UUID.
    #[prost(string, tag = "1")]
    pub uuid: String,
    /// Application-side interface.
    #[prost(string, tag = "2")]
    pub intf: String,
    /// Host-side interface.
    #[prost(string, tag = "3")]
    pub local_intf: String,
    /// Network instance UUID.
    #[prost(string, tag = "4")]
    pub net_inst_uuid: String,
}

/// Five-tuple of a flow.
#[derive(Clone, PartialEq, Eq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpFlow {
    /// Source address.
    #[prost(string, tag = "1")]
    pub src: String,
    /// Destination address.
    #[prost(string, tag = "2")]
    pub dest: String,
    /// IP protocol number.
    #[prost(int32, tag = "3")]
    pub protocol: i32,
    /// Source port.
    #[prost(int32, tag = "4")]
    pub src_port: i32,
    /// Destination port.
    #[prost(int32, tag = "5")]
    pub dest_port: i32,
}

/// Accounting for one flow.
#[derive(Clone, PartialEq, Eq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowRecord {
    /// Flow identity.
    #[prost(message, optional, tag = "1")]
    pub flow: Option<IpFlow>,
    /// Direction relative to the application.
    #[prost(bool, tag = "2")]
    pub inbound: bool,
    /// Matching ACL id.
    #[prost(int32, tag = "3")]
    pub acl_id: i32,
    /// Flow start, nanoseconds since the epoch.
    #[prost(int64, tag = "4")]
    #[serde(deserialize_with = "int_from_number_or_string")]
    pub start_time: i64,
    /// Flow end, nanoseconds since the epoch.
    #[prost(int64, tag = "5")]
    #[serde(deserialize_with = "int_from_number_or_string")]
    pub end_time: i64,
    /// Transmitted bytes.
    #[prost(int64, tag = "6")]
    #[serde(deserialize_with = "int_from_number_or_string")]
    pub tx_bytes: i64,
    /// Transmitted packets.
    #[prost(int64, tag = "7")]
    #[serde(deserialize_with = "int_from_number_or_string")]
    pub tx_pkts: i64,
    /// Received bytes.
    #[prost(int64, tag = "8")]
    #[serde(deserialize_with = "int_from_number_or_string")]
    pub rx_bytes: i64,
    /// Received packets.
    #[prost(int64, tag = "9")]
    #[serde(deserialize_with = "int_from_number_or_string")]
    pub rx_pkts: i64,
}

/// A DNS lookup made by an application.
#[derive(Clone, PartialEq, Eq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsRequest {
    /// Queried name.
    #[prost(string, tag = "1")]
    pub host_name: String,
    /// Resolved addresses.
    #[prost(string, repeated, tag = "2")]
    pub addrs: Vec<String>,
    /// Request time, nanoseconds since the epoch.
    #[prost(int64, tag = "3")]
    #[serde(deserialize_with = "int_from_number_or_string")]
    pub request_time: i64,
    /// Matching ACL number.
    #[prost(int32, tag = "4")]
    pub acl_num: i32,
}

/// A batch of flow records for one network scope.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowMessage {
    /// Device UUID as reported by the node.
    #[prost(string, tag = "1")]
    pub dev_id: String,
    /// Where the flows were observed.
    #[prost(message, optional, tag = "2")]
    pub scope: Option<ScopeInfo>,
    /// Flow accounting entries.
    #[prost(message, repeated, tag = "3")]
    pub flows: Vec<FlowRecord>,
    /// DNS lookups.
    #[prost(message, repeated, tag = "4")]
    pub dns_reqs: Vec<DnsRequest>,
    /// Time the batch was assembled.
    #[prost(message, optional, tag = "5")]
    pub timestamp: Option<ProtoTimestamp>,
}

impl Record for FlowMessage {
    fn decode(data: &[u8]) -> Result<Self> {
        Ok(<Self as Message>::decode(data)?)
    }

    fn timestamp(&self) -> Option<RecordTimestamp> {
        self.timestamp
            .map(|ts| RecordTimestamp::new(ts.seconds, ts.nanos))
    }
}

fn timestamp_from<R: Record>(kind: LoaderObjectType, data: &[u8]) -> Result<RecordTimestamp> {
    R::decode(data)?
        .timestamp()
        .ok_or(TelemetryError::MissingTimestamp(kind))
}

/// Extracts the embedded timestamp of a canonical record of `kind`.
///
/// # Errors
///
/// Returns a decode error for malformed payloads and
/// [`TelemetryError::MissingTimestamp`] if the record has none.
pub fn timestamp_of(kind: LoaderObjectType, data: &[u8]) -> Result<RecordTimestamp> {
    match kind {
        LoaderObjectType::Logs | LoaderObjectType::AppLog => timestamp_from::<LogEntry>(kind, data),
        LoaderObjectType::Info => timestamp_from::<InfoMsg>(kind, data),
        LoaderObjectType::Metrics => timestamp_from::<MetricMsg>(kind, data),
        LoaderObjectType::Request => timestamp_from::<ApiRequest>(kind, data),
        LoaderObjectType::FlowLog => timestamp_from::<FlowMessage>(kind, data),
    }
}

/// Converts a JSON-projected message into the canonical bytes of `kind`.
///
/// Flow logs are re-encoded as protobuf; everything else becomes compact JSON.
///
/// # Errors
///
/// Returns a decode error if a flow log does not fit the message schema.
pub fn canonicalize(kind: LoaderObjectType, value: Value) -> Result<Vec<u8>> {
    match kind {
        LoaderObjectType::FlowLog => {
            let msg: FlowMessage = serde_json::from_value(value)?;
            Ok(msg.encode_to_vec())
        }
        _ => Ok(serde_json::to_vec(&value)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_entry_decodes_protojson_projection() {
        let data = br#"{"severity":"ERROR","source":"pillar","content":"boom",
            "msgid":"7","timestamp":"2023-01-02T03:04:05.000000006Z","eveVersion":"9.1"}"#;
        let entry = LogEntry::decode(data).unwrap();
        assert_eq!(entry.msgid, 7);
        assert_eq!(entry.severity, "ERROR");
        assert_eq!(entry.eve_version, "9.1");
        assert_eq!(entry.timestamp().unwrap().nanos, 6);
    }

    #[test]
    fn log_entry_accepts_numeric_msgid() {
        let entry = LogEntry::decode(br#"{"msgid":12}"#).unwrap();
        assert_eq!(entry.msgid, 12);
        assert!(LogEntry::decode(br#"{"msgid":"twelve"}"#).is_err());
    }

    #[test]
    fn info_keeps_unknown_fields() {
        let data = br#"{"ztype":"ZiDevice","devId":"d1","atTimeStamp":"2023-01-02T03:04:05Z",
            "dinfo":{"network":[{"devName":"eth0"}]}}"#;
        let info = InfoMsg::decode(data).unwrap();
        assert_eq!(info.ztype, "ZiDevice");
        assert!(info.content.contains_key("dinfo"));
        assert_eq!(info.timestamp().unwrap().nanos, 0);
    }

    #[test]
    fn request_accepts_dashed_client_ip() {
        let data = br#"{"client-ip":"10.0.0.1","method":"POST","url":"/api/v2/edgedevice/info",
            "timestamp":"2023-01-02T03:04:05Z"}"#;
        let req = ApiRequest::decode(data).unwrap();
        assert_eq!(req.client_ip, "10.0.0.1");
    }

    #[test]
    fn flow_message_protobuf_timestamp() {
        let msg = FlowMessage {
            dev_id: "d1".to_string(),
            timestamp: Some(ProtoTimestamp {
                seconds: 10,
                nanos: 20,
            }),
            ..Default::default()
        };
        let data = msg.encode_to_vec();
        let ts = timestamp_of(LoaderObjectType::FlowLog, &data).unwrap();
        assert_eq!(ts, RecordTimestamp::new(10, 20));
    }

    #[test]
    fn missing_timestamp_is_reported() {
        let err = timestamp_of(LoaderObjectType::Logs, br#"{"severity":"INFO"}"#).unwrap_err();
        assert!(matches!(err, TelemetryError::MissingTimestamp(LoaderObjectType::Logs)));
    }

    #[test]
    fn malformed_payload_is_decode_error() {
        let err = timestamp_of(LoaderObjectType::Metrics, b"not json").unwrap_err();
        assert!(err.is_decode());
    }

    #[test]
    fn canonicalize_flow_log_to_protobuf() {
        let value = json!({
            "devId": "d1",
            "flows": [{"flow": {"src": "10.1.0.2", "destPort": 443}}],
            "timestamp": {"seconds": 5, "nanos": 1}
        });
        let bytes = canonicalize(LoaderObjectType::FlowLog, value).unwrap();
        let msg = <FlowMessage as Record>::decode(&bytes).unwrap();
        assert_eq!(msg.flows.len(), 1);
        assert_eq!(msg.flows[0].flow.as_ref().unwrap().dest_port, 443);
    }

    #[test]
    fn canonicalize_flow_log_from_protojson() {
        let value = json!({
            "devId": "d1",
            "flows": [{"txBytes": "100", "rxPkts": 3, "startTime": "1672531200000000000"}],
            "dnsReqs": [{"hostName": "example.com", "requestTime": "1672531200000000001"}],
            "timestamp": "2023-01-01T00:00:00.000000005Z"
        });
        let bytes = canonicalize(LoaderObjectType::FlowLog, value).unwrap();
        let msg = <FlowMessage as Record>::decode(&bytes).unwrap();
        assert_eq!(msg.flows[0].tx_bytes, 100);
        assert_eq!(msg.flows[0].rx_pkts, 3);
        assert_eq!(msg.flows[0].start_time, 1_672_531_200_000_000_000);
        assert_eq!(msg.dns_reqs[0].request_time, 1_672_531_200_000_000_001);
        assert_eq!(
            timestamp_of(LoaderObjectType::FlowLog, &bytes).unwrap(),
            RecordTimestamp::new(1_672_531_200, 5)
        );
    }

    #[test]
    fn proto_timestamp_accepts_string_seconds() {
        let ts: ProtoTimestamp = serde_json::from_value(json!({"seconds": "7", "nanos": 8})).unwrap();
        assert_eq!((ts.seconds, ts.nanos), (7, 8));
        assert!(serde_json::from_value::<ProtoTimestamp>(json!("yesterday")).is_err());
    }

    #[test]
    fn canonicalize_json_kinds_compacts() {
        let value = json!({"severity": "INFO", "timestamp": "2023-01-02T03:04:05Z"});
        let bytes = canonicalize(LoaderObjectType::Logs, value).unwrap();
        assert!(!bytes.contains(&b' '));
        assert!(timestamp_of(LoaderObjectType::Logs, &bytes).is_ok());
    }
}
