// Text envelope codec for courier messages.
//
// A message travels as a single `&`-joined key=value string. The header is
// itself a `&`-joined key=value string whose values are sealed, and the whole
// header plus the body are sealed again before being embedded in the outer
// envelope, so `&` and newline never appear raw inside a value.
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const HEADER_KEY: &str = "courier.header";
pub const BODY_KEY: &str = "courier.body";
pub const MONITOR_KEY: &str = "courier.monitor";
pub const ADVISORY_QUEUE_KEY: &str = "courier.advisory.queue";
pub const ADVISORY_ONLINE_KEY: &str = "courier.advisory.online";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("missing header token")]
    MissingHeader,
    #[error("missing mandatory header field {0}")]
    MissingField(&'static str),
    #[error("malformed header field {0}")]
    MalformedField(&'static str),
    #[error("unknown message type {0}")]
    UnknownType(String),
}

/// Reversible escaping applied to every value embedded in an envelope.
///
/// ```
/// let sealed = courier_wire::seal("a=1&b=2\nc=3");
/// assert_eq!(sealed, "a=1#AND#b=2#LF#c=3");
/// assert_eq!(courier_wire::unseal(&sealed), "a=1&b=2\nc=3");
/// ```
pub fn seal(value: &str) -> String {
    value.replace('&', "#AND#").replace('\n', "#LF#")
}

pub fn unseal(value: &str) -> String {
    value.replace("#AND#", "&").replace("#LF#", "\n")
}

// Wall-clock (sec, nsec) pair used for the three header timestamps.
pub fn now_pair() -> (u64, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Message,
    Status,
    Query,
}

impl MessageType {
    fn as_str(&self) -> &'static str {
        match self {
            MessageType::Message => "0",
            MessageType::Status => "1",
            MessageType::Query => "2",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "0" => Ok(MessageType::Message),
            "1" => Ok(MessageType::Status),
            "2" => Ok(MessageType::Query),
            other => Err(Error::UnknownType(other.to_string())),
        }
    }

    pub fn is_advisory(&self) -> bool {
        matches!(self, MessageType::Status | MessageType::Query)
    }
}

/// Routing and bookkeeping fields carried ahead of the opaque body.
///
/// Each delivery stage fills only its own timestamp pair: the sender stamps
/// `sender_time` at creation, the broker stamps `broker_time` on admission,
/// and the receiver may stamp `receiver_time` after decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: String,
    pub reply_id: String,
    pub sender_id: String,
    pub broker_id: String,
    pub receiver_id: String,
    pub receiver_queue: String,
    pub description: String,
    pub sender_time: (u64, u32),
    pub broker_time: (u64, u32),
    pub receiver_time: (u64, u32),
    pub certificate_hash: String,
    pub signature: String,
    pub digest: String,
    pub encrypted: bool,
    pub mtype: MessageType,
}

impl MessageHeader {
    // Fresh header addressed to `receiver_queue`, stamped with sender time.
    pub fn new(receiver_queue: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            reply_id: String::new(),
            sender_id: String::new(),
            broker_id: String::new(),
            receiver_id: String::new(),
            receiver_queue: receiver_queue.into(),
            description: String::new(),
            sender_time: now_pair(),
            broker_time: (0, 0),
            receiver_time: (0, 0),
            certificate_hash: String::new(),
            signature: String::new(),
            digest: String::new(),
            encrypted: false,
            mtype: MessageType::Message,
        }
    }

    /// Correlate this header as a reply to `other`.
    pub fn set_reply_to(&mut self, other: &MessageHeader) {
        self.reply_id = other.id.clone();
    }

    fn encode(&self) -> String {
        let fields: [(&str, String); 18] = [
            ("id", self.id.clone()),
            ("reply", self.reply_id.clone()),
            ("sender", self.sender_id.clone()),
            ("broker", self.broker_id.clone()),
            ("receiver", self.receiver_id.clone()),
            ("rqueue", self.receiver_queue.clone()),
            ("desc", self.description.clone()),
            ("tx.sec", self.sender_time.0.to_string()),
            ("tx.nsec", self.sender_time.1.to_string()),
            ("brk.sec", self.broker_time.0.to_string()),
            ("brk.nsec", self.broker_time.1.to_string()),
            ("rx.sec", self.receiver_time.0.to_string()),
            ("rx.nsec", self.receiver_time.1.to_string()),
            ("cert", self.certificate_hash.clone()),
            ("sig", self.signature.clone()),
            ("digest", self.digest.clone()),
            ("enc", if self.encrypted { "1" } else { "0" }.to_string()),
            ("type", self.mtype.as_str().to_string()),
        ];
        let mut out = String::new();
        for (key, value) in fields {
            if !out.is_empty() {
                out.push('&');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(&seal(&value));
        }
        out
    }

    fn decode(raw: &str) -> Result<Self> {
        let mut header = Self {
            id: String::new(),
            reply_id: String::new(),
            sender_id: String::new(),
            broker_id: String::new(),
            receiver_id: String::new(),
            receiver_queue: String::new(),
            description: String::new(),
            sender_time: (0, 0),
            broker_time: (0, 0),
            receiver_time: (0, 0),
            certificate_hash: String::new(),
            signature: String::new(),
            digest: String::new(),
            encrypted: false,
            mtype: MessageType::Message,
        };
        let mut saw_id = false;
        let mut saw_queue = false;
        let mut saw_type = false;
        for token in raw.split('&') {
            let Some((key, sealed)) = token.split_once('=') else {
                continue;
            };
            let value = unseal(sealed);
            match key {
                "id" => {
                    header.id = value;
                    saw_id = true;
                }
                "reply" => header.reply_id = value,
                "sender" => header.sender_id = value,
                "broker" => header.broker_id = value,
                "receiver" => header.receiver_id = value,
                "rqueue" => {
                    header.receiver_queue = value;
                    saw_queue = true;
                }
                "desc" => header.description = value,
                "tx.sec" => {
                    header.sender_time.0 =
                        value.parse().map_err(|_| Error::MalformedField("tx.sec"))?
                }
                "tx.nsec" => {
                    header.sender_time.1 =
                        value.parse().map_err(|_| Error::MalformedField("tx.nsec"))?
                }
                "brk.sec" => {
                    header.broker_time.0 =
                        value.parse().map_err(|_| Error::MalformedField("brk.sec"))?
                }
                "brk.nsec" => {
                    header.broker_time.1 = value
                        .parse()
                        .map_err(|_| Error::MalformedField("brk.nsec"))?
                }
                "rx.sec" => {
                    header.receiver_time.0 =
                        value.parse().map_err(|_| Error::MalformedField("rx.sec"))?
                }
                "rx.nsec" => {
                    header.receiver_time.1 =
                        value.parse().map_err(|_| Error::MalformedField("rx.nsec"))?
                }
                "cert" => header.certificate_hash = value,
                "sig" => header.signature = value,
                "digest" => header.digest = value,
                "enc" => header.encrypted = value == "1",
                "type" => {
                    header.mtype = MessageType::parse(&value)?;
                    saw_type = true;
                }
                _ => {}
            }
        }
        if !saw_id || header.id.is_empty() {
            return Err(Error::MissingField("id"));
        }
        if !saw_queue || header.receiver_queue.is_empty() {
            return Err(Error::MissingField("rqueue"));
        }
        if !saw_type {
            return Err(Error::MissingField("type"));
        }
        Ok(header)
    }
}

/// Advisory payload announcing a queue going online or offline, or asking
/// peers to republish their state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisoryInfo {
    pub queue: String,
    pub online: bool,
}

/// A courier message: header, opaque body, optional monitor tag and
/// advisory payload.
///
/// ```
/// use courier_wire::Message;
///
/// let message = Message::to_queue("/courier/fst1", "quota=low&level=5");
/// let wire = message.encode();
/// let decoded = Message::decode(&wire).expect("decode");
/// assert_eq!(decoded.body, "quota=low&level=5");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: String,
    pub monitor: bool,
    pub advisory: Option<AdvisoryInfo>,
}

impl Message {
    pub fn to_queue(receiver_queue: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            header: MessageHeader::new(receiver_queue),
            body: body.into(),
            monitor: false,
            advisory: None,
        }
    }

    // Best-effort monitoring variant: the broker may discard it silently
    // when nothing is listening.
    pub fn monitoring(receiver_queue: impl Into<String>, body: impl Into<String>) -> Self {
        let mut message = Self::to_queue(receiver_queue, body);
        message.monitor = true;
        message
    }

    pub fn advisory(
        mtype: MessageType,
        receiver_queue: impl Into<String>,
        queue: impl Into<String>,
        online: bool,
    ) -> Self {
        let mut header = MessageHeader::new(receiver_queue);
        header.mtype = mtype;
        Self {
            header,
            body: String::new(),
            monitor: false,
            advisory: Some(AdvisoryInfo {
                queue: queue.into(),
                online,
            }),
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(HEADER_KEY);
        out.push('=');
        out.push_str(&seal(&self.header.encode()));
        out.push('&');
        out.push_str(BODY_KEY);
        out.push('=');
        out.push_str(&seal(&self.body));
        if self.monitor {
            out.push('&');
            out.push_str(MONITOR_KEY);
            out.push_str("=1");
        }
        if let Some(advisory) = &self.advisory {
            out.push('&');
            out.push_str(ADVISORY_QUEUE_KEY);
            out.push('=');
            out.push_str(&seal(&advisory.queue));
            out.push('&');
            out.push_str(ADVISORY_ONLINE_KEY);
            out.push('=');
            out.push_str(if advisory.online { "1" } else { "0" });
        }
        out
    }

    // A failed decode invalidates only this envelope; the caller may keep
    // parsing subsequent records.
    pub fn decode(raw: &str) -> Result<Self> {
        let mut header_raw = None;
        let mut body = String::new();
        let mut monitor = false;
        let mut advisory_queue = None;
        let mut advisory_online = false;
        for token in raw.trim_end_matches('\n').split('&') {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                HEADER_KEY => header_raw = Some(unseal(value)),
                BODY_KEY => body = unseal(value),
                MONITOR_KEY => monitor = value == "1",
                ADVISORY_QUEUE_KEY => advisory_queue = Some(unseal(value)),
                ADVISORY_ONLINE_KEY => advisory_online = value == "1",
                _ => {}
            }
        }
        let header_raw = header_raw.ok_or(Error::MissingHeader)?;
        let header = MessageHeader::decode(&header_raw)?;
        let advisory = advisory_queue.map(|queue| AdvisoryInfo {
            queue,
            online: advisory_online,
        });
        Ok(Self {
            header,
            body,
            monitor,
            advisory,
        })
    }

    /// Split a drained batch into individual envelopes (newline separated).
    pub fn split_batch(batch: &str) -> impl Iterator<Item = &str> {
        batch.split('\n').filter(|record| !record.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_round_trip() {
        let raw = "mgm.cmd=fs&mgm.subcmd=ls\nmgm.path=/eos";
        let sealed = seal(raw);
        assert!(!sealed.contains('&'));
        assert!(!sealed.contains('\n'));
        assert_eq!(unseal(&sealed), raw);
    }

    #[test]
    fn message_round_trip_preserves_delimiters_in_body() {
        // Body containing the envelope delimiters must survive unchanged.
        let mut message = Message::to_queue("/courier/fst1", "a=1&b=2\nc=3");
        message.header.sender_id = "/courier/mgm".to_string();
        message.header.description = "config update & reload".to_string();
        let wire = message.encode();
        let decoded = Message::decode(&wire).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn monitor_flag_round_trips() {
        let message = Message::monitoring("/courier/mon", "load=0.7");
        let decoded = Message::decode(&message.encode()).expect("decode");
        assert!(decoded.monitor);
    }

    #[test]
    fn advisory_round_trips() {
        let message = Message::advisory(MessageType::Status, "/courier/*", "/courier/fst1", true);
        let decoded = Message::decode(&message.encode()).expect("decode");
        assert_eq!(decoded.header.mtype, MessageType::Status);
        let advisory = decoded.advisory.expect("advisory");
        assert_eq!(advisory.queue, "/courier/fst1");
        assert!(advisory.online);
    }

    #[test]
    fn decode_rejects_missing_header() {
        let err = Message::decode("courier.body=hello").expect_err("missing header");
        assert!(matches!(err, Error::MissingHeader));
    }

    #[test]
    fn decode_rejects_missing_mandatory_fields() {
        // A header without an id is unusable for routing or correlation.
        let mut message = Message::to_queue("/courier/fst1", "x");
        message.header.id = String::new();
        let err = Message::decode(&message.encode()).expect_err("missing id");
        assert!(matches!(err, Error::MissingField("id")));

        let mut message = Message::to_queue("", "x");
        message.header.id = "m1".to_string();
        let err = Message::decode(&message.encode()).expect_err("missing queue");
        assert!(matches!(err, Error::MissingField("rqueue")));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let message = Message::to_queue("/courier/fst1", "x");
        let wire = message.encode();
        let header_raw = message.header.encode().replace("type=0", "type=9");
        let patched = wire.replace(
            &format!("{HEADER_KEY}={}", seal(&message.header.encode())),
            &format!("{HEADER_KEY}={}", seal(&header_raw)),
        );
        let err = Message::decode(&patched).expect_err("unknown type");
        assert!(matches!(err, Error::UnknownType(_)));
    }

    #[test]
    fn set_reply_copies_message_id() {
        let request = MessageHeader::new("/courier/mgm");
        let mut reply = MessageHeader::new("/courier/fst1");
        reply.set_reply_to(&request);
        assert_eq!(reply.reply_id, request.id);
    }

    #[test]
    fn split_batch_separates_records() {
        let a = Message::to_queue("/courier/fst1", "one").encode();
        let b = Message::to_queue("/courier/fst1", "two\nthree").encode();
        let batch = format!("{a}\n{b}\n");
        let records: Vec<_> = Message::split_batch(&batch).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(Message::decode(records[0]).expect("decode").body, "one");
        assert_eq!(
            Message::decode(records[1]).expect("decode").body,
            "two\nthree"
        );
    }

    #[test]
    fn headers_get_unique_ids() {
        let a = MessageHeader::new("/courier/fst1");
        let b = MessageHeader::new("/courier/fst1");
        assert_ne!(a.id, b.id);
    }
}
