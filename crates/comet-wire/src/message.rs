// Payload classification and transport control messages.
//
// Every payload is an XML document whose root element carries a `role`
// attribute. Event roles also carry an `ivorn`; heartbeats carry an `Origin`
// child naming the sender.
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use std::fmt;

/// Roles that denote an astronomical event rather than protocol traffic.
pub const VOEVENT_ROLES: [&str; 4] = ["observation", "prediction", "utility", "test"];

pub const TRANSPORT_NAMESPACE: &str = "http://telescope-networks.org/schema/Transport/v1.1";
const TRANSPORT_SCHEMA_LOCATION: &str = "http://telescope-networks.org/schema/Transport/v1.1 \
     http://telescope-networks.org/schema/Transport-v1.1.xsd";

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed attribute: {0}")]
    Attribute(#[from] AttrError),
    #[error("document has no root element")]
    NoRoot,
    #[error("document ends inside element <{0}>")]
    Unclosed(String),
    #[error("content after the root element")]
    TrailingContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Observation,
    Prediction,
    Utility,
    Test,
    IAmAlive,
    Ack,
    /// Any other value, including a missing attribute (empty string).
    Unknown(String),
}

impl Role {
    pub fn parse(value: &str) -> Self {
        match value {
            "observation" => Role::Observation,
            "prediction" => Role::Prediction,
            "utility" => Role::Utility,
            "test" => Role::Test,
            "iamalive" => Role::IAmAlive,
            "ack" => Role::Ack,
            other => Role::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Observation => "observation",
            Role::Prediction => "prediction",
            Role::Utility => "utility",
            Role::Test => "test",
            Role::IAmAlive => "iamalive",
            Role::Ack => "ack",
            Role::Unknown(other) => other,
        }
    }

    /// True for the four event roles in [`VOEVENT_ROLES`].
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            Role::Observation | Role::Prediction | Role::Utility | Role::Test
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified payload: the original bytes plus the attributes the
/// protocol roles dispatch on.
///
/// ```
/// use bytes::Bytes;
/// use comet_wire::{Message, Role};
///
/// let payload = Bytes::from_static(
///     br#"<voe:VOEvent xmlns:voe="http://www.ivoa.net/xml/VOEvent/v2.0" role="observation" ivorn="ivo://x.y/z#1"/>"#,
/// );
/// let message = Message::parse(payload).expect("parse");
/// assert_eq!(message.role(), &Role::Observation);
/// assert_eq!(message.ivorn(), Some("ivo://x.y/z#1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    role: Role,
    ivorn: Option<String>,
    origin: Option<String>,
}

impl Message {
    /// Parses a whole payload; the document must be well formed end to end.
    pub fn parse(payload: Bytes) -> Result<Self, ParseError> {
        let source = payload.clone();
        let mut reader = Reader::from_reader(&source[..]);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut depth = 0usize;
        let mut root: Option<(Role, Option<String>)> = None;
        let mut origin: Option<String> = None;
        let mut in_origin = false;
        let mut open: Vec<String> = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(start) => {
                    let name = local_name(&start);
                    if depth == 0 {
                        if root.is_some() {
                            return Err(ParseError::TrailingContent);
                        }
                        root = Some(root_attributes(&start)?);
                    } else if depth == 1 && name == "Origin" && origin.is_none() {
                        in_origin = true;
                        origin = Some(String::new());
                    }
                    open.push(name);
                    depth += 1;
                }
                Event::Empty(start) => {
                    if depth == 0 {
                        if root.is_some() {
                            return Err(ParseError::TrailingContent);
                        }
                        root = Some(root_attributes(&start)?);
                    } else if depth == 1 && local_name(&start) == "Origin" && origin.is_none() {
                        origin = Some(String::new());
                    }
                }
                Event::End(_) => {
                    // Mismatched end tags are rejected by the reader itself.
                    open.pop();
                    depth = depth.saturating_sub(1);
                    in_origin = false;
                }
                Event::Text(text) => {
                    if depth == 0 {
                        return Err(ParseError::TrailingContent);
                    }
                    if in_origin {
                        let text = text.unescape()?;
                        if let Some(origin) = origin.as_mut() {
                            origin.push_str(&text);
                        }
                    }
                }
                Event::CData(data) => {
                    if depth == 0 {
                        return Err(ParseError::TrailingContent);
                    }
                    if in_origin && let Some(origin) = origin.as_mut() {
                        origin.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => break,
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            }
            buf.clear();
        }

        if let Some(unclosed) = open.pop() {
            return Err(ParseError::Unclosed(unclosed));
        }
        let (role, ivorn) = root.ok_or(ParseError::NoRoot)?;
        Ok(Self {
            payload,
            role,
            ivorn,
            origin,
        })
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn ivorn(&self) -> Option<&str> {
        self.ivorn.as_deref()
    }

    /// Text of the root's `Origin` child, if present.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn root_attributes(start: &BytesStart<'_>) -> Result<(Role, Option<String>), ParseError> {
    let mut role = None;
    let mut ivorn = None;
    for attr in start.attributes() {
        let attr = attr?;
        match attr.key.local_name().as_ref() {
            b"role" => role = Some(attr.unescape_value()?.into_owned()),
            b"ivorn" => ivorn = Some(attr.unescape_value()?.into_owned()),
            _ => {}
        }
    }
    let role = Role::parse(role.as_deref().unwrap_or_default());
    Ok((role, ivorn))
}

/// Transport-protocol control message (`trn:Transport` document).
///
/// ```
/// use comet_wire::{Message, Role, TransportMessage};
///
/// let ack = TransportMessage::ack("ivo://comet.broker/default", "ivo://x.y/z#1");
/// let parsed = Message::parse(ack.to_bytes()).expect("parse");
/// assert_eq!(parsed.role(), &Role::Ack);
/// assert_eq!(parsed.origin(), Some("ivo://x.y/z#1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    role: Role,
    origin: String,
    response: Option<String>,
    result: Option<&'static str>,
    timestamp: DateTime<Utc>,
}

impl TransportMessage {
    /// Acknowledges receipt of the event `ivorn` on behalf of `local_ivorn`.
    pub fn ack(local_ivorn: &str, ivorn: &str) -> Self {
        Self {
            role: Role::Ack,
            origin: ivorn.to_string(),
            response: Some(local_ivorn.to_string()),
            result: Some("Message received"),
            timestamp: Utc::now(),
        }
    }

    /// Heartbeat sent by a publisher to each connected subscriber.
    pub fn iamalive(local_ivorn: &str) -> Self {
        Self {
            role: Role::IAmAlive,
            origin: local_ivorn.to_string(),
            response: None,
            result: None,
            timestamp: Utc::now(),
        }
    }

    /// Reply to a heartbeat; echoes the heartbeat's origin so the sender can
    /// correlate it.
    pub fn iamalive_response(local_ivorn: &str, origin: &str) -> Self {
        Self {
            role: Role::IAmAlive,
            origin: origin.to_string(),
            response: Some(local_ivorn.to_string()),
            result: None,
            timestamp: Utc::now(),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut xml = String::with_capacity(512);
        xml.push_str("<?xml version='1.0' encoding='UTF-8'?>\n");
        xml.push_str(&format!(
            "<trn:Transport xmlns:trn=\"{TRANSPORT_NAMESPACE}\" \
             xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" \
             xsi:schemaLocation=\"{TRANSPORT_SCHEMA_LOCATION}\" \
             role=\"{}\" version=\"1.0\">\n",
            self.role.as_str()
        ));
        xml.push_str(&format!("  <Origin>{}</Origin>\n", escape(self.origin.as_str())));
        if let Some(response) = &self.response {
            xml.push_str(&format!("  <Response>{}</Response>\n", escape(response.as_str())));
        }
        xml.push_str(&format!(
            "  <TimeStamp>{}</TimeStamp>\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        if let Some(result) = self.result {
            xml.push_str(&format!("  <Meta>\n    <Result>{result}</Result>\n  </Meta>\n"));
        }
        xml.push_str("</trn:Transport>\n");
        Bytes::from(xml)
    }
}
