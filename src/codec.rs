//! XML wire codec (spec section 4.1).
//!
//! Parsing is permissive (accepts both the v3 `<property name=.. value=..>`
//! shape and the legacy v2 shape where the child tag name IS the property
//! name) and normalises everything to the v3 shape for downstream
//! consumers. Serialisation only ever produces well-formed, minimal XML —
//! the engine never needs to round-trip a frame it didn't build itself.

use roxmltree::Document;

use crate::error::CodecError;
use crate::model::{AckResult, AckStatus, Command, ProtocolVersion, PropertyAck, PropertyEvent};

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>";
/// How much of a malformed payload to keep for diagnostics (spec 4.1).
const MALFORMED_SNIPPET_LEN: usize = 200;

/// A parsed inbound frame, normalised to a small set of shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Transponder(TransponderFrame),
    Ack(Vec<AckResult>),
    Notify { sequence: u32, properties: Vec<PropertyEvent> },
    Subscription(Vec<PropertyAck>),
    Unsubscribe(Vec<PropertyAck>),
    Update(Vec<PropertyAck>),
    /// Opaque pass-through: root name plus the raw payload bytes.
    Opaque { root: String, raw: String },
    KeepAlive,
    Goodbye,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransponderFrame {
    pub model: String,
    pub revision: String,
    pub name: String,
    pub protocol_version: Option<ProtocolVersion>,
    pub control_port: Option<u16>,
    pub notify_port: Option<u16>,
    pub keepalive_interval_ms: Option<u32>,
}

fn truncated_snippet(bytes: &[u8]) -> String {
    let take = bytes.len().min(MALFORMED_SNIPPET_LEN);
    String::from_utf8_lossy(&bytes[..take]).into_owned()
}

/// Parse an inbound datagram, enforcing the size bound before any
/// allocation-heavy work happens (spec P7).
pub fn parse_inbound(bytes: &[u8], max_xml_bytes: usize) -> Result<InboundFrame, CodecError> {
    if bytes.len() > max_xml_bytes {
        return Err(CodecError::XmlTooLarge {
            size: bytes.len(),
            max: max_xml_bytes,
        });
    }

    let text = std::str::from_utf8(bytes).map_err(|e| CodecError::XmlMalformed {
        detail: format!("invalid utf-8: {e}"),
        snippet: truncated_snippet(bytes),
    })?;

    let doc = Document::parse(text).map_err(|e| CodecError::XmlMalformed {
        detail: e.to_string(),
        snippet: truncated_snippet(bytes),
    })?;

    let root = doc.root_element();
    match root.tag_name().name() {
        "emotivaTransponder" => parse_transponder(&root).map(InboundFrame::Transponder),
        "emotivaAck" => parse_ack(&root).map(InboundFrame::Ack),
        "emotivaNotify" => parse_notify(&root),
        "emotivaSubscription" => parse_property_acks(&root).map(InboundFrame::Subscription),
        "emotivaUnsubscribe" => parse_property_acks(&root).map(InboundFrame::Unsubscribe),
        "emotivaUpdate" => parse_property_acks(&root).map(InboundFrame::Update),
        "emotivaMenuNotify" | "emotivaBarNotify" => Ok(InboundFrame::Opaque {
            root: root.tag_name().name().to_string(),
            raw: text.to_string(),
        }),
        "emotivaKeepAlive" => Ok(InboundFrame::KeepAlive),
        "emotivaGoodbye" | "goodbye" => Ok(InboundFrame::Goodbye),
        other => Err(CodecError::UnknownRoot(other.to_string())),
    }
}

fn child_text(node: &roxmltree::Node, name: &str) -> Option<String> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
        .and_then(|c| c.text())
        .map(|s| s.to_string())
}

fn parse_transponder(root: &roxmltree::Node) -> Result<TransponderFrame, CodecError> {
    let model = child_text(root, "model").unwrap_or_default();
    let revision = child_text(root, "revision").unwrap_or_default();
    let name = child_text(root, "name").unwrap_or_default();

    let control = root
        .children()
        .find(|c| c.is_element() && c.tag_name().name() == "control");

    let (protocol_version, control_port, notify_port, keepalive_interval_ms) =
        if let Some(control) = control {
            (
                child_text(&control, "version").and_then(|s| ProtocolVersion::parse(&s)),
                child_text(&control, "controlPort").and_then(|s| s.parse().ok()),
                child_text(&control, "notifyPort").and_then(|s| s.parse().ok()),
                child_text(&control, "keepAlive").and_then(|s| s.parse().ok()),
            )
        } else {
            (None, None, None, None)
        };

    Ok(TransponderFrame {
        model,
        revision,
        name,
        protocol_version,
        control_port,
        notify_port,
        keepalive_interval_ms,
    })
}

fn parse_ack(root: &roxmltree::Node) -> Result<Vec<AckResult>, CodecError> {
    let mut out = Vec::new();
    for child in root.children().filter(|c| c.is_element()) {
        let status = parse_status_attr(&child)?;
        out.push(AckResult {
            name: child.tag_name().name().to_string(),
            status,
        });
    }
    Ok(out)
}

fn parse_status_attr(node: &roxmltree::Node) -> Result<AckStatus, CodecError> {
    match node.attribute("status") {
        Some("ack") | None => Ok(AckStatus::Ack),
        Some("nak") => Ok(AckStatus::Nak),
        Some(other) => Err(CodecError::XmlMalformed {
            detail: format!("unknown status attribute {other:?}"),
            snippet: node.tag_name().name().to_string(),
        }),
    }
}

fn parse_bool_attr(node: &roxmltree::Node, name: &str) -> Option<bool> {
    node.attribute(name).map(|v| v == "true" || v == "1")
}

/// Parse a single property child, accepting both the v3
/// `<property name=".." value=".." visible=".."/>` shape and the legacy v2
/// shape where the tag name itself is the property name.
fn parse_property_node(node: &roxmltree::Node) -> Option<(String, Option<String>, Option<bool>)> {
    let tag = node.tag_name().name();
    let name = if tag == "property" {
        node.attribute("name")?.to_string()
    } else {
        tag.to_string()
    };
    let value = node.attribute("value").map(|s| s.to_string());
    let visible = parse_bool_attr(node, "visible");
    Some((name, value, visible))
}

fn parse_notify(root: &roxmltree::Node) -> Result<InboundFrame, CodecError> {
    let sequence = root
        .attribute("sequence")
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    let mut properties = Vec::new();
    for child in root.children().filter(|c| c.is_element()) {
        let (name, value, visible) = parse_property_node(&child).ok_or_else(|| CodecError::XmlMalformed {
            detail: "notification property missing name".into(),
            snippet: child.tag_name().name().to_string(),
        })?;
        properties.push(PropertyEvent {
            name,
            value: value.unwrap_or_default(),
            visible: visible.unwrap_or(true),
            seq: sequence,
        });
    }
    Ok(InboundFrame::Notify { sequence, properties })
}

fn parse_property_acks(root: &roxmltree::Node) -> Result<Vec<PropertyAck>, CodecError> {
    let mut out = Vec::new();
    for child in root.children().filter(|c| c.is_element()) {
        let (name, value, visible) = parse_property_node(&child).ok_or_else(|| CodecError::XmlMalformed {
            detail: "response property missing name".into(),
            snippet: child.tag_name().name().to_string(),
        })?;
        let status = parse_status_attr(&child)?;
        out.push(PropertyAck {
            name,
            status,
            value,
            visible,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Serialisation
// ---------------------------------------------------------------------------

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `<emotivaPing protocol="..."/>`
pub fn serialize_ping(protocol: ProtocolVersion) -> Vec<u8> {
    format!(
        "{XML_DECL}<emotivaPing protocol=\"{}\"/>",
        protocol.as_str()
    )
    .into_bytes()
}

/// `<emotivaControl><NAME value="V" ack="yes|no"/>...</emotivaControl>`
pub fn serialize_control(commands: &[Command]) -> Vec<u8> {
    let mut out = String::from(XML_DECL);
    out.push_str("<emotivaControl>");
    for cmd in commands {
        out.push('<');
        out.push_str(&cmd.name);
        out.push_str(" value=\"");
        out.push_str(&xml_escape(&cmd.value));
        out.push_str("\" ack=\"");
        out.push_str(if cmd.ack_required { "yes" } else { "no" });
        out.push_str("\"/>");
    }
    out.push_str("</emotivaControl>");
    out.into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetFrameKind {
    Subscription,
    Unsubscribe,
    Update,
}

impl SetFrameKind {
    fn root(self) -> &'static str {
        match self {
            SetFrameKind::Subscription => "emotivaSubscription",
            SetFrameKind::Unsubscribe => "emotivaUnsubscribe",
            SetFrameKind::Update => "emotivaUpdate",
        }
    }
}

/// `<emotivaSubscription protocol="..."><NAME/>...</emotivaSubscription>`
/// (and the unsubscribe/update analogues).
pub fn serialize_name_set(kind: SetFrameKind, protocol: ProtocolVersion, names: &[String]) -> Vec<u8> {
    let root = kind.root();
    let mut out = String::from(XML_DECL);
    out.push('<');
    out.push_str(root);
    out.push_str(" protocol=\"");
    out.push_str(protocol.as_str());
    out.push_str("\">");
    for name in names {
        out.push('<');
        out.push_str(name);
        out.push_str("/>");
    }
    out.push_str("</");
    out.push_str(root);
    out.push('>');
    out.into_bytes()
}
