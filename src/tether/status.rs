use bytes::Bytes;
use serde::Serialize;

use crate::tether::{config, protocol};

pub const STATUS_RESPONSE_ID: u32 = 0x00;

/// Protocol number that no client speaks, so the server list renders the
/// version name in place of the player count.
const INCOMPATIBLE_PROTOCOL: i32 = -1;

#[derive(Debug, Serialize)]
struct StatusDocument<'a> {
    version: Version<'a>,
    players: Players,
    description: Description<'a>,
}

#[derive(Debug, Serialize)]
struct Version<'a> {
    name: &'a str,
    protocol: i32,
}

#[derive(Debug, Serialize)]
struct Players {
    max: u32,
    online: u32,
}

#[derive(Debug, Serialize)]
struct Description<'a> {
    text: &'a str,
    color: &'static str,
    bold: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra: Vec<TextComponent<'a>>,
}

#[derive(Debug, Serialize)]
struct TextComponent<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bold: Option<bool>,
}

/// Answers status queries with a fixed "server offline" document.
///
/// The packet is rendered once; every call to [`StatusResponder::packet`]
/// returns the same bytes.
#[derive(Debug, Clone)]
pub struct StatusResponder {
    packet: Bytes,
    json: String,
}

impl StatusResponder {
    pub fn new(text: &config::StatusText) -> Self {
        let mut extra = Vec::new();
        if !text.footer.is_empty() {
            extra.push(TextComponent {
                text: "\n",
                color: None,
                bold: None,
            });
            extra.push(TextComponent {
                text: &text.footer,
                color: Some("dark_purple"),
                bold: Some(true),
            });
        }

        let doc = StatusDocument {
            version: Version {
                name: &text.version_name,
                protocol: INCOMPATIBLE_PROTOCOL,
            },
            players: Players { max: 0, online: 0 },
            description: Description {
                text: &text.description,
                color: "red",
                bold: true,
                extra,
            },
        };

        // Plain structs of strings and integers always serialize.
        let json = serde_json::to_string(&doc).unwrap_or_default();
        let packet = protocol::encode_packet(STATUS_RESPONSE_ID, &protocol::encode_string(&json));
        Self { packet, json }
    }

    pub fn packet(&self) -> Bytes {
        self.packet.clone()
    }

    pub fn json(&self) -> &str {
        &self.json
    }
}

impl Default for StatusResponder {
    fn default() -> Self {
        Self::new(&config::StatusText::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_is_deterministic() {
        let a = StatusResponder::default();
        let b = StatusResponder::default();
        assert_eq!(a.packet(), a.packet());
        assert_eq!(a.packet(), b.packet());
    }

    #[test]
    fn default_document_matches_offline_layout() {
        let r = StatusResponder::default();
        assert_eq!(
            r.json(),
            concat!(
                r#"{"version":{"name":"§4Offline","protocol":-1},"#,
                r#""players":{"max":0,"online":0},"#,
                r#""description":{"text":"Server Is Offline","color":"red","bold":true,"#,
                r#""extra":[{"text":"\n"},{"text":"View YOUR_DOMAIN_HERE","color":"dark_purple","bold":true}]}}"#,
            )
        );
    }

    #[test]
    fn packet_wraps_json_as_status_response() {
        let r = StatusResponder::default();
        let pkt = r.packet();
        let (frame, n) = protocol::decode_packet(&pkt).unwrap();
        assert_eq!(n, pkt.len());
        assert_eq!(frame.id, STATUS_RESPONSE_ID);

        let (len, len_n) = protocol::decode_varint(&frame.body, 0).unwrap();
        let json = std::str::from_utf8(&frame.body[len_n..]).unwrap();
        assert_eq!(len as usize, json.len());

        let v: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(v["players"]["online"], 0);
        assert_eq!(v["players"]["max"], 0);
        assert_eq!(v["version"]["protocol"], -1);
        assert_eq!(v["description"]["text"], "Server Is Offline");
    }

    #[test]
    fn empty_footer_omits_extra() {
        let text = config::StatusText {
            footer: String::new(),
            ..config::StatusText::default()
        };
        let r = StatusResponder::new(&text);
        let v: serde_json::Value = serde_json::from_str(r.json()).unwrap();
        assert!(v["description"].get("extra").is_none());
    }
}
