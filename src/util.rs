//! Small helpers shared across modules.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload is missing required field \"host\"")]
    MissingHost,
}

/// Connection target decoded from the `?payload=` query parameter.
#[derive(Debug, Clone, Default)]
pub struct ConnectPayload {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub username: String,
    pub password: String,
    pub private_key: String,
    pub passphrase: String,
    /// Optional protocol attributes (fonts, drive, remote-app and friends);
    /// filtered through the per-protocol allow-list before use.
    pub attributes: HashMap<String, String>,
}

/// Decode the base64-wrapped JSON connect payload.
///
/// `host` is required; `protocol` falls back to `"ssh"` and `port` to `22`
/// when absent or of the wrong JSON type.
pub fn decode_payload(raw: &str) -> Result<ConnectPayload, PayloadError> {
    let bytes = STANDARD.decode(raw)?;
    let value: Value = serde_json::from_slice(&bytes)?;
    let obj = value.as_object().ok_or(PayloadError::NotAnObject)?;

    let host = obj
        .get("host")
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())
        .ok_or(PayloadError::MissingHost)?
        .to_owned();

    let protocol = obj
        .get("protocol")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .unwrap_or("ssh")
        .to_owned();

    // Clients send the port as either a number or a numeric string.
    let port = match obj.get("port") {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.parse::<u16>().ok(),
        _ => None,
    }
    .unwrap_or(22);

    let field = |name: &str| {
        obj.get(name)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned()
    };

    let attributes = obj
        .get("attributes")
        .and_then(Value::as_object)
        .map(|attrs| {
            attrs
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default();

    Ok(ConnectPayload {
        host,
        port,
        protocol,
        username: field("username"),
        password: field("password"),
        private_key: field("privateKey"),
        passphrase: field("passphrase"),
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(json: &str) -> String {
        STANDARD.encode(json)
    }

    #[test]
    fn decodes_full_payload() {
        let raw = encode(
            r#"{"host":"10.0.0.5","port":2222,"protocol":"rdp","username":"u","password":"p"}"#,
        );
        let p = decode_payload(&raw).unwrap();
        assert_eq!(p.host, "10.0.0.5");
        assert_eq!(p.port, 2222);
        assert_eq!(p.protocol, "rdp");
        assert_eq!(p.username, "u");
    }

    #[test]
    fn protocol_defaults_to_ssh_and_port_to_22() {
        let p = decode_payload(&encode(r#"{"host":"h"}"#)).unwrap();
        assert_eq!(p.protocol, "ssh");
        assert_eq!(p.port, 22);

        // Wrong JSON types fall back too.
        let p = decode_payload(&encode(r#"{"host":"h","protocol":7,"port":"abc"}"#)).unwrap();
        assert_eq!(p.protocol, "ssh");
        assert_eq!(p.port, 22);
    }

    #[test]
    fn numeric_string_port_is_accepted() {
        let p = decode_payload(&encode(r#"{"host":"h","port":"2022"}"#)).unwrap();
        assert_eq!(p.port, 2022);
    }

    #[test]
    fn missing_host_is_fatal() {
        assert!(matches!(
            decode_payload(&encode(r#"{"port":22}"#)),
            Err(PayloadError::MissingHost)
        ));
        assert!(matches!(
            decode_payload(&encode(r#"{"host":""}"#)),
            Err(PayloadError::MissingHost)
        ));
    }

    #[test]
    fn attributes_object_is_extracted() {
        let raw = encode(r#"{"host":"h","attributes":{"font-size":"14","bad":7}}"#);
        let p = decode_payload(&raw).unwrap();
        assert_eq!(p.attributes.get("font-size").map(String::as_str), Some("14"));
        assert!(!p.attributes.contains_key("bad"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_payload("!!!not-base64!!!").is_err());
        assert!(decode_payload(&encode("[1,2,3]")).is_err());
    }
}
