//! Request body encoding, dispatched on `body.mode`.

use crate::error::{HttpError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::multipart;
use serde::Deserialize;
use serde_json::Value;

/// One `kv` entry shared by `urlencoded` and `formdata` modes.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// The recognized shape of `RequestData.body` / `RequestData.extra["body"]`.
#[derive(Debug, Clone, Deserialize)]
pub struct BodySpec {
    pub mode: String,
    #[serde(default)]
    pub raw: Option<Value>,
    #[serde(default)]
    pub kv: Vec<KeyValue>,
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// An encoded body ready to hand to `reqwest::RequestBuilder`.
pub enum EncodedBody {
    /// No body at all.
    None,
    /// Raw bytes plus an optional content-type override.
    Bytes(Vec<u8>, Option<String>),
    /// A `multipart/form-data` body.
    Multipart(multipart::Form),
}

/// Parses and encodes `body` per its declared `mode`. Returns
/// [`EncodedBody::None`] when `body` is `null` or not a recognized
/// `BodySpec` object.
pub fn encode_body(body: &Value) -> Result<EncodedBody> {
    if body.is_null() {
        return Ok(EncodedBody::None);
    }
    let spec: BodySpec = match serde_json::from_value(body.clone()) {
        Ok(spec) => spec,
        Err(_) => return Ok(EncodedBody::None),
    };
    match spec.mode.as_str() {
        "raw" => {
            let text = match &spec.raw {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Ok(EncodedBody::Bytes(text.into_bytes(), spec.content_type))
        }
        "urlencoded" => {
            let encoded = spec
                .kv
                .iter()
                .map(|kv| {
                    format!(
                        "{}={}",
                        urlencoding::encode(&kv.key),
                        urlencoding::encode(&kv.value)
                    )
                })
                .collect::<Vec<_>>()
                .join("&");
            Ok(EncodedBody::Bytes(
                encoded.into_bytes(),
                Some("application/x-www-form-urlencoded".to_string()),
            ))
        }
        "formdata" => {
            let mut form = multipart::Form::new();
            for kv in &spec.kv {
                if kv.r#type.as_deref() == Some("file") {
                    let bytes = BASE64.decode(kv.value.as_bytes())?;
                    form = form.part(kv.key.clone(), multipart::Part::bytes(bytes));
                } else {
                    form = form.text(kv.key.clone(), kv.value.clone());
                }
            }
            Ok(EncodedBody::Multipart(form))
        }
        "binary" => {
            let encoded = spec.binary.unwrap_or_default();
            let bytes = BASE64.decode(encoded.as_bytes())?;
            Ok(EncodedBody::Bytes(
                bytes,
                spec.content_type.or(Some("application/octet-stream".to_string())),
            ))
        }
        other => Err(HttpError::UnsupportedBodyMode(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_mode_encodes_string_literal() {
        let body = json!({"mode": "raw", "raw": "hello world"});
        match encode_body(&body).unwrap() {
            EncodedBody::Bytes(bytes, content_type) => {
                assert_eq!(bytes, b"hello world");
                assert!(content_type.is_none());
            }
            _ => panic!("expected Bytes"),
        }
    }

    #[test]
    fn urlencoded_mode_joins_kv_pairs() {
        let body = json!({
            "mode": "urlencoded",
            "kv": [{"key": "a", "value": "1"}, {"key": "b", "value": "2 3"}],
        });
        match encode_body(&body).unwrap() {
            EncodedBody::Bytes(bytes, content_type) => {
                assert_eq!(String::from_utf8(bytes).unwrap(), "a=1&b=2%203");
                assert_eq!(content_type.as_deref(), Some("application/x-www-form-urlencoded"));
            }
            _ => panic!("expected Bytes"),
        }
    }

    #[test]
    fn binary_mode_decodes_base64() {
        let body = json!({"mode": "binary", "binary": "aGVsbG8="});
        match encode_body(&body).unwrap() {
            EncodedBody::Bytes(bytes, _) => assert_eq!(bytes, b"hello"),
            _ => panic!("expected Bytes"),
        }
    }

    #[test]
    fn unrecognized_body_shape_is_treated_as_absent() {
        let body = json!({"just": "some data"});
        assert!(matches!(encode_body(&body).unwrap(), EncodedBody::None));
    }

    #[test]
    fn unknown_mode_is_an_error() {
        let body = json!({"mode": "graphql"});
        assert!(encode_body(&body).is_err());
    }
}
