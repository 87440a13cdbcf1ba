//! Turns a submitted value into the canonical payload `{input_key: value}` for its substep.
use crate::attachment::{AttachmentWriter, Upload, extension_for};
use crate::canonical::number_from_f64;
use crate::error::{NotaryError, NotaryResult};
use crate::process::Payload;
use crate::workflow::{InputKind, Substep};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde_json::Value;
use std::io::Read;
use std::sync::LazyLock;

// data:[<mediatype>][;param=value]*[;base64],<payload>
static DATA_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^data:([A-Za-z0-9!#$&^_.+-]+/[A-Za-z0-9!#$&^_.+-]+)?((?:;[A-Za-z0-9!#$&^_.+-]+=[^;,]*)*)(;base64)?,(.*)$")
        .expect("data url pattern is valid")
});

/// What a client submitted for one substep.
pub enum Submission<R> {
    Text(String),
    File(Upload<R>),
}

/// A decoded `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

pub fn parse_data_url(text: &str) -> Option<NotaryResult<DataUrl>> {
    let caps = DATA_URL.captures(text)?;
    let media_type = caps
        .get(1)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_else(|| "text/plain".to_string());
    let body = caps.get(4).map(|m| m.as_str()).unwrap_or_default();

    let bytes = if caps.get(3).is_some() {
        STANDARD
            .decode(body.trim())
            .map_err(|e| NotaryError::validation(format!("invalid base64 in data url: {e}")))
    } else {
        Ok(urlencoding::decode_binary(body.as_bytes()).into_owned())
    };
    Some(bytes.map(|bytes| DataUrl { media_type, bytes }))
}

/// Canonical payload for `substep` from `submission`. Files, and data URLs inside
/// structured documents, are written through `attachments`.
pub fn normalize<R: Read>(
    substep: &Substep,
    submission: Submission<R>,
    attachments: &AttachmentWriter<'_>,
) -> NotaryResult<Payload> {
    let key = substep.input_key.as_str();
    let value = match (substep.input_type, submission) {
        (InputKind::Number, Submission::Text(text)) => parse_number(&text)?,
        (InputKind::String, Submission::Text(text)) => {
            let text = text.trim();
            if text.is_empty() {
                return Err(NotaryError::validation(format!("'{key}' is required")));
            }
            Value::String(text.to_string())
        }
        (InputKind::Structured, Submission::Text(text)) => {
            let doc: Value = serde_json::from_str(&text)
                .map_err(|e| NotaryError::validation(format!("'{key}' is not valid JSON: {e}")))?;
            if !doc.is_object() {
                return Err(NotaryError::validation(format!("'{key}' must be a JSON object")));
            }
            extract_data_urls(doc, &mut vec![key.to_string()], attachments)?
        }
        (InputKind::File, Submission::File(upload)) => {
            attachments.save_upload(upload)?.to_ref().to_value()
        }
        (InputKind::File, Submission::Text(_)) => {
            return Err(NotaryError::validation(format!("'{key}' requires a file upload")));
        }
        (_, Submission::File(_)) => {
            return Err(NotaryError::validation(format!("'{key}' does not accept files")));
        }
    };
    Ok(Payload::single(key, value))
}

fn parse_number(text: &str) -> NotaryResult<Value> {
    let text = text.trim();
    let parsed: f64 = text
        .parse()
        .map_err(|_| NotaryError::validation(format!("value must be a number, got '{text}'")))?;
    number_from_f64(parsed)
        .map(Value::Number)
        .ok_or_else(|| NotaryError::validation("value must be a finite number"))
}

/// Recursive descent over the document; string leaves holding data URLs become
/// attachment references. `path` is the field path, used to name the stored file.
fn extract_data_urls(
    value: Value,
    path: &mut Vec<String>,
    attachments: &AttachmentWriter<'_>,
) -> NotaryResult<Value> {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                path.push(k.clone());
                let v = extract_data_urls(v, path, attachments);
                path.pop();
                out.insert(k, v?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, v) in items.into_iter().enumerate() {
                path.push(i.to_string());
                let v = extract_data_urls(v, path, attachments);
                path.pop();
                out.push(v?);
            }
            Ok(Value::Array(out))
        }
        Value::String(s) => match parse_data_url(&s) {
            Some(decoded) => {
                let DataUrl { media_type, bytes } = decoded?;
                let filename = format!("{}{}", path_filename(path), extension_for(&media_type));
                let attachment = attachments.save(&filename, Some(&media_type), &mut bytes.as_slice())?;
                Ok(attachment.to_ref().to_value())
            }
            None => Ok(Value::String(s)),
        },
        other => Ok(other),
    }
}

fn path_filename(path: &[String]) -> String {
    path.join("_")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
