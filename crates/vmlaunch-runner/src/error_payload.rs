use crate::error::LaunchError;

pub const PREFIX: &str = "VMLAUNCH_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

/// Renders `err` as a single prefixed JSON line the host UI can pick apart.
pub fn encode(err: &LaunchError) -> String {
    let payload = ErrorPayload {
        code: err.code().to_string(),
        message: truncate_utf8(&err.to_string(), MAX_MESSAGE_BYTES),
        hint: err.hint().map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
    };

    let json = serde_json::to_string(&payload)
        .unwrap_or_else(|_| "{\"code\":\"internal\",\"message\":\"serialize_failed\"}".to_string());

    format!("{PREFIX}{json}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_truncates_message() {
        let long = "a".repeat(MAX_MESSAGE_BYTES + 1024);
        let s = encode(&LaunchError::configuration(long));
        assert!(s.starts_with(PREFIX));

        let json = &s[PREFIX.len()..];
        let v: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(v["code"], "configuration_error");
        let msg = v["message"].as_str().unwrap();
        assert!(msg.len() <= MAX_MESSAGE_BYTES);
        assert!(msg.ends_with("…(truncated)"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(40);
        let out = truncate_utf8(&s, 21);
        assert!(out.ends_with("…(truncated)"));
        assert!(out.len() <= 21);
    }

    #[test]
    fn hint_is_omitted_when_absent() {
        let err = LaunchError::resource(
            "allocate service port",
            std::io::Error::from(std::io::ErrorKind::AddrInUse),
        );
        let s = encode(&err);
        let v: serde_json::Value = serde_json::from_str(&s[PREFIX.len()..]).unwrap();
        assert_eq!(v["code"], "resource_error");
        assert!(v.get("hint").is_none());
    }
}
