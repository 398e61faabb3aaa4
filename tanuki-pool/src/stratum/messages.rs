//! Stratum v1 wire messages.
//!
//! Requests arrive as line-delimited JSON-RPC; a single decoder inspects the
//! `method` field and produces a typed [`Request`] variant, so the
//! connection state machine never touches raw JSON. Responses use the
//! classic Stratum error triple `[code, message, traceback]`.

use serde::Deserialize;
use serde_json::{json, Value};

/// Upper bound on one Stratum line; anything longer is a protocol error.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Stratum error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratumCode {
    Other,
    JobNotFound,
    DuplicateShare,
    LowDifficulty,
    UnauthorizedWorker,
    NotSubscribed,
}

impl StratumCode {
    pub fn code(self) -> i64 {
        match self {
            StratumCode::Other => 20,
            StratumCode::JobNotFound => 21,
            StratumCode::DuplicateShare => 22,
            StratumCode::LowDifficulty => 23,
            StratumCode::UnauthorizedWorker => 24,
            StratumCode::NotSubscribed => 25,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            StratumCode::Other => "other/unknown",
            StratumCode::JobNotFound => "job not found",
            StratumCode::DuplicateShare => "duplicate share",
            StratumCode::LowDifficulty => "low difficulty share",
            StratumCode::UnauthorizedWorker => "unauthorized worker",
            StratumCode::NotSubscribed => "not subscribed",
        }
    }
}

/// A share or request rejection, mapped onto the wire as an error triple.
#[derive(Debug, Clone, PartialEq)]
pub struct Reject {
    pub code: StratumCode,
    pub detail: Option<String>,
}

impl Reject {
    pub fn new(code: StratumCode) -> Self {
        Self { code, detail: None }
    }

    pub fn with_detail(code: StratumCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    /// Whether this rejection counts toward the invalid-submission ban.
    pub fn counts_toward_ban(&self) -> bool {
        !matches!(self.code, StratumCode::NotSubscribed)
    }
}

/// Raw JSON-RPC request envelope, before method dispatch.
#[derive(Debug, Deserialize)]
pub struct RawRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Typed Stratum requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Configure(ConfigureParams),
    Subscribe {
        user_agent: Option<String>,
        session_id: Option<String>,
    },
    Authorize {
        username: String,
        password: String,
    },
    SuggestDifficulty(f64),
    Submit(SubmitParams),
    /// A method this server does not implement.
    Unknown(String),
}

/// Parsed `mining.configure` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureParams {
    /// Whether `version-rolling` was among the requested extensions
    pub version_rolling: bool,
    /// Mask the miner intends to roll; full mask when unspecified
    pub mask: u32,
    /// Minimum bit count the miner needs
    pub min_bit_count: u32,
}

/// Parsed `mining.submit` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    pub version_bits: Option<u32>,
}

/// A malformed request; the connection terminates on these.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("malformed {method}: {detail}")]
pub struct ParseError {
    pub method: String,
    pub detail: String,
}

fn bad(method: &str, detail: impl Into<String>) -> ParseError {
    ParseError {
        method: method.to_string(),
        detail: detail.into(),
    }
}

fn param_str<'a>(method: &str, params: &'a [Value], index: usize) -> Result<&'a str, ParseError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| bad(method, format!("param {index} must be a string")))
}

fn param_hex_u32(method: &str, params: &[Value], index: usize) -> Result<u32, ParseError> {
    let s = param_str(method, params, index)?;
    if s.len() != 8 {
        return Err(bad(method, format!("param {index} must be 8 hex chars")));
    }
    u32::from_str_radix(s, 16).map_err(|_| bad(method, format!("param {index} is not hex")))
}

impl Request {
    /// Route a raw request to its typed variant.
    pub fn parse(raw: &RawRequest) -> Result<Request, ParseError> {
        let method = raw.method.as_str();
        let params = raw.params.as_array().cloned().unwrap_or_default();

        match method {
            "mining.configure" => {
                let extensions: Vec<String> = raw
                    .params
                    .get(0)
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let ext_params = raw.params.get(1).cloned().unwrap_or(Value::Null);

                let version_rolling = extensions.iter().any(|e| e == "version-rolling");
                let mask = match ext_params.get("version-rolling.mask").and_then(Value::as_str) {
                    Some(mask_hex) => u32::from_str_radix(mask_hex, 16)
                        .map_err(|_| bad(method, "version-rolling.mask is not hex"))?,
                    None => u32::MAX,
                };
                let min_bit_count = ext_params
                    .get("version-rolling.min-bit-count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;

                Ok(Request::Configure(ConfigureParams {
                    version_rolling,
                    mask,
                    min_bit_count,
                }))
            }

            "mining.subscribe" => Ok(Request::Subscribe {
                user_agent: params.first().and_then(Value::as_str).map(str::to_string),
                session_id: params.get(1).and_then(Value::as_str).map(str::to_string),
            }),

            "mining.authorize" => Ok(Request::Authorize {
                username: param_str(method, &params, 0)?.to_string(),
                password: params
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),

            "mining.suggest_difficulty" => {
                let difficulty = params
                    .first()
                    .and_then(Value::as_f64)
                    .ok_or_else(|| bad(method, "param 0 must be a number"))?;
                Ok(Request::SuggestDifficulty(difficulty))
            }

            "mining.submit" => {
                let extranonce2 = hex::decode(param_str(method, &params, 2)?)
                    .map_err(|_| bad(method, "extranonce2 is not hex"))?;
                let version_bits = match params.get(5) {
                    Some(Value::String(_)) => Some(param_hex_u32(method, &params, 5)?),
                    Some(Value::Null) | None => None,
                    Some(_) => return Err(bad(method, "version bits must be a string")),
                };
                Ok(Request::Submit(SubmitParams {
                    worker: param_str(method, &params, 0)?.to_string(),
                    job_id: param_str(method, &params, 1)?.to_string(),
                    extranonce2,
                    ntime: param_hex_u32(method, &params, 3)?,
                    nonce: param_hex_u32(method, &params, 4)?,
                    version_bits,
                }))
            }

            other => Ok(Request::Unknown(other.to_string())),
        }
    }
}

/// Successful response line.
pub fn response_ok(id: &Value, result: Value) -> Value {
    json!({ "id": id, "result": result, "error": Value::Null })
}

/// Error response line, using the Stratum error triple.
pub fn response_err(id: &Value, reject: &Reject) -> Value {
    let message = match &reject.detail {
        Some(detail) => format!("{} ({})", reject.code.message(), detail),
        None => reject.code.message().to_string(),
    };
    json!({
        "id": id,
        "result": Value::Null,
        "error": [reject.code.code(), message, Value::Null],
    })
}

/// Server-initiated notification line.
pub fn notification(method: &str, params: Value) -> Value {
    json!({ "id": Value::Null, "method": method, "params": params })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(line: &str) -> RawRequest {
        serde_json::from_str(line).unwrap()
    }

    #[test]
    fn parses_subscribe_variants() {
        let request = Request::parse(&raw(
            r#"{"id":1,"method":"mining.subscribe","params":["cgminer/4.12"]}"#,
        ))
        .unwrap();
        assert_eq!(
            request,
            Request::Subscribe {
                user_agent: Some("cgminer/4.12".into()),
                session_id: None
            }
        );

        let request =
            Request::parse(&raw(r#"{"id":1,"method":"mining.subscribe","params":[]}"#)).unwrap();
        assert_eq!(
            request,
            Request::Subscribe {
                user_agent: None,
                session_id: None
            }
        );
    }

    #[test]
    fn parses_configure_with_mask() {
        let request = Request::parse(&raw(
            r#"{"id":2,"method":"mining.configure",
               "params":[["version-rolling"],
                         {"version-rolling.mask":"1fffe000","version-rolling.min-bit-count":2}]}"#,
        ))
        .unwrap();
        assert_eq!(
            request,
            Request::Configure(ConfigureParams {
                version_rolling: true,
                mask: 0x1fffe000,
                min_bit_count: 2
            })
        );
    }

    #[test]
    fn configure_without_mask_defaults_to_full() {
        let request = Request::parse(&raw(
            r#"{"id":2,"method":"mining.configure","params":[["version-rolling"],{}]}"#,
        ))
        .unwrap();
        let Request::Configure(params) = request else {
            panic!("expected configure");
        };
        assert_eq!(params.mask, u32::MAX);
    }

    #[test]
    fn parses_submit_with_and_without_version_bits() {
        let request = Request::parse(&raw(
            r#"{"id":4,"method":"mining.submit",
               "params":["bcrt1qworker.rig1","7","aabbccdd","6553fd00","00000001","00b40000"]}"#,
        ))
        .unwrap();
        let Request::Submit(submit) = request else {
            panic!("expected submit");
        };
        assert_eq!(submit.worker, "bcrt1qworker.rig1");
        assert_eq!(submit.job_id, "7");
        assert_eq!(submit.extranonce2, vec![0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(submit.ntime, 0x6553fd00);
        assert_eq!(submit.nonce, 1);
        assert_eq!(submit.version_bits, Some(0x00b40000));

        let request = Request::parse(&raw(
            r#"{"id":4,"method":"mining.submit",
               "params":["w","7","aabbccdd","6553fd00","00000001"]}"#,
        ))
        .unwrap();
        let Request::Submit(submit) = request else {
            panic!("expected submit");
        };
        assert_eq!(submit.version_bits, None);
    }

    #[test]
    fn submit_rejects_short_ntime() {
        let err = Request::parse(&raw(
            r#"{"id":4,"method":"mining.submit","params":["w","7","aabbccdd","6553","00000001"]}"#,
        ))
        .unwrap_err();
        assert_eq!(err.method, "mining.submit");
    }

    #[test]
    fn submit_rejects_non_hex_extranonce2() {
        assert!(Request::parse(&raw(
            r#"{"id":4,"method":"mining.submit","params":["w","7","zzzz","6553fd00","00000001"]}"#,
        ))
        .is_err());
    }

    #[test]
    fn unknown_method_is_not_an_error() {
        let request =
            Request::parse(&raw(r#"{"id":9,"method":"mining.extranonce.subscribe","params":[]}"#))
                .unwrap();
        assert_eq!(
            request,
            Request::Unknown("mining.extranonce.subscribe".into())
        );
    }

    #[test]
    fn error_response_uses_triple() {
        let line = response_err(&json!(5), &Reject::new(StratumCode::LowDifficulty));
        assert_eq!(line["error"][0], 23);
        assert_eq!(line["error"][1], "low difficulty share");
        assert_eq!(line["error"][2], Value::Null);
        assert_eq!(line["result"], Value::Null);
        assert_eq!(line["id"], 5);
    }

    #[test]
    fn suggest_difficulty_parses_number() {
        let request = Request::parse(&raw(
            r#"{"id":3,"method":"mining.suggest_difficulty","params":[512.0]}"#,
        ))
        .unwrap();
        assert_eq!(request, Request::SuggestDifficulty(512.0));
    }
}
