//! The event envelope: one entry per stage transition of one job.
//!
//! On the stream an envelope travels as flat field-value pairs (so
//! non-Rust producers can XADD it without a JSON layer); everywhere
//! else (State KV, pub/sub channel, SSE payload) it is JSON.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Pipeline stage of a job. `Done` is the terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Vision,
    Rule,
    Answer,
    Reward,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Vision => "vision",
            Stage::Rule => "rule",
            Stage::Answer => "answer",
            Stage::Reward => "reward",
            Stage::Done => "done",
        }
    }

    /// Position in the pipeline, used by producers to derive `seq`.
    pub fn order(&self) -> u64 {
        match self {
            Stage::Queued => 0,
            Stage::Vision => 1,
            Stage::Rule => 2,
            Stage::Answer => 3,
            Stage::Reward => 4,
            Stage::Done => 5,
        }
    }
}

impl FromStr for Stage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Stage::Queued),
            "vision" => Ok(Stage::Vision),
            "rule" => Ok(Stage::Rule),
            "answer" => Ok(Stage::Answer),
            "reward" => Ok(Stage::Reward),
            "done" => Ok(Stage::Done),
            other => Err(ProtocolError::InvalidField {
                field: "stage",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a stage transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Started,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Started => "started",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl FromStr for Status {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Status::Started),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(ProtocolError::InvalidField {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single pipeline progress event.
///
/// `seq` is assigned by the producer, strictly increasing per
/// `job_id`, and is the sole ordering and dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub job_id: String,
    pub stage: Stage,
    pub status: Status,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub ts: f64,
}

impl Envelope {
    /// Whether this event ends a subscription: the terminal stage was
    /// reached or the producer reported a failure.
    pub fn is_terminal(&self) -> bool {
        self.stage == Stage::Done || self.status == Status::Failed
    }

    /// Flat field-value pairs for `XADD`.
    pub fn to_stream_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("job_id", self.job_id.clone()),
            ("stage", self.stage.as_str().to_string()),
            ("status", self.status.as_str().to_string()),
            ("seq", self.seq.to_string()),
            ("ts", self.ts.to_string()),
        ];
        if let Some(progress) = self.progress {
            fields.push(("progress", progress.to_string()));
        }
        if let Some(result) = &self.result {
            fields.push(("result", result.to_string()));
        }
        fields
    }

    /// Re-assemble an envelope from the flat fields of a stream entry.
    ///
    /// A missing `job_id` is unrecoverable (no correlation key), any
    /// other invalid field also maps to the malformed-drop path.
    pub fn from_stream_fields(
        map: &HashMap<String, redis::Value>,
    ) -> Result<Envelope, ProtocolError> {
        let job_id = field_str(map, "job_id")?.ok_or(ProtocolError::MissingJobId)?;
        if job_id.is_empty() {
            return Err(ProtocolError::MissingJobId);
        }

        let stage: Stage = field_str(map, "stage")?
            .ok_or(ProtocolError::MissingField { field: "stage" })?
            .parse()?;
        let status: Status = field_str(map, "status")?
            .ok_or(ProtocolError::MissingField { field: "status" })?
            .parse()?;
        let seq = field_str(map, "seq")?
            .ok_or(ProtocolError::MissingField { field: "seq" })?
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidField {
                field: "seq",
                value: field_str(map, "seq").ok().flatten().unwrap_or_default(),
            })?;

        let ts = field_str(map, "ts")?
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let progress = field_str(map, "progress")?.and_then(|s| s.parse::<u8>().ok());
        let result = field_str(map, "result")?
            .filter(|s| !s.is_empty())
            .and_then(|s| serde_json::from_str(&s).ok());

        Ok(Envelope {
            job_id,
            stage,
            status,
            seq,
            progress,
            result,
            ts,
        })
    }
}

fn field_str(
    map: &HashMap<String, redis::Value>,
    field: &'static str,
) -> Result<Option<String>, ProtocolError> {
    match map.get(field) {
        None => Ok(None),
        Some(value) => redis::from_redis_value::<String>(value)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidField {
                field,
                value: format!("{value:?}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(s: &str) -> redis::Value {
        redis::Value::BulkString(s.as_bytes().to_vec())
    }

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, redis::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), raw(v)))
            .collect()
    }

    #[test]
    fn roundtrip_through_stream_fields() {
        let envelope = Envelope {
            job_id: "job-abc-123".to_string(),
            stage: Stage::Vision,
            status: Status::Completed,
            seq: 11,
            progress: Some(25),
            result: Some(serde_json::json!({"label": "bottle"})),
            ts: 1735123456.789,
        };

        let map: HashMap<String, redis::Value> = envelope
            .to_stream_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), raw(&v)))
            .collect();

        let decoded = Envelope::from_stream_fields(&map).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn missing_job_id_is_malformed() {
        let map = fields(&[("stage", "vision"), ("status", "started"), ("seq", "10")]);
        assert!(matches!(
            Envelope::from_stream_fields(&map),
            Err(ProtocolError::MissingJobId)
        ));

        let map = fields(&[("job_id", ""), ("stage", "vision"), ("status", "started")]);
        assert!(matches!(
            Envelope::from_stream_fields(&map),
            Err(ProtocolError::MissingJobId)
        ));
    }

    #[test]
    fn unknown_stage_is_malformed() {
        let map = fields(&[
            ("job_id", "job-1"),
            ("stage", "telemetry"),
            ("status", "started"),
            ("seq", "10"),
        ]);
        assert!(matches!(
            Envelope::from_stream_fields(&map),
            Err(ProtocolError::InvalidField { field: "stage", .. })
        ));
    }

    #[test]
    fn terminal_detection() {
        let mut envelope = Envelope {
            job_id: "j".to_string(),
            stage: Stage::Vision,
            status: Status::Completed,
            seq: 11,
            progress: None,
            result: None,
            ts: 0.0,
        };
        assert!(!envelope.is_terminal());

        envelope.stage = Stage::Done;
        assert!(envelope.is_terminal());

        envelope.stage = Stage::Rule;
        envelope.status = Status::Failed;
        assert!(envelope.is_terminal());
    }

    #[test]
    fn optional_fields_absent() {
        let map = fields(&[
            ("job_id", "job-1"),
            ("stage", "queued"),
            ("status", "started"),
            ("seq", "0"),
            ("ts", "1.5"),
        ]);
        let decoded = Envelope::from_stream_fields(&map).unwrap();
        assert_eq!(decoded.progress, None);
        assert_eq!(decoded.result, None);
        assert_eq!(decoded.ts, 1.5);
    }
}
