use redis::RedisError;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("event is missing job_id; no correlation key")]
    MissingJobId,

    #[error("event is missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("invalid value for field '{field}': {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("store error: {0}")]
    Store(#[from] RedisError),
}
