#[derive(Debug, thiserror::Error)]
pub enum MpegTsErrorValue {
    #[error("stream not found: pid {0:#06x}")]
    StreamNotFound(u16),

    #[error("stream count exceeded")]
    StreamCountExceeded,

    #[error("streams cannot be added once packets were written")]
    StreamsSealed,

    #[error("empty access unit")]
    EmptyPayload,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct MpegTsError {
    pub value: MpegTsErrorValue,
}

impl From<MpegTsErrorValue> for MpegTsError {
    fn from(value: MpegTsErrorValue) -> Self {
        Self { value }
    }
}
