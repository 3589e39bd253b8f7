use crate::types::TimestampNs;

/// Errors surfaced by the estimation core, one variant per row of the
/// error-policy table. Fatal kinds (`ImuGap`, `ImuStale`) terminate the VIO
/// worker; everything else is a per-landmark skip counted in `Stats` and
/// never returned as an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum VioError {
    #[error("IMU gap: requested t1={t1} beyond newest sample {newest} after {retries} retries")]
    ImuGap {
        t1: TimestampNs,
        newest: TimestampNs,
        retries: u32,
    },

    #[error("IMU stale: requested t0={t0} older than oldest retained sample {oldest}")]
    ImuStale {
        t0: TimestampNs,
        oldest: TimestampNs,
    },

    #[error("preintegrate called with t0={t0} >= t1={t1}")]
    NonMonotonicInterval { t0: TimestampNs, t1: TimestampNs },

    #[error("ring buffer is empty, no samples to query")]
    EmptyBuffer,

    #[error("shutdown requested while waiting for IMU data")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, VioError>;
