use crate::error::{SctpError, SctpResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Size of the SCTP common header.
pub const COMMON_HEADER_SIZE: usize = 12;
/// Size of a DATA chunk header including the chunk header.
pub const DATA_CHUNK_HEADER_SIZE: usize = 16;

/// Association tunables. Durations serialize as `{ secs, nanos }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SctpConfig {
    pub rto_initial: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,
    /// Association-wide error threshold (Association.Max.Retrans).
    pub max_association_retransmits: u32,
    /// Per-destination error threshold (Path.Max.Retrans).
    pub max_path_retransmits: u32,
    pub max_init_retransmits: u32,
    /// `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    pub sack_delay: Duration,
    /// Packets carrying DATA that may arrive before a SACK is forced.
    pub sack_frequency: u32,
    pub fast_retransmit_threshold: u32,
    pub max_burst: usize,
    pub pmtu: usize,
    pub receive_window: usize,
    /// Bytes of unacknowledged and queued user data allowed before `send`
    /// refuses. Zero means unlimited.
    pub send_queue_limit: usize,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    /// Advertise delivered TSNs as non-revocable.
    pub nr_sack: bool,
    /// Drop SACKs whose guard sequence number is not newer than the last one.
    pub check_sack_sequence: bool,
    /// Allow the receiver to renege revocably acknowledged data when the
    /// receive buffer is full.
    pub enable_reneging: bool,
    /// Send PACKET_DROP reports for DATA discarded on a full receive buffer.
    pub packet_drop_reports: bool,
    /// Spread new data over all active paths instead of the primary only.
    pub cmt: bool,
    /// Switch back to the original primary path once it becomes active again.
    pub reactivate_primary_path: bool,
    pub max_gap_blocks: usize,
    pub local_port: u16,
    pub remote_port: u16,
}

impl Default for SctpConfig {
    fn default() -> Self {
        Self {
            rto_initial: Duration::from_secs(3),
            rto_min: Duration::from_secs(1),
            rto_max: Duration::from_secs(60),
            max_association_retransmits: 10,
            max_path_retransmits: 5,
            max_init_retransmits: 8,
            heartbeat_interval: Some(Duration::from_secs(30)),
            sack_delay: Duration::from_millis(200),
            sack_frequency: 2,
            fast_retransmit_threshold: 3,
            max_burst: 4,
            pmtu: 1200,
            receive_window: 1024 * 1024,
            send_queue_limit: 0,
            outbound_streams: 10,
            inbound_streams: 10,
            nr_sack: false,
            check_sack_sequence: true,
            enable_reneging: false,
            packet_drop_reports: false,
            cmt: false,
            reactivate_primary_path: false,
            max_gap_blocks: 16,
            local_port: 5000,
            remote_port: 5000,
        }
    }
}

impl SctpConfig {
    pub fn validate(&self) -> SctpResult<()> {
        if self.rto_min.is_zero() || self.rto_min > self.rto_max {
            return Err(SctpError::InvalidConfig("rto_min must be non-zero and <= rto_max"));
        }
        if self.rto_initial < self.rto_min || self.rto_initial > self.rto_max {
            return Err(SctpError::InvalidConfig("rto_initial must lie within [rto_min, rto_max]"));
        }
        if self.pmtu < COMMON_HEADER_SIZE + DATA_CHUNK_HEADER_SIZE + 4 {
            return Err(SctpError::InvalidConfig("pmtu too small to carry DATA"));
        }
        if self.fast_retransmit_threshold == 0 {
            return Err(SctpError::InvalidConfig("fast_retransmit_threshold must be >= 1"));
        }
        if self.sack_frequency == 0 {
            return Err(SctpError::InvalidConfig("sack_frequency must be >= 1"));
        }
        if self.outbound_streams == 0 || self.inbound_streams == 0 {
            return Err(SctpError::InvalidConfig("stream counts must be >= 1"));
        }
        if self.max_gap_blocks == 0 {
            return Err(SctpError::InvalidConfig("max_gap_blocks must be >= 1"));
        }
        Ok(())
    }

    /// Largest user payload that fits one DATA chunk in a single packet.
    pub fn max_payload(&self) -> usize {
        self.pmtu - COMMON_HEADER_SIZE - DATA_CHUNK_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SctpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_payload(), 1172, "1200 - 12 - 16");
    }

    #[test]
    fn test_rejects_inverted_rto_bounds() {
        let config = SctpConfig {
            rto_min: Duration::from_secs(5),
            rto_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SctpError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = SctpConfig {
            fast_retransmit_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
