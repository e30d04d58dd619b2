//! Per-path congestion control (RFC 4960 §7.2 with CMT pseudo-cumulative-ack
//! gating).
//!
//! Controllers are stateless with respect to the association: every window
//! lives on the [`Path`] so one controller instance serves all destinations.

use crate::path::Path;
use crate::tsn::tsn_ge;
use std::fmt;
use tracing::debug;

/// Lowest initial window permitted by RFC 4960 §7.2.1.
const INITIAL_WINDOW_FLOOR: usize = 4380;

/// Pluggable congestion control algorithm.
pub trait CongestionController: fmt::Debug + Send {
    /// Sets the initial window and threshold for a new or idle path.
    fn initialize(&self, path: &mut Path, peer_rwnd: u32);

    /// Credits `acked` newly acknowledged bytes to `path`. `cum_advanced` is
    /// true when the SACK moved the path's (pseudo-)cumulative ack point.
    fn on_bytes_acked(&self, path: &mut Path, acked: usize, cum_advanced: bool);

    /// Loss was detected by miss indications. `highest_outstanding` becomes the
    /// fast recovery exit point. Returns false if the path already was in fast
    /// recovery and nothing changed.
    fn on_loss_detected(&self, path: &mut Path, highest_outstanding: u32) -> bool;

    /// Leaves fast recovery once the cumulative ack reaches the exit point.
    fn on_cum_ack(&self, path: &mut Path, cum_tsn_ack: u32);

    fn on_retransmission_timeout(&self, path: &mut Path);

    /// Limits bursts after a SACK so at most `max_burst` packets go out.
    fn limit_burst(&self, path: &mut Path, max_burst: usize);

    /// The path has been idle for longer than one RTO.
    fn on_idle(&self, path: &mut Path);

    fn can_send(&self, path: &Path) -> bool {
        path.outstanding_bytes < path.cwnd
    }
}

/// Standard SCTP window management with slow start, congestion avoidance and
/// fast recovery.
#[derive(Debug, Default, Clone, Copy)]
pub struct NewReno;

impl NewReno {
    fn initial_window(pmtu: usize) -> usize {
        (2 * pmtu).max(INITIAL_WINDOW_FLOOR)
    }

    fn reduced_threshold(path: &Path) -> usize {
        (path.cwnd - path.cwnd / 2).max(4 * path.pmtu)
    }
}

impl CongestionController for NewReno {
    fn initialize(&self, path: &mut Path, peer_rwnd: u32) {
        path.cwnd = Self::initial_window(path.pmtu);
        path.ssthresh = (peer_rwnd as usize).max(4 * path.pmtu);
        path.partial_bytes_acked = 0;
    }

    fn on_bytes_acked(&self, path: &mut Path, acked: usize, cum_advanced: bool) {
        if path.fast_recovery_exit.is_none() {
            if path.cwnd <= path.ssthresh {
                if cum_advanced && path.outstanding_before_sack >= path.cwnd {
                    path.cwnd += acked.min(path.pmtu);
                }
                path.partial_bytes_acked = 0;
            } else {
                path.partial_bytes_acked += acked;
                if path.partial_bytes_acked >= path.cwnd
                    && cum_advanced
                    && path.outstanding_before_sack >= path.cwnd
                {
                    path.partial_bytes_acked -= path.cwnd;
                    path.cwnd += path.pmtu;
                }
            }
        }
        if path.outstanding_bytes == 0 {
            path.partial_bytes_acked = 0;
        }
    }

    fn on_loss_detected(&self, path: &mut Path, highest_outstanding: u32) -> bool {
        if path.fast_recovery_exit.is_some() {
            return false;
        }
        path.ssthresh = Self::reduced_threshold(path);
        path.cwnd = path.ssthresh;
        path.partial_bytes_acked = 0;
        path.fast_recovery_exit = Some(highest_outstanding);
        debug!(
            "{} entering fast recovery: cwnd={} ssthresh={} exit={}",
            path.id, path.cwnd, path.ssthresh, highest_outstanding
        );
        true
    }

    fn on_cum_ack(&self, path: &mut Path, cum_tsn_ack: u32) {
        if let Some(exit) = path.fast_recovery_exit {
            if tsn_ge(cum_tsn_ack, exit) {
                debug!("{} leaving fast recovery at {}", path.id, cum_tsn_ack);
                path.fast_recovery_exit = None;
            }
        }
    }

    fn on_retransmission_timeout(&self, path: &mut Path) {
        path.ssthresh = Self::reduced_threshold(path);
        path.cwnd = path.pmtu;
        path.partial_bytes_acked = 0;
        path.fast_recovery_exit = None;
    }

    fn limit_burst(&self, path: &mut Path, max_burst: usize) {
        let limit = path.outstanding_bytes + max_burst * path.pmtu;
        if path.cwnd > limit {
            path.cwnd = limit.max(path.pmtu);
        }
    }

    fn on_idle(&self, path: &mut Path) {
        let initial = Self::initial_window(path.pmtu);
        if path.cwnd > initial {
            path.cwnd = initial;
        }
        path.partial_bytes_acked = 0;
    }
}
