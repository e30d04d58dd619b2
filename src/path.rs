//! Destination transport addresses and their per-path state.

use crate::config::SctpConfig;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

// RTO Constants (RFC 4960)
const RTO_ALPHA: f64 = 0.125;
const RTO_BETA: f64 = 0.25;

/// Stable handle for a path. Slots are never reused within an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub(crate) usize);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RtoCalculator {
    srtt: f64,
    rttvar: f64,
    rto: f64,
    min: f64,
    max: f64,
}

impl RtoCalculator {
    pub(crate) fn new(initial: f64, min: f64, max: f64) -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: initial,
            min,
            max,
        }
    }

    pub(crate) fn update(&mut self, rtt: f64) {
        if self.srtt == 0.0 {
            self.srtt = rtt;
            self.rttvar = rtt / 2.0;
        } else {
            self.rttvar = (1.0 - RTO_BETA) * self.rttvar + RTO_BETA * (self.srtt - rtt).abs();
            self.srtt = (1.0 - RTO_ALPHA) * self.srtt + RTO_ALPHA * rtt;
        }
        self.rto = (self.srtt + 4.0 * self.rttvar).clamp(self.min, self.max);
    }

    pub(crate) fn backoff(&mut self) {
        self.rto = (self.rto * 2.0).min(self.max);
    }

    pub(crate) fn rto(&self) -> Duration {
        Duration::from_secs_f64(self.rto)
    }

    pub(crate) fn srtt(&self) -> Option<Duration> {
        (self.srtt > 0.0).then(|| Duration::from_secs_f64(self.srtt))
    }
}

/// CMT "split fast retransmit" pseudo-cumulative-ack tracking (CUCv2).
#[derive(Debug, Clone, Default)]
pub(crate) struct PseudoCumAck {
    pub(crate) pseudo_cum_ack: Option<u32>,
    pub(crate) find_pseudo_cum_ack: bool,
    pub(crate) rtx_pseudo_cum_ack: Option<u32>,
    pub(crate) find_rtx_pseudo_cum_ack: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HeartbeatProbe {
    pub(crate) nonce: u64,
    pub(crate) sent: Instant,
}

#[derive(Debug, Clone)]
pub struct Path {
    pub(crate) id: PathId,
    pub(crate) remote: SocketAddr,
    pub(crate) rto: RtoCalculator,
    pub(crate) pmtu: usize,
    pub(crate) cwnd: usize,
    pub(crate) ssthresh: usize,
    pub(crate) partial_bytes_acked: usize,
    pub(crate) outstanding_bytes: usize,
    /// Outstanding bytes at the start of the SACK being processed.
    pub(crate) outstanding_before_sack: usize,
    pub(crate) error_count: u32,
    pub(crate) active: bool,
    pub(crate) confirmed: bool,
    /// Set while in fast recovery: the highest TSN outstanding when loss was
    /// detected.
    pub(crate) fast_recovery_exit: Option<u32>,
    pub(crate) cuc: PseudoCumAck,
    pub(crate) heartbeat: Option<HeartbeatProbe>,
    pub(crate) last_send: Option<Instant>,
}

impl Path {
    fn new(id: PathId, remote: SocketAddr, config: &SctpConfig) -> Self {
        Self {
            id,
            remote,
            rto: RtoCalculator::new(
                config.rto_initial.as_secs_f64(),
                config.rto_min.as_secs_f64(),
                config.rto_max.as_secs_f64(),
            ),
            pmtu: config.pmtu,
            cwnd: 0,
            ssthresh: 0,
            partial_bytes_acked: 0,
            outstanding_bytes: 0,
            outstanding_before_sack: 0,
            error_count: 0,
            active: true,
            confirmed: false,
            fast_recovery_exit: None,
            cuc: PseudoCumAck {
                find_pseudo_cum_ack: true,
                find_rtx_pseudo_cum_ack: true,
                ..Default::default()
            },
            heartbeat: None,
            last_send: None,
        }
    }

    pub fn id(&self) -> PathId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn rto(&self) -> Duration {
        self.rto.rto()
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.rto.srtt()
    }

    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    /// For [`CongestionController`](crate::congestion::CongestionController)
    /// implementations outside this crate.
    pub fn set_window(&mut self, cwnd: usize, ssthresh: usize) {
        self.cwnd = cwnd;
        self.ssthresh = ssthresh;
    }

    pub fn pmtu(&self) -> usize {
        self.pmtu
    }

    pub fn partial_bytes_acked(&self) -> usize {
        self.partial_bytes_acked
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.fast_recovery_exit.is_some()
    }

    pub(crate) fn release_outstanding(&mut self, bytes: usize) {
        self.outstanding_bytes = self.outstanding_bytes.saturating_sub(bytes);
    }
}

/// All destinations of an association, addressed by [`PathId`].
#[derive(Debug, Default)]
pub struct PathSet {
    paths: Vec<Option<Path>>,
    primary: Option<PathId>,
    initial_primary: Option<PathId>,
    cursor: usize,
}

impl PathSet {
    /// Returns the id for `remote`, creating the path if it is new.
    pub(crate) fn add(&mut self, remote: SocketAddr, config: &SctpConfig) -> (PathId, bool) {
        if let Some(id) = self.find(remote) {
            return (id, false);
        }
        let id = PathId(self.paths.len());
        self.paths.push(Some(Path::new(id, remote, config)));
        if self.primary.is_none() {
            self.primary = Some(id);
            self.initial_primary = Some(id);
        }
        (id, true)
    }

    pub(crate) fn remove(&mut self, id: PathId) -> Option<Path> {
        let path = self.paths.get_mut(id.0)?.take()?;
        if self.primary == Some(id) {
            self.primary = self.next_active_after(id).or_else(|| self.ids().into_iter().next());
        }
        if self.initial_primary == Some(id) {
            self.initial_primary = None;
        }
        Some(path)
    }

    pub fn get(&self, id: PathId) -> Option<&Path> {
        self.paths.get(id.0).and_then(|p| p.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: PathId) -> Option<&mut Path> {
        self.paths.get_mut(id.0).and_then(|p| p.as_mut())
    }

    pub fn find(&self, remote: SocketAddr) -> Option<PathId> {
        self.iter().find(|p| p.remote == remote).map(|p| p.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Path> {
        self.paths.iter_mut().flatten()
    }

    pub fn ids(&self) -> Vec<PathId> {
        self.iter().map(|p| p.id).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn primary(&self) -> Option<PathId> {
        self.primary
    }

    pub(crate) fn initial_primary(&self) -> Option<PathId> {
        self.initial_primary
    }

    pub(crate) fn set_primary(&mut self, id: PathId) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        self.primary = Some(id);
        true
    }

    pub fn active_count(&self) -> usize {
        self.iter().filter(|p| p.active).count()
    }

    /// Next active path after `id` in slot order, excluding `id` itself.
    pub(crate) fn next_active_after(&self, id: PathId) -> Option<PathId> {
        let n = self.paths.len();
        (1..n)
            .map(|step| (id.0 + step) % n)
            .filter_map(|slot| self.paths[slot].as_ref())
            .find(|p| p.active)
            .map(|p| p.id)
    }

    /// Destination for a retransmission of data last sent on `last`: an
    /// alternate active path when one exists, otherwise `last` (if it still
    /// exists) or the primary.
    pub(crate) fn retransmit_destination(&self, last: Option<PathId>) -> Option<PathId> {
        if let Some(last) = last {
            if let Some(alt) = self.next_active_after(last) {
                return Some(alt);
            }
            if self.get(last).is_some() {
                return Some(last);
            }
        }
        self.primary
    }

    /// Destination for new data: the primary, or with `round_robin` each
    /// active path in turn.
    pub(crate) fn data_destination(&mut self, round_robin: bool) -> Option<PathId> {
        if round_robin && self.active_count() > 1 {
            let n = self.paths.len();
            for step in 0..n {
                let slot = (self.cursor + step) % n;
                if let Some(p) = self.paths[slot].as_ref().filter(|p| p.active) {
                    self.cursor = slot + 1;
                    return Some(p.id);
                }
            }
        }
        match self.primary {
            Some(id) if self.get(id).is_some_and(|p| p.active) => Some(id),
            Some(id) => self.next_active_after(id).or(Some(id)),
            None => None,
        }
    }

    /// Moves the primary to the next active path if the current one is down.
    /// Returns the new primary when it changed.
    pub(crate) fn failover(&mut self) -> Option<PathId> {
        let current = self.primary?;
        if self.get(current).is_some_and(|p| p.active) {
            return None;
        }
        let next = self.next_active_after(current)?;
        self.primary = Some(next);
        Some(next)
    }
}
