//! Receiver side of dynamic address reconfiguration (RFC 5061).

use super::{Association, Inbound};
use crate::chunk::{
    Asconf, AsconfAck, AsconfRequest, CAUSE_DELETE_LAST_ADDRESS, CAUSE_DELETE_SOURCE_ADDRESS,
    CAUSE_UNRESOLVABLE_ADDRESS, Chunk, ErrorCause,
};
use crate::context::AssociationContext;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct AsconfState {
    expected_serial: u32,
    last_ack: Option<AsconfAck>,
}

impl AsconfState {
    pub(crate) fn reset(&mut self, peer_initial_tsn: u32) {
        self.expected_serial = peer_initial_tsn;
        self.last_ack = None;
    }
}

fn address_info(ip: IpAddr) -> Bytes {
    let mut buf = BytesMut::new();
    match ip {
        IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
    buf.freeze()
}

impl<C: AssociationContext> Association<C> {
    pub(crate) fn on_asconf(&mut self, now: Instant, inbound: &mut Inbound, asconf: Asconf) {
        let expected = self.asconf.expected_serial;
        if asconf.serial == expected.wrapping_sub(1) {
            if let Some(ack) = self.asconf.last_ack.clone() {
                debug!("Repeating ASCONF-ACK for serial {}", ack.serial);
                self.ctx.send(Chunk::AsconfAck(ack), inbound.source);
            }
            return;
        }
        if asconf.serial != expected {
            debug!("Ignoring ASCONF serial {} (expected {})", asconf.serial, expected);
            return;
        }
        self.asconf.expected_serial = expected.wrapping_add(1);

        let port = inbound.source.port();
        let mut failures = Vec::new();
        for param in asconf.params {
            let outcome = match param.request {
                AsconfRequest::AddIp(ip) => {
                    let ip = if ip.is_unspecified() { inbound.source.ip() } else { ip };
                    self.add_path(now, SocketAddr::new(ip, port));
                    Ok(())
                }
                AsconfRequest::DeleteIp(ip) => self.asconf_delete(now, inbound.source, SocketAddr::new(ip, port)),
                AsconfRequest::SetPrimary(ip) => {
                    let ip = if ip.is_unspecified() { inbound.source.ip() } else { ip };
                    self.set_primary(SocketAddr::new(ip, port))
                        .map_err(|_| ErrorCause::new(CAUSE_UNRESOLVABLE_ADDRESS, address_info(ip)))
                }
            };
            if let Err(cause) = outcome {
                debug!("ASCONF request {} failed with cause {}", param.correlation_id, cause.code);
                failures.push((param.correlation_id, cause));
            }
        }
        let ack = AsconfAck {
            serial: asconf.serial,
            failures,
        };
        self.asconf.last_ack = Some(ack.clone());
        self.ctx.send(Chunk::AsconfAck(ack), inbound.source);
        inbound.transmit = true;
    }

    fn asconf_delete(&mut self, now: Instant, source: SocketAddr, remote: SocketAddr) -> Result<(), ErrorCause> {
        let info = address_info(remote.ip());
        if remote.ip() == source.ip() {
            return Err(ErrorCause::new(CAUSE_DELETE_SOURCE_ADDRESS, info));
        }
        let Some(id) = self.paths.find(remote) else {
            return Err(ErrorCause::new(CAUSE_UNRESOLVABLE_ADDRESS, info));
        };
        if self.paths.len() <= 1 {
            return Err(ErrorCause::new(CAUSE_DELETE_LAST_ADDRESS, info));
        }
        self.drop_path(now, id);
        Ok(())
    }
}
