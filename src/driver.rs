//! Runs an [`Association`] on tokio.
//!
//! The driver owns the association, turns its recorded actions into
//! datagrams and timer deadlines, and exchanges user commands and events with
//! an [`AssociationHandle`] over channels.

use crate::association::Association;
use crate::chunk::Chunk;
use crate::chunk::packet::{COMMON_HEADER_LEN, Packet};
use crate::context::{Action, ActionQueue, Indication, Message};
use crate::error::SctpError;
use crate::stream::OutgoingMessage;
use crate::timer::TimerId;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Where encoded packets go.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, packet: Bytes, destination: SocketAddr) -> Result<()>;
}

#[async_trait]
impl DatagramTransport for UdpSocket {
    async fn send_to(&self, packet: Bytes, destination: SocketAddr) -> Result<()> {
        UdpSocket::send_to(self, &packet, destination).await?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum Command {
    Connect(SocketAddr),
    Send(OutgoingMessage),
    ResetStreams(Vec<u16>),
    AddStreams { outbound: u16, inbound: u16 },
    AddPath(SocketAddr),
    Shutdown,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(Message),
    Indication(Indication),
    CommandFailed(SctpError),
}

/// User side of a running driver.
#[derive(Debug)]
pub struct AssociationHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
}

impl AssociationHandle {
    pub fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("association driver has stopped"))
    }

    pub fn connect(&self, remote: SocketAddr) -> Result<()> {
        self.command(Command::Connect(remote))
    }

    pub fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.command(Command::Send(message))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

pub struct Driver<T: DatagramTransport> {
    association: Association<ActionQueue>,
    transport: Arc<T>,
    incoming: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    deadlines: BTreeMap<TimerId, Instant>,
    finished: bool,
}

impl<T: DatagramTransport + 'static> Driver<T> {
    pub fn new(
        association: Association<ActionQueue>,
        transport: Arc<T>,
        incoming: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
    ) -> (Self, AssociationHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let driver = Self {
            association,
            transport,
            incoming,
            commands: command_rx,
            events: event_tx,
            deadlines: BTreeMap::new(),
            finished: false,
        };
        let handle = AssociationHandle {
            commands: command_tx,
            events: event_rx,
        };
        (driver, handle)
    }

    pub async fn run(mut self) {
        debug!("SCTP driver started");
        loop {
            self.flush().await;
            if self.finished {
                break;
            }
            let deadline = self.deadlines.values().min().copied();
            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                packet = self.incoming.recv() => match packet {
                    Some((raw, source)) => {
                        if let Err(e) = self.association.receive_raw(Instant::now(), source, raw) {
                            debug!("Dropping packet from {}: {}", source, e);
                        }
                        while let Ok((raw, source)) = self.incoming.try_recv() {
                            if let Err(e) = self.association.receive_raw(Instant::now(), source, raw) {
                                debug!("Dropping packet from {}: {}", source, e);
                            }
                        }
                    }
                    None => {
                        debug!("SCTP driver exiting (transport closed)");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => {
                        debug!("SCTP driver exiting (handle dropped)");
                        self.association.abort(Instant::now());
                        self.flush().await;
                        break;
                    }
                },
                _ = sleep => self.fire_timers(),
            }
        }
    }

    fn apply(&mut self, command: Command) {
        let now = Instant::now();
        let result = match command {
            Command::Connect(remote) => self.association.connect(now, remote),
            Command::Send(message) => self.association.send(now, message),
            Command::ResetStreams(streams) => self.association.reset_streams(now, &streams).map(|_| ()),
            Command::AddStreams { outbound, inbound } => {
                self.association.add_streams(now, outbound, inbound).map(|_| ())
            }
            Command::AddPath(remote) => {
                self.association.add_path(now, remote);
                Ok(())
            }
            Command::Shutdown => self.association.shutdown(now),
            Command::Abort => {
                self.association.abort(now);
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!("SCTP command failed: {}", e);
            let _ = self.events.send(Event::CommandFailed(e));
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        let expired: Vec<TimerId> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(timer, _)| *timer)
            .collect();
        for timer in expired {
            self.deadlines.remove(&timer);
            trace!("Timer {:?} fired", timer);
            self.association.handle_timeout(now, timer);
        }
    }

    /// Applies every action the association recorded and sends the
    /// resulting packets.
    async fn flush(&mut self) {
        let actions: Vec<Action> = self.association.context_mut().drain().collect();
        let mut outgoing: Vec<(SocketAddr, u32, Vec<Chunk>)> = Vec::new();
        let pmtu = self.association.config().pmtu;
        for action in actions {
            match action {
                Action::Send { chunk, destination } => {
                    let tag = self.association.verification_tag_for(&chunk);
                    push_bundled(&mut outgoing, destination, tag, chunk, pmtu);
                }
                Action::ScheduleTimer { timer, after } => {
                    self.deadlines.insert(timer, Instant::now() + after);
                }
                Action::CancelTimer(timer) => {
                    self.deadlines.remove(&timer);
                }
                Action::Deliver(message) => {
                    let _ = self.events.send(Event::Message(message));
                }
                Action::Indicate(indication) => {
                    if matches!(indication, Indication::Closed | Indication::ConnectionLost(_)) {
                        self.finished = true;
                    }
                    let _ = self.events.send(Event::Indication(indication));
                }
            }
        }
        let config = self.association.config();
        let (local_port, remote_port) = (config.local_port, config.remote_port);
        for (destination, tag, chunks) in outgoing {
            let mut packet = Packet::new(local_port, remote_port, tag);
            packet.chunks = chunks;
            if let Err(e) = self.transport.send_to(packet.marshal(), destination).await {
                debug!("Failed to send SCTP packet to {}: {}", destination, e);
            }
        }
    }
}

/// Appends `chunk` to the last packet when destination and tag match and it
/// fits; INIT, INIT ACK and SHUTDOWN COMPLETE always travel alone.
fn push_bundled(
    outgoing: &mut Vec<(SocketAddr, u32, Vec<Chunk>)>,
    destination: SocketAddr,
    tag: u32,
    chunk: Chunk,
    pmtu: usize,
) {
    let alone = |c: &Chunk| {
        matches!(
            c,
            Chunk::Init(_) | Chunk::InitAck(_) | Chunk::ShutdownComplete { .. }
        )
    };
    if let Some((dest, last_tag, chunks)) = outgoing.last_mut() {
        let size: usize = COMMON_HEADER_LEN + chunks.iter().map(Chunk::encoded_len).sum::<usize>();
        if *dest == destination
            && *last_tag == tag
            && !alone(&chunk)
            && !chunks.iter().any(alone)
            && size + chunk.encoded_len() <= pmtu
        {
            chunks.push(chunk);
            return;
        }
    }
    outgoing.push((destination, tag, vec![chunk]));
}

/// Spawns a driver for an association carried over a UDP socket, plus the
/// task feeding it received datagrams.
pub fn spawn_udp(association: Association<ActionQueue>, socket: Arc<UdpSocket>) -> AssociationHandle {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let reader = socket.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            match reader.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    if incoming_tx
                        .send((Bytes::copy_from_slice(&buf[..len]), source))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!("UDP receive failed: {}", e);
                    break;
                }
            }
        }
    });
    let (driver, handle) = Driver::new(association, socket, incoming_rx);
    tokio::spawn(driver.run());
    handle
}
