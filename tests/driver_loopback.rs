use anyhow::{Context, Result};
use bytes::Bytes;
use rustsctp::driver::{AssociationHandle, Event, spawn_udp};
use rustsctp::{ActionQueue, Association, Indication, OutgoingMessage, SctpConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

fn config() -> SctpConfig {
    SctpConfig {
        rto_initial: Duration::from_millis(200),
        rto_min: Duration::from_millis(100),
        sack_delay: Duration::from_millis(20),
        ..SctpConfig::default()
    }
}

async fn wait_for<F>(handle: &mut AssociationHandle, mut pred: F) -> Result<Event>
where
    F: FnMut(&Event) -> bool,
{
    timeout(Duration::from_secs(5), async {
        while let Some(event) = handle.next_event().await {
            if pred(&event) {
                return Ok(event);
            }
        }
        anyhow::bail!("driver stopped")
    })
    .await
    .context("timed out waiting for event")?
}

async fn pair() -> Result<(AssociationHandle, AssociationHandle)> {
    let server_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let client_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let server_addr = server_socket.local_addr()?;

    let server = Association::new(config(), ActionQueue::default())?;
    let client = Association::new(config(), ActionQueue::default())?;
    let mut server = spawn_udp(server, server_socket);
    let mut client = spawn_udp(client, client_socket);

    client.connect(server_addr)?;
    let up = |e: &Event| matches!(e, Event::Indication(Indication::CommunicationUp));
    wait_for(&mut client, up).await?;
    wait_for(&mut server, up).await?;
    Ok((client, server))
}

#[tokio::test]
async fn test_udp_loopback_exchange() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (mut client, mut server) = pair().await?;

    client.send(OutgoingMessage::new(1, Bytes::from_static(b"ping")).with_ppid(51))?;
    let Event::Message(message) = wait_for(&mut server, |e| matches!(e, Event::Message(_))).await?
    else {
        unreachable!()
    };
    assert_eq!(message.payload, Bytes::from_static(b"ping"));
    assert_eq!(message.stream_id, 1);
    assert_eq!(message.ppid, 51);

    server.send(OutgoingMessage::new(1, Bytes::from_static(b"pong")))?;
    let Event::Message(reply) = wait_for(&mut client, |e| matches!(e, Event::Message(_))).await?
    else {
        unreachable!()
    };
    assert_eq!(reply.payload, Bytes::from_static(b"pong"));

    client.shutdown()?;
    let closed = |e: &Event| matches!(e, Event::Indication(Indication::Closed));
    wait_for(&mut client, closed).await?;
    wait_for(&mut server, closed).await?;
    Ok(())
}

#[tokio::test]
async fn test_udp_loopback_large_message_is_fragmented() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client, mut server) = pair().await?;

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    client.send(OutgoingMessage::new(0, payload.clone()))?;
    let Event::Message(message) = wait_for(&mut server, |e| matches!(e, Event::Message(_))).await?
    else {
        unreachable!()
    };
    assert_eq!(message.payload.len(), payload.len());
    assert_eq!(&message.payload[..], &payload[..]);
    Ok(())
}

#[tokio::test]
async fn test_command_failure_is_reported() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (mut client, _server) = pair().await?;
    client.send(OutgoingMessage::new(9000, Bytes::from_static(b"x")))?;
    let event = wait_for(&mut client, |e| matches!(e, Event::CommandFailed(_))).await?;
    assert_eq!(
        event,
        Event::CommandFailed(rustsctp::SctpError::InvalidStream(9000))
    );
    Ok(())
}
