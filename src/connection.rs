//! # Connection Lifecycle
//!
//! Handshake, admission, and the per-connection reader and writer tasks.
//!
//! ## Handshake
//!
//! ```text
//! dialer                         acceptor
//!   | ---- Hello{contact} -------> |  gate(Known(dialer))
//!   | <--- Welcome{contact, ..} -- |  or Refused
//!   | gate(Known(acceptor))        |
//!   | ---- Accept ---------------> |  acceptor inserts neighbor
//!   |  dialer inserts neighbor     |
//! ```
//!
//! An acceptor whose policies deny the bare address still reads the `Hello`
//! and answers `Refused`.
//!
//! Either side may answer `Refused` instead; the connection is then closed
//! without touching the neighbor table. The whole exchange is bounded by the
//! connect timeout.
//!
//! ## Tasks
//!
//! After the handshake the write half moves into a writer task draining the
//! neighbor's outbound queue. The read half stays with a reader loop that
//! hands frames to the node in arrival order and removes the neighbor when
//! the stream ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::admission::Candidate;
use crate::error::NetError;
use crate::identity::Contact;
use crate::messages::Frame;
use crate::neighbors::{Direction, Neighbor};
use crate::node::NodeInner;
use crate::transport::{self, read_frame, write_frame};

/// Result of a successful outbound handshake.
pub(crate) struct Dialed {
    pub contact: Contact,
    /// Neighbors of the remote at handshake time.
    pub introduced: Vec<Contact>,
}

/// Accept loop. Each connection is handled on its own task.
pub(crate) async fn serve(inner: Arc<NodeInner>, listener: tokio::net::TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_inbound(inner, stream, remote).await {
                debug!(remote = %remote, error = %e, "inbound connection failed");
            }
        });
    }
}

async fn handle_inbound(inner: Arc<NodeInner>, stream: TcpStream, remote: SocketAddr) -> Result<()> {
    let remote_str = remote.to_string();
    let permitted = inner.gate.permits(&Candidate::Unknown { addr: Some(&remote_str) });
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();

    if !permitted {
        // The hello must be read before closing, or the close resets the
        // stream and the dialer never sees the refusal.
        let hello = read_frame(&mut reader);
        let peer = match tokio::time::timeout(inner.config.connect_timeout, hello).await {
            Ok(Ok(Some(Frame::Hello { contact }))) => contact.identity.short(),
            _ => "unknown".to_string(),
        };
        info!(peer = %peer, remote = %remote, "inbound connection denied before handshake");
        refuse(&inner, &mut writer, REFUSED_ADMISSION).await;
        let _ = writer.shutdown().await;
        return Ok(());
    }

    let handshake = accept_handshake(&inner, &mut reader, &mut writer, remote);
    let contact = match tokio::time::timeout(inner.config.connect_timeout, handshake).await {
        Ok(Ok(Some(contact))) => contact,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => bail!("handshake with {remote} timed out"),
    };

    let conn_id = install(&inner, &contact, Direction::Inbound, writer)?;
    read_loop(inner, contact, conn_id, reader).await;
    Ok(())
}

/// Returns `None` when either side refused.
async fn accept_handshake(
    inner: &NodeInner,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    remote: SocketAddr,
) -> Result<Option<Contact>> {
    let claimed = match read_frame(reader).await? {
        Some(Frame::Hello { contact }) => contact,
        Some(other) => bail!("expected hello, got {}", other.kind()),
        None => bail!("connection closed before hello"),
    };
    let contact = Contact::new(claimed.identity, advertised_addr(&claimed.addr, remote));

    if let Some(reason) = refusal(inner, &contact, false) {
        info!(
            peer = %contact.identity.short(),
            remote = %remote,
            reason,
            "refused inbound connection"
        );
        refuse(inner, writer, reason).await;
        return Ok(None);
    }

    let introduced = inner
        .neighbors
        .contacts()
        .into_iter()
        .filter(|c| c.identity != contact.identity)
        .collect();
    let welcome = Frame::Welcome {
        contact: inner.contact.clone(),
        neighbors: introduced,
    };
    write_frame(writer, &welcome).await?;

    match read_frame(reader).await? {
        Some(Frame::Accept) => Ok(Some(contact)),
        Some(Frame::Refused { reason, .. }) => {
            info!(peer = %contact.identity.short(), reason = %reason, "dialer refused connection");
            Ok(None)
        }
        Some(other) => bail!("expected accept, got {}", other.kind()),
        None => bail!("connection closed during handshake"),
    }
}

/// Dial `addr` and complete the handshake.
///
/// When `expected` is given the gate is consulted before dialing, and the
/// remote must present that identity.
pub(crate) async fn dial(
    inner: &Arc<NodeInner>,
    addr: &str,
    expected: Option<&Contact>,
) -> Result<Dialed> {
    if let Some(expected) = expected
        && !inner.gate.permits(&Candidate::Known(expected))
    {
        return Err(NetError::AdmissionDenied {
            identity: expected.identity,
        }
        .into());
    }

    let stream = transport::dial(addr, inner.config.connect_timeout).await?;
    let remote = stream.peer_addr().context("failed to read peer address")?;
    let (mut reader, mut writer) = stream.into_split();

    let handshake = dial_handshake(inner, &mut reader, &mut writer, remote, expected);
    let dialed = tokio::time::timeout(inner.config.connect_timeout, handshake)
        .await
        .map_err(|_| anyhow!("handshake with {addr} timed out"))??;

    let conn_id = install(inner, &dialed.contact, Direction::Outbound, writer)?;
    tokio::spawn(read_loop(inner.clone(), dialed.contact.clone(), conn_id, reader));
    Ok(dialed)
}

async fn dial_handshake(
    inner: &NodeInner,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    remote: SocketAddr,
    expected: Option<&Contact>,
) -> Result<Dialed> {
    write_frame(
        writer,
        &Frame::Hello {
            contact: inner.contact.clone(),
        },
    )
    .await?;

    let (claimed, introduced) = match read_frame(reader).await? {
        Some(Frame::Welcome { contact, neighbors }) => (contact, neighbors),
        Some(Frame::Refused { identity, reason }) => {
            info!(
                peer = %identity.short(),
                remote = %remote,
                reason = %reason,
                "connection refused by remote"
            );
            if reason == REFUSED_ADMISSION {
                return Err(NetError::AdmissionDenied { identity }.into());
            }
            bail!("{} refused connection: {}", identity.short(), reason);
        }
        Some(other) => bail!("expected welcome, got {}", other.kind()),
        None => bail!("connection closed before welcome"),
    };
    let contact = Contact::new(claimed.identity, advertised_addr(&claimed.addr, remote));

    if let Some(expected) = expected
        && expected.identity != contact.identity
    {
        refuse(inner, writer, "identity mismatch").await;
        bail!(
            "expected {} at {}, found {}",
            expected.identity.short(),
            remote,
            contact.identity.short()
        );
    }

    // An expected contact already passed the gate before dialing.
    if let Some(reason) = refusal(inner, &contact, expected.is_some()) {
        refuse(inner, writer, reason).await;
        if reason == REFUSED_ADMISSION {
            info!(peer = %contact.identity.short(), remote = %remote, "refused outbound connection");
            return Err(NetError::AdmissionDenied {
                identity: contact.identity,
            }
            .into());
        }
        bail!("{} ({})", reason, contact.identity.short());
    }

    write_frame(writer, &Frame::Accept).await?;
    Ok(Dialed { contact, introduced })
}

const REFUSED_ADMISSION: &str = "admission denied";

/// Checks shared by both sides once the remote identity is known. The gate is
/// skipped when `gate_passed` is set, so each policy sees a candidate once.
fn refusal(inner: &NodeInner, contact: &Contact, gate_passed: bool) -> Option<&'static str> {
    if contact.identity == inner.contact.identity {
        Some("connection to self")
    } else if inner.is_shutting_down() {
        Some("node shutting down")
    } else if !gate_passed && !inner.gate.permits(&Candidate::Known(contact)) {
        Some(REFUSED_ADMISSION)
    } else if inner.neighbors.contains(&contact.identity) {
        Some("already connected")
    } else if inner.neighbors.is_full() {
        Some("neighbor table full")
    } else {
        None
    }
}

async fn refuse(inner: &NodeInner, writer: &mut OwnedWriteHalf, reason: &str) {
    let frame = Frame::Refused {
        identity: inner.contact.identity,
        reason: reason.to_string(),
    };
    if let Err(e) = write_frame(writer, &frame).await {
        debug!(error = %e, "failed to send refusal");
    }
}

/// Insert the neighbor and start its writer task. Fails once the node is
/// shutting down.
pub(crate) fn install(
    inner: &Arc<NodeInner>,
    contact: &Contact,
    direction: Direction,
    writer: OwnedWriteHalf,
) -> Result<u64> {
    if inner.is_shutting_down() {
        bail!("node shutting down, dropping link to {}", contact.identity.short());
    }
    let (link, queue) = mpsc::channel(inner.config.outbound_queue.max(1));
    let conn_id = inner.neighbors.next_conn_id();
    inner
        .neighbors
        .insert(Neighbor {
            contact: contact.clone(),
            link,
            established_at: Instant::now(),
            direction,
            conn_id,
        })
        .with_context(|| format!("cannot admit {}", contact.identity.short()))?;

    tokio::spawn(write_loop(contact.clone(), queue, writer));

    info!(
        peer = %contact.identity.short(),
        addr = %contact.addr,
        direction = ?direction,
        "neighbor connected"
    );
    if let Some(summary) = inner.neighbors.summary(&contact.identity) {
        inner.hooks.connected(&summary);
    }
    Ok(conn_id)
}

async fn write_loop(contact: Contact, mut queue: mpsc::Receiver<Frame>, mut writer: OwnedWriteHalf) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(peer = %contact.identity.short(), error = %e, "write failed, closing link");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(inner: Arc<NodeInner>, contact: Contact, conn_id: u64, mut reader: OwnedReadHalf) {
    let mut shutdown = inner.shutdown_signal();
    let peer = contact.identity;
    while !*shutdown.borrow_and_update() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(frame)) => inner.handle_frame(&peer, frame),
                Ok(None) => {
                    debug!(peer = %peer.short(), "link closed by remote");
                    break;
                }
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "link read failed");
                    break;
                }
            },
        }
    }
    if inner.neighbors.remove(&peer, conn_id).is_some() {
        info!(peer = %peer.short(), addr = %contact.addr, "neighbor disconnected");
    }
}

/// Replace an unspecified listen address (`0.0.0.0:port`) with the address
/// the connection was observed from.
fn advertised_addr(claimed: &str, observed: SocketAddr) -> String {
    match claimed.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => {
            SocketAddr::new(observed.ip(), addr.port()).to_string()
        }
        _ => claimed.to_string(),
    }
}
