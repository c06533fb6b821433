// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization over a raw serial line
//!
//! Before SSH can run over the serial port, both ends must agree that they
//! are talking to each other and not to stale bytes in the line:
//!
//! ```text
//! client                          server
//!   SYN r           ------->
//!                   <-------      ACK r+1 s
//!   ACK s+1         ------->
//! ```
//!
//! A client may answer with DEBUG-ACK instead, in which case it then sends a
//! fixed 23-byte probe, the server echoes it, and the client confirms with
//! ACK if the echo matched.  A mismatch at any point is answered with NAK.

use rand::Rng;
use slog::{debug, info, Logger};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SYN: u8 = 0x16;
pub const ACK: u8 = 0x06;
pub const DEBUG_ACK: u8 = 0x07;
pub const NAK: u8 = 0x15;

/// Bound on the exchange up to and including the final ACK
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sent by a debugging client after DEBUG-ACK and echoed by the server
pub const LOSSINESS_PROBE: &[u8; 23] = b"\x1b[32mhello world\x1b[39m!\n";

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("timed out waiting for peer")]
    Timeout,
    #[error("expected SYN, read {0:#04x}")]
    NotSyn(u8),
    #[error("expected SYN-ACK {expected:02x?}, read {found:02x?}")]
    BadSynAck { expected: [u8; 2], found: [u8; 2] },
    #[error("expected ACK {expected:02x?}, read {found:02x?}")]
    BadAck { expected: [u8; 2], found: [u8; 2] },
    #[error("lossiness check failed")]
    Lossy,
    #[error("i/o error during handshake")]
    Io(#[from] std::io::Error),
}

/// Outcome of a successful server handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Negotiated {
    Normal,
    /// The client asked for, and passed, the lossiness check
    Debug,
}

async fn within<T, F>(
    deadline: tokio::time::Instant,
    f: F,
) -> Result<T, HandshakeError>
where
    F: std::future::Future<Output = Result<T, HandshakeError>>,
{
    tokio::time::timeout_at(deadline, f)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Runs the server side of the handshake on `conn`.
pub async fn server<C>(
    log: &Logger,
    conn: &mut C,
) -> Result<Negotiated, HandshakeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;

    debug!(log, "reading syn");
    let syn = within(deadline, async {
        let mut syn = [0u8; 2];
        conn.read_exact(&mut syn).await?;
        Ok::<_, HandshakeError>(syn)
    })
    .await?;
    if syn[0] != SYN {
        conn.write_all(&[NAK]).await?;
        return Err(HandshakeError::NotSyn(syn[0]));
    }

    let s: u8 = rand::thread_rng().gen();
    conn.write_all(&[ACK, syn[1].wrapping_add(1), s]).await?;
    conn.flush().await?;

    debug!(log, "reading ack");
    let ack = within(deadline, async {
        let mut ack = [0u8; 2];
        conn.read_exact(&mut ack).await?;
        Ok::<_, HandshakeError>(ack)
    })
    .await?;
    let expected = s.wrapping_add(1);
    if (ack[0] != ACK && ack[0] != DEBUG_ACK) || ack[1] != expected {
        conn.write_all(&[NAK]).await?;
        return Err(HandshakeError::BadAck {
            expected: [ACK, expected],
            found: ack,
        });
    }
    info!(log, "received ack"; "debug" => ack[0] == DEBUG_ACK);

    if ack[0] != DEBUG_ACK {
        return Ok(Negotiated::Normal);
    }

    let mut probe = [0u8; LOSSINESS_PROBE.len()];
    conn.read_exact(&mut probe).await?;
    conn.write_all(&probe).await?;
    conn.flush().await?;
    let mut confirm = [0u8; 1];
    conn.read_exact(&mut confirm).await?;
    if confirm[0] != ACK {
        return Err(HandshakeError::Lossy);
    }
    info!(log, "lossiness check passed");
    Ok(Negotiated::Debug)
}

/// Runs the client side of the handshake on `conn`.
pub async fn client<C>(
    log: &Logger,
    conn: &mut C,
    debug: bool,
) -> Result<(), HandshakeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;

    let r: u8 = rand::thread_rng().gen();
    conn.write_all(&[SYN, r]).await?;
    conn.flush().await?;

    let synack = within(deadline, async {
        let mut synack = [0u8; 3];
        conn.read_exact(&mut synack).await?;
        Ok::<_, HandshakeError>(synack)
    })
    .await?;
    let expected = [ACK, r.wrapping_add(1)];
    if synack[..2] != expected {
        conn.write_all(&[NAK]).await?;
        return Err(HandshakeError::BadSynAck {
            expected,
            found: [synack[0], synack[1]],
        });
    }

    let flag = if debug { DEBUG_ACK } else { ACK };
    conn.write_all(&[flag, synack[2].wrapping_add(1)]).await?;
    conn.flush().await?;
    debug!(log, "sent ack"; "debug" => debug);

    if debug {
        conn.write_all(LOSSINESS_PROBE).await?;
        conn.flush().await?;
        let mut echo = [0u8; LOSSINESS_PROBE.len()];
        conn.read_exact(&mut echo).await?;
        if &echo != LOSSINESS_PROBE {
            conn.write_all(&[NAK]).await?;
            return Err(HandshakeError::Lossy);
        }
        conn.write_all(&[ACK]).await?;
        conn.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use vch_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn handshake() {
        let logctx = test_setup_log("handshake");
        for debug in [false, true] {
            let (mut a, mut b) = tokio::io::duplex(64);
            let log = logctx.log.clone();
            let server =
                tokio::spawn(async move { server(&log, &mut a).await });
            client(&logctx.log, &mut b, debug).await.unwrap();
            let negotiated = server.await.unwrap().unwrap();
            let expected =
                if debug { Negotiated::Debug } else { Negotiated::Normal };
            assert_eq!(negotiated, expected);
        }
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn wrong_ack_is_refused() {
        let logctx = test_setup_log("wrong_ack_is_refused");
        let (mut a, mut b) = tokio::io::duplex(64);
        let log = logctx.log.clone();
        let server = tokio::spawn(async move { server(&log, &mut a).await });

        b.write_all(&[SYN, 41]).await.unwrap();
        let mut synack = [0u8; 3];
        b.read_exact(&mut synack).await.unwrap();
        assert_eq!(synack[..2], [ACK, 42]);
        b.write_all(&[ACK, synack[2].wrapping_add(2)]).await.unwrap();

        let mut nak = [0u8; 1];
        b.read_exact(&mut nak).await.unwrap();
        assert_eq!(nak[0], NAK);
        assert!(matches!(
            server.await.unwrap(),
            Err(HandshakeError::BadAck { .. })
        ));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn garbage_is_answered_with_nak() {
        let logctx = test_setup_log("garbage_is_answered_with_nak");
        let (mut a, mut b) = tokio::io::duplex(64);
        let log = logctx.log.clone();
        let server = tokio::spawn(async move { server(&log, &mut a).await });

        b.write_all(b"xx").await.unwrap();
        let mut nak = [0u8; 1];
        b.read_exact(&mut nak).await.unwrap();
        assert_eq!(nak[0], NAK);
        assert!(matches!(
            server.await.unwrap(),
            Err(HandshakeError::NotSyn(b'x'))
        ));
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let logctx = test_setup_log("silent_peer_times_out");
        let (mut a, _b) = tokio::io::duplex(64);
        assert!(matches!(
            server(&logctx.log, &mut a).await,
            Err(HandshakeError::Timeout)
        ));
        logctx.cleanup_successful();
    }
}
