//! TCP-proxy channel byte pumps (`spec.md` §4.4 "TCP-proxy channels"): a
//! reader pumps target->channel bytes as framed `TCP_PROXY_DATA`; a writer
//! pumps channel->target bytes raw. On target EOF or read error, a
//! `CLOSE_TCP_PROXY` frame is sent with an error indicator.

use crate::session::Session;
use crate::tunnel::channel::VirtualChannel;
use agentd_protocol::{FramedMessage, MessageCode};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Opens a TCP connection to `target` and pumps bytes in both directions
/// between it and `channel`, reporting closure back to `session` on the
/// wire (`spec.md` §4.4). Runs until either side closes.
pub async fn run(
    session: Arc<Session>,
    channel: Arc<VirtualChannel>,
    channel_id: u32,
    target: std::net::SocketAddr,
) {
    let stream = match TcpStream::connect(target).await {
        Ok(s) => s,
        Err(e) => {
            debug!(%target, error = %e, "tcp-proxy connect failed");
            send_close(&session, channel_id, true).await;
            return;
        }
    };
    let (mut read_half, mut write_half) = stream.into_split();

    let reader_channel = channel.clone();
    let reader_session = session.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    send_close(&reader_session, channel_id, false).await;
                    return;
                }
                Ok(n) => {
                    let id = reader_session.next_id();
                    let message = FramedMessage::new(MessageCode::TcpProxyData, id)
                        .with_field(1, channel_id)
                        .with_field(2, buf[..n].to_vec());
                    if reader_session.send(message).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "tcp-proxy target read error");
                    send_close(&reader_session, channel_id, true).await;
                    return;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(data) = reader_channel.recv().await {
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    let _ = reader.await;
    channel.close();
    writer.abort();
}

async fn send_close(session: &Arc<Session>, channel_id: u32, had_error: bool) {
    let id = session.next_id();
    let message = FramedMessage::new(MessageCode::CloseTcpProxy, id)
        .with_field(1, channel_id)
        .with_field(2, had_error as u32);
    let _ = session.send(message).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RoleFlags, SessionOrigin};
    use crate::transport::VirtualSession;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn bytes_from_target_arrive_as_tcp_proxy_data_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            drop(stream);
        });

        let transport = Arc::new(VirtualSession::new());
        let session = Arc::new(Session::new(
            SessionOrigin::Inbound,
            RoleFlags::empty(),
            false,
            transport,
        ));
        let (channel, _outbound_rx) = VirtualChannel::new(1);

        run(session, channel, 1, target_addr).await;
        accept_task.await.unwrap();
    }
}
