//! Channel over a connected UDP socket, one text message per datagram.
//!
//! UDP matches the channel contract closely: best-effort and unframed. Unlike the
//! contract it may reorder, which the protocol tolerates since replies are matched by
//! index and late ones are reported as unexpected.

use std::{net::SocketAddr, sync::Arc};

use tokio::{net::UdpSocket, sync::mpsc};

use super::{Channel, ChannelError, MessageSink};

/// Largest datagram accepted from the peer.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Queues outbound text for the writer task owning the socket's send side.
struct UdpSink(mpsc::UnboundedSender<String>);

impl MessageSink for UdpSink {
    fn send(&self, text: String) -> Result<(), ChannelError> {
        self.0.send(text).map_err(|_| ChannelError::Closed)
    }
}

/// Binds `local_addr`, connects to `remote_addr` and wraps the socket in a [`Channel`].
pub async fn connect(
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
) -> Result<Channel, ChannelError> {
    let socket = UdpSocket::bind(local_addr).await?;
    socket.connect(remote_addr).await?;
    log::info!("UDP channel {} -> {}", local_addr, remote_addr);
    Ok(from_socket(socket))
}

/// Wraps an already connected socket in a [`Channel`].
pub fn from_socket(socket: UdpSocket) -> Channel {
    let socket = Arc::new(socket);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let writer_socket = socket.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if let Err(e) = writer_socket.send(text.as_bytes()).await {
                log::debug!("UDP send error: {}", e);
            }
        }
    });

    let reader_socket = socket;
    let reader = tokio::spawn(async move {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            match reader_socket.recv(&mut buf).await {
                Ok(len) => {
                    let text = String::from_utf8_lossy(&buf[..len]).into_owned();
                    if inbound_tx.send(text).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here while the peer is not up yet.
                    log::debug!("UDP receive error: {}", e);
                }
            }
        }
    });

    Channel::new(Arc::new(UdpSink(outbound_tx)), inbound_rx)
        .with_task(reader)
        .with_task(writer)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_udp_channel_exchange() {
        let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a_sock.connect(b_sock.local_addr().unwrap()).await.unwrap();
        b_sock.connect(a_sock.local_addr().unwrap()).await.unwrap();

        let a = from_socket(a_sock);
        let mut b = from_socket(b_sock);

        a.send("TSQ12".to_string()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), b.recv())
            .await
            .expect("timed out waiting for datagram");
        assert_eq!(got.as_deref(), Some("TSQ12"));
    }

    #[tokio::test]
    async fn test_burst_sent_before_first_poll_is_delivered() {
        let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a_sock.connect(b_sock.local_addr().unwrap()).await.unwrap();
        b_sock.connect(a_sock.local_addr().unwrap()).await.unwrap();

        let a = from_socket(a_sock);
        let mut b = from_socket(b_sock);

        // Fresh socket, no writability seen yet by the reactor.
        for i in 0..5 {
            a.send(format!("TSQ{}", i)).unwrap();
        }
        for i in 0..5 {
            let got = tokio::time::timeout(Duration::from_secs(5), b.recv())
                .await
                .expect("timed out waiting for datagram");
            assert_eq!(got, Some(format!("TSQ{}", i)));
        }
    }

    #[tokio::test]
    async fn test_send_fails_once_channel_dropped_writer() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.connect(sock.local_addr().unwrap()).await.unwrap();
        let channel = from_socket(sock);
        let sink = channel.sink();
        drop(channel);
        // Aborted writer drops its receiver once the runtime reaps it.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            sink.send("TSQ1".to_string()),
            Err(ChannelError::Closed)
        ));
    }
}
