//! UDP media sockets of a transport

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;

use super::config::ListenIp;

/// The transport's port bound on every listen address
///
/// The client's address is learned from the first packet it sends after
/// connecting; everything the router sends goes back to that address
/// through the socket it arrived on.
pub(crate) struct MediaSocket {
    sockets: Vec<Arc<UdpSocket>>,
    remote: Mutex<Option<(usize, SocketAddr)>>,
}

impl MediaSocket {
    pub(crate) async fn bind(listen_ips: &[ListenIp], port: u16) -> io::Result<Self> {
        let mut sockets = Vec::with_capacity(listen_ips.len());
        for listen_ip in listen_ips {
            let socket = UdpSocket::bind(SocketAddr::new(listen_ip.ip, port)).await?;
            sockets.push(Arc::new(socket));
        }
        Ok(Self {
            sockets,
            remote: Mutex::new(None),
        })
    }

    pub(crate) fn sockets(&self) -> impl Iterator<Item = (usize, Arc<UdpSocket>)> + '_ {
        self.sockets.iter().cloned().enumerate()
    }

    pub(crate) fn remote(&self) -> Option<SocketAddr> {
        let remote = *self.remote.lock();
        remote.map(|(_, addr)| addr)
    }

    /// Remember where the client sends from; true only the first time
    pub(crate) fn latch(&self, index: usize, from: SocketAddr) -> bool {
        let mut remote = self.remote.lock();
        if remote.is_some() {
            return false;
        }
        *remote = Some((index, from));
        true
    }

    /// Send to the client; `Ok(false)` while its address is unknown
    pub(crate) async fn send(&self, datagram: &[u8]) -> io::Result<bool> {
        let remote = *self.remote.lock();
        let Some((index, addr)) = remote else {
            return Ok(false);
        };
        let Some(socket) = self.sockets.get(index) else {
            return Ok(false);
        };
        socket.send_to(datagram, addr).await?;
        Ok(true)
    }
}
