// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::trace;

use crate::tunnel::grpc::{Inner, close_request, data_packet};
use crate::tunnel::proto::Packet;

// Largest payload carried by one DATA packet.
const MAX_DATA_FRAME: usize = 32 * 1024;

// TunnelStream is the connection dialed through a tunnel. Reads drain DATA packets for its
// connect id; writes become DATA packets; shutdown sends CLOSE_REQ.
pub struct TunnelStream {
    connect_id: i64,
    recv: mpsc::Receiver<Bytes>,
    buf: Bytes,
    send: PollSender<Packet>,
    closed: bool,
    _tunnel: Arc<Inner>,
}

impl TunnelStream {
    pub(super) fn new(
        connect_id: i64,
        recv: mpsc::Receiver<Bytes>,
        send: mpsc::Sender<Packet>,
        tunnel: Arc<Inner>,
    ) -> Self {
        TunnelStream {
            connect_id,
            recv,
            buf: Bytes::new(),
            send: PollSender::new(send),
            closed: false,
            _tunnel: tunnel,
        }
    }

    fn poll_send(&mut self, cx: &mut Context<'_>, pkt: Packet) -> Poll<io::Result<()>> {
        ready!(self.send.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        self.send.send_item(pkt).map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(()))
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed")
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        if !self.closed {
            trace!(connect_id = self.connect_id, "dropping tunnel stream");
            if let Some(sender) = self.send.get_ref() {
                let _ = sender.try_send(close_request(self.connect_id));
            }
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        read_buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buf.is_empty() {
            self.buf = loop {
                match ready!(self.recv.poll_recv(cx)) {
                    // CLOSE_RSP or the tunnel went away
                    None => return Poll::Ready(Ok(())),
                    Some(buf) if buf.is_empty() => continue,
                    Some(buf) => break buf,
                }
            };
        }
        let cnt = std::cmp::min(self.buf.len(), read_buf.remaining());
        read_buf.put_slice(&self.buf[..cnt]);
        self.buf.advance(cnt);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let cnt = std::cmp::min(buf.len(), MAX_DATA_FRAME);
        let pkt = data_packet(self.connect_id, Bytes::copy_from_slice(&buf[..cnt]));
        ready!(self.poll_send(cx, pkt))?;
        Poll::Ready(Ok(cnt))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        let pkt = close_request(self.connect_id);
        ready!(self.poll_send(cx, pkt))?;
        self.closed = true;
        Poll::Ready(Ok(()))
    }
}
