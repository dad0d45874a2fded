//! TCP connection relay.
//!
//! Client → remote: segments delivered by the stack are queued in
//! `recv_queue` and written to the outbound socket; the stack's receive
//! window is reopened only for bytes the socket accepted.
//!
//! Remote → client: reads are sized by the stack's send buffer headroom
//! and kept in `send_queue` until acknowledged. When the headroom runs out
//! read interest is dropped and only re-armed once acknowledgments bring it
//! back above `TCP_SNDLOWAT`. An orderly hangup seen while reads are
//! paused is held until the remote bytes still buffered in the socket have
//! been relayed.

use std::io;
use std::net::{Shutdown, SocketAddr};

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::common::error::{fatal, log_sock_error};
use crate::sock::{Ready, SocketOps};
use crate::stack::{SegmentChain, StackError, TcpPcb, TCP_SNDLOWAT, TCP_SND_QUEUELEN};

/// 协议栈发送队列中预留的空闲段数
const QUEUE_SLACK: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// 出站连接建立中或握手中
    Attaching,
    Relaying,
    /// Client sent FIN; outbound write side shut.
    HalfClosedLocal,
    /// Outbound EOF; stack transmit side shut.
    HalfClosedRemote,
    Closed,
}

pub struct TcpConnection {
    local: SocketAddr,
    socket: Option<Box<dyn SocketOps>>,
    /// 客户端数据，出站 socket 尚未接收
    recv_queue: SegmentChain,
    /// 已写入协议栈、尚未被确认的数据
    send_queue: SegmentChain,
    state: RelayState,
    /// Outbound write shutdown waiting for `recv_queue` to drain.
    fin_pending: bool,
    remote_eof: bool,
    /// 因协议栈发送缓冲区满而暂停读取
    read_paused: bool,
    /// 出站连接已挂断，等待剩余数据读完再关闭
    hup_pending: bool,
}

impl TcpConnection {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            socket: None,
            recv_queue: SegmentChain::new(),
            send_queue: SegmentChain::new(),
            state: RelayState::Attaching,
            fin_pending: false,
            remote_eof: false,
            read_paused: false,
            hup_pending: false,
        }
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.socket.is_some()
    }

    pub fn socket_mut(&mut self) -> Option<&mut (dyn SocketOps + 'static)> {
        self.socket.as_deref_mut()
    }

    pub fn recv_queued(&self) -> usize {
        self.recv_queue.tot_len()
    }

    pub fn send_queued(&self) -> usize {
        self.send_queue.tot_len()
    }

    pub fn on_connection_new<P: TcpPcb>(&mut self, pcb: &mut P) {
        pcb.set_nodelay(true);
    }

    /// 挂载出站 socket 并开始监听可读
    pub fn attach(&mut self, mut socket: Box<dyn SocketOps>) {
        socket.evctl(Ready::READABLE, true);
        debug!(local = %self.local, backend = socket.name(), "tcp relay attached");
        self.socket = Some(socket);
        self.state = RelayState::Attaching;
    }

    /// 出站 socket 打开失败
    pub fn on_attach_failed<P: TcpPcb>(&mut self, pcb: &mut P) {
        self.socket = None;
        self.state = RelayState::Closed;
        pcb.abort();
    }

    pub fn on_data_from_stack<P: TcpPcb>(&mut self, pcb: &mut P, chain: SegmentChain) {
        if self.socket.is_none() {
            trace!(local = %self.local, len = chain.tot_len(), "data for detached relay");
            pcb.abort();
            self.state = RelayState::Closed;
            return;
        }
        pcb.ack_now();
        self.recv_queue.cat(chain);
        self.flush(pcb);
    }

    /// Readiness already filtered through the socket's handshake and the
    /// armed interest.
    pub fn on_socket_event<P: TcpPcb>(&mut self, pcb: &mut P, ready: Ready) {
        if self.socket.is_none() || ready.is_empty() {
            return;
        }
        if ready.contains(Ready::ERROR) {
            self.teardown(pcb, true);
            return;
        }
        if self.state == RelayState::Attaching {
            self.state = RelayState::Relaying;
        }
        if ready.contains(Ready::READABLE) {
            self.on_socket_readable(pcb);
        }
        if ready.contains(Ready::WRITABLE) {
            self.flush(pcb);
        }
        if ready.contains(Ready::HUP) {
            self.hup_pending = true;
        }
        self.finish_hangup(pcb);
    }

    /// Close once a pending hangup has nothing left to deliver.
    fn finish_hangup<P: TcpPcb>(&mut self, pcb: &mut P) {
        if !self.hup_pending || (self.read_paused && !self.remote_eof) {
            return;
        }
        self.hup_pending = false;
        self.teardown(pcb, false);
    }

    fn on_socket_readable<P: TcpPcb>(&mut self, pcb: &mut P) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        loop {
            let sndbuf = pcb.sndbuf();
            if sndbuf == 0 || pcb.sndqueuelen() + QUEUE_SLACK >= TCP_SND_QUEUELEN {
                trace!(local = %self.local, sndbuf, "stack send buffer full, pausing reads");
                socket.evctl(Ready::READABLE, false);
                self.read_paused = true;
                return;
            }

            let mut buf = BytesMut::zeroed(pcb.mss().min(sndbuf));
            match socket.recv(&mut buf) {
                Ok(0) => {
                    debug!(local = %self.local, "outbound eof");
                    self.remote_eof = true;
                    pcb.shutdown_tx();
                    socket.evctl(Ready::READABLE, false);
                    self.state = match self.state {
                        RelayState::HalfClosedLocal => RelayState::Closed,
                        _ => RelayState::HalfClosedRemote,
                    };
                    return;
                }
                Ok(n) => {
                    buf.truncate(n);
                    let seg = buf.freeze();
                    match pcb.write(&seg) {
                        Ok(()) => {
                            self.send_queue.push(seg);
                            pcb.output();
                        }
                        Err(StackError::NotConnected) => {
                            debug!(local = %self.local, state = %pcb.state(), "stack side no longer writable");
                            socket.evctl(Ready::READABLE, false);
                            return;
                        }
                        // 按 sndbuf 取数，协议栈不会拒绝
                        Err(_) => fatal("tcp relay write"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    socket.evctl(Ready::READABLE, true);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log_sock_error("tcp relay recv", &e);
                    socket.evctl(Ready::READABLE, false);
                    return;
                }
            }
        }
    }

    pub fn on_stack_acked<P: TcpPcb>(&mut self, pcb: &mut P, len: usize) {
        self.send_queue.free_header(len.min(self.send_queue.tot_len()));
        if self.remote_eof {
            return;
        }
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        if !socket.interest().contains(Ready::READABLE)
            && pcb.state().can_send()
            && pcb.sndbuf() > TCP_SNDLOWAT
        {
            trace!(local = %self.local, sndbuf = pcb.sndbuf(), "resuming reads");
            socket.evctl(Ready::READABLE, true);
            self.read_paused = false;
            if self.hup_pending {
                // 挂断后不会再有读就绪事件，直接读
                self.on_socket_readable(pcb);
                self.finish_hangup(pcb);
            }
        }
    }

    /// 将排队的客户端数据写入出站 socket
    fn flush<P: TcpPcb>(&mut self, pcb: &mut P) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        loop {
            let Some(front) = self.recv_queue.front() else {
                socket.evctl(Ready::WRITABLE, false);
                break;
            };
            let len = front.len();
            match socket.send(front) {
                Ok(n) => {
                    self.recv_queue.free_header(n);
                    pcb.recved(n);
                    if n < len {
                        socket.evctl(Ready::WRITABLE, true);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    socket.evctl(Ready::WRITABLE, true);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log_sock_error("tcp relay send", &e);
                    socket.evctl(Ready::WRITABLE, false);
                    return;
                }
            }
        }
        if self.fin_pending {
            self.fin_pending = false;
            if let Err(e) = socket.shutdown(Shutdown::Write) {
                log_sock_error("tcp relay shutdown", &e);
            }
        }
    }

    /// 客户端发送了 FIN
    pub fn on_stack_closed(&mut self) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        self.state = match self.state {
            RelayState::HalfClosedRemote => RelayState::Closed,
            _ => RelayState::HalfClosedLocal,
        };
        if self.recv_queue.is_empty() {
            if let Err(e) = socket.shutdown(Shutdown::Write) {
                log_sock_error("tcp relay shutdown", &e);
            }
        } else {
            self.fin_pending = true;
        }
    }

    /// The control block vanished underneath the relay. No stack calls.
    pub fn on_stack_reset(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            debug!(local = %self.local, "tcp relay reset by stack");
            socket.destroy();
        }
        self.recv_queue.clear();
        self.send_queue.clear();
        self.state = RelayState::Closed;
    }

    /// Release the socket, then abort or close the control block. Only the
    /// first call has an effect.
    pub fn teardown<P: TcpPcb>(&mut self, pcb: &mut P, abort: bool) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        socket.destroy();
        debug!(local = %self.local, abort, state = ?self.state, "tcp relay teardown");
        self.hup_pending = false;
        self.read_paused = false;
        self.recv_queue.clear();
        self.state = RelayState::Closed;
        if abort {
            self.send_queue.clear();
            pcb.abort();
        } else {
            pcb.close();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.destroy();
        }
    }
}
