use std::collections::VecDeque;
use std::io::{self, Read, Write};

use mio::event::Event;
use mio::{Interest, Token};

use faas_common::log;
use ipc::{Message, MessageAccumulator, Role, MESSAGE_SIZE};

use crate::buffer_pool::{Lease, WriteRequest};
use crate::io_worker::{ConnectionId, IoContext};
use crate::transport::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Handshake,
    Running,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Message,
}

/// A transport endpoint owned by one I/O worker.
///
/// All methods run on the owning reactor thread.
pub trait Connection {
    fn id(&self) -> ConnectionId;
    fn kind(&self) -> ConnectionKind;
    fn state(&self) -> State;

    /// `Created -> Handshake`. Registers the transport with the reactor.
    fn start(&mut self, ctx: &mut IoContext);
    fn on_event(&mut self, ctx: &mut IoContext, event: &Event);

    /// Queues a message. It is written on the next flush.
    fn enqueue_message(&mut self, ctx: &mut IoContext, message: Message);
    fn flush(&mut self, ctx: &mut IoContext);

    /// Moves to `Closing` and releases the transport. The worker completes
    /// the close after the current batch.
    fn schedule_close(&mut self, ctx: &mut IoContext);
    /// `Closing -> Closed`.
    fn on_close_complete(&mut self, ctx: &mut IoContext);
}

pub struct MessageConnection {
    id: ConnectionId,
    stream: Stream,
    state: State,
    role: Option<Role>,
    func_id: u16,
    client_id: u16,
    log_header: String,
    handshake_buf: Vec<u8>,
    accumulator: MessageAccumulator,
    pending: Vec<Message>,
    write_queue: VecDeque<Lease<WriteRequest>>,
    want_writable: bool,
}

impl MessageConnection {
    pub fn new(id: ConnectionId, stream: Stream) -> Self {
        MessageConnection {
            id,
            stream,
            state: State::Created,
            role: None,
            func_id: 0,
            client_id: 0,
            log_header: format!("MessageConnection[{}]: ", id),
            handshake_buf: Vec::with_capacity(MESSAGE_SIZE),
            accumulator: MessageAccumulator::new(),
            pending: Vec::new(),
            write_queue: VecDeque::new(),
            want_writable: false,
        }
    }

    #[inline]
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    #[inline]
    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    #[inline]
    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    #[inline]
    fn token(&self) -> Token {
        Token(self.id.key)
    }

    fn handle_readable(&mut self, ctx: &mut IoContext) {
        let mut read_buf = ctx.read_buffers.get();
        loop {
            match self.stream.read(&mut read_buf[..]) {
                Ok(0) => {
                    log::info!("{}Connection closed by peer", self.log_header);
                    self.schedule_close(ctx);
                    return;
                }
                Ok(n) => {
                    ctx.bytes_per_read.add_sample(n as u64);
                    self.on_data(ctx, &read_buf[..n]);
                    if self.state != State::Handshake && self.state != State::Running {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("{}Read error: {}", self.log_header, e);
                    self.schedule_close(ctx);
                    return;
                }
            }
        }
    }

    fn on_data(&mut self, ctx: &mut IoContext, data: &[u8]) {
        match self.state {
            State::Handshake => {
                if self.handshake_buf.len() + data.len() > MESSAGE_SIZE {
                    log::error!("{}Unexpected data before handshake response", self.log_header);
                    self.schedule_close(ctx);
                    return;
                }
                self.handshake_buf.extend_from_slice(data);
                if self.handshake_buf.len() == MESSAGE_SIZE {
                    self.on_handshake(ctx);
                }
            }
            State::Running => {
                self.accumulator.push(data);
                while let Some(message) = self.accumulator.next_message() {
                    match message {
                        Ok(Message::FuncCall(message)) => {
                            let conn = ctx.connection_ref(self.id);
                            ctx.handler.on_recv_message(&conn, &message);
                        }
                        Ok(other) => {
                            log::error!("{}Unexpected message: {:?}", self.log_header, other);
                            self.schedule_close(ctx);
                            return;
                        }
                        Err(e) => {
                            log::error!("{}Failed to decode message: {}", self.log_header, e);
                            self.schedule_close(ctx);
                            return;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn on_handshake(&mut self, ctx: &mut IoContext) {
        let handshake = match Message::decode(&self.handshake_buf) {
            Ok(Message::Handshake(handshake)) => handshake,
            Ok(other) => {
                log::error!("{}Expect a handshake, got {:?}", self.log_header, other);
                self.schedule_close(ctx);
                return;
            }
            Err(e) => {
                log::error!("{}Malformed handshake: {}", self.log_header, e);
                self.schedule_close(ctx);
                return;
            }
        };
        self.handshake_buf.clear();

        let conn = ctx.connection_ref(self.id);
        let Some(reply) = ctx.handler.on_new_handshake(&conn, &handshake) else {
            log::warn!("{}Handshake rejected: {:?}", self.log_header, handshake);
            self.schedule_close(ctx);
            return;
        };

        self.role = Some(handshake.role);
        self.func_id = handshake.func_id;
        self.client_id = reply.response.client_id;
        self.log_header = match handshake.role {
            Role::Launcher => format!("LauncherConnection[{}]: ", self.func_id),
            Role::Watchdog => format!("WatchdogConnection[{}]: ", self.func_id),
            Role::FuncWorker => {
                format!("FuncWorkerConnection[{}-{}]: ", self.func_id, self.client_id)
            }
        };

        // The response goes ahead of anything queued during the handshake.
        debug_assert!(self.write_queue.is_empty());
        let response = Message::HandshakeResponse(reply.response).encode();
        self.append_bytes(ctx, &response);
        self.append_bytes(ctx, &reply.payload);
        self.state = State::Running;
        log::info!("{}Handshake done", self.log_header);
        self.flush(ctx);
    }

    /// Copies `data` to the tail of the write queue, chaining new write
    /// buffers as the current one fills up.
    fn append_bytes(&mut self, ctx: &mut IoContext, mut data: &[u8]) {
        while !data.is_empty() {
            let need_new = self
                .write_queue
                .back()
                .map_or(true, |req| req.spare_capacity() == 0);
            if need_new {
                let mut req = ctx.write_requests.get();
                req.attach(ctx.write_buffers.get());
                self.write_queue.push_back(req);
            }
            if let Some(req) = self.write_queue.back_mut() {
                let n = req.append(data);
                data = &data[n..];
            }
        }
    }

    fn drive_writes(&mut self, ctx: &mut IoContext) {
        while let Some(req) = self.write_queue.front_mut() {
            match self.stream.write(req.unwritten()) {
                Ok(0) => {
                    log::error!("{}Transport accepted no bytes", self.log_header);
                    self.schedule_close(ctx);
                    return;
                }
                Ok(n) => {
                    req.advance(n);
                    if req.is_done() {
                        self.write_queue.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.set_writable_interest(ctx, true);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("{}Write error: {}", self.log_header, e);
                    self.schedule_close(ctx);
                    return;
                }
            }
        }
        self.set_writable_interest(ctx, false);
    }

    fn set_writable_interest(&mut self, ctx: &mut IoContext, writable: bool) {
        if self.want_writable == writable {
            return;
        }
        let interest = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let token = self.token();
        match ctx.registry.reregister(&mut self.stream, token, interest) {
            Ok(()) => self.want_writable = writable,
            Err(e) => {
                log::error!("{}Failed to reregister: {}", self.log_header, e);
                self.schedule_close(ctx);
            }
        }
    }
}

impl Connection for MessageConnection {
    #[inline]
    fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Message
    }

    #[inline]
    fn state(&self) -> State {
        self.state
    }

    fn start(&mut self, ctx: &mut IoContext) {
        assert_eq!(self.state, State::Created);
        self.state = State::Handshake;
        let token = self.token();
        if let Err(e) = ctx
            .registry
            .register(&mut self.stream, token, Interest::READABLE)
        {
            log::error!("{}Failed to register: {}", self.log_header, e);
            self.schedule_close(ctx);
        }
    }

    fn on_event(&mut self, ctx: &mut IoContext, event: &Event) {
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.handle_readable(ctx);
        }
        if self.state == State::Running && event.is_writable() {
            self.drive_writes(ctx);
        }
    }

    fn enqueue_message(&mut self, ctx: &mut IoContext, message: Message) {
        match self.state {
            State::Closing | State::Closed => {
                log::warn!("{}Closing, drop {:?}", self.log_header, message);
            }
            _ => {
                self.pending.push(message);
                ctx.mark_dirty(self.id.key);
            }
        }
    }

    fn flush(&mut self, ctx: &mut IoContext) {
        match self.state {
            // held until the handshake response is staged
            State::Created | State::Handshake => return,
            State::Running => {}
            State::Closing | State::Closed => {
                if !self.pending.is_empty() {
                    log::warn!(
                        "{}Drop {} pending messages",
                        self.log_header,
                        self.pending.len()
                    );
                    self.pending.clear();
                }
                return;
            }
        }
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            for message in &pending {
                self.append_bytes(ctx, &message.encode());
            }
            ctx.write_size
                .add_sample((pending.len() * MESSAGE_SIZE) as u64);
            // keep the allocation
            self.pending = pending;
            self.pending.clear();
        }
        if !self.want_writable {
            self.drive_writes(ctx);
        }
    }

    fn schedule_close(&mut self, ctx: &mut IoContext) {
        match self.state {
            State::Closing | State::Closed => return,
            State::Created => {}
            State::Handshake | State::Running => {
                if let Err(e) = ctx.registry.deregister(&mut self.stream) {
                    log::debug!("{}Failed to deregister: {}", self.log_header, e);
                }
            }
        }
        self.state = State::Closing;
        if let Err(e) = self.stream.shutdown() {
            if e.kind() != io::ErrorKind::NotConnected {
                log::debug!("{}Failed to shutdown: {}", self.log_header, e);
            }
        }
        self.write_queue.clear();
        self.pending.clear();
        ctx.mark_closing(self.id.key);
    }

    fn on_close_complete(&mut self, _ctx: &mut IoContext) {
        assert_eq!(self.state, State::Closing);
        self.state = State::Closed;
        log::info!("{}Connection closed", self.log_header);
    }
}

impl Drop for MessageConnection {
    fn drop(&mut self) {
        debug_assert!(
            matches!(self.state, State::Created | State::Closed),
            "{}dropped in state {:?}",
            self.log_header,
            self.state
        );
    }
}
