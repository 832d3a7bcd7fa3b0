//! Event-driven I/O workers.
//!
//! Each worker is one thread running a `mio` reactor over a slab of
//! connections. Everything else talks to a worker through its
//! [`IoWorkerHandle`]: tasks go over a bounded channel and the reactor is
//! woken through a [`Waker`]. Reactor threads never block on a full channel;
//! they spill into an overflow queue that is drained in order with it.
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use mio::{Events, Poll, Registry, Token, Waker};
use slab::Slab;

use faas_common::log;
use faas_common::stat::StatisticsCollector;
use ipc::Message;

use crate::buffer_pool::{self, BufferPool, WriteRequestPool};
use crate::config::IoWorkerConfig;
use crate::connection::{Connection, MessageConnection, State};
use crate::server::MessageHandler;
use crate::transport::Stream;
use crate::Error;

const WAKER_TOKEN: Token = Token(usize::MAX);

thread_local! {
    static IS_REACTOR: Cell<bool> = Cell::new(false);
}

/// Identifies a connection across workers. The serial number tells apart
/// connections that reused the same slab slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub worker: usize,
    pub key: usize,
    pub serial: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.worker, self.key, self.serial)
    }
}

pub enum Task {
    Register(Stream),
    Write(ConnectionId, Message),
    Run {
        owner: Option<ConnectionId>,
        f: Box<dyn FnOnce() + Send>,
    },
    Close(ConnectionId),
    Stop,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Register(stream) => f.debug_tuple("Register").field(stream).finish(),
            Task::Write(id, msg) => f.debug_tuple("Write").field(id).field(msg).finish(),
            Task::Run { owner, .. } => f.debug_struct("Run").field("owner", owner).finish(),
            Task::Close(id) => f.debug_tuple("Close").field(id).finish(),
            Task::Stop => f.write_str("Stop"),
        }
    }
}

struct Shared {
    id: usize,
    tx: Sender<Task>,
    waker: Waker,
    overflow: Mutex<VecDeque<Task>>,
    has_overflow: AtomicBool,
}

/// Thread-safe handle to an I/O worker.
#[derive(Clone)]
pub struct IoWorkerHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for IoWorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoWorkerHandle")
            .field("id", &self.shared.id)
            .finish()
    }
}

impl IoWorkerHandle {
    #[inline]
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Hands a freshly accepted stream over to the worker.
    pub fn register_stream(&self, stream: Stream) {
        self.submit(Task::Register(stream));
    }

    pub fn write_message(&self, conn: ConnectionId, message: Message) {
        self.submit(Task::Write(conn, message));
    }

    /// Runs `f` on the reactor thread after the current batch. Skipped if
    /// `owner` is given and that connection is no longer running.
    pub fn schedule_function<F>(&self, owner: Option<ConnectionId>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::Run {
            owner,
            f: Box::new(f),
        });
    }

    pub fn close_connection(&self, conn: ConnectionId) {
        self.submit(Task::Close(conn));
    }

    pub fn stop(&self) {
        self.submit(Task::Stop);
    }

    fn submit(&self, task: Task) {
        let shared = &*self.shared;
        let spilled = if shared.has_overflow.load(Ordering::Acquire) {
            Some(task)
        } else if IS_REACTOR.with(|r| r.get()) {
            match shared.tx.try_send(task) {
                Ok(()) => None,
                Err(TrySendError::Full(task)) => Some(task),
                Err(TrySendError::Disconnected(task)) => {
                    log::debug!("IoWorker {} is gone, drop {:?}", shared.id, task);
                    return;
                }
            }
        } else {
            match shared.tx.send(task) {
                Ok(()) => None,
                Err(e) => {
                    log::debug!("IoWorker {} is gone, drop {:?}", shared.id, e.into_inner());
                    return;
                }
            }
        };
        if let Some(task) = spilled {
            let mut overflow = shared.overflow.lock().unwrap();
            overflow.push_back(task);
            shared.has_overflow.store(true, Ordering::Release);
        }
        if let Err(e) = shared.waker.wake() {
            log::warn!("Failed to wake IoWorker {}: {}", shared.id, e);
        }
    }
}

/// A handle to one connection, usable from any thread.
#[derive(Debug, Clone)]
pub struct ConnectionRef {
    id: ConnectionId,
    worker: IoWorkerHandle,
}

impl ConnectionRef {
    pub fn new(id: ConnectionId, worker: IoWorkerHandle) -> Self {
        debug_assert_eq!(id.worker, worker.id());
        ConnectionRef { id, worker }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn worker(&self) -> &IoWorkerHandle {
        &self.worker
    }

    /// Messages written through the same thread are sent in call order.
    #[inline]
    pub fn write_message(&self, message: Message) {
        self.worker.write_message(self.id, message);
    }

    #[inline]
    pub fn close(&self) {
        self.worker.close_connection(self.id);
    }
}

impl PartialEq for ConnectionRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionRef {}

/// Reactor-local state the connections operate on.
pub struct IoContext {
    pub handler: Arc<dyn MessageHandler>,
    pub registry: Registry,
    pub read_buffers: BufferPool,
    pub write_buffers: BufferPool,
    pub write_requests: WriteRequestPool,
    pub bytes_per_read: StatisticsCollector,
    pub write_size: StatisticsCollector,
    worker: IoWorkerHandle,
    dirty: Vec<usize>,
    closing: Vec<usize>,
}

impl IoContext {
    #[inline]
    pub fn connection_ref(&self, id: ConnectionId) -> ConnectionRef {
        ConnectionRef::new(id, self.worker.clone())
    }

    /// The connection has pending messages to flush after this batch.
    #[inline]
    pub fn mark_dirty(&mut self, key: usize) {
        self.dirty.push(key);
    }

    /// The connection entered `Closing` and must be completed after this batch.
    #[inline]
    pub fn mark_closing(&mut self, key: usize) {
        self.closing.push(key);
    }
}

fn lookup(
    connections: &mut Slab<Box<dyn Connection>>,
    id: ConnectionId,
) -> Option<&mut Box<dyn Connection>> {
    connections.get_mut(id.key).filter(|conn| conn.id() == id)
}

pub struct IoWorker {
    id: usize,
    poll: Poll,
    events: Events,
    rx: Receiver<Task>,
    handle: IoWorkerHandle,
    connections: Slab<Box<dyn Connection>>,
    next_serial: u64,
    ctx: IoContext,
    stopping: bool,
}

impl IoWorker {
    fn new(id: usize, config: &IoWorkerConfig, handler: Arc<dyn MessageHandler>) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (tx, rx) = channel::bounded(config.task_queue_depth.max(1));
        let handle = IoWorkerHandle {
            shared: Arc::new(Shared {
                id,
                tx,
                waker,
                overflow: Mutex::new(VecDeque::new()),
                has_overflow: AtomicBool::new(false),
            }),
        };
        let interval = config.stat_report_interval();
        let ctx = IoContext {
            handler,
            registry: poll.registry().try_clone()?,
            read_buffers: buffer_pool::buffer_pool(
                "read_buffer",
                config.read_buffer_size,
                config.initial_buffers,
            ),
            write_buffers: buffer_pool::buffer_pool(
                "write_buffer",
                config.write_buffer_size,
                config.initial_buffers,
            ),
            write_requests: buffer_pool::write_request_pool(config.initial_buffers),
            bytes_per_read: StatisticsCollector::with_interval(
                format!("IoWorker[{}] bytes_per_read", id),
                interval,
            ),
            write_size: StatisticsCollector::with_interval(
                format!("IoWorker[{}] write_size", id),
                interval,
            ),
            worker: handle.clone(),
            dirty: Vec::new(),
            closing: Vec::new(),
        };
        Ok(IoWorker {
            id,
            poll,
            events: Events::with_capacity(config.events_capacity.max(1)),
            rx,
            handle,
            connections: Slab::new(),
            next_serial: 0,
            ctx,
            stopping: false,
        })
    }

    /// Spawns a worker thread and returns its handle once the reactor is up.
    pub fn spawn(
        id: usize,
        config: &IoWorkerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(IoWorkerHandle, JoinHandle<()>), Error> {
        let config = config.clone();
        let (ready_tx, ready_rx) = channel::bounded(1);
        let join_handle = thread::Builder::new()
            .name(format!("io-worker-{}", id))
            .spawn(move || match IoWorker::new(id, &config, handler) {
                Ok(worker) => {
                    let _ = ready_tx.send(Ok(worker.handle.clone()));
                    worker.mainloop();
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;
        match ready_rx.recv() {
            Ok(Ok(handle)) => Ok((handle, join_handle)),
            Ok(Err(e)) => {
                let _ = join_handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = join_handle.join();
                Err(Error::WorkerExited(id))
            }
        }
    }

    fn mainloop(mut self) {
        IS_REACTOR.with(|r| r.set(true));
        log::info!("IoWorker {} started", self.id);
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("IoWorker {} poll failed: {}", self.id, e);
                self.stopping = true;
            }
            self.handle_events();
            self.handle_tasks();
            self.flush_dirty();
            self.complete_closes();
            if self.stopping {
                self.shutdown();
                break;
            }
        }
        log::info!("IoWorker {} stopped", self.id);
    }

    fn handle_events(&mut self) {
        let IoWorker {
            events,
            connections,
            ctx,
            ..
        } = self;
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            if let Some(conn) = connections.get_mut(event.token().0) {
                conn.on_event(ctx, event);
            }
        }
    }

    fn drain_tasks(&mut self) -> Vec<Task> {
        let shared = &*self.handle.shared;
        // Hold the overflow lock while draining the channel so that spilled
        // tasks stay behind everything their producer sent before.
        let mut overflow = shared.overflow.lock().unwrap();
        let mut tasks: Vec<Task> = self.rx.try_iter().collect();
        tasks.extend(overflow.drain(..));
        shared.has_overflow.store(false, Ordering::Release);
        tasks
    }

    fn handle_tasks(&mut self) {
        for task in self.drain_tasks() {
            match task {
                Task::Register(stream) => self.register(stream),
                Task::Write(id, message) => match lookup(&mut self.connections, id) {
                    Some(conn) => conn.enqueue_message(&mut self.ctx, message),
                    None => log::debug!("Connection {} is gone, drop {:?}", id, message),
                },
                Task::Run { owner, f } => {
                    let alive = match owner {
                        Some(id) => self
                            .connections
                            .get(id.key)
                            .map_or(false, |c| c.id() == id && c.state() == State::Running),
                        None => true,
                    };
                    if alive {
                        f();
                    }
                }
                Task::Close(id) => {
                    if let Some(conn) = lookup(&mut self.connections, id) {
                        conn.schedule_close(&mut self.ctx);
                    }
                }
                Task::Stop => self.stopping = true,
            }
        }
    }

    fn register(&mut self, stream: Stream) {
        let entry = self.connections.vacant_entry();
        let id = ConnectionId {
            worker: self.id,
            key: entry.key(),
            serial: self.next_serial,
        };
        self.next_serial += 1;
        let conn = entry.insert(Box::new(MessageConnection::new(id, stream)));
        log::debug!(
            "IoWorker {} registered {:?} connection {}",
            self.id,
            conn.kind(),
            id
        );
        conn.start(&mut self.ctx);
    }

    fn flush_dirty(&mut self) {
        let mut dirty = std::mem::take(&mut self.ctx.dirty);
        dirty.sort_unstable();
        dirty.dedup();
        for key in dirty.drain(..) {
            if let Some(conn) = self.connections.get_mut(key) {
                conn.flush(&mut self.ctx);
            }
        }
        // keep the allocation
        if self.ctx.dirty.is_empty() {
            self.ctx.dirty = dirty;
        }
    }

    fn complete_closes(&mut self) {
        while let Some(key) = self.ctx.closing.pop() {
            let Some(conn) = self.connections.get_mut(key) else {
                continue;
            };
            if conn.state() != State::Closing {
                continue;
            }
            conn.on_close_complete(&mut self.ctx);
            let conn_ref = self.ctx.connection_ref(conn.id());
            self.ctx.handler.on_connection_close(&conn_ref);
            self.connections.remove(key);
        }
    }

    fn shutdown(&mut self) {
        for (_, conn) in self.connections.iter_mut() {
            conn.schedule_close(&mut self.ctx);
        }
        self.complete_closes();
        debug_assert!(self.connections.is_empty());
        self.ctx.bytes_per_read.report();
        self.ctx.write_size.report();
    }
}
