//! The gateway: accepts connections, validates handshakes and routes
//! function calls between function workers and the launchers/watchdogs
//! that execute them.
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use fnv::FnvHashMap as HashMap;
use mio::{Events, Interest, Poll, Token};

use faas_common::log;
use faas_common::stat::{Counter, StatisticsCollector};
use faas_common::time::monotonic_micros;
use faas_common::FuncConfig;
use ipc::{
    Direction, FuncCallMessage, HandshakeMessage, HandshakeResponse, HandshakeStatus, Message,
    Role,
};

use crate::config::{Config, IoWorkerConfig};
use crate::io_worker::{ConnectionId, ConnectionRef, IoWorker, IoWorkerHandle};
use crate::transport::Listener;
use crate::Error;

/// What a connection sends back after a successful handshake.
#[derive(Debug, Clone)]
pub struct HandshakeReply {
    pub response: HandshakeResponse,
    /// Opaque bytes following the response, `response.payload_len` long.
    pub payload: Vec<u8>,
}

/// Callbacks a message connection invokes on its owning reactor thread.
pub trait MessageHandler: Send + Sync {
    /// Returns `None` to reject the handshake and close the connection.
    fn on_new_handshake(
        &self,
        conn: &ConnectionRef,
        handshake: &HandshakeMessage,
    ) -> Option<HandshakeReply>;

    fn on_recv_message(&self, conn: &ConnectionRef, message: &FuncCallMessage);

    fn on_connection_close(&self, conn: &ConnectionRef);
}

#[derive(Debug, Default)]
struct Routes {
    /// Launcher or watchdog executing each function.
    executors: HashMap<u16, (Role, ConnectionRef)>,
    func_workers: HashMap<u16, ConnectionRef>,
    by_conn: HashMap<ConnectionId, (Role, u16)>,
    next_client_id: u16,
}

impl Routes {
    /// Honors `requested` when no live func worker holds it, otherwise picks
    /// the next free id. Returns `None` when every id is taken.
    fn assign_client_id(&mut self, requested: u16) -> Option<u16> {
        if requested != 0 && !self.func_workers.contains_key(&requested) {
            return Some(requested);
        }
        for _ in 0..=u16::MAX {
            let id = self.next_client_id;
            self.next_client_id = self.next_client_id.wrapping_add(1);
            if id != 0 && !self.func_workers.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }
}

struct Stats {
    message_delay: StatisticsCollector,
    discarded_func_calls: Counter,
}

pub struct Gateway {
    func_config: FuncConfig,
    routes: Mutex<Routes>,
    stats: Mutex<Stats>,
}

impl Gateway {
    pub fn new(func_config: FuncConfig) -> Self {
        Gateway {
            func_config,
            routes: Mutex::new(Routes::default()),
            stats: Mutex::new(Stats {
                message_delay: StatisticsCollector::new("message_delay"),
                discarded_func_calls: Counter::new("discarded_func_calls"),
            }),
        }
    }

    #[inline]
    pub fn func_config(&self) -> &FuncConfig {
        &self.func_config
    }

    fn reject_call(&self, conn: &ConnectionRef, message: &FuncCallMessage) {
        self.stats.lock().unwrap().discarded_func_calls.tick();
        let mut response = FuncCallMessage::new_response(message.func_call, false);
        response.send_timestamp = monotonic_micros();
        conn.write_message(Message::FuncCall(response));
    }
}

impl MessageHandler for Gateway {
    fn on_new_handshake(
        &self,
        conn: &ConnectionRef,
        handshake: &HandshakeMessage,
    ) -> Option<HandshakeReply> {
        let func_id = handshake.func_id;
        if self.func_config.find_by_func_id(func_id).is_none() {
            log::error!("Invalid func_id {} in handshake message", func_id);
            return None;
        }
        let mut routes = self.routes.lock().unwrap();
        // executors are keyed by func_id, func workers by client_id
        let (client_id, route_key, payload) = match handshake.role {
            Role::Launcher | Role::Watchdog => {
                if let Some((role, _)) = routes.executors.get(&func_id) {
                    log::error!("{:?} already connected for func_id {}", role, func_id);
                    return None;
                }
                routes
                    .executors
                    .insert(func_id, (handshake.role, conn.clone()));
                let payload = if handshake.role == Role::Launcher {
                    self.func_config.json().as_bytes().to_vec()
                } else {
                    Vec::new()
                };
                (0, func_id, payload)
            }
            Role::FuncWorker => {
                let Some(client_id) = routes.assign_client_id(handshake.client_id) else {
                    log::error!("No client_id left for func_id {}", func_id);
                    return None;
                };
                routes.func_workers.insert(client_id, conn.clone());
                (client_id, client_id, Vec::new())
            }
        };
        routes
            .by_conn
            .insert(conn.id(), (handshake.role, route_key));
        log::info!(
            "New {:?} connection for func_id {}, client_id {}",
            handshake.role,
            func_id,
            client_id
        );
        Some(HandshakeReply {
            response: HandshakeResponse {
                status: HandshakeStatus::Ok,
                client_id,
                payload_len: payload.len() as u32,
            },
            payload,
        })
    }

    fn on_recv_message(&self, conn: &ConnectionRef, message: &FuncCallMessage) {
        if message.send_timestamp > 0 {
            let delay = monotonic_micros() - message.send_timestamp;
            if delay >= 0 {
                self.stats
                    .lock()
                    .unwrap()
                    .message_delay
                    .add_sample(delay as u64);
            }
        }
        let func_call = message.func_call;
        match message.direction {
            Direction::Request => {
                let target = self
                    .routes
                    .lock()
                    .unwrap()
                    .executors
                    .get(&func_call.func_id)
                    .map(|(_, c)| c.clone());
                match target {
                    Some(target) => target.write_message(Message::FuncCall(*message)),
                    None => {
                        log::warn!("No executor for func_call {}, reject it", func_call);
                        self.reject_call(conn, message);
                    }
                }
            }
            Direction::Response => {
                let target = self
                    .routes
                    .lock()
                    .unwrap()
                    .func_workers
                    .get(&func_call.client_id)
                    .cloned();
                match target {
                    Some(target) => target.write_message(Message::FuncCall(*message)),
                    None => {
                        self.stats.lock().unwrap().discarded_func_calls.tick();
                        log::warn!(
                            "Cannot find func worker for client_id {}, drop response of {}",
                            func_call.client_id,
                            func_call
                        );
                    }
                }
            }
        }
    }

    fn on_connection_close(&self, conn: &ConnectionRef) {
        let mut routes = self.routes.lock().unwrap();
        let Some((role, id)) = routes.by_conn.remove(&conn.id()) else {
            return;
        };
        match role {
            Role::Launcher | Role::Watchdog => {
                routes.executors.remove(&id);
                log::info!("{:?} for func_id {} disconnected", role, id);
            }
            Role::FuncWorker => {
                routes.func_workers.remove(&id);
                log::info!("FuncWorker with client_id {} disconnected", id);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(u16),
}

const LISTENER: Token = Token(0);

pub struct Server {
    listener: Listener,
    poll: Poll,
    workers: Vec<(IoWorkerHandle, JoinHandle<()>)>,
    next_worker: usize,
    gateway: Arc<Gateway>,
}

impl Server {
    pub fn new(config: &Config, func_config: FuncConfig) -> Result<Self, Error> {
        let addr = match (&config.gateway.listen_path, config.gateway.tcp_port) {
            (Some(path), _) => ListenAddr::Unix(path.clone()),
            (None, Some(port)) => ListenAddr::Tcp(port),
            (None, None) => return Err(Error::NoListenAddress),
        };
        Self::bind(
            &addr,
            config.gateway.num_io_workers,
            &config.io_worker,
            Arc::new(Gateway::new(func_config)),
        )
    }

    pub fn bind(
        addr: &ListenAddr,
        num_io_workers: usize,
        io_config: &IoWorkerConfig,
        gateway: Arc<Gateway>,
    ) -> Result<Self, Error> {
        let mut listener = match addr {
            ListenAddr::Unix(path) => Listener::bind_unix(path)?,
            ListenAddr::Tcp(port) => Listener::bind_tcp(*port)?,
        };
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let mut workers = Vec::with_capacity(num_io_workers);
        for id in 0..num_io_workers.max(1) {
            match IoWorker::spawn(id, io_config, gateway.clone()) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    stop_workers(&mut workers);
                    return Err(e);
                }
            }
        }
        log::info!("Listening on {:?} with {} IoWorkers", addr, workers.len());
        Ok(Server {
            listener,
            poll,
            workers,
            next_worker: 0,
            gateway,
        })
    }

    #[inline]
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn mainloop(&mut self, terminate: &AtomicBool) -> anyhow::Result<()> {
        let mut events = Events::with_capacity(64);
        let timeout = Duration::from_millis(100);
        while !terminate.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                stop_workers(&mut self.workers);
                return Err(e.into());
            }
            for event in events.iter() {
                if event.token() == LISTENER {
                    self.accept_all();
                }
            }
        }
        log::info!("Gateway is shutting down");
        stop_workers(&mut self.workers);
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(stream) => {
                    let (worker, _) = &self.workers[self.next_worker];
                    self.next_worker = (self.next_worker + 1) % self.workers.len();
                    log::debug!("New connection assigned to IoWorker {}", worker.id());
                    worker.register_stream(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Failed to accept: {}", e);
                    return;
                }
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        stop_workers(&mut self.workers);
    }
}

fn stop_workers(workers: &mut Vec<(IoWorkerHandle, JoinHandle<()>)>) {
    for (handle, _) in workers.iter() {
        handle.stop();
    }
    for (handle, join_handle) in workers.drain(..) {
        if join_handle.join().is_err() {
            log::error!("IoWorker {} panicked", handle.id());
        }
    }
}
