//! Call correlation for a function worker.
//!
//! The [`Manager`] sits between a worker's two control channels (to the
//! gateway and to its watchdog) and the function code. It frames inbound
//! bytes into messages, keeps one table of calls this worker issued and one
//! of calls it is serving, and moves payloads larger than
//! [`INLINE_DATA_SIZE`] through named shared-memory regions.
//!
//! The manager does no I/O itself. Outbound bytes leave through the send
//! callbacks and transport failures are reported back through
//! [`Manager::on_gateway_io_error`] / [`Manager::on_watchdog_io_error`].
use std::env;
use std::path::PathBuf;

use fnv::FnvHashMap as HashMap;

use faas_common::log;
use faas_common::stat::StatisticsCollector;
use faas_common::time::monotonic_micros;
use faas_common::FuncConfig;
use ipc::{
    region_name, Direction, FuncCall, FuncCallMessage, HandshakeMessage, HandshakeResponse,
    HandshakeStatus, Message, MessageAccumulator, Payload, RegionKind, RegionName, Role,
    ShmProvider, ShmRegion, INLINE_DATA_SIZE,
};

use crate::Error;

pub type Handle = u32;

pub type SendDataCallback = Box<dyn FnMut(&[u8])>;
pub type IncomingFuncCallCallback = Box<dyn FnMut(Handle, &[u8])>;
pub type OutcomingFuncCallCompleteCallback = Box<dyn FnMut(Handle, bool, &[u8])>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Gateway,
    Watchdog,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub func_id: u16,
    /// Requested client id, 0 for none. The id in the gateway's handshake
    /// response replaces it.
    pub client_id: u16,
    pub func_config: FuncConfig,
    pub root_path_for_ipc: PathBuf,
}

fn env_var(key: &'static str) -> Result<String, Error> {
    env::var(key).map_err(|e| Error::Env(key, e.to_string()))
}

fn env_u16(key: &'static str) -> Result<u16, Error> {
    env_var(key)?
        .parse()
        .map_err(|e: std::num::ParseIntError| Error::Env(key, e.to_string()))
}

impl ManagerConfig {
    pub const FUNC_ID_ENV: &'static str = "FAAS_FUNC_ID";
    pub const CLIENT_ID_ENV: &'static str = "FAAS_CLIENT_ID";
    pub const FUNC_CONFIG_FILE_ENV: &'static str = "FAAS_FUNC_CONFIG_FILE";
    pub const ROOT_PATH_FOR_IPC_ENV: &'static str = "FAAS_ROOT_PATH_FOR_IPC";

    /// Reads the settings a launcher passes to the worker processes it
    /// spawns. `FAAS_CLIENT_ID` and `FAAS_ROOT_PATH_FOR_IPC` are optional.
    pub fn from_env() -> Result<Self, Error> {
        let func_id = env_u16(Self::FUNC_ID_ENV)?;
        let client_id = match env::var(Self::CLIENT_ID_ENV) {
            Ok(_) => env_u16(Self::CLIENT_ID_ENV)?,
            Err(_) => 0,
        };
        let func_config = FuncConfig::from_path(env_var(Self::FUNC_CONFIG_FILE_ENV)?)?;
        let root_path_for_ipc = env::var(Self::ROOT_PATH_FOR_IPC_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(ipc::shm::DEFAULT_ROOT_PATH));
        Ok(ManagerConfig {
            func_id,
            client_id,
            func_config,
            root_path_for_ipc,
        })
    }
}

/// A call this worker issued. Owns the input region until the call resolves.
#[derive(Debug)]
struct OutcomingFuncCall {
    func_call: FuncCall,
    input_region: Option<ShmRegion>,
    start_timestamp: i64,
}

/// A call this worker is serving.
#[derive(Debug)]
struct IncomingFuncCall {
    func_call: FuncCall,
    channel: Channel,
    start_timestamp: i64,
}

pub struct Manager {
    func_id: u16,
    client_id: u16,
    func_config: FuncConfig,
    shm: ShmProvider,
    started: bool,
    closed: bool,

    send_gateway_data: Option<SendDataCallback>,
    send_watchdog_data: Option<SendDataCallback>,
    incoming_func_call: Option<IncomingFuncCallCallback>,
    outcoming_func_call_complete: Option<OutcomingFuncCallCompleteCallback>,

    gateway_recv: MessageAccumulator,
    watchdog_recv: MessageAccumulator,
    /// Handshake payload bytes still to be skipped on the gateway channel.
    gateway_skip: usize,

    next_handle: Handle,
    outcoming: HashMap<Handle, OutcomingFuncCall>,
    next_incoming_handle: Handle,
    incoming: HashMap<Handle, IncomingFuncCall>,
    incoming_by_call: HashMap<FuncCall, Handle>,

    processing_delay: StatisticsCollector,
    call_latency: StatisticsCollector,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Result<Self, Error> {
        let shm = ShmProvider::new(&config.root_path_for_ipc)?;
        Ok(Manager {
            func_id: config.func_id,
            client_id: config.client_id,
            func_config: config.func_config,
            shm,
            started: false,
            closed: false,
            send_gateway_data: None,
            send_watchdog_data: None,
            incoming_func_call: None,
            outcoming_func_call_complete: None,
            gateway_recv: MessageAccumulator::new(),
            watchdog_recv: MessageAccumulator::new(),
            gateway_skip: 0,
            next_handle: 1,
            outcoming: HashMap::default(),
            next_incoming_handle: 1,
            incoming: HashMap::default(),
            incoming_by_call: HashMap::default(),
            processing_delay: StatisticsCollector::new("processing_delay"),
            call_latency: StatisticsCollector::new("incoming_call_latency"),
        })
    }

    pub fn set_send_gateway_data_callback<F>(&mut self, f: F)
    where
        F: FnMut(&[u8]) + 'static,
    {
        self.send_gateway_data = Some(Box::new(f));
    }

    pub fn set_send_watchdog_data_callback<F>(&mut self, f: F)
    where
        F: FnMut(&[u8]) + 'static,
    {
        self.send_watchdog_data = Some(Box::new(f));
    }

    pub fn set_incoming_func_call_callback<F>(&mut self, f: F)
    where
        F: FnMut(Handle, &[u8]) + 'static,
    {
        self.incoming_func_call = Some(Box::new(f));
    }

    pub fn set_outcoming_func_call_complete_callback<F>(&mut self, f: F)
    where
        F: FnMut(Handle, bool, &[u8]) + 'static,
    {
        self.outcoming_func_call_complete = Some(Box::new(f));
    }

    /// All four callbacks have to be set before calling `start`.
    pub fn start(&mut self) {
        assert!(
            self.send_gateway_data.is_some(),
            "send gateway data callback is not set"
        );
        assert!(
            self.send_watchdog_data.is_some(),
            "send watchdog data callback is not set"
        );
        assert!(
            self.incoming_func_call.is_some(),
            "incoming func call callback is not set"
        );
        assert!(
            self.outcoming_func_call_complete.is_some(),
            "outcoming func call complete callback is not set"
        );
        self.started = true;
    }

    #[inline]
    fn assert_started(&self) {
        assert!(self.started, "Manager is not started");
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
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn shm(&self) -> &ShmProvider {
        &self.shm
    }

    /// Number of issued calls still waiting for a response.
    #[inline]
    pub fn pending_outcoming_calls(&self) -> usize {
        self.outcoming.len()
    }

    /// The message a function worker opens its gateway connection with.
    pub fn handshake_message(&self) -> Message {
        Message::Handshake(HandshakeMessage {
            role: Role::FuncWorker,
            func_id: self.func_id,
            client_id: self.client_id,
            payload_len: 0,
        })
    }

    pub fn on_recv_gateway_data(&mut self, data: &[u8]) {
        self.on_recv_data(Channel::Gateway, data);
    }

    pub fn on_recv_watchdog_data(&mut self, data: &[u8]) {
        self.on_recv_data(Channel::Watchdog, data);
    }

    pub fn on_gateway_io_error(&mut self, error: &str) {
        self.on_io_error(Channel::Gateway, error);
    }

    pub fn on_watchdog_io_error(&mut self, error: &str) {
        self.on_io_error(Channel::Watchdog, error);
    }

    /// Issues a call to `func_name`. The returned handle is completed
    /// exactly once through the outcoming completion callback.
    pub fn on_outcoming_func_call(&mut self, func_name: &str, input: &[u8]) -> Result<Handle, Error> {
        self.assert_started();
        if self.closed {
            return Err(Error::Closed);
        }
        let func_id = self
            .func_config
            .find_by_func_name(func_name)
            .map(|entry| entry.func_id)
            .ok_or_else(|| Error::UnknownFunction(func_name.to_owned()))?;

        let handle = self.next_handle();
        let func_call = FuncCall::new(func_id, self.client_id, handle);
        let mut message = FuncCallMessage::new_request(func_call);
        let input_region = if input.len() <= INLINE_DATA_SIZE {
            message.set_inline_data(input);
            None
        } else {
            let name = region_name(func_call, RegionKind::Input);
            let mut region = self.shm.create_named(&name, input.len())?;
            region.enable_remove_on_drop();
            region.as_mut_slice().copy_from_slice(input);
            message.set_region(name, input.len() as u32);
            Some(region)
        };
        let now = monotonic_micros();
        message.send_timestamp = now;
        self.outcoming.insert(
            handle,
            OutcomingFuncCall {
                func_call,
                input_region,
                start_timestamp: now,
            },
        );
        log::debug!("New outcoming call {} with handle {}", func_call, handle);
        self.send(Channel::Watchdog, Message::FuncCall(message));
        Ok(handle)
    }

    /// Finishes an incoming call. Panics if `handle` is not being served.
    pub fn on_incoming_func_call_complete(&mut self, handle: Handle, success: bool, output: &[u8]) {
        self.assert_started();
        let Some(call) = self.incoming.remove(&handle) else {
            panic!("Cannot find incoming call with handle {}", handle);
        };
        self.incoming_by_call.remove(&call.func_call);

        let now = monotonic_micros();
        let latency = (now - call.start_timestamp).max(0);
        self.call_latency.add_sample(latency as u64);
        if self.closed {
            log::warn!("Manager is closed, drop response of {}", call.func_call);
            return;
        }

        let mut response = FuncCallMessage::new_response(call.func_call, success);
        if success {
            if output.len() <= INLINE_DATA_SIZE {
                response.set_inline_data(output);
            } else {
                let name = region_name(call.func_call, RegionKind::Output);
                // the caller removes it after reading
                match self.shm.create_named(&name, output.len()) {
                    Ok(mut region) => {
                        region.as_mut_slice().copy_from_slice(output);
                        response.set_region(name, output.len() as u32);
                    }
                    Err(e) => {
                        log::error!("Failed to create output region {}: {}", name, e);
                        response = FuncCallMessage::new_response(call.func_call, false);
                    }
                }
            }
        }
        response.processing_time = u32::try_from(latency).unwrap_or(u32::MAX);
        response.send_timestamp = now;
        self.send(call.channel, Message::FuncCall(response));
    }

    fn next_handle(&mut self) -> Handle {
        loop {
            let handle = self.next_handle;
            self.next_handle = self.next_handle.wrapping_add(1);
            if handle != 0 && !self.outcoming.contains_key(&handle) {
                return handle;
            }
        }
    }

    fn next_incoming_handle(&mut self) -> Handle {
        loop {
            let handle = self.next_incoming_handle;
            self.next_incoming_handle = self.next_incoming_handle.wrapping_add(1);
            if handle != 0 && !self.incoming.contains_key(&handle) {
                return handle;
            }
        }
    }

    fn send(&mut self, channel: Channel, message: Message) {
        let buf = message.encode();
        let callback = match channel {
            Channel::Gateway => self.send_gateway_data.as_mut(),
            Channel::Watchdog => self.send_watchdog_data.as_mut(),
        };
        if let Some(callback) = callback {
            callback(&buf);
        }
    }

    fn on_recv_data(&mut self, channel: Channel, data: &[u8]) {
        self.assert_started();
        match channel {
            Channel::Gateway => self.gateway_recv.push(data),
            Channel::Watchdog => self.watchdog_recv.push(data),
        }
        loop {
            if channel == Channel::Gateway && self.gateway_skip > 0 {
                let skipped = self.gateway_recv.take_raw(self.gateway_skip).len();
                self.gateway_skip -= skipped;
                if self.gateway_skip > 0 {
                    break;
                }
            }
            let next = match channel {
                Channel::Gateway => self.gateway_recv.next_message(),
                Channel::Watchdog => self.watchdog_recv.next_message(),
            };
            match next {
                None => break,
                Some(Ok(Message::FuncCall(message))) => self.on_recv_message(channel, message),
                Some(Ok(Message::HandshakeResponse(response))) if channel == Channel::Gateway => {
                    self.on_handshake_response(response)
                }
                Some(Ok(other)) => {
                    log::warn!("Unexpected message on {:?} channel: {:?}", channel, other);
                }
                Some(Err(e)) => {
                    log::error!("Malformed message on {:?} channel: {}", channel, e);
                }
            }
        }
    }

    fn on_handshake_response(&mut self, response: HandshakeResponse) {
        self.gateway_skip = response.payload_len as usize;
        match response.status {
            HandshakeStatus::Ok => {
                // responses are routed back by the id the gateway assigned
                if self.client_id != response.client_id {
                    if self.client_id != 0 {
                        log::warn!(
                            "Gateway assigned client_id {} instead of {}",
                            response.client_id,
                            self.client_id
                        );
                    }
                    self.client_id = response.client_id;
                }
                log::info!(
                    "Handshake with gateway done, func_id={}, client_id={}",
                    self.func_id,
                    self.client_id
                );
            }
            HandshakeStatus::Rejected => {
                self.on_io_error(Channel::Gateway, "handshake rejected");
            }
        }
    }

    fn on_recv_message(&mut self, channel: Channel, message: FuncCallMessage) {
        if message.send_timestamp > 0 {
            let delay = monotonic_micros() - message.send_timestamp;
            if delay >= 0 {
                self.processing_delay.add_sample(delay as u64);
            }
        }
        match message.direction {
            Direction::Response => self.on_outcoming_func_call_response(message),
            Direction::Request => self.on_incoming_func_call(channel, message),
        }
    }

    fn on_outcoming_func_call_response(&mut self, message: FuncCallMessage) {
        let handle = message.func_call.call_id;
        match self.outcoming.get(&handle) {
            Some(call) if call.func_call == message.func_call => {}
            _ => {
                log::warn!(
                    "Cannot find outcoming call {}, drop the stale response",
                    message.func_call
                );
                if let Payload::Region(name) = message.payload {
                    self.discard_region(&name);
                }
                return;
            }
        }
        let Some(call) = self.outcoming.remove(&handle) else {
            return;
        };
        if !message.success {
            self.complete_outcoming(handle, call, false, &[]);
            return;
        }
        match message.payload {
            Payload::Inline(_) => {
                let output = message.inline_data().unwrap_or_default();
                self.complete_outcoming(handle, call, true, output);
            }
            Payload::Region(name) => match self.shm.open_named(&name) {
                Ok(mut region) => {
                    region.enable_remove_on_drop();
                    let len = message.payload_len as usize;
                    if len > region.len() {
                        log::error!(
                            "Output region {} holds {} bytes, expect {}",
                            name,
                            region.len(),
                            len
                        );
                        self.complete_outcoming(handle, call, false, &[]);
                    } else {
                        self.complete_outcoming(handle, call, true, &region.as_slice()[..len]);
                    }
                }
                Err(e) => {
                    log::error!("Failed to open output region {}: {}", name, e);
                    self.complete_outcoming(handle, call, false, &[]);
                }
            },
        }
    }

    /// Consumes the pending call: invokes the completion callback, then
    /// releases the input region.
    fn complete_outcoming(
        &mut self,
        handle: Handle,
        call: OutcomingFuncCall,
        success: bool,
        output: &[u8],
    ) {
        log::debug!(
            "Outcoming call {} finished after {}us, success={}",
            call.func_call,
            monotonic_micros() - call.start_timestamp,
            success
        );
        if let Some(callback) = self.outcoming_func_call_complete.as_mut() {
            callback(handle, success, output);
        }
        drop(call);
    }

    /// Unlinks a region named by a response nobody is waiting for.
    fn discard_region(&self, name: &RegionName) {
        match self.shm.open_named(name) {
            Ok(mut region) => region.enable_remove_on_drop(),
            Err(e) => log::debug!("Cannot discard region {}: {}", name, e),
        }
    }

    fn reject_incoming(&mut self, channel: Channel, func_call: FuncCall) {
        let mut response = FuncCallMessage::new_response(func_call, false);
        response.send_timestamp = monotonic_micros();
        self.send(channel, Message::FuncCall(response));
    }

    fn on_incoming_func_call(&mut self, channel: Channel, message: FuncCallMessage) {
        let func_call = message.func_call;
        if self.incoming_by_call.contains_key(&func_call) {
            log::warn!("Duplicate incoming call {}, drop it", func_call);
            return;
        }
        // the region is released as soon as the callback returns
        let region = match message.payload {
            Payload::Inline(_) => None,
            Payload::Region(name) => match self.shm.open_named(&name) {
                Ok(mut region) => {
                    region.enable_remove_on_drop();
                    Some(region)
                }
                Err(e) => {
                    log::error!("Failed to open input region {}: {}", name, e);
                    self.reject_incoming(channel, func_call);
                    return;
                }
            },
        };
        let input = match &region {
            Some(region) => {
                let len = message.payload_len as usize;
                if len > region.len() {
                    log::error!(
                        "Input region {} holds {} bytes, expect {}",
                        region.name(),
                        region.len(),
                        len
                    );
                    self.reject_incoming(channel, func_call);
                    return;
                }
                &region.as_slice()[..len]
            }
            None => message.inline_data().unwrap_or_default(),
        };

        let handle = self.next_incoming_handle();
        self.incoming.insert(
            handle,
            IncomingFuncCall {
                func_call,
                channel,
                start_timestamp: monotonic_micros(),
            },
        );
        self.incoming_by_call.insert(func_call, handle);
        log::debug!("New incoming call {} with handle {}", func_call, handle);
        if let Some(callback) = self.incoming_func_call.as_mut() {
            callback(handle, input);
        }
    }

    fn on_io_error(&mut self, channel: Channel, error: &str) {
        if self.closed {
            return;
        }
        log::error!("{:?} channel IO error: {}", channel, error);
        self.closed = true;
        let mut pending: Vec<_> = self.outcoming.drain().collect();
        pending.sort_unstable_by_key(|(handle, _)| *handle);
        for (handle, call) in pending {
            self.complete_outcoming(handle, call, false, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use ipc::MESSAGE_SIZE;

    const FUNC_CONFIG: &str =
        r#"[{"funcName": "Foo", "funcId": 7}, {"funcName": "Bar", "funcId": 8}]"#;

    #[derive(Default)]
    struct Record {
        gateway_out: Vec<u8>,
        watchdog_out: Vec<u8>,
        incoming: Vec<(Handle, Vec<u8>)>,
        completions: Vec<(Handle, bool, Vec<u8>)>,
    }

    impl Record {
        fn take_messages(buf: &mut Vec<u8>) -> Vec<FuncCallMessage> {
            assert_eq!(buf.len() % MESSAGE_SIZE, 0);
            let messages = buf
                .chunks_exact(MESSAGE_SIZE)
                .map(|chunk| match Message::decode(chunk).unwrap() {
                    Message::FuncCall(m) => m,
                    other => panic!("expect a function call, got {:?}", other),
                })
                .collect();
            buf.clear();
            messages
        }
    }

    fn new_manager(dir: &tempfile::TempDir, client_id: u16) -> Manager {
        Manager::new(ManagerConfig {
            func_id: 7,
            client_id,
            func_config: FuncConfig::load(FUNC_CONFIG).unwrap(),
            root_path_for_ipc: dir.path().to_path_buf(),
        })
        .unwrap()
    }

    fn setup(dir: &tempfile::TempDir, client_id: u16) -> (Manager, Rc<RefCell<Record>>) {
        let mut manager = new_manager(dir, client_id);
        let record = Rc::new(RefCell::new(Record::default()));
        let r = record.clone();
        manager.set_send_gateway_data_callback(move |data| {
            r.borrow_mut().gateway_out.extend_from_slice(data)
        });
        let r = record.clone();
        manager.set_send_watchdog_data_callback(move |data| {
            r.borrow_mut().watchdog_out.extend_from_slice(data)
        });
        let r = record.clone();
        manager.set_incoming_func_call_callback(move |handle, input| {
            r.borrow_mut().incoming.push((handle, input.to_vec()))
        });
        let r = record.clone();
        manager.set_outcoming_func_call_complete_callback(move |handle, success, output| {
            r.borrow_mut()
                .completions
                .push((handle, success, output.to_vec()))
        });
        manager.start();
        (manager, record)
    }

    #[test]
    fn unknown_function_allocates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        assert!(matches!(
            manager.on_outcoming_func_call("foo", &[0u8; 64]),
            Err(Error::UnknownFunction(_))
        ));
        assert!(manager.shm().live_regions().unwrap().is_empty());
        assert!(record.borrow().watchdog_out.is_empty());
        assert_eq!(manager.pending_outcoming_calls(), 0);
        // no handle was consumed
        assert_eq!(manager.on_outcoming_func_call("Foo", b"x").unwrap(), 1);
    }

    #[test]
    fn outcoming_call_through_regions() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        let input = vec![0xabu8; 1000];
        let handle = manager.on_outcoming_func_call("Bar", &input).unwrap();
        assert_eq!(handle, 1);

        let requests = Record::take_messages(&mut record.borrow_mut().watchdog_out);
        assert_eq!(requests.len(), 1);
        let request = requests[0];
        assert_eq!(request.direction, Direction::Request);
        assert_eq!(request.func_call, FuncCall::new(8, 3, handle));
        assert_eq!(request.payload_len, 1000);
        let input_name = *request.region_name().unwrap();
        assert_eq!(
            manager.shm().open_named(&input_name).unwrap().as_slice(),
            &input[..]
        );

        // the callee writes its output into a region it does not remove
        let provider = ShmProvider::new(dir.path()).unwrap();
        let output_name = region_name(request.func_call, RegionKind::Output);
        let output = vec![0x5au8; 300];
        provider
            .create_named(&output_name, output.len())
            .unwrap()
            .as_mut_slice()
            .copy_from_slice(&output);
        let mut response = FuncCallMessage::new_response(request.func_call, true);
        response.set_region(output_name, output.len() as u32);
        manager.on_recv_watchdog_data(&Message::FuncCall(response).encode());

        assert_eq!(record.borrow().completions, vec![(handle, true, output)]);
        assert!(manager.shm().live_regions().unwrap().is_empty());
        assert_eq!(manager.pending_outcoming_calls(), 0);
    }

    #[test]
    fn incoming_call_split_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 0);

        // the gateway assigns the client id, its payload is skipped
        let mut wire = Message::HandshakeResponse(HandshakeResponse {
            status: HandshakeStatus::Ok,
            client_id: 5,
            payload_len: 3,
        })
        .encode()
        .to_vec();
        wire.extend_from_slice(b"abc");
        manager.on_recv_gateway_data(&wire[..40]);
        manager.on_recv_gateway_data(&wire[40..]);
        assert_eq!(manager.client_id(), 5);

        // a caller with client id 2 invokes us with a 4096-byte input
        let func_call = FuncCall::new(7, 2, 1);
        let input: Vec<u8> = (0..4096).map(|i| i as u8).collect();
        let input_name = region_name(func_call, RegionKind::Input);
        let provider = ShmProvider::new(dir.path()).unwrap();
        let mut region = provider.create_named(&input_name, input.len()).unwrap();
        assert!(region.len() >= 4096);
        region.as_mut_slice().copy_from_slice(&input);
        drop(region);

        let mut request = FuncCallMessage::new_request(func_call);
        request.set_region(input_name, input.len() as u32);
        let encoded = Message::FuncCall(request).encode();
        for chunk in encoded.chunks(10) {
            manager.on_recv_watchdog_data(chunk);
        }
        let (handle, received) = record.borrow_mut().incoming.pop().unwrap();
        assert_eq!(received, input);
        // released once the callback returned
        assert!(provider.live_regions().unwrap().is_empty());

        let output = vec![7u8; 100];
        manager.on_incoming_func_call_complete(handle, true, &output);
        let responses = Record::take_messages(&mut record.borrow_mut().watchdog_out);
        assert_eq!(responses.len(), 1);
        let response = responses[0];
        assert_eq!(response.direction, Direction::Response);
        assert_eq!(response.func_call, func_call);
        assert!(response.success);
        let output_region = provider.open_named(response.region_name().unwrap()).unwrap();
        assert_eq!(output_region.as_slice(), &output[..]);
        assert!(record.borrow().gateway_out.is_empty());
    }

    #[test]
    fn small_payloads_are_inline() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        let mut request = FuncCallMessage::new_request(FuncCall::new(7, 4, 9));
        request.set_inline_data(b"ping");
        manager.on_recv_gateway_data(&Message::FuncCall(request).encode());
        let (handle, input) = record.borrow_mut().incoming.pop().unwrap();
        assert_eq!(input, b"ping");

        // the same call again while in flight
        manager.on_recv_gateway_data(&Message::FuncCall(request).encode());
        assert!(record.borrow().incoming.is_empty());

        manager.on_incoming_func_call_complete(handle, true, b"pong");
        // answered on the channel the request came from
        let responses = Record::take_messages(&mut record.borrow_mut().gateway_out);
        assert_eq!(responses[0].inline_data().unwrap(), b"pong");
        assert!(record.borrow().watchdog_out.is_empty());
        assert!(manager.shm().live_regions().unwrap().is_empty());
    }

    #[test]
    fn missing_input_region_fails_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        let func_call = FuncCall::new(7, 4, 1);
        let mut request = FuncCallMessage::new_request(func_call);
        request.set_region(region_name(func_call, RegionKind::Input), 4096);
        manager.on_recv_watchdog_data(&Message::FuncCall(request).encode());
        assert!(record.borrow().incoming.is_empty());
        let responses = Record::take_messages(&mut record.borrow_mut().watchdog_out);
        assert_eq!(responses[0].func_call, func_call);
        assert!(!responses[0].success);
    }

    #[test]
    fn gateway_io_error_fails_pending_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        let h1 = manager.on_outcoming_func_call("Foo", &[1u8; 64]).unwrap();
        let h2 = manager.on_outcoming_func_call("Bar", &[2u8; 128]).unwrap();
        assert_eq!(manager.shm().live_regions().unwrap().len(), 2);

        manager.on_gateway_io_error("connection reset");
        assert_eq!(
            record.borrow().completions,
            vec![(h1, false, vec![]), (h2, false, vec![])]
        );
        assert!(manager.shm().live_regions().unwrap().is_empty());
        assert!(manager.is_closed());
        assert!(matches!(
            manager.on_outcoming_func_call("Foo", b"x"),
            Err(Error::Closed)
        ));

        // a late response finds nothing
        let response = FuncCallMessage::new_response(FuncCall::new(7, 3, h1), true);
        manager.on_recv_watchdog_data(&Message::FuncCall(response).encode());
        assert_eq!(record.borrow().completions.len(), 2);
    }

    #[test]
    fn stale_response_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        let handle = manager.on_outcoming_func_call("Foo", b"hi").unwrap();

        let mut response = FuncCallMessage::new_response(FuncCall::new(7, 3, handle + 1), true);
        response.set_inline_data(b"nope");
        manager.on_recv_watchdog_data(&Message::FuncCall(response).encode());
        assert!(record.borrow().completions.is_empty());

        let mut response = FuncCallMessage::new_response(FuncCall::new(7, 3, handle), true);
        response.set_inline_data(b"ok");
        let encoded = Message::FuncCall(response).encode();
        manager.on_recv_watchdog_data(&encoded);
        manager.on_recv_watchdog_data(&encoded);
        assert_eq!(
            record.borrow().completions,
            vec![(handle, true, b"ok".to_vec())]
        );
    }

    #[test]
    fn failed_response_completes_with_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        let handle = manager.on_outcoming_func_call("Foo", &[0u8; 40]).unwrap();
        let response = FuncCallMessage::new_response(FuncCall::new(7, 3, handle), false);
        manager.on_recv_gateway_data(&Message::FuncCall(response).encode());
        assert_eq!(record.borrow().completions, vec![(handle, false, vec![])]);
        assert!(manager.shm().live_regions().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "Cannot find incoming call")]
    fn double_complete_panics() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        let mut request = FuncCallMessage::new_request(FuncCall::new(7, 4, 1));
        request.set_inline_data(b"x");
        manager.on_recv_watchdog_data(&Message::FuncCall(request).encode());
        let (handle, _) = record.borrow_mut().incoming.pop().unwrap();
        manager.on_incoming_func_call_complete(handle, true, b"y");
        manager.on_incoming_func_call_complete(handle, true, b"y");
    }

    #[test]
    #[should_panic(expected = "callback is not set")]
    fn start_requires_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir, 3);
        manager.set_send_gateway_data_callback(|_| {});
        manager.start();
    }

    #[test]
    #[should_panic(expected = "Manager is not started")]
    fn use_before_start_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir, 3);
        manager.on_recv_gateway_data(&[0u8; 8]);
    }

    #[test]
    fn handles_skip_pending_values() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _record) = setup(&dir, 3);
        manager.next_handle = u32::MAX;
        let a = manager.on_outcoming_func_call("Foo", b"a").unwrap();
        let b = manager.on_outcoming_func_call("Foo", b"b").unwrap();
        assert_eq!((a, b), (u32::MAX, 1));
        manager.next_handle = u32::MAX;
        let c = manager.on_outcoming_func_call("Foo", b"c").unwrap();
        assert_eq!(c, 2);
    }

    #[test]
    fn handshake_message_identifies_worker() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(&dir, 0);
        assert_eq!(
            manager.handshake_message(),
            Message::Handshake(HandshakeMessage {
                role: Role::FuncWorker,
                func_id: 7,
                client_id: 0,
                payload_len: 0,
            })
        );
    }

    fn handshake_response(client_id: u16) -> Vec<u8> {
        Message::HandshakeResponse(HandshakeResponse {
            status: HandshakeStatus::Ok,
            client_id,
            payload_len: 0,
        })
        .encode()
        .to_vec()
    }

    #[test]
    fn configured_client_id_follows_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 5);
        assert_eq!(manager.client_id(), 5);
        manager.on_recv_gateway_data(&handshake_response(1));
        assert_eq!(manager.client_id(), 1);

        let handle = manager.on_outcoming_func_call("Foo", b"x").unwrap();
        let requests = Record::take_messages(&mut record.borrow_mut().watchdog_out);
        assert_eq!(requests[0].func_call, FuncCall::new(7, 1, handle));

        // the gateway routes the response by the id it assigned
        let response = FuncCallMessage::new_response(FuncCall::new(7, 1, handle), true);
        manager.on_recv_gateway_data(&Message::FuncCall(response).encode());
        assert_eq!(record.borrow().completions, vec![(handle, true, vec![])]);
    }

    #[test]
    fn late_response_releases_output_region() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        let handle = manager.on_outcoming_func_call("Foo", b"hi").unwrap();
        manager.on_watchdog_io_error("broken pipe");
        assert_eq!(record.borrow().completions, vec![(handle, false, vec![])]);

        // the callee finished anyway and left its output behind
        let func_call = FuncCall::new(7, 3, handle);
        let output_name = region_name(func_call, RegionKind::Output);
        manager
            .shm()
            .create_named(&output_name, 100)
            .unwrap()
            .as_mut_slice()
            .fill(1);
        let mut response = FuncCallMessage::new_response(func_call, true);
        response.set_region(output_name, 100);
        let encoded = Message::FuncCall(response).encode();
        manager.on_recv_watchdog_data(&encoded);
        assert!(manager.shm().live_regions().unwrap().is_empty());
        assert_eq!(record.borrow().completions.len(), 1);

        // a duplicate finds nothing left to remove
        manager.on_recv_watchdog_data(&encoded);
        assert_eq!(record.borrow().completions.len(), 1);
    }

    #[test]
    fn short_output_region_fails_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        let handle = manager.on_outcoming_func_call("Foo", b"hi").unwrap();
        let func_call = FuncCall::new(7, 3, handle);
        let output_name = region_name(func_call, RegionKind::Output);
        manager.shm().create_named(&output_name, 64).unwrap();

        let mut response = FuncCallMessage::new_response(func_call, true);
        response.set_region(output_name, 4096);
        manager.on_recv_watchdog_data(&Message::FuncCall(response).encode());
        assert_eq!(record.borrow().completions, vec![(handle, false, vec![])]);
        assert!(manager.shm().live_regions().unwrap().is_empty());
    }

    #[test]
    fn short_input_region_fails_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, record) = setup(&dir, 3);
        let func_call = FuncCall::new(7, 4, 1);
        let input_name = region_name(func_call, RegionKind::Input);
        manager.shm().create_named(&input_name, 64).unwrap();

        let mut request = FuncCallMessage::new_request(func_call);
        request.set_region(input_name, 4096);
        manager.on_recv_gateway_data(&Message::FuncCall(request).encode());
        assert!(record.borrow().incoming.is_empty());
        let responses = Record::take_messages(&mut record.borrow_mut().gateway_out);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].func_call, func_call);
        assert!(!responses[0].success);
        assert!(manager.shm().live_regions().unwrap().is_empty());
    }
}
