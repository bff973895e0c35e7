use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicI32, AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{encode_command, encode_reply, JdwpReader, JdwpWriter, HANDSHAKE, HEADER_LEN},
    types::*,
};

/// A scripted JDWP agent for wire-level tests.
///
/// It answers `IDSizes`, `CapabilitiesNew` and `EventRequest.Set` on its own;
/// every other command replies with whatever was registered through
/// [`MockJdwpServer::set_reply`], or `NOT_IMPLEMENTED`.
pub struct MockJdwpServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
    events: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct MockJdwpServerConfig {
    pub id_sizes: JdwpIdSizes,
    pub capabilities: Vec<bool>,
}

impl Default for MockJdwpServerConfig {
    fn default() -> Self {
        Self {
            id_sizes: JdwpIdSizes::default(),
            capabilities: vec![true; 32],
        }
    }
}

/// A command packet as the mock received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCommand {
    pub command_set: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    config: MockJdwpServerConfig,
    next_request_id: AtomicI32,
    next_packet_id: AtomicU32,
    replies: Mutex<HashMap<(u8, u8), (u16, Vec<u8>)>>,
    commands: Mutex<Vec<RecordedCommand>>,
}

impl MockJdwpServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockJdwpServerConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockJdwpServerConfig) -> std::io::Result<Self> {
        let listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(State {
            config,
            next_request_id: AtomicI32::new(1),
            next_packet_id: AtomicU32::new(0x4000_0000),
            ..State::default()
        });
        let (events, events_rx) = mpsc::unbounded_channel();

        let task_state = state.clone();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = run(listener, task_state, events_rx, task_shutdown).await {
                tracing::debug!(target: "nova.jdwp", error = %err, "mock JDWP server stopped");
            }
        });

        Ok(Self {
            addr,
            shutdown,
            state,
            events,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn id_sizes(&self) -> JdwpIdSizes {
        self.state.config.id_sizes
    }

    /// Registers the reply for every future `(command_set, command)` packet.
    pub fn set_reply(&self, command_set: u8, command: u8, error_code: u16, payload: Vec<u8>) {
        self.state
            .replies
            .lock()
            .insert((command_set, command), (error_code, payload));
    }

    /// Like [`MockJdwpServer::set_reply`], building the payload with the mock's id sizes.
    pub fn set_reply_with(
        &self,
        command_set: u8,
        command: u8,
        build: impl FnOnce(&mut JdwpWriter, &JdwpIdSizes),
    ) {
        let mut w = JdwpWriter::new();
        build(&mut w, &self.state.config.id_sizes);
        self.set_reply(command_set, command, 0, w.into_vec());
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.commands.lock().clone()
    }

    pub fn commands_for(&self, command_set: u8, command: u8) -> Vec<RecordedCommand> {
        self.commands()
            .into_iter()
            .filter(|c| c.command_set == command_set && c.command == command)
            .collect()
    }

    /// Sends `events` to the debugger as one composite event packet.
    pub fn emit(&self, suspend_policy: u8, events: &[JdwpEvent]) {
        let sizes = self.state.config.id_sizes;
        let mut w = JdwpWriter::new();
        w.write_u8(suspend_policy);
        w.write_u32(events.len() as u32);
        for event in events {
            encode_event(&mut w, event, &sizes);
        }
        let id = self.state.next_packet_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(encode_command(id, 64, 100, &w.into_vec()));
    }
}

impl Drop for MockJdwpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn encode_event(w: &mut JdwpWriter, event: &JdwpEvent, sizes: &JdwpIdSizes) {
    let kind = match event {
        JdwpEvent::SingleStep { .. } => EVENT_KIND_SINGLE_STEP,
        JdwpEvent::Breakpoint { .. } => EVENT_KIND_BREAKPOINT,
        JdwpEvent::Exception { .. } => EVENT_KIND_EXCEPTION,
        JdwpEvent::MethodEntry { .. } => EVENT_KIND_METHOD_ENTRY,
        JdwpEvent::MethodExit { .. } => EVENT_KIND_METHOD_EXIT,
        JdwpEvent::MethodExitWithReturnValue { .. } => EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE,
        JdwpEvent::ClassPrepare { .. } => EVENT_KIND_CLASS_PREPARE,
        JdwpEvent::VmStart { .. } => EVENT_KIND_VM_START,
        JdwpEvent::VmDeath => EVENT_KIND_VM_DEATH,
    };
    w.write_u8(kind);
    w.write_i32(event.request_id().unwrap_or(0));
    match event {
        JdwpEvent::SingleStep {
            thread, location, ..
        }
        | JdwpEvent::Breakpoint {
            thread, location, ..
        }
        | JdwpEvent::MethodEntry {
            thread, location, ..
        }
        | JdwpEvent::MethodExit {
            thread, location, ..
        } => {
            w.write_object_id(*thread, sizes);
            w.write_location(location, sizes);
        }
        JdwpEvent::MethodExitWithReturnValue {
            thread,
            location,
            value,
            ..
        } => {
            w.write_object_id(*thread, sizes);
            w.write_location(location, sizes);
            w.write_tagged_value(value, sizes);
        }
        JdwpEvent::Exception {
            thread,
            location,
            exception,
            catch_location,
            ..
        } => {
            w.write_object_id(*thread, sizes);
            w.write_location(location, sizes);
            w.write_u8(TAG_OBJECT);
            w.write_object_id(*exception, sizes);
            let zero = Location {
                type_tag: 0,
                class_id: 0,
                method_id: 0,
                index: 0,
            };
            w.write_location(catch_location.as_ref().unwrap_or(&zero), sizes);
        }
        JdwpEvent::ClassPrepare {
            thread,
            ref_type_tag,
            type_id,
            signature,
            status,
            ..
        } => {
            w.write_object_id(*thread, sizes);
            w.write_u8(*ref_type_tag);
            w.write_reference_type_id(*type_id, sizes);
            w.write_string(signature);
            w.write_u32(*status);
        }
        JdwpEvent::VmStart { thread, .. } => w.write_object_id(*thread, sizes),
        JdwpEvent::VmDeath => {}
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    mut events: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut socket = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accept = listener.accept() => accept?.0,
    };

    let mut hs = [0u8; HANDSHAKE.len()];
    socket.read_exact(&mut hs).await?;
    if hs != *HANDSHAKE {
        return Ok(());
    }
    socket.write_all(HANDSHAKE).await?;

    let (mut reader, mut writer) = socket.into_split();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            Some(packet) = events.recv() => writer.write_all(&packet).await?,
            res = read_packet(&mut reader) => {
                let Some((id, command)) = res? else {
                    return Ok(());
                };
                let (error_code, payload) = reply_for(&state, &command);
                state.commands.lock().push(command);
                writer.write_all(&encode_reply(id, error_code, &payload)).await?;
            }
        }
    }
}

async fn read_packet(
    socket: &mut tokio::net::tcp::OwnedReadHalf,
) -> std::io::Result<Option<(u32, RecordedCommand)>> {
    let mut header = [0u8; HEADER_LEN];
    match socket.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length < HEADER_LEN {
        return Ok(None);
    }
    let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let mut payload = vec![0u8; length - HEADER_LEN];
    socket.read_exact(&mut payload).await?;
    Ok(Some((
        id,
        RecordedCommand {
            command_set: header[9],
            command: header[10],
            payload,
        },
    )))
}

fn reply_for(state: &State, command: &RecordedCommand) -> (u16, Vec<u8>) {
    let key = (command.command_set, command.command);
    if let Some(reply) = state.replies.lock().get(&key) {
        return reply.clone();
    }
    let sizes = state.config.id_sizes;
    let mut w = JdwpWriter::new();
    match key {
        // VirtualMachine.IDSizes
        (1, 7) => {
            for size in [
                sizes.field_id,
                sizes.method_id,
                sizes.object_id,
                sizes.reference_type_id,
                sizes.frame_id,
            ] {
                w.write_u32(size as u32);
            }
        }
        // VirtualMachine.CapabilitiesNew
        (1, 17) => {
            for cap in &state.config.capabilities {
                w.write_bool(*cap);
            }
        }
        // EventRequest.Set
        (15, 1) => {
            let mut r = JdwpReader::new(&command.payload);
            if r.read_u8().is_err() {
                return (ERROR_INVALID_LENGTH, Vec::new());
            }
            w.write_i32(state.next_request_id.fetch_add(1, Ordering::Relaxed));
        }
        // VM/thread resume, EventRequest.Clear and friends carry empty replies.
        (1, 8) | (1, 9) | (11, 3) | (15, 2) => {}
        _ => return (ERROR_NOT_IMPLEMENTED, Vec::new()),
    }
    (0, w.into_vec())
}
