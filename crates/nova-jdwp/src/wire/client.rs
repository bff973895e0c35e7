use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{encode_command, JdwpReader, JdwpWriter, FLAG_REPLY, HANDSHAKE, HEADER_LEN},
    types::*,
};

#[derive(Debug, Clone)]
pub struct JdwpClientConfig {
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
    pub event_channel_size: usize,
}

impl Default for JdwpClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            event_channel_size: 256,
        }
    }
}

#[derive(Debug)]
struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

type PendingReplies = HashMap<u32, oneshot::Sender<Result<Reply>>>;

#[derive(Debug)]
struct Inner {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: Mutex<PendingReplies>,
    next_id: AtomicU32,
    id_sizes: Mutex<JdwpIdSizes>,
    events: broadcast::Sender<JdwpEvent>,
    shutdown: CancellationToken,
    config: JdwpClientConfig,
}

/// Cloneable handle to a JDWP connection.
///
/// Commands may be issued concurrently; replies are matched by packet id on a
/// background read task which also fans out composite event packets to every
/// [`JdwpClient::subscribe_events`] receiver.
#[derive(Clone, Debug)]
pub struct JdwpClient {
    inner: Arc<Inner>,
}

impl JdwpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, JdwpClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: JdwpClientConfig) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);

        tokio::time::timeout(config.handshake_timeout, stream.write_all(HANDSHAKE))
            .await
            .map_err(|_| JdwpError::Timeout)??;

        let mut handshake = [0u8; HANDSHAKE.len()];
        tokio::time::timeout(config.handshake_timeout, stream.read_exact(&mut handshake))
            .await
            .map_err(|_| JdwpError::Timeout)??;

        if handshake != *HANDSHAKE {
            return Err(JdwpError::Protocol(format!(
                "invalid handshake reply: {:?}",
                String::from_utf8_lossy(&handshake)
            )));
        }

        let (reader, writer) = stream.into_split();
        let (events, _) = broadcast::channel(config.event_channel_size.max(1));

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            id_sizes: Mutex::new(JdwpIdSizes::default()),
            events,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));

        let client = Self { inner };
        // Every id-bearing reply depends on these.
        let sizes = client.idsizes().await?;
        tracing::debug!(target: "nova.jdwp", ?addr, ?sizes, "connected to JDWP agent");

        Ok(client)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled on [`JdwpClient::shutdown`] and when the connection drops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JdwpEvent> {
        self.inner.events.subscribe()
    }

    async fn send_command_raw(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.inner.pending.lock().await.insert(id, tx);

        let packet = encode_command(id, command_set, command, &payload);
        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(err) = writer.write_all(&packet).await {
                self.remove_pending(id).await;
                return Err(err.into());
            }
        }

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(JdwpError::Cancelled);
            }
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(r)) => r,
                    Ok(Err(_closed)) => return Err(JdwpError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        return Err(JdwpError::Timeout);
                    }
                }
            }
        }?;

        if reply.error_code != 0 {
            tracing::trace!(
                target: "nova.jdwp",
                command_set,
                command,
                error_code = reply.error_code,
                "JDWP command rejected"
            );
            return Err(JdwpError::VmError(reply.error_code));
        }

        Ok(reply.payload)
    }

    /// Encodes a command payload with the negotiated id sizes and sends it.
    async fn command<F>(&self, command_set: u8, command: u8, build: F) -> Result<(Vec<u8>, JdwpIdSizes)>
    where
        F: FnOnce(&mut JdwpWriter, &JdwpIdSizes),
    {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        build(&mut w, &sizes);
        let payload = self.send_command_raw(command_set, command, w.into_vec()).await?;
        Ok((payload, sizes))
    }

    async fn remove_pending(&self, id: u32) {
        self.inner.pending.lock().await.remove(&id);
    }

    async fn id_sizes(&self) -> JdwpIdSizes {
        *self.inner.id_sizes.lock().await
    }

    // ---------------------------------------------------------------------
    // VirtualMachine

    /// VirtualMachine.IDSizes (1, 7)
    pub async fn idsizes(&self) -> Result<JdwpIdSizes> {
        let payload = self.send_command_raw(1, 7, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let sizes = JdwpIdSizes {
            field_id: r.read_u32()? as usize,
            method_id: r.read_u32()? as usize,
            object_id: r.read_u32()? as usize,
            reference_type_id: r.read_u32()? as usize,
            frame_id: r.read_u32()? as usize,
        };
        *self.inner.id_sizes.lock().await = sizes;
        Ok(sizes)
    }

    /// VirtualMachine.CapabilitiesNew (1, 17), as raw booleans in JDWP order.
    pub async fn capabilities_new(&self) -> Result<Vec<bool>> {
        let payload = self.send_command_raw(1, 17, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let mut caps = Vec::with_capacity(r.remaining());
        while r.remaining() > 0 {
            caps.push(r.read_bool()?);
        }
        Ok(caps)
    }

    /// VirtualMachine.ClassesBySignature (1, 2)
    pub async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        let (payload, sizes) = self
            .command(1, 2, |w, _| w.write_string(signature))
            .await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut classes = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: signature.to_string(),
                status: r.read_u32()?,
            });
        }
        Ok(classes)
    }

    /// VirtualMachine.Resume (1, 9)
    pub async fn vm_resume(&self) -> Result<()> {
        self.send_command_raw(1, 9, Vec::new()).await.map(drop)
    }

    /// VirtualMachine.CreateString (1, 11)
    pub async fn vm_create_string(&self, value: &str) -> Result<ObjectId> {
        let (payload, sizes) = self.command(1, 11, |w, _| w.write_string(value)).await?;
        JdwpReader::new(&payload).read_object_id(&sizes)
    }

    // ---------------------------------------------------------------------
    // ReferenceType / ClassType / ArrayType / ClassObjectReference

    /// ReferenceType.Signature (2, 1)
    pub async fn reference_type_signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        let (payload, _) = self
            .command(2, 1, |w, s| w.write_reference_type_id(class_id, s))
            .await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ReferenceType.ClassLoader (2, 2). `0` is the bootstrap loader.
    pub async fn reference_type_class_loader(&self, class_id: ReferenceTypeId) -> Result<ObjectId> {
        let (payload, sizes) = self
            .command(2, 2, |w, s| w.write_reference_type_id(class_id, s))
            .await?;
        JdwpReader::new(&payload).read_object_id(&sizes)
    }

    /// ReferenceType.Methods (2, 5)
    pub async fn reference_type_methods(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<MethodInfo>> {
        let (payload, sizes) = self
            .command(2, 5, |w, s| w.write_reference_type_id(class_id, s))
            .await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut methods = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            methods.push(MethodInfo {
                method_id: r.read_id(sizes.method_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(methods)
    }

    /// ReferenceType.Interfaces (2, 10)
    pub async fn reference_type_interfaces(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<ReferenceTypeId>> {
        let (payload, sizes) = self
            .command(2, 10, |w, s| w.write_reference_type_id(class_id, s))
            .await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut interfaces = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            interfaces.push(r.read_reference_type_id(&sizes)?);
        }
        Ok(interfaces)
    }

    /// ClassType.Superclass (3, 1). `None` for `java.lang.Object` and interfaces.
    pub async fn class_type_superclass(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>> {
        let (payload, sizes) = self
            .command(3, 1, |w, s| w.write_reference_type_id(class_id, s))
            .await?;
        let id = JdwpReader::new(&payload).read_reference_type_id(&sizes)?;
        Ok((id != 0).then_some(id))
    }

    /// ClassType.InvokeMethod (3, 3)
    pub async fn class_type_invoke_method(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeOutcome> {
        let (payload, sizes) = self
            .command(3, 3, |w, s| {
                w.write_reference_type_id(class_id, s);
                w.write_object_id(thread, s);
                w.write_id(method_id, s.method_id);
                write_arguments(w, args, s);
                w.write_u32(options);
            })
            .await?;
        read_invoke_outcome(&payload, &sizes)
    }

    /// ClassType.NewInstance (3, 4)
    pub async fn class_type_new_instance(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeOutcome> {
        let (payload, sizes) = self
            .command(3, 4, |w, s| {
                w.write_reference_type_id(class_id, s);
                w.write_object_id(thread, s);
                w.write_id(method_id, s.method_id);
                write_arguments(w, args, s);
                w.write_u32(options);
            })
            .await?;
        let mut r = JdwpReader::new(&payload);
        let (tag, id) = r.read_tagged_object_id(&sizes)?;
        let (_, exception) = r.read_tagged_object_id(&sizes)?;
        Ok(InvokeOutcome {
            value: JdwpValue::Object { tag, id },
            exception: (exception != 0).then_some(exception),
        })
    }

    /// ArrayType.NewInstance (4, 1)
    pub async fn array_type_new_instance(
        &self,
        array_type: ReferenceTypeId,
        length: i32,
    ) -> Result<ObjectId> {
        let (payload, sizes) = self
            .command(4, 1, |w, s| {
                w.write_reference_type_id(array_type, s);
                w.write_i32(length);
            })
            .await?;
        let (_, id) = JdwpReader::new(&payload).read_tagged_object_id(&sizes)?;
        Ok(id)
    }

    /// ClassObjectReference.ReflectedType (17, 1)
    pub async fn class_object_reflected_type(
        &self,
        class_object: ObjectId,
    ) -> Result<ReferenceTypeId> {
        let (payload, sizes) = self
            .command(17, 1, |w, s| w.write_object_id(class_object, s))
            .await?;
        let mut r = JdwpReader::new(&payload);
        let _ref_type_tag = r.read_u8()?;
        r.read_reference_type_id(&sizes)
    }

    // ---------------------------------------------------------------------
    // Method

    /// Method.VariableTable (6, 2): `(argCnt, slots)`.
    pub async fn method_variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<(u32, Vec<VariableInfo>)> {
        let (payload, _) = self
            .command(6, 2, |w, s| {
                w.write_reference_type_id(class_id, s);
                w.write_id(method_id, s.method_id);
            })
            .await?;
        let mut r = JdwpReader::new(&payload);
        let arg_count = r.read_u32()?;
        let count = r.read_u32()? as usize;
        let mut vars = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            vars.push(VariableInfo {
                code_index: r.read_u64()?,
                name: r.read_string()?,
                signature: r.read_string()?,
                length: r.read_u32()?,
                slot: r.read_u32()?,
            });
        }
        Ok((arg_count, vars))
    }

    // ---------------------------------------------------------------------
    // ObjectReference / StringReference / ArrayReference

    /// ObjectReference.ReferenceType (9, 1)
    pub async fn object_reference_reference_type(
        &self,
        object_id: ObjectId,
    ) -> Result<ReferenceTypeId> {
        let (payload, sizes) = self
            .command(9, 1, |w, s| w.write_object_id(object_id, s))
            .await?;
        let mut r = JdwpReader::new(&payload);
        let _ref_type_tag = r.read_u8()?;
        r.read_reference_type_id(&sizes)
    }

    /// ObjectReference.InvokeMethod (9, 6)
    pub async fn object_reference_invoke_method(
        &self,
        object_id: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeOutcome> {
        let (payload, sizes) = self
            .command(9, 6, |w, s| {
                w.write_object_id(object_id, s);
                w.write_object_id(thread, s);
                w.write_reference_type_id(class_id, s);
                w.write_id(method_id, s.method_id);
                write_arguments(w, args, s);
                w.write_u32(options);
            })
            .await?;
        read_invoke_outcome(&payload, &sizes)
    }

    /// ObjectReference.DisableCollection (9, 7)
    pub async fn object_reference_disable_collection(&self, object_id: ObjectId) -> Result<()> {
        self.command(9, 7, |w, s| w.write_object_id(object_id, s))
            .await
            .map(drop)
    }

    /// ObjectReference.EnableCollection (9, 8)
    pub async fn object_reference_enable_collection(&self, object_id: ObjectId) -> Result<()> {
        self.command(9, 8, |w, s| w.write_object_id(object_id, s))
            .await
            .map(drop)
    }

    /// StringReference.Value (10, 1)
    pub async fn string_reference_value(&self, string_id: ObjectId) -> Result<String> {
        let (payload, _) = self
            .command(10, 1, |w, s| w.write_object_id(string_id, s))
            .await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ArrayReference.Length (13, 1)
    pub async fn array_reference_length(&self, array_id: ObjectId) -> Result<i32> {
        let (payload, _) = self
            .command(13, 1, |w, s| w.write_object_id(array_id, s))
            .await?;
        JdwpReader::new(&payload).read_i32()
    }

    /// ArrayReference.GetValues (13, 2)
    pub async fn array_reference_get_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>> {
        let (payload, sizes) = self
            .command(13, 2, |w, s| {
                w.write_object_id(array_id, s);
                w.write_i32(first_index);
                w.write_i32(length);
            })
            .await?;
        JdwpReader::new(&payload).read_array_region(&sizes)
    }

    /// ArrayReference.SetValues (13, 3). Values are written untagged.
    pub async fn array_reference_set_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        values: &[JdwpValue],
    ) -> Result<()> {
        self.command(13, 3, |w, s| {
            w.write_object_id(array_id, s);
            w.write_i32(first_index);
            w.write_u32(values.len() as u32);
            for value in values {
                w.write_value(value, s);
            }
        })
        .await
        .map(drop)
    }

    // ---------------------------------------------------------------------
    // ThreadReference / StackFrame

    /// ThreadReference.Resume (11, 3)
    pub async fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        self.command(11, 3, |w, s| w.write_object_id(thread, s))
            .await
            .map(drop)
    }

    /// ThreadReference.Frames (11, 6). `length == -1` requests all remaining frames.
    pub async fn thread_frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>> {
        let (payload, sizes) = self
            .command(11, 6, |w, s| {
                w.write_object_id(thread, s);
                w.write_i32(start);
                w.write_i32(length);
            })
            .await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut frames = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            let frame_id = r.read_id(sizes.frame_id)?;
            let location = r.read_location(&sizes)?;
            frames.push(FrameInfo { frame_id, location });
        }
        Ok(frames)
    }

    /// ThreadReference.FrameCount (11, 7)
    pub async fn thread_frame_count(&self, thread: ThreadId) -> Result<i32> {
        let (payload, _) = self
            .command(11, 7, |w, s| w.write_object_id(thread, s))
            .await?;
        JdwpReader::new(&payload).read_i32()
    }

    /// ThreadReference.ForceEarlyReturn (11, 14)
    pub async fn thread_force_early_return(
        &self,
        thread: ThreadId,
        value: &JdwpValue,
    ) -> Result<()> {
        self.command(11, 14, |w, s| {
            w.write_object_id(thread, s);
            w.write_tagged_value(value, s);
        })
        .await
        .map(drop)
    }

    /// StackFrame.GetValues (16, 1). Each slot is paired with its JNI signature.
    pub async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        let (payload, sizes) = self
            .command(16, 1, |w, s| {
                w.write_object_id(thread, s);
                w.write_id(frame_id, s.frame_id);
                w.write_u32(slots.len() as u32);
                for (slot, signature) in slots {
                    w.write_u32(*slot);
                    w.write_u8(super::codec::signature_to_tag(signature));
                }
            })
            .await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut values = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            values.push(r.read_tagged_value(&sizes)?);
        }
        Ok(values)
    }

    /// StackFrame.SetValues (16, 2)
    pub async fn stack_frame_set_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        values: &[(u32, JdwpValue)],
    ) -> Result<()> {
        self.command(16, 2, |w, s| {
            w.write_object_id(thread, s);
            w.write_id(frame_id, s.frame_id);
            w.write_u32(values.len() as u32);
            for (slot, value) in values {
                w.write_u32(*slot);
                w.write_tagged_value(value, s);
            }
        })
        .await
        .map(drop)
    }

    // ---------------------------------------------------------------------
    // EventRequest

    /// EventRequest.Set (15, 1), returning the request id.
    pub async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<i32> {
        let (payload, _) = self
            .command(15, 1, |w, s| {
                w.write_u8(event_kind);
                w.write_u8(suspend_policy);
                w.write_u32(modifiers.len() as u32);
                for modifier in &modifiers {
                    modifier.encode(w, s);
                }
            })
            .await?;
        JdwpReader::new(&payload).read_i32()
    }

    /// EventRequest.Clear (15, 2)
    pub async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        self.command(15, 2, |w, _| {
            w.write_u8(event_kind);
            w.write_i32(request_id);
        })
        .await
        .map(drop)
    }
}

fn write_arguments(w: &mut JdwpWriter, args: &[JdwpValue], sizes: &JdwpIdSizes) {
    w.write_u32(args.len() as u32);
    for arg in args {
        w.write_tagged_value(arg, sizes);
    }
}

fn read_invoke_outcome(payload: &[u8], sizes: &JdwpIdSizes) -> Result<InvokeOutcome> {
    let mut r = JdwpReader::new(payload);
    let value = r.read_tagged_value(sizes)?;
    let (_, exception) = r.read_tagged_object_id(sizes)?;
    Ok(InvokeOutcome {
        value,
        exception: (exception != 0).then_some(exception),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventModifier {
    Count {
        count: u32,
    },
    ThreadOnly {
        thread: ThreadId,
    },
    ClassOnly {
        class_id: ReferenceTypeId,
    },
    ClassMatch {
        pattern: String,
    },
    LocationOnly {
        location: Location,
    },
    ExceptionOnly {
        exception_or_null: ReferenceTypeId,
        caught: bool,
        uncaught: bool,
    },
    Step {
        thread: ThreadId,
        size: u32,
        depth: u32,
    },
}

impl EventModifier {
    fn encode(&self, w: &mut JdwpWriter, sizes: &JdwpIdSizes) {
        match self {
            EventModifier::Count { count } => {
                w.write_u8(EVENT_MODIFIER_KIND_COUNT);
                w.write_u32(*count);
            }
            EventModifier::ThreadOnly { thread } => {
                w.write_u8(EVENT_MODIFIER_KIND_THREAD_ONLY);
                w.write_object_id(*thread, sizes);
            }
            EventModifier::ClassOnly { class_id } => {
                w.write_u8(EVENT_MODIFIER_KIND_CLASS_ONLY);
                w.write_reference_type_id(*class_id, sizes);
            }
            EventModifier::ClassMatch { pattern } => {
                w.write_u8(EVENT_MODIFIER_KIND_CLASS_MATCH);
                w.write_string(pattern);
            }
            EventModifier::LocationOnly { location } => {
                w.write_u8(EVENT_MODIFIER_KIND_LOCATION_ONLY);
                w.write_location(location, sizes);
            }
            EventModifier::ExceptionOnly {
                exception_or_null,
                caught,
                uncaught,
            } => {
                w.write_u8(EVENT_MODIFIER_KIND_EXCEPTION_ONLY);
                w.write_reference_type_id(*exception_or_null, sizes);
                w.write_bool(*caught);
                w.write_bool(*uncaught);
            }
            EventModifier::Step {
                thread,
                size,
                depth,
            } => {
                w.write_u8(EVENT_MODIFIER_KIND_STEP);
                w.write_object_id(*thread, sizes);
                w.write_u32(*size);
                w.write_u32(*depth);
            }
        }
    }
}

async fn read_loop(mut reader: tokio::net::tcp::OwnedReadHalf, inner: Arc<Inner>) {
    let mut terminated_with_error = false;

    loop {
        let mut header = [0u8; HEADER_LEN];
        let header_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut header) => res,
        };
        if let Err(err) = header_read {
            tracing::debug!(target: "nova.jdwp", error = %err, "JDWP connection closed");
            terminated_with_error = true;
            break;
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length < HEADER_LEN {
            tracing::warn!(target: "nova.jdwp", length, "malformed JDWP packet length");
            terminated_with_error = true;
            break;
        }

        let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let flags = header[8];
        let mut payload = vec![0u8; length - HEADER_LEN];
        let payload_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut payload) => res,
        };
        if payload_read.is_err() {
            terminated_with_error = true;
            break;
        }

        if (flags & FLAG_REPLY) != 0 {
            let error_code = u16::from_be_bytes([header[9], header[10]]);
            let tx = inner.pending.lock().await.remove(&id);
            if let Some(tx) = tx {
                let _ = tx.send(Ok(Reply {
                    error_code,
                    payload,
                }));
            }
        } else if header[9] == 64 && header[10] == 100 {
            // Event.Composite
            if let Err(err) = handle_event_packet(&inner, &payload).await {
                tracing::warn!(target: "nova.jdwp", error = %err, "failed to decode JDWP event packet");
                terminated_with_error = true;
                break;
            }
        } else {
            tracing::trace!(
                target: "nova.jdwp",
                command_set = header[9],
                command = header[10],
                "ignoring VM command packet"
            );
        }
    }

    inner.shutdown.cancel();

    if terminated_with_error {
        let pending = std::mem::take(&mut *inner.pending.lock().await);
        for (_id, tx) in pending {
            let _ = tx.send(Err(JdwpError::ConnectionClosed));
        }
    }
}

async fn handle_event_packet(inner: &Inner, payload: &[u8]) -> Result<()> {
    let sizes = *inner.id_sizes.lock().await;
    let mut r = JdwpReader::new(payload);
    let _suspend_policy = r.read_u8()?;
    let event_count = r.read_u32()? as usize;
    for _ in 0..event_count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        let event = match kind {
            EVENT_KIND_SINGLE_STEP => JdwpEvent::SingleStep {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            EVENT_KIND_BREAKPOINT => JdwpEvent::Breakpoint {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            EVENT_KIND_EXCEPTION => JdwpEvent::Exception {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
                exception: r.read_tagged_object_id(&sizes)?.1,
                catch_location: r.read_optional_location(&sizes)?,
            },
            EVENT_KIND_METHOD_ENTRY => JdwpEvent::MethodEntry {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            EVENT_KIND_METHOD_EXIT => JdwpEvent::MethodExit {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE => JdwpEvent::MethodExitWithReturnValue {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
                value: r.read_tagged_value(&sizes)?,
            },
            EVENT_KIND_CLASS_PREPARE => JdwpEvent::ClassPrepare {
                request_id,
                thread: r.read_object_id(&sizes)?,
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: r.read_string()?,
                status: r.read_u32()?,
            },
            EVENT_KIND_VM_START => JdwpEvent::VmStart {
                request_id,
                thread: r.read_object_id(&sizes)?,
            },
            EVENT_KIND_VM_DEATH => JdwpEvent::VmDeath,
            other => {
                // Event layouts are kind-specific; the rest of the packet can't be framed.
                tracing::debug!(target: "nova.jdwp", kind = other, "skipping unsupported JDWP event");
                return Ok(());
            }
        };
        let _ = inner.events.send(event);
    }
    Ok(())
}
