use std::time::Duration;

use pretty_assertions::assert_eq;

use super::{mock::MockJdwpServer, *};

fn location(method_id: MethodId, index: u64) -> Location {
    Location {
        type_tag: TYPE_TAG_CLASS,
        class_id: 0x100,
        method_id,
        index,
    }
}

async fn connect(server: &MockJdwpServer) -> JdwpClient {
    let config = JdwpClientConfig {
        reply_timeout: Duration::from_secs(2),
        ..JdwpClientConfig::default()
    };
    JdwpClient::connect_with_config(server.addr(), config)
        .await
        .unwrap()
}

#[tokio::test]
async fn connect_negotiates_id_sizes() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let client = connect(&server).await;

    assert_eq!(client.idsizes().await.unwrap(), server.id_sizes());
    assert_eq!(server.commands_for(1, 7).len(), 2);
}

#[tokio::test]
async fn vm_errors_are_surfaced_with_their_code() {
    let server = MockJdwpServer::spawn().await.unwrap();
    server.set_reply(11, 14, ERROR_OPAQUE_FRAME, Vec::new());
    let client = connect(&server).await;

    let err = client
        .thread_force_early_return(1, &JdwpValue::Int(3))
        .await
        .unwrap_err();
    assert_eq!(err.vm_error_code(), Some(ERROR_OPAQUE_FRAME));
    assert!(err.to_string().contains("OPAQUE_FRAME"), "{err}");
}

#[tokio::test]
async fn force_early_return_sends_tagged_value() {
    let server = MockJdwpServer::spawn().await.unwrap();
    server.set_reply(11, 14, 0, Vec::new());
    let client = connect(&server).await;

    client
        .thread_force_early_return(0x77, &JdwpValue::object(0x55))
        .await
        .unwrap();

    let sent = server.commands_for(11, 14);
    let mut r = JdwpReader::new(&sent[0].payload);
    let sizes = server.id_sizes();
    assert_eq!(r.read_object_id(&sizes).unwrap(), 0x77);
    assert_eq!(r.read_tagged_value(&sizes).unwrap(), JdwpValue::object(0x55));
}

#[tokio::test]
async fn invoke_method_reports_thrown_exception() {
    let server = MockJdwpServer::spawn().await.unwrap();
    server.set_reply_with(3, 3, |w, s| {
        w.write_tagged_value(&JdwpValue::NULL, s);
        w.write_u8(TAG_OBJECT);
        w.write_object_id(0x99, s);
    });
    let client = connect(&server).await;

    let outcome = client
        .class_type_invoke_method(0x10, 0x20, 0x30, &[JdwpValue::Int(1)], INVOKE_SINGLE_THREADED)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        InvokeOutcome {
            value: JdwpValue::NULL,
            exception: Some(0x99),
        }
    );

    let sent = server.commands_for(3, 3);
    let sizes = server.id_sizes();
    let mut r = JdwpReader::new(&sent[0].payload);
    assert_eq!(r.read_reference_type_id(&sizes).unwrap(), 0x10);
    assert_eq!(r.read_object_id(&sizes).unwrap(), 0x20);
    assert_eq!(r.read_id(sizes.method_id).unwrap(), 0x30);
    assert_eq!(r.read_u32().unwrap(), 1);
    assert_eq!(r.read_tagged_value(&sizes).unwrap(), JdwpValue::Int(1));
    assert_eq!(r.read_u32().unwrap(), INVOKE_SINGLE_THREADED);
}

#[tokio::test]
async fn array_set_values_writes_untagged_elements() {
    let server = MockJdwpServer::spawn().await.unwrap();
    server.set_reply(13, 3, 0, Vec::new());
    let client = connect(&server).await;

    client
        .array_reference_set_values(0x42, 0, &[JdwpValue::Byte(-54), JdwpValue::Byte(0x3e)])
        .await
        .unwrap();

    let sent = server.commands_for(13, 3);
    let payload = &sent[0].payload;
    // object id (8) + first index (4) + count (4) + two bytes
    assert_eq!(payload.len(), 18);
    assert_eq!(&payload[16..], &[0xca, 0x3e]);
}

#[tokio::test]
async fn event_request_set_encodes_class_only_modifier() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let client = connect(&server).await;

    let id = client
        .event_request_set(
            EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE,
            SUSPEND_POLICY_EVENT_THREAD,
            vec![EventModifier::ClassOnly { class_id: 0x300 }],
        )
        .await
        .unwrap();
    assert_eq!(id, 1);

    let sent = server.commands_for(15, 1);
    let mut r = JdwpReader::new(&sent[0].payload);
    assert_eq!(r.read_u8().unwrap(), EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE);
    assert_eq!(r.read_u8().unwrap(), SUSPEND_POLICY_EVENT_THREAD);
    assert_eq!(r.read_u32().unwrap(), 1);
    assert_eq!(r.read_u8().unwrap(), EVENT_MODIFIER_KIND_CLASS_ONLY);
    assert_eq!(r.read_reference_type_id(&server.id_sizes()).unwrap(), 0x300);
}

#[tokio::test]
async fn composite_method_events_are_broadcast() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let client = connect(&server).await;
    let mut events = client.subscribe_events();

    let expected = vec![
        JdwpEvent::MethodEntry {
            request_id: 3,
            thread: 0x77,
            location: location(0x31, 0),
        },
        JdwpEvent::MethodExitWithReturnValue {
            request_id: 4,
            thread: 0x77,
            location: location(0x31, 12),
            value: JdwpValue::Object {
                tag: TAG_OBJECT,
                id: 0x500,
            },
        },
        JdwpEvent::Exception {
            request_id: 5,
            thread: 0x77,
            location: location(0x32, 4),
            exception: 0x600,
            catch_location: None,
        },
    ];
    server.emit(SUSPEND_POLICY_EVENT_THREAD, &expected);

    let mut received = Vec::new();
    for _ in 0..expected.len() {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(event);
    }
    assert_eq!(received, expected);
}

#[tokio::test]
async fn variable_table_and_frames_decode() {
    let server = MockJdwpServer::spawn().await.unwrap();
    server.set_reply_with(6, 2, |w, _| {
        w.write_u32(1);
        w.write_u32(1);
        w.write_u64(0);
        w.write_string("list");
        w.write_string("Ljava/util/List;");
        w.write_u32(20);
        w.write_u32(1);
    });
    server.set_reply_with(11, 6, |w, s| {
        w.write_u32(1);
        w.write_id(0xf0, s.frame_id);
        w.write_location(&location(0x31, 7), s);
    });
    let client = connect(&server).await;

    let (args, vars) = client.method_variable_table(0x100, 0x31).await.unwrap();
    assert_eq!(args, 1);
    assert_eq!(vars[0].name, "list");
    assert!(vars[0].is_visible_at(19));
    assert!(!vars[0].is_visible_at(20));

    let frames = client.thread_frames(0x77, 0, -1).await.unwrap();
    assert_eq!(
        frames,
        vec![FrameInfo {
            frame_id: 0xf0,
            location: location(0x31, 7),
        }]
    );
}

#[tokio::test]
async fn pending_requests_fail_when_connection_drops() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let client = connect(&server).await;
    let token = client.shutdown_token();
    drop(server);

    tokio::time::timeout(Duration::from_secs(2), token.cancelled())
        .await
        .unwrap();
    let err = client.vm_resume().await.unwrap_err();
    assert!(
        matches!(err, JdwpError::Cancelled | JdwpError::ConnectionClosed | JdwpError::Io(_)),
        "{err:?}"
    );
}
