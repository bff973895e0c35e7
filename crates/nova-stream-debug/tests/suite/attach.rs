use nova_config::StreamDebugConfig;
use nova_jdwp::wire::mock::{MockJdwpServer, MockJdwpServerConfig};
use nova_jdwp::wire::CAPABILITY_CAN_FORCE_EARLY_RETURN;
use nova_stream_debug::{attach, TraceError, TraceState};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn attach_connects_with_the_configured_timeouts() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let config = StreamDebugConfig::load_from_str(
        r#"
[jdwp]
handshake_timeout_ms = 1000
reply_timeout_ms = 2000
"#,
    )
    .unwrap();

    let (client, manager) = attach(server.addr(), &config).await.unwrap();

    assert_eq!(client.idsizes().await.unwrap(), server.id_sizes());
    assert_eq!(manager.state(), TraceState::Idle);
    assert_eq!(server.commands_for(1, 17).len(), 1, "capabilities are checked once");
    manager.shutdown().await;
}

#[tokio::test]
async fn attach_refuses_a_vm_that_cannot_force_returns() {
    let mut capabilities = vec![true; 32];
    capabilities[CAPABILITY_CAN_FORCE_EARLY_RETURN] = false;
    let server = MockJdwpServer::spawn_with_config(MockJdwpServerConfig {
        capabilities,
        ..MockJdwpServerConfig::default()
    })
    .await
    .unwrap();

    let err = attach(server.addr(), &StreamDebugConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(err, TraceError::UnsupportedVm(_)), "{err}");
}

#[tokio::test]
async fn attach_reports_an_unreachable_debuggee() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = attach(addr, &StreamDebugConfig::default()).await.unwrap_err();

    assert!(matches!(err, TraceError::Jdwp(_)), "{err}");
}
