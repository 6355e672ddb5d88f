use handshake_bench::process::{CommandSpec, ManagedProcess};
use handshake_bench::timing::{TimingParser, TERMINAL_LABEL};
use std::time::Duration;

/// Timer lines a long-running server writes to its stdout pipe are read and
/// sealed into records while the server keeps running.
#[tokio::test]
async fn server_timer_lines_via_stdout_pipe() {
    let script = r#"
echo "Listening on 0.0.0.0:20100"
printf 'SERVER HELLO SENT: 11 ns\nHANDSHAKE COMPLETED: 12 ns\n'
printf 'SERVER HELLO SENT: 21 ns\nHANDSHAKE COMPLETED: 22 ns\n'
echo "CERTIFICATE SENT: 30 ns"
exec sleep 30
"#;
    let spec = CommandSpec::new("sh").arg("-c").arg(script);
    let mut server = ManagedProcess::start(&spec, "stub server").expect("spawn server");

    let mut parser = TimingParser::new(TERMINAL_LABEL);
    let mut sealed = Vec::new();
    while sealed.len() < 2 {
        let line = tokio::time::timeout(Duration::from_secs(5), server.read_line())
            .await
            .expect("server output within the limit")
            .expect("readable stdout")
            .expect("stdout still open");
        sealed.extend(parser.feed(&line));
    }

    assert_eq!(sealed[0].get("SERVER HELLO SENT"), Some(11));
    assert_eq!(sealed[1].get("HANDSHAKE COMPLETED"), Some(22));

    let line = server.read_line().await.unwrap().unwrap();
    assert!(parser.feed(&line).is_none());
    assert_eq!(parser.in_progress().get("CERTIFICATE SENT"), Some(30));

    assert!(server.is_alive());
    server.terminate(Duration::from_secs(5)).await.unwrap();
    assert!(!server.is_alive());
    assert_eq!(server.read_line().await.unwrap(), None);
}
