mod common;

use common::{add, connect, TestNode};
use mediacore::RunMode;
use mediaruntime::{drive, MediaRuntime, RuntimeConfig};

#[tokio::test]
async fn test_run_stops_on_quit_from_handle() {
    let mut runtime = MediaRuntime::new();
    let handle = runtime.handle();

    std::thread::spawn(move || handle.quit().unwrap())
        .join()
        .unwrap();
    let stats = runtime.run().await;

    assert_eq!(stats.wakeups, 1);
    assert_eq!(stats.dispatched, 1);
}

#[test]
fn test_config_sets_wave_limit() {
    let config = RuntimeConfig {
        max_wave_activations: 1,
        ..Default::default()
    };
    let mut runtime = MediaRuntime::with_config(config);
    let (src, _) = add(runtime.graph_mut(), TestNode::source());
    let (sink, sink_probe) = add(runtime.graph_mut(), TestNode::sink());
    connect(&mut runtime, src, 0, sink, 0);
    runtime.start_all().unwrap();

    let report = runtime.graph_mut().push(src).unwrap();

    assert!(report.truncated);
    assert_eq!(sink_probe.consumed.get(), 0);
}

#[tokio::test]
async fn test_drive_sync_modes() {
    for mode in [RunMode::SyncPush, RunMode::SyncPull, RunMode::Direct] {
        let mut runtime = MediaRuntime::new();
        let (src, src_probe) = add(runtime.graph_mut(), TestNode::source());
        let (sink, sink_probe) = add(runtime.graph_mut(), TestNode::sink());
        connect(&mut runtime, src, 0, sink, 0);

        let report = drive(&mut runtime, src, sink, mode, 500).await.unwrap();

        assert_eq!(report.mode, mode);
        assert_eq!(report.cycles, 500);
        assert_eq!(sink_probe.consumed.get(), 500, "{:?} should consume every cycle", mode);
        assert_eq!(src_probe.reused.get(), 500);
        assert_eq!(report.reused, 500);
    }
}

#[tokio::test]
async fn test_async_push_refuses_sync_source() {
    let mut runtime = MediaRuntime::new();
    let (src, _) = add(runtime.graph_mut(), TestNode::source());
    let (sink, _) = add(runtime.graph_mut(), TestNode::sink());
    connect(&mut runtime, src, 0, sink, 0);

    assert!(drive(&mut runtime, src, sink, RunMode::AsyncPush, 10).await.is_err());
}
