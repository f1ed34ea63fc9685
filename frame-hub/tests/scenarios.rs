// 帧中心集成测试
//
// 使用脚本化的连接器模拟设备拔出、打开卡死和读取中断，时间均为暂停时钟。

use async_trait::async_trait;
use frame_hub::{
    BackoffPolicy, CaptureError, CaptureOptions, ConnectionTarget, ErrorKind, FrameCache,
    FrameHub, FrameReader, FrameStatsAnalyzer, HubConfig, RawFrame, Result, SourceBackoff,
    SourceConnector, SourceDescriptor, SourceEvent, SourceEventKind, SourceHandle, SourceState,
    StreamItem,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};

#[derive(Debug, Clone, Default)]
struct Script {
    open_failures: u32,
    hang_on_open: bool,
    fail_reads_after: Option<u32>,
    open_panics: u32,
    panic_reads_after: Option<u32>,
}

struct ScriptedConnector {
    scripts: Mutex<HashMap<String, Script>>,
    opens: Mutex<Vec<(String, Instant)>>,
    live: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    frame_interval: Duration,
}

impl ScriptedConnector {
    fn new(frame_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            opens: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            frame_interval,
        })
    }

    fn script(&self, source_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(source_id.to_string(), script);
    }

    fn opens_for(&self, source_id: &str) -> Vec<Instant> {
        self.opens
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == source_id)
            .map(|(_, at)| *at)
            .collect()
    }

    fn live_readers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn closed_readers(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    async fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameReader>> {
        let source_id = descriptor.source_id.clone();
        self.opens
            .lock()
            .unwrap()
            .push((source_id.clone(), Instant::now()));

        let (hang, fail, panic, fail_reads_after, panic_reads_after) = {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.entry(source_id.clone()).or_default();
            let fail = script.open_failures > 0;
            if fail {
                script.open_failures -= 1;
            }
            let panic = script.open_panics > 0;
            if panic {
                script.open_panics -= 1;
            }
            (
                script.hang_on_open,
                fail,
                panic,
                script.fail_reads_after,
                script.panic_reads_after,
            )
        };

        if panic {
            panic!("driver for {} crashed", source_id);
        }
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(CaptureError::OpenFailure(format!("{} is unplugged", source_id)));
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedReader {
            live: self.live.clone(),
            closed: self.closed.clone(),
            interval: self.frame_interval,
            reads: 0,
            fail_reads_after,
            panic_reads_after,
            released: false,
        }))
    }
}

struct ScriptedReader {
    live: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    interval: Duration,
    reads: u32,
    fail_reads_after: Option<u32>,
    panic_reads_after: Option<u32>,
    released: bool,
}

impl ScriptedReader {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl FrameReader for ScriptedReader {
    async fn read_frame(&mut self) -> Result<RawFrame> {
        sleep(self.interval).await;
        self.reads += 1;
        if let Some(limit) = self.panic_reads_after {
            if self.reads > limit {
                panic!("decoder crashed");
            }
        }
        if let Some(limit) = self.fail_reads_after {
            if self.reads > limit {
                return Err(CaptureError::ReadFailure("cable pulled".to_string()));
            }
        }
        Ok(RawFrame::new(vec![(self.reads % 256) as u8; 16]).with_size(4, 4))
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for ScriptedReader {
    fn drop(&mut self) {
        self.release();
    }
}

fn descriptor(source_id: &str) -> SourceDescriptor {
    SourceDescriptor::new(
        source_id,
        format!("Camera {}", source_id),
        ConnectionTarget::Uri(format!("test://{}", source_id)),
    )
}

fn config() -> HubConfig {
    let mut config = HubConfig::default();
    config.reconnect.initial_backoff_ms = 100;
    config.reconnect.max_backoff_ms = 1_000;
    config.reconnect.stagger_step_ms = 25;
    config.capture.read_retry_limit = 2;
    config
}

async fn eventually<F: Fn() -> bool>(limit: Duration, what: &str, condition: F) {
    let waited = timeout(limit, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// 收集某个视频源的状态序列，直到出现 `until`
async fn collect_trace(
    events: &mut broadcast::Receiver<SourceEvent>,
    source_id: &str,
    until: SourceState,
) -> (Vec<SourceState>, Vec<Duration>) {
    let mut states = Vec::new();
    let mut delays = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        if event.source_id != source_id {
            continue;
        }
        match event.kind {
            SourceEventKind::StateChanged { state } => {
                states.push(state);
                if state == until {
                    return (states, delays);
                }
            }
            SourceEventKind::BackoffScheduled { delay, .. } => delays.push(delay),
            SourceEventKind::Failure { .. } => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_opens_produce_reconnect_trace() {
    let connector = ScriptedConnector::new(Duration::from_millis(20));
    connector.script(
        "cam-a",
        Script {
            open_failures: 2,
            ..Script::default()
        },
    );
    let hub = FrameHub::with_connector(&config(), connector.clone());
    let mut events = hub.subscribe_events();

    hub.register(descriptor("cam-a")).unwrap();
    let (trace, delays) = collect_trace(&mut events, "cam-a", SourceState::Streaming).await;

    assert_eq!(
        trace,
        vec![
            SourceState::Connecting,
            SourceState::Reconnecting,
            SourceState::Connecting,
            SourceState::Reconnecting,
            SourceState::Connecting,
            SourceState::Streaming,
        ]
    );
    assert_eq!(delays.len(), 2);
    assert!(delays[0] < delays[1]);

    // 实际的重连间隔同样递增
    let opens = connector.opens_for("cam-a");
    assert_eq!(opens.len(), 3);
    let first_gap = opens[1] - opens[0];
    let second_gap = opens[2] - opens[1];
    assert!(first_gap >= delays[0]);
    assert!(second_gap >= delays[1]);
    assert!(first_gap < second_gap);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_to_ceiling() {
    let connector = ScriptedConnector::new(Duration::from_millis(20));
    connector.script(
        "cam-a",
        Script {
            open_failures: u32::MAX,
            ..Script::default()
        },
    );
    let mut config = config();
    config.reconnect.max_backoff_ms = 400;
    config.reconnect.stagger_slots = 0;
    let hub = FrameHub::with_connector(&config, connector.clone());
    let mut events = hub.subscribe_events();
    hub.register(descriptor("cam-a")).unwrap();

    let mut delays = Vec::new();
    while delays.len() < 6 {
        let event = events.recv().await.unwrap();
        if let SourceEventKind::BackoffScheduled { delay, .. } = event.kind {
            delays.push(delay);
        }
    }

    let expected: Vec<Duration> = [100, 200, 400, 400, 400, 400]
        .iter()
        .map(|ms| Duration::from_millis(*ms))
        .collect();
    assert_eq!(delays, expected);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_register_opens_once() {
    let connector = ScriptedConnector::new(Duration::from_millis(20));
    let hub = FrameHub::with_connector(&config(), connector.clone());

    hub.register(descriptor("cam-a")).unwrap();
    hub.register(descriptor("cam-a")).unwrap();
    eventually(Duration::from_secs(1), "streaming", || {
        hub.state("cam-a") == Some(SourceState::Streaming)
    })
    .await;
    sleep(Duration::from_millis(200)).await;

    assert_eq!(connector.opens_for("cam-a").len(), 1);
    assert_eq!(connector.live_readers(), 1);
    assert_eq!(hub.source_ids(), vec!["cam-a".to_string()]);

    let conflicting = descriptor("cam-a").with_size(1280, 720);
    assert!(matches!(
        hub.register(conflicting),
        Err(CaptureError::DescriptorConflict(_))
    ));

    hub.shutdown().await;
    assert_eq!(connector.live_readers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_releases_reader_every_cycle() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    let cache = FrameCache::new();
    let (events, _) = broadcast::channel(64);
    let mut handle = SourceHandle::new(
        descriptor("cam-a"),
        connector.clone(),
        cache.clone(),
        SourceBackoff::new(BackoffPolicy::default(), Duration::ZERO),
        CaptureOptions::default(),
        events,
    );

    for cycle in 1..=5 {
        handle.start().unwrap();
        assert!(matches!(handle.start(), Err(CaptureError::SourceBusy(_))));

        eventually(Duration::from_secs(1), "first frame", || {
            handle.state() == SourceState::Streaming && cache.latest("cam-a").is_some()
        })
        .await;
        assert_eq!(connector.live_readers(), 1);

        handle.stop().await;
        assert!(!handle.is_running());
        assert_eq!(connector.live_readers(), 0);
        assert_eq!(connector.closed_readers(), cycle);
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_blocked_read() {
    let connector = ScriptedConnector::new(Duration::from_secs(3_600));
    let cache = FrameCache::new();
    let (events, _) = broadcast::channel(64);
    let mut options = CaptureOptions::default();
    options.read_timeout = Duration::from_secs(7_200);
    let mut handle = SourceHandle::new(
        descriptor("cam-a"),
        connector.clone(),
        cache.clone(),
        SourceBackoff::new(BackoffPolicy::default(), Duration::ZERO),
        options,
        events,
    );

    handle.start().unwrap();
    eventually(Duration::from_secs(1), "streaming", || {
        handle.state() == SourceState::Streaming
    })
    .await;

    let started = Instant::now();
    handle.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(connector.live_readers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_handle_on_same_source_is_busy() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    let cache = FrameCache::new();
    let (events, _) = broadcast::channel(64);
    let make = || {
        SourceHandle::new(
            descriptor("cam-a"),
            connector.clone(),
            cache.clone(),
            SourceBackoff::new(BackoffPolicy::default(), Duration::ZERO),
            CaptureOptions::default(),
            events.clone(),
        )
    };

    let mut first = make();
    let mut second = make();
    first.start().unwrap();
    assert!(matches!(second.start(), Err(CaptureError::SourceBusy(_))));

    first.stop().await;
    second.start().unwrap();
    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_two_cadences_receive_same_frames_independently() {
    // 7ms的帧间隔与两个节奏点错开，节奏点上读到的是同一帧
    let connector = ScriptedConnector::new(Duration::from_millis(7));
    let hub = FrameHub::with_connector(&config(), connector.clone());
    hub.register(descriptor("cam-a")).unwrap();

    let gather = |fps: f64| {
        let mut stream = hub
            .multiplexer()
            .subscribe_fps("cam-a", fps)
            .unwrap();
        tokio::spawn(async move {
            let mut frames = Vec::new();
            let deadline = Instant::now() + Duration::from_secs(3);
            while let Ok(Some(item)) = tokio::time::timeout_at(deadline, stream.next()).await {
                if let StreamItem::Frame(frame) = item {
                    frames.push((Instant::now(), frame));
                }
            }
            frames
        })
    };
    let slow = gather(2.0);
    let fast = gather(10.0);

    let slow = slow.await.unwrap();
    let fast = fast.await.unwrap();

    for (frames, cadence) in [(&slow, 500u64), (&fast, 100u64)] {
        assert!(frames.len() >= 2);
        assert!(frames
            .windows(2)
            .all(|pair| pair[0].1.sequence < pair[1].1.sequence));
        assert!(frames
            .windows(2)
            .all(|pair| pair[1].0 - pair[0].0 >= Duration::from_millis(cadence)));
    }
    assert!(fast.len() > slow.len() * 3);

    let mut shared = 0;
    for (_, frame) in &slow {
        if let Some((_, same)) = fast.iter().find(|(_, f)| f.sequence == frame.sequence) {
            assert!(Arc::ptr_eq(frame, same));
            shared += 1;
        }
    }
    assert!(shared >= 1);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_one_subscription_keeps_others() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    let hub = FrameHub::with_connector(&config(), connector.clone());
    hub.register(descriptor("cam-a")).unwrap();
    hub.register(descriptor("cam-b")).unwrap();

    let mut same_source = hub.subscribe("cam-a", Duration::from_millis(50)).unwrap();
    let cancelled = hub.subscribe("cam-a", Duration::from_millis(50)).unwrap();
    let mut other_source = hub.subscribe("cam-b", Duration::from_millis(50)).unwrap();
    assert_eq!(hub.multiplexer().subscriber_count("cam-a"), 2);

    drop(cancelled);
    assert_eq!(hub.multiplexer().subscriber_count("cam-a"), 1);
    assert_eq!(hub.snapshot()["cam-a"].active_subscribers, 1);

    let mut last = None;
    for _ in 0..5 {
        let item = loop {
            let item = same_source.next().await.unwrap();
            if !item.is_placeholder() {
                break item;
            }
        };
        assert!(item.sequence() > last);
        last = item.sequence();
    }
    while other_source.next().await.unwrap().is_placeholder() {}

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_latest_for_unregistered_source_is_absent() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    let hub = FrameHub::with_connector(&config(), connector);

    assert!(hub.latest("ghost").is_none());
    assert!(hub.state("ghost").is_none());
    assert!(matches!(
        hub.subscribe("ghost", Duration::from_millis(10)),
        Err(CaptureError::CacheMiss(_))
    ));
    assert!(matches!(
        hub.deregister("ghost").await,
        Err(CaptureError::CacheMiss(_))
    ));
    assert!(matches!(hub.reset("ghost").await, Err(CaptureError::CacheMiss(_))));
}

#[tokio::test(start_paused = true)]
async fn test_hung_source_does_not_delay_other_reconnects() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    connector.script(
        "cam-a",
        Script {
            hang_on_open: true,
            ..Script::default()
        },
    );
    connector.script(
        "cam-b",
        Script {
            open_failures: 2,
            ..Script::default()
        },
    );
    let mut config = config();
    config.capture.open_timeout_ms = 60_000;
    let hub = FrameHub::with_connector(&config, connector.clone());

    hub.register(descriptor("cam-a")).unwrap();
    hub.register(descriptor("cam-b")).unwrap();

    eventually(Duration::from_secs(2), "cam-b streaming", || {
        hub.state("cam-b") == Some(SourceState::Streaming)
    })
    .await;
    assert_eq!(hub.state("cam-a"), Some(SourceState::Connecting));
    assert_eq!(connector.opens_for("cam-b").len(), 3);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_failures_reconnect_at_staggered_times() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    for id in ["cam-a", "cam-b", "cam-c"] {
        connector.script(
            id,
            Script {
                open_failures: 1,
                ..Script::default()
            },
        );
    }
    let hub = FrameHub::with_connector(&config(), connector.clone());
    for id in ["cam-a", "cam-b", "cam-c"] {
        hub.register(descriptor(id)).unwrap();
    }

    eventually(Duration::from_secs(2), "all streaming", || {
        ["cam-a", "cam-b", "cam-c"]
            .iter()
            .all(|id| hub.state(id) == Some(SourceState::Streaming))
    })
    .await;

    let retries: Vec<Instant> = ["cam-a", "cam-b", "cam-c"]
        .iter()
        .map(|id| connector.opens_for(id)[1])
        .collect();
    assert!(retries[0] < retries[1]);
    assert!(retries[1] < retries[2]);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_subscriber_does_not_hold_back_publishing() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    let hub = FrameHub::with_connector(&config(), connector.clone());
    hub.register(descriptor("cam-a")).unwrap();

    // 订阅后从不读取
    let _idle = hub.subscribe("cam-a", Duration::from_secs(60)).unwrap();
    let mut slow = hub.subscribe("cam-a", Duration::from_secs(1)).unwrap();

    eventually(Duration::from_secs(1), "first frame", || hub.latest("cam-a").is_some()).await;
    let _ = slow.next().await;
    let before = hub.latest("cam-a").unwrap().sequence;

    sleep(Duration::from_millis(500)).await;
    let after = hub.latest("cam-a").unwrap().sequence;
    assert!(after >= before + 40, "published {} -> {}", before, after);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_read_failures_trigger_reconnect() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    connector.script(
        "cam-a",
        Script {
            fail_reads_after: Some(5),
            ..Script::default()
        },
    );
    let hub = FrameHub::with_connector(&config(), connector.clone());
    let mut events = hub.subscribe_events();
    hub.register(descriptor("cam-a")).unwrap();

    let mut read_failures = 0;
    let mut states = Vec::new();
    while !states.ends_with(&[SourceState::Reconnecting, SourceState::Connecting, SourceState::Streaming]) {
        let event = events.recv().await.unwrap();
        match event.kind {
            SourceEventKind::Failure { kind, .. } => {
                assert_eq!(kind, ErrorKind::ReadFailure);
                read_failures += 1;
            }
            SourceEventKind::StateChanged { state } => states.push(state),
            SourceEventKind::BackoffScheduled { .. } => {}
        }
    }

    // 原地重试两次后才进入重连
    assert_eq!(read_failures, 3);
    assert_eq!(connector.opens_for("cam-a").len(), 2);
    assert_eq!(connector.live_readers(), 1);

    let report = &hub.snapshot()["cam-a"];
    assert_eq!(
        report.last_error.as_ref().map(|error| error.kind),
        Some(ErrorKind::ReadFailure)
    );

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_sequences_increase_across_reconnect() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    connector.script(
        "cam-a",
        Script {
            fail_reads_after: Some(5),
            ..Script::default()
        },
    );
    let hub = FrameHub::with_connector(&config(), connector.clone());
    hub.register(descriptor("cam-a")).unwrap();
    let mut stream = hub.subscribe("cam-a", Duration::from_millis(5)).unwrap();

    let mut sequences = Vec::new();
    let _ = timeout(Duration::from_secs(1), async {
        while let Some(item) = stream.next().await {
            if let Some(sequence) = item.sequence() {
                sequences.push(sequence);
            }
        }
    })
    .await;

    // 一秒内经历了多次重连
    assert!(connector.opens_for("cam-a").len() >= 3);
    assert!(
        sequences.windows(2).all(|pair| pair[1] > pair[0]),
        "sequences went backwards or repeated: {:?}",
        sequences
    );
    // 每次连接只产出5帧，超过5说明重连后的帧也已交付
    assert!(sequences.iter().any(|&sequence| sequence >= 10), "{:?}", sequences);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_panicking_open_is_an_open_failure() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    connector.script(
        "cam-a",
        Script {
            open_panics: 1,
            ..Script::default()
        },
    );
    let hub = FrameHub::with_connector(&config(), connector.clone());
    let mut events = hub.subscribe_events();
    hub.register(descriptor("cam-a")).unwrap();
    hub.register(descriptor("cam-b")).unwrap();

    let mut failures = Vec::new();
    let mut states = Vec::new();
    while states.last() != Some(&SourceState::Streaming) {
        let event = events.recv().await.unwrap();
        if event.source_id != "cam-a" {
            continue;
        }
        match event.kind {
            SourceEventKind::Failure { kind, message } => failures.push((kind, message)),
            SourceEventKind::StateChanged { state } => states.push(state),
            SourceEventKind::BackoffScheduled { .. } => {}
        }
    }

    assert_eq!(
        states,
        vec![
            SourceState::Connecting,
            SourceState::Reconnecting,
            SourceState::Connecting,
            SourceState::Streaming,
        ]
    );
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, ErrorKind::OpenFailure);
    assert!(failures[0].1.contains("driver for cam-a crashed"), "{}", failures[0].1);
    assert_eq!(hub.state("cam-b"), Some(SourceState::Streaming));

    hub.shutdown().await;
    assert_eq!(connector.live_readers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_read_reconnects_without_retry() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    connector.script(
        "cam-a",
        Script {
            panic_reads_after: Some(3),
            ..Script::default()
        },
    );
    let hub = FrameHub::with_connector(&config(), connector.clone());
    let mut events = hub.subscribe_events();
    hub.register(descriptor("cam-a")).unwrap();

    let mut failures = Vec::new();
    let mut states = Vec::new();
    while !states.ends_with(&[SourceState::Reconnecting, SourceState::Connecting, SourceState::Streaming]) {
        let event = events.recv().await.unwrap();
        match event.kind {
            SourceEventKind::Failure { kind, message } => failures.push((kind, message)),
            SourceEventKind::StateChanged { state } => states.push(state),
            SourceEventKind::BackoffScheduled { .. } => {}
        }
    }

    // panic后不原地重试
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, ErrorKind::ReadFailure);
    assert!(failures[0].1.contains("decoder crashed"), "{}", failures[0].1);
    assert_eq!(connector.opens_for("cam-a").len(), 2);
    assert_eq!(connector.closed_readers(), 1);
    assert_eq!(connector.live_readers(), 1);
    assert_eq!(hub.cache().last_sequence("cam-a"), Some(2));

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_source_waits_for_reset() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    connector.script(
        "cam-a",
        Script {
            open_failures: u32::MAX,
            ..Script::default()
        },
    );
    let mut config = config();
    config.reconnect.max_consecutive_failures = 3;
    let hub = FrameHub::with_connector(&config, connector.clone());
    hub.register(descriptor("cam-a")).unwrap();

    eventually(Duration::from_secs(5), "failed", || {
        hub.state("cam-a") == Some(SourceState::Failed)
    })
    .await;
    let report = &hub.snapshot()["cam-a"];
    assert_eq!(report.consecutive_failures, 3);
    assert_eq!(
        report.last_error.as_ref().map(|error| error.kind),
        Some(ErrorKind::OpenFailure)
    );

    // 不会自动重试
    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.opens_for("cam-a").len(), 3);
    assert_eq!(hub.state("cam-a"), Some(SourceState::Failed));

    connector.script("cam-a", Script::default());
    assert!(hub.reset("cam-a").await.unwrap());
    eventually(Duration::from_secs(1), "streaming after reset", || {
        hub.state("cam-a") == Some(SourceState::Streaming)
    })
    .await;
    assert!(!hub.reset("cam-a").await.unwrap());
    assert_eq!(hub.snapshot()["cam-a"].consecutive_failures, 0);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_source_auto_resets_when_configured() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    connector.script(
        "cam-a",
        Script {
            open_failures: 2,
            ..Script::default()
        },
    );
    let mut config = config();
    config.reconnect.max_consecutive_failures = 2;
    config.reconnect.failed_auto_reset_ms = Some(5_000);
    let hub = FrameHub::with_connector(&config, connector.clone());
    let mut events = hub.subscribe_events();
    hub.register(descriptor("cam-a")).unwrap();

    let (trace, _) = collect_trace(&mut events, "cam-a", SourceState::Streaming).await;
    assert!(trace.contains(&SourceState::Failed));
    assert_eq!(trace.last(), Some(&SourceState::Streaming));

    let opens = connector.opens_for("cam-a");
    assert_eq!(opens.len(), 3);
    assert!(opens[2] - opens[1] >= Duration::from_secs(5));

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reregistered_source_resumes_sequence() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    let hub = FrameHub::with_connector(&config(), connector.clone());
    hub.register(descriptor("cam-a")).unwrap();

    eventually(Duration::from_secs(1), "a few frames", || {
        hub.cache().last_sequence("cam-a").map_or(false, |seq| seq >= 3)
    })
    .await;
    let mut stream = hub.subscribe("cam-a", Duration::from_millis(10)).unwrap();
    let analyzed = hub
        .analysis()
        .analyze_latest("cam-a", &FrameStatsAnalyzer)
        .await
        .unwrap();
    assert!(analyzed.is_some());
    assert_eq!(hub.analysis().len(), 1);

    hub.deregister("cam-a").await.unwrap();
    assert!(hub.analysis().is_empty());
    assert_eq!(connector.closed_readers(), 1);
    assert_eq!(connector.live_readers(), 0);
    assert!(hub.latest("cam-a").is_none());
    assert!(hub.snapshot().is_empty());

    // 注销后订阅流结束
    let ended = timeout(Duration::from_secs(1), async {
        while stream.next().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok());

    hub.register(descriptor("cam-a")).unwrap();
    eventually(Duration::from_secs(1), "frame after re-register", || {
        hub.latest("cam-a").is_some()
    })
    .await;
    assert!(hub.latest("cam-a").unwrap().sequence > 3);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_status_snapshot_and_event_stream() {
    let connector = ScriptedConnector::new(Duration::from_millis(10));
    let mut config = config();
    config.status.stale_after_ms = 200;
    let hub = FrameHub::with_connector(&config, connector.clone());
    let events = hub.event_stream();
    tokio::pin!(events);

    hub.register(descriptor("cam-a")).unwrap();
    let first = events.next().await.unwrap();
    assert_eq!(first.source_id, "cam-a");
    assert_eq!(
        first.kind,
        SourceEventKind::StateChanged {
            state: SourceState::Connecting
        }
    );

    eventually(Duration::from_secs(1), "frames", || hub.latest("cam-a").is_some()).await;
    let report = &hub.snapshot()["cam-a"];
    assert_eq!(report.display_name, "Camera cam-a");
    assert_eq!(report.state, SourceState::Streaming);
    assert!(report.last_sequence.is_some());
    assert!(!report.stale);
    assert_eq!(hub.summary().streaming, 1);

    hub.shutdown().await;
    assert!(hub.snapshot().is_empty());
    assert!(hub.source_ids().is_empty());
}
