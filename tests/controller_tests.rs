//! Controller 串行化语义测试（公开 API + mock 能力）

#[cfg(feature = "agent")]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};
    use tracking_service::agent::{spawn, AgentController, Broadcaster, Command, ControllerHandle};
    use tracking_service::protocol::{EventType, Response};
    use tracking_service::source::{LocationSource, SourceEvent, UpdateOptions};
    use tracking_service::state::StateFlag;
    use tracking_service::types::{PermissionState, SessionState};
    use tracking_service::{GuardToken, LifecycleGuard, Result};

    /// 始终授权的 source，记录启停次数
    struct GrantedSource {
        enables: AtomicUsize,
        disables: AtomicUsize,
    }

    impl GrantedSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                enables: AtomicUsize::new(0),
                disables: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LocationSource for GrantedSource {
        async fn request_permission(&self) -> Result<PermissionState> {
            Ok(PermissionState::Granted)
        }

        async fn enable_updates(
            &self,
            _options: UpdateOptions,
            _sink: mpsc::Sender<SourceEvent>,
        ) -> Result<()> {
            self.enables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disable_updates(&self) -> Result<()> {
            self.disables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// 慢 guard：acquire 拖 delay，便于在 Starting 窗口里排队后续命令
    struct SlowGuard {
        delay: Duration,
        held: AtomicBool,
    }

    impl SlowGuard {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                held: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl LifecycleGuard for SlowGuard {
        async fn acquire(&self) -> Result<GuardToken> {
            sleep(self.delay).await;
            self.held.store(true, Ordering::SeqCst);
            Ok(GuardToken::new())
        }

        async fn release(&self, _token: GuardToken) {
            self.held.store(false, Ordering::SeqCst);
        }
    }

    struct Harness {
        handle: ControllerHandle,
        source: Arc<GrantedSource>,
        guard: Arc<SlowGuard>,
        push_rx: mpsc::Receiver<String>,
        _dir: tempfile::TempDir,
    }

    fn build(guard_delay: Duration) -> Harness {
        let dir = tempdir().unwrap();
        let broadcaster = Broadcaster::new();
        let (push_tx, push_rx) = mpsc::channel(64);
        let conn_id = broadcaster.register(push_tx);
        broadcaster.subscribe(
            conn_id,
            vec![
                EventType::Lifecycle,
                EventType::Location,
                EventType::Permission,
                EventType::Error,
            ],
        );

        let source = GrantedSource::new();
        let guard = SlowGuard::new(guard_delay);
        let (controller, source_rx) = AgentController::new(
            source.clone(),
            guard.clone(),
            broadcaster,
            UpdateOptions::default(),
            Duration::from_secs(5),
            StateFlag::new(dir.path().join("tracking.state")),
        );
        let handle = spawn(controller, source_rx);

        Harness {
            handle,
            source,
            guard,
            push_rx,
            _dir: dir,
        }
    }

    async fn next_push_type(rx: &mut mpsc::Receiver<String>) -> String {
        let line = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for push")
            .expect("push channel closed");
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        value["type"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_stop_during_starting_queues_until_start_completes() {
        let mut h = build(Duration::from_millis(200));

        // Start 在 guard 获取上拖 200ms；Stop 紧随其后入队
        let start_handle = h.handle.clone();
        let start_task =
            tokio::spawn(
                async move { start_handle.command(Command::Start { resume_token: None }).await },
            );
        sleep(Duration::from_millis(50)).await;

        // Stop 在 Starting 窗口内入队，排在 Start 之后串行执行
        let stop = h.handle.command(Command::Stop).await.unwrap();
        assert_eq!(stop, Response::Ok);

        // Start 必须先完整跑完（Started 先于 Stopped）
        let start = start_task.await.unwrap().unwrap();
        assert_eq!(start, Response::Ok);
        assert_eq!(next_push_type(&mut h.push_rx).await, "ServiceStarted");
        assert_eq!(next_push_type(&mut h.push_rx).await, "ServiceStopped");

        assert_eq!(h.handle.session_state().await.unwrap(), SessionState::Idle);
        assert_eq!(h.source.enables.load(Ordering::SeqCst), 1);
        assert_eq!(h.source.disables.load(Ordering::SeqCst), 1);
        assert!(!h.guard.held.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_guard_never_held_while_idle() {
        let h = build(Duration::from_millis(10));

        for _ in 0..3 {
            h.handle
                .command(Command::Start { resume_token: None })
                .await
                .unwrap();
            assert!(h.guard.held.load(Ordering::SeqCst));

            h.handle.command(Command::Stop).await.unwrap();
            assert_eq!(h.handle.session_state().await.unwrap(), SessionState::Idle);
            assert!(!h.guard.held.load(Ordering::SeqCst));
        }

        assert_eq!(h.source.enables.load(Ordering::SeqCst), 3);
        assert_eq!(h.source.disables.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reads_queue_behind_in_flight_start() {
        let h = build(Duration::from_millis(200));

        let start_handle = h.handle.clone();
        tokio::spawn(
            async move { start_handle.command(Command::Start { resume_token: None }).await },
        );
        sleep(Duration::from_millis(50)).await;

        // 读命令也排队：回答时 Start 已完整跑完
        let response = h.handle.command(Command::IsRunning).await.unwrap();
        assert_eq!(response, Response::Running { running: true });
        assert_eq!(
            h.handle.session_state().await.unwrap(),
            SessionState::Active
        );
    }
}
