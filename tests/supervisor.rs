#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use futures_util::future::join_all;
use napcat_supervisor::{
    ErrorKind, InstanceConfig, InstanceSnapshot, Interval, LifecycleEvent, Notice, Phase,
    RestartPolicy, Supervisor, SupervisorEvent, SupervisorSettings,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(15);

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        graceful_shutdown_timeout_secs: 5,
        ..SupervisorSettings::default()
    }
}

/// A fake bot: `/bin/sh -c <script> bot -q <id>`, so the account id is `$2`.
fn fake_bot(id: u64, dir: &Path, script: &str) -> InstanceConfig {
    let mut cfg = InstanceConfig::new(id, "/bin/sh", dir);
    cfg.name = format!("bot{id}");
    cfg.args = vec!["-c".to_string(), script.to_string(), "bot".to_string()];
    cfg.env.insert(
        "STATE".to_string(),
        dir.join(format!("state-{id}")).display().to_string(),
    );
    cfg.env
        .insert("GO".to_string(), dir.join(format!("go-{id}")).display().to_string());
    cfg
}

const LOGS_IN: &str = r#"echo "[Core] login success: $2"; exec sleep 30"#;

async fn wait_snapshot(
    supervisor: &Supervisor,
    id: u64,
    pred: impl Fn(&InstanceSnapshot) -> bool,
) -> InstanceSnapshot {
    let mut rx = supervisor.watch(id).unwrap();
    let snapshot = timeout(WAIT, rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for snapshot")
        .unwrap()
        .clone();
    snapshot
}

async fn wait_phase(supervisor: &Supervisor, id: u64, phase: Phase) -> InstanceSnapshot {
    wait_snapshot(supervisor, id, |s| s.phase == phase).await
}

async fn next_notice(
    events: &mut broadcast::Receiver<SupervisorEvent>,
    id: u64,
    pred: impl Fn(&Notice) -> bool,
) -> Notice {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(SupervisorEvent::Notice { id: from, notice }) if from == id && pred(&notice) => {
                    return notice;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event feed closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for notice")
}

fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quick_login_error_restarts_then_logs_in() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"
n=$(cat "$STATE" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$STATE"
if [ "$n" = 1 ]; then
  echo "QR:ABC123"
  while [ ! -f "$GO" ]; do sleep 0.1; done
  echo "[Login] quick login error: token expired"
  exec sleep 30
fi
echo "[Core] login success: $2"
exec sleep 30
"#;
    let supervisor = Supervisor::new(settings());
    supervisor
        .add_instance(fake_bot(100001, dir.path(), script))
        .unwrap();
    let mut events = supervisor.subscribe();

    supervisor.start(100001).await.unwrap();
    let first = wait_phase(&supervisor, 100001, Phase::AwaitingLogin).await;
    assert_eq!(first.last_qr_payload.as_deref(), Some("ABC123"));
    assert_eq!(first.restart_count, 0);
    let first_pid = first.pid.unwrap();

    std::fs::write(dir.path().join("go-100001"), "").unwrap();

    let notice = next_notice(&mut events, 100001, |n| {
        matches!(n, Notice::AutoRestarting { .. })
    })
    .await;
    assert_eq!(
        notice,
        Notice::AutoRestarting {
            attempt: 1,
            reason: "token expired".to_string()
        }
    );

    let running = wait_phase(&supervisor, 100001, Phase::Running).await;
    assert_eq!(running.restart_count, 1);
    assert_eq!(running.last_qr_payload, None);
    assert_ne!(running.pid, Some(first_pid));
    assert!(!pid_alive(first_pid), "old process must be gone");

    supervisor.stop(100001).await.unwrap();
    let stopped = supervisor.snapshot(100001).unwrap();
    assert_eq!(stopped.phase, Phase::Stopped);
    assert_eq!(stopped.restart_count, 0);
    assert_eq!(stopped.pid, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destructive_operations_require_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(settings());
    let cfg = fake_bot(100001, dir.path(), LOGS_IN);
    supervisor.add_instance(cfg.clone()).unwrap();

    let err = supervisor.add_instance(cfg.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceAlreadyExists);

    supervisor.start(100001).await.unwrap();
    wait_phase(&supervisor, 100001, Phase::Running).await;

    let err = supervisor.delete_instance(100001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceBusy);
    assert_eq!(err.get("id"), Some("100001"));
    let err = supervisor
        .update_config(100001, cfg.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceBusy);

    supervisor.stop(100001).await.unwrap();
    assert_eq!(supervisor.snapshot(100001).unwrap().phase, Phase::Stopped);

    let mut renamed = cfg.clone();
    renamed.name = "renamed".to_string();
    supervisor.update_config(100001, renamed).await.unwrap();
    assert_eq!(supervisor.config(100001).unwrap().name, "renamed");
    assert_eq!(supervisor.snapshot(100001).unwrap().name, "renamed");

    supervisor.delete_instance(100001).await.unwrap();
    let err = supervisor.snapshot(100001).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceNotFound);
    assert!(supervisor.instance_ids().is_empty());

    supervisor.add_instance(cfg).unwrap();
    assert_eq!(supervisor.instance_ids(), vec![100001]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_starts_spawn_once() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(settings());
    supervisor
        .add_instance(fake_bot(100001, dir.path(), LOGS_IN))
        .unwrap();

    let results = join_all((0..8).map(|_| supervisor.start(100001))).await;
    let started = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(started, 1);
    for err in results.into_iter().filter_map(Result::err) {
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
        assert!(err.is_invalid_transition());
    }

    wait_phase(&supervisor, 100001, Phase::Running).await;
    supervisor.stop(100001).await.unwrap();

    let err = supervisor.stop(100001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn global_update_gate() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(settings());
    for id in [100001, 100002] {
        supervisor
            .add_instance(fake_bot(id, dir.path(), LOGS_IN))
            .unwrap();
    }
    assert!(supervisor.check_global_update_allowed().is_ok());

    supervisor.start(100002).await.unwrap();
    let err = supervisor.check_global_update_allowed().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AnyInstanceRunning);
    assert_eq!(err.get("ids"), Some("100002"));
    assert!(supervisor.begin_global_update().is_err());

    supervisor.stop(100002).await.unwrap();
    let guard = supervisor.begin_global_update().unwrap();
    let err = supervisor.start(100001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpdateInProgress);
    let err = supervisor.reboot(100001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpdateInProgress);
    assert_eq!(supervisor.snapshot(100001).unwrap().phase, Phase::Stopped);
    assert!(supervisor.check_global_update_allowed().is_ok());

    drop(guard);
    supervisor.start(100001).await.unwrap();
    supervisor.stop_all().await.unwrap();
    assert!(supervisor
        .snapshots()
        .iter()
        .all(|s| s.phase == Phase::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_failures_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(settings());

    let missing = InstanceConfig::new(100001, dir.path().join("no-such-bot"), dir.path());
    supervisor.add_instance(missing).unwrap();
    let err = supervisor.start(100001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Spawn);
    assert_eq!(err.get("reason"), Some("executable_not_found"));
    assert_eq!(err.get("id"), Some("100001"));
    assert_eq!(supervisor.snapshot(100001).unwrap().phase, Phase::Stopped);

    let not_executable = dir.path().join("bot.txt");
    std::fs::write(&not_executable, "not a program").unwrap();
    let cfg = InstanceConfig::new(100002, &not_executable, dir.path());
    supervisor.add_instance(cfg).unwrap();
    let err = supervisor.start(100002).await.unwrap_err();
    assert_eq!(err.get("reason"), Some("permission_denied"));
    assert_eq!(supervisor.snapshot(100002).unwrap().phase, Phase::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_limit_stops_a_flapping_bot() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(SupervisorSettings {
        restart_policy: RestartPolicy {
            max_restarts: 2,
            window_secs: 600,
        },
        ..settings()
    });
    let script = r#"echo "QR:X"; echo "quick login failed: kicked"; exec sleep 30"#;
    supervisor
        .add_instance(fake_bot(100001, dir.path(), script))
        .unwrap();
    let mut events = supervisor.subscribe();

    supervisor.start(100001).await.unwrap();
    let notice = next_notice(&mut events, 100001, |n| {
        matches!(n, Notice::RestartLimitReached { .. })
    })
    .await;
    assert_eq!(notice, Notice::RestartLimitReached { restarts: 2 });

    let stopped = wait_phase(&supervisor, 100001, Phase::Stopped).await;
    assert_eq!(stopped.restart_count, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exits_are_classified_by_phase() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(settings());
    supervisor
        .add_instance(fake_bot(100001, dir.path(), "exit 1"))
        .unwrap();
    supervisor
        .add_instance(fake_bot(
            100002,
            dir.path(),
            r#"echo "login success $2"; exit 3"#,
        ))
        .unwrap();
    let mut events = supervisor.subscribe();

    supervisor.start(100001).await.unwrap();
    let notice = next_notice(&mut events, 100001, |n| {
        matches!(n, Notice::StartFailed { .. })
    })
    .await;
    assert_eq!(notice, Notice::StartFailed { code: Some(1) });
    wait_phase(&supervisor, 100001, Phase::Stopped).await;

    supervisor.start(100002).await.unwrap();
    let notice = next_notice(&mut events, 100002, |n| {
        matches!(n, Notice::UnexpectedExit { .. })
    })
    .await;
    assert_eq!(notice, Notice::UnexpectedExit { code: Some(3) });
    wait_phase(&supervisor, 100002, Phase::Stopped).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_follow_output_order() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(settings());
    let script = r#"
printf '\033[32mhello\033[0m\n'
echo "oops" >&2
echo "QR:FIRST"
echo "QR:SECOND"
while [ ! -f "$GO" ]; do sleep 0.1; done
echo "登录成功 账号 $2"
exec sleep 30
"#;
    supervisor
        .add_instance(fake_bot(100001, dir.path(), script))
        .unwrap();
    let mut events = supervisor.subscribe();

    supervisor.start(100001).await.unwrap();
    let waiting = wait_snapshot(&supervisor, 100001, |s| {
        s.last_qr_payload.as_deref() == Some("SECOND")
    })
    .await;
    assert_eq!(waiting.phase, Phase::AwaitingLogin);
    assert_eq!(
        supervisor.recent_output(100001).unwrap(),
        vec!["hello", "oops", "QR:FIRST", "QR:SECOND"]
    );

    std::fs::write(dir.path().join("go-100001"), "").unwrap();
    wait_phase(&supervisor, 100001, Phase::Running).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.instance_id() != 100001 {
            continue;
        }
        match event {
            SupervisorEvent::Lifecycle { event, .. } => seen.push(format!("{event:?}")),
            SupervisorEvent::PhaseChanged { to, .. } => seen.push(format!("-> {to}")),
            _ => {}
        }
    }
    assert_eq!(
        seen,
        vec![
            "-> starting".to_string(),
            format!(
                "{:?}",
                LifecycleEvent::QrChallenge {
                    payload: "FIRST".to_string()
                }
            ),
            "-> awaiting_login".to_string(),
            format!(
                "{:?}",
                LifecycleEvent::QrChallenge {
                    payload: "SECOND".to_string()
                }
            ),
            format!("{:?}", LifecycleEvent::LoginSuccess { account_id: 100001 }),
            "-> running".to_string(),
        ]
    );

    supervisor.reboot(100001).await.unwrap();
    // Reboot is an operator start: history starts over.
    let _ = wait_phase(&supervisor, 100001, Phase::Running).await;
    let history = supervisor.recent_output(100001).unwrap();
    assert_eq!(history.iter().filter(|line| *line == "hello").count(), 1);
    supervisor.stop(100001).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_restart_reboots_the_bot() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(settings());
    let mut cfg = fake_bot(100001, dir.path(), LOGS_IN);
    cfg.auto_restart.enable = true;
    cfg.auto_restart.interval = Interval::parse("1s").unwrap();
    supervisor.add_instance(cfg).unwrap();
    let mut events = supervisor.subscribe();

    supervisor.start(100001).await.unwrap();
    let first = wait_phase(&supervisor, 100001, Phase::Running).await;

    next_notice(&mut events, 100001, |n| *n == Notice::ScheduledRestart).await;
    let second = wait_snapshot(&supervisor, 100001, |s| {
        s.phase == Phase::Running && s.pid != first.pid
    })
    .await;
    assert_eq!(second.restart_count, 0);

    supervisor.stop(100001).await.unwrap();
    assert_eq!(supervisor.snapshot(100001).unwrap().phase, Phase::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_while_starting_kills_the_bot() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(settings());
    supervisor
        .add_instance(fake_bot(100001, dir.path(), "exec sleep 30"))
        .unwrap();

    supervisor.start(100001).await.unwrap();
    let starting = supervisor.snapshot(100001).unwrap();
    assert_eq!(starting.phase, Phase::Starting);
    let pid = starting.pid.unwrap();

    supervisor.stop(100001).await.unwrap();
    let stopped = supervisor.snapshot(100001).unwrap();
    assert_eq!(stopped.phase, Phase::Stopped);
    assert_eq!(stopped.pid, None);
    assert!(!pid_alive(pid));

    // Reboot from Stopped is a plain start.
    supervisor.reboot(100001).await.unwrap();
    assert_eq!(supervisor.snapshot(100001).unwrap().phase, Phase::Starting);
    supervisor.stop(100001).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn awaiting_login_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(settings());
    let cfg = fake_bot(100001, dir.path(), r#"echo "QR:WAITING"; exec sleep 30"#);
    supervisor.add_instance(cfg.clone()).unwrap();

    supervisor.start(100001).await.unwrap();
    wait_phase(&supervisor, 100001, Phase::AwaitingLogin).await;

    let err = supervisor.update_config(100001, cfg).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceBusy);
    let err = supervisor.delete_instance(100001).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceBusy);

    supervisor.stop(100001).await.unwrap();
    supervisor.delete_instance(100001).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn far_off_schedules_stay_managed() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(settings());

    let mut huge = fake_bot(100001, dir.path(), LOGS_IN);
    huge.auto_restart.enable = true;
    huge.auto_restart.interval = Interval::parse("9999999999999999d").unwrap();
    huge.auto_restart.jitter_secs = 10;
    let err = supervisor.add_instance(huge.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    let mut yearly = huge.clone();
    yearly.auto_restart.interval = Interval::parse("365d").unwrap();
    yearly.auto_restart.jitter_secs = 3600;
    supervisor.add_instance(yearly).unwrap();
    let err = supervisor.update_config(100001, huge).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    supervisor.start(100001).await.unwrap();
    let running = wait_phase(&supervisor, 100001, Phase::Running).await;
    let pid = running.pid.unwrap();

    supervisor.stop(100001).await.unwrap();
    assert!(!pid_alive(pid));
    supervisor.delete_instance(100001).await.unwrap();
    assert!(supervisor.check_global_update_allowed().is_ok());
}
