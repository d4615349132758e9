mod common;

use common::{Counters, FakePorts, Reply, ScriptedSource};
use oledlink_core::{
    BridgeEvent, BridgeService, BridgeSettings, BridgeState, ConfigError, DecodePolicy, RunOutcome,
    ServiceError, Severity,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FALLBACK: &str = "0C;0C;0.00;$";

fn settings(interval_ms: u64) -> BridgeSettings {
    BridgeSettings {
        interval: Duration::from_millis(interval_ms),
        poll_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

fn service(ports: FakePorts, source: ScriptedSource, settings: BridgeSettings) -> BridgeService {
    BridgeService::new(ports, source, settings).unwrap()
}

fn drain(service: &BridgeService) -> Vec<BridgeEvent> {
    service.events().try_iter().collect()
}

fn statuses(events: &[BridgeEvent], severity: Severity) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, BridgeEvent::Status { severity: s, .. } if *s == severity))
        .count()
}

#[test]
fn missing_channel_is_rejected_without_touching_the_port() {
    let counters = Arc::new(Counters::default());
    let source = ScriptedSource::new(&counters, &[], Reply::Data("1;2;3"));
    let mut service = service(FakePorts::new(&counters), source, settings(150));

    assert_eq!(service.start(None), Err(ConfigError::NoChannelSelected));
    assert_eq!(service.start(Some("")), Err(ConfigError::NoChannelSelected));
    assert_eq!(service.start(Some("   ")), Err(ConfigError::NoChannelSelected));

    assert!(service.active_run().is_none());
    assert!(service.wait().is_none());
    assert_eq!(counters.opens(), 0);
    assert_eq!(counters.writes(), 0);
    assert_eq!(counters.closes(), 0);
    assert_eq!(counters.polls(), 0);
    assert!(drain(&service).is_empty());
}

#[test]
fn no_data_on_first_cycle_sends_one_fallback_and_stops() {
    let counters = Arc::new(Counters::default());
    let source = ScriptedSource::new(&counters, &[], Reply::NoData);
    let mut service = service(FakePorts::new(&counters), source, settings(150));

    service.start(Some("COM3")).unwrap();
    assert_eq!(service.wait(), Some(RunOutcome::SourceUnavailable));

    assert_eq!(counters.lines(), vec![FALLBACK.to_string()]);
    assert_eq!(counters.polls(), 1);
    assert_eq!(counters.closes(), 1);

    let events = drain(&service);
    assert_eq!(statuses(&events, Severity::Critical), 1);
    assert_eq!(events.last(), Some(&BridgeEvent::Finished(RunOutcome::SourceUnavailable)));
    assert!(events.contains(&BridgeEvent::StateChanged(BridgeState::Faulted)));
}

#[test]
fn write_failure_after_n_cycles_closes_once() {
    let counters = Arc::new(Counters::default());
    let source = ScriptedSource::new(&counters, &[], Reply::Data("45.20;51.80;87.49;"));
    let mut ports = FakePorts::new(&counters);
    ports.fail_write_after = Some(3);
    let mut service = service(ports, source, settings(150));

    service.start(Some("/dev/ttyUSB0")).unwrap();
    let outcome = service.wait().unwrap();
    assert!(matches!(outcome, RunOutcome::WriteFailed(_)), "{outcome:?}");

    assert_eq!(counters.lines(), vec!["45C;52C;87.49;$".to_string(); 3]);
    assert_eq!(counters.writes(), 4);
    assert_eq!(counters.closes(), 1);
    assert_eq!(counters.polls(), 4);

    let events = drain(&service);
    assert_eq!(statuses(&events, Severity::Critical), 1);
    assert_eq!(statuses(&events, Severity::Recoverable), 0);

    let states: Vec<BridgeState> = events
        .iter()
        .filter_map(|e| match e {
            BridgeEvent::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            BridgeState::Connecting,
            BridgeState::Running,
            BridgeState::Stopping,
            BridgeState::Faulted,
        ]
    );
    let sent = events.iter().filter(|e| matches!(e, BridgeEvent::LineSent(_))).count();
    assert_eq!(sent, 3);
    assert!(matches!(events.last(), Some(BridgeEvent::Finished(RunOutcome::WriteFailed(_)))));
}

#[test]
fn malformed_snapshot_sends_fallback_and_keeps_running() {
    let counters = Arc::new(Counters::default());
    let script = [
        Reply::Data("30;35;12.3"),
        Reply::Data("garbage;;"),
        Reply::Data("1;2;3;"),
    ];
    let source = ScriptedSource::new(&counters, &script, Reply::NoData);
    let mut service = service(FakePorts::new(&counters), source, settings(120));

    service.start(Some("COM3")).unwrap();
    assert_eq!(service.wait(), Some(RunOutcome::SourceUnavailable));

    assert_eq!(
        counters.lines(),
        vec![
            "30C;35C;12.30;$".to_string(),
            FALLBACK.to_string(),
            "1C;2C;3.00;$".to_string(),
            FALLBACK.to_string(),
        ]
    );
    let events = drain(&service);
    assert_eq!(statuses(&events, Severity::Recoverable), 1);
    assert_eq!(statuses(&events, Severity::Critical), 1);
}

#[test]
fn strict_decode_policy_ends_the_run_without_writing() {
    let counters = Arc::new(Counters::default());
    let source = ScriptedSource::new(&counters, &[Reply::Data("12;abc;3")], Reply::Data("1;2;3"));
    let mut settings = settings(150);
    settings.decode_policy = DecodePolicy::Stop;
    let mut service = service(FakePorts::new(&counters), source, settings);

    service.start(Some("COM3")).unwrap();
    let outcome = service.wait().unwrap();

    assert!(matches!(outcome, RunOutcome::DecodeFailed(_)), "{outcome:?}");
    assert!(outcome.is_fault());
    assert!(counters.lines().is_empty());
    assert_eq!(counters.polls(), 1);
    assert_eq!(counters.closes(), 1);
}

#[test]
fn open_failure_is_critical_and_terminal() {
    let counters = Arc::new(Counters::default());
    let source = ScriptedSource::new(&counters, &[], Reply::Data("1;2;3"));
    let mut ports = FakePorts::new(&counters);
    ports.fail_open = true;
    let mut service = service(ports, source, settings(150));

    service.start(Some("COM9")).unwrap();
    let outcome = service.wait().unwrap();

    assert!(matches!(outcome, RunOutcome::OpenFailed(_)), "{outcome:?}");
    assert_eq!(counters.opens(), 1);
    assert_eq!(counters.polls(), 0);
    assert_eq!(counters.writes(), 0);
    assert_eq!(counters.closes(), 0);

    let events = drain(&service);
    assert_eq!(
        events.first(),
        Some(&BridgeEvent::StateChanged(BridgeState::Connecting))
    );
    assert!(!events.contains(&BridgeEvent::StateChanged(BridgeState::Running)));
    assert!(events.contains(&BridgeEvent::StateChanged(BridgeState::Faulted)));
    assert_eq!(statuses(&events, Severity::Critical), 1);
}

#[test]
fn stop_interrupts_the_sleep_before_the_next_poll() {
    let counters = Arc::new(Counters::default());
    let source = ScriptedSource::new(&counters, &[], Reply::Data("40;50;60"));
    let mut service = service(FakePorts::new(&counters), source, settings(5_000));

    let handle = service.start(Some("COM3")).unwrap();
    assert_eq!(service.active_run(), Some(handle));

    // first line is written right away, then the worker sleeps for 5s
    let first_line = service
        .events()
        .iter()
        .find(|e| matches!(e, BridgeEvent::LineSent(_)));
    assert!(first_line.is_some());

    let asked = Instant::now();
    service.stop(handle);
    assert_eq!(service.wait(), Some(RunOutcome::Cancelled));
    assert!(asked.elapsed() < Duration::from_secs(2));

    assert_eq!(counters.polls(), 1);
    assert_eq!(counters.lines(), vec!["40C;50C;60.00;$".to_string()]);
    assert_eq!(counters.closes(), 1);

    let events = drain(&service);
    assert!(events.contains(&BridgeEvent::StateChanged(BridgeState::Stopped)));
    assert_eq!(events.last(), Some(&BridgeEvent::Finished(RunOutcome::Cancelled)));
    assert_eq!(statuses(&events, Severity::Critical), 0);
}

#[test]
fn stale_handle_does_not_stop_the_current_run() {
    let counters = Arc::new(Counters::default());
    let source = ScriptedSource::new(&counters, &[], Reply::Data("40;50;60"));
    let mut service = service(FakePorts::new(&counters), source, settings(5_000));

    let first = service.start(Some("COM3")).unwrap();
    let second = service.start(Some("COM4")).unwrap();
    assert_ne!(first, second);
    assert_eq!(second.id(), first.id() + 1);

    service.stop(first);
    std::thread::sleep(Duration::from_millis(200));
    assert!(service.is_running());

    service.stop(second);
    assert_eq!(service.wait(), Some(RunOutcome::Cancelled));
}

#[test]
fn starting_again_stops_the_previous_run_first() {
    let counters = Arc::new(Counters::default());
    let source = ScriptedSource::new(&counters, &[], Reply::Data("40;50;60"));
    let mut service = service(FakePorts::new(&counters), source, settings(5_000));

    service.start(Some("COM3")).unwrap();
    let second = service.start(Some("COM4")).unwrap();

    // the first run was joined before the second opened its port
    assert_eq!(counters.closes(), 1);
    service.stop(second);
    assert_eq!(service.wait(), Some(RunOutcome::Cancelled));

    assert_eq!(counters.opens(), 2);
    assert_eq!(counters.closes(), 2);
    assert_eq!(*counters.opened_ports.lock(), vec!["COM3".to_string(), "COM4".to_string()]);

    let events = drain(&service);
    let finished: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, BridgeEvent::Finished(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(finished.len(), 2);
    let second_connecting = events
        .iter()
        .rposition(|e| *e == BridgeEvent::StateChanged(BridgeState::Connecting))
        .unwrap();
    assert!(finished[0] < second_connecting);
}

#[test]
fn dropping_the_service_releases_the_port() {
    let counters = Arc::new(Counters::default());
    let source = ScriptedSource::new(&counters, &[], Reply::Data("40;50;60"));
    let mut service = service(FakePorts::new(&counters), source, settings(5_000));

    service.start(Some("COM3")).unwrap();
    drop(service);
    assert_eq!(counters.closes(), 1);
}

#[test]
fn invalid_settings_are_rejected() {
    let counters = Arc::new(Counters::default());
    let mut bad = settings(100);
    bad.poll_timeout = Duration::from_millis(100);
    let result = BridgeService::new(
        FakePorts::new(&counters),
        ScriptedSource::new(&counters, &[], Reply::NoData),
        bad,
    );
    assert!(matches!(result, Err(ServiceError::Config(ConfigError::Invalid(_)))));
}
