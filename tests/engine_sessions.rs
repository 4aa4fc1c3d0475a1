#![cfg(unix)]

use asm_engine::executor::{CANCELLED_MESSAGE, TERMINAL_CLOSED_MESSAGE, TERMINAL_OPENED_MESSAGE};
use asm_engine::harness::terminal::TerminalCandidate;
use asm_engine::history::{HistoryDocument, OperationSamples};
use asm_engine::privilege::escalation_unavailable_message;
use asm_engine::{
    CommandSpec, ExecutionEvent, ExecutionSession, ExecutorOptions, FixedProbe, HistoryStore, JsonFileStore,
    MemoryStore, OperationKey, Outcome, SessionContext, SessionState,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn context(store: Arc<dyn HistoryStore>, probe: FixedProbe) -> SessionContext {
    SessionContext::new(store, Arc::new(probe), ExecutorOptions::default())
}

fn shell(script: &str) -> CommandSpec {
    CommandSpec::new(["sh", "-c", script])
}

fn percents(events: &[ExecutionEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect()
}

fn line_count(events: &[ExecutionEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ExecutionEvent::LineReceived { .. }))
        .count()
}

fn terminal(events: &[ExecutionEvent]) -> (Outcome, String) {
    assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
    match events.last() {
        Some(ExecutionEvent::Terminated { outcome, message }) => (*outcome, message.clone()),
        other => panic!("stream must end with Terminated, got {:?}", other),
    }
}

#[tokio::test]
async fn first_run_streams_lines_with_rising_progress_and_records_a_sample() {
    let store = Arc::new(MemoryStore::new());
    let spec = shell("for i in $(seq 1 25); do echo \"line $i\"; sleep 0.08; done");
    let key = spec.operation_key();
    let events = ExecutionSession::new(spec, context(store.clone(), FixedProbe::bare()))
        .start()
        .collect()
        .await;

    assert_eq!(events.first(), Some(&ExecutionEvent::Indeterminate { active: true }));
    let cleared = events
        .iter()
        .position(|event| *event == ExecutionEvent::Indeterminate { active: false })
        .expect("indeterminate cleared");
    let first_line = events
        .iter()
        .position(|event| matches!(event, ExecutionEvent::LineReceived { .. }))
        .expect("lines");
    assert!(cleared < first_line);
    assert!(events.contains(&ExecutionEvent::status("Running: sh -c for i in $(seq 1 25); do echo \"line $i\"; sleep 0.08; done...")));

    assert_eq!(line_count(&events), 25);
    let percents = percents(&events);
    assert_eq!(percents.len(), 25);
    assert!(percents.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(percents.iter().all(|percent| *percent <= 99));

    let (outcome, message) = terminal(&events);
    assert_eq!(outcome, Outcome::Succeeded);
    assert_eq!(message, "Completed successfully");

    let document = store.document();
    let samples = document.get(&key).expect("recorded");
    assert_eq!(samples.lines, vec![25]);
    assert_eq!(samples.durations.len(), 1);
    assert!(samples.durations[0] >= 1.5);
}

#[tokio::test]
async fn known_operation_skips_indeterminate_and_caps_at_99() {
    let spec = shell("for i in $(seq 1 12); do echo $i; done");
    let mut document = HistoryDocument::new();
    let mut samples = OperationSamples::default();
    samples.push(6, 0.2);
    document.insert(spec.operation_key(), samples);
    let store = Arc::new(MemoryStore::with_document(document));

    let events = ExecutionSession::new(spec.clone(), context(store.clone(), FixedProbe::bare()))
        .start()
        .collect()
        .await;

    assert!(!events
        .iter()
        .any(|event| matches!(event, ExecutionEvent::Indeterminate { .. })));
    let percents = percents(&events);
    assert_eq!(percents.last(), Some(&99));
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(terminal(&events).0, Outcome::Succeeded);
    assert_eq!(store.document()[&spec.operation_key()].lines, vec![6, 12]);
}

#[tokio::test]
async fn missing_program_terminates_once_with_not_found() {
    let store = Arc::new(MemoryStore::new());
    let events = ExecutionSession::new(
        CommandSpec::new(["asm-engine-test-missing", "-S", "pkg"]),
        context(store.clone(), FixedProbe::bare()),
    )
    .start()
    .collect()
    .await;

    assert_eq!(
        events,
        vec![ExecutionEvent::terminated(
            Outcome::NotFound,
            "Command not found: asm-engine-test-missing"
        )]
    );
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn non_zero_exit_reports_code_and_tail_and_records_once() {
    let store = Arc::new(MemoryStore::new());
    let spec = shell("echo 'resolving dependencies...'; echo 'error: target not found: nope' >&2; exit 1");
    let events = ExecutionSession::new(spec.clone(), context(store.clone(), FixedProbe::bare()))
        .start()
        .collect()
        .await;

    assert_eq!(line_count(&events), 2);
    let (outcome, message) = terminal(&events);
    assert_eq!(outcome, Outcome::Failed { exit_code: Some(1) });
    assert!(message.starts_with("Exited with code 1"));
    assert!(message.contains("error: target not found: nope"));
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.document()[&spec.operation_key()].lines, vec![2]);
}

#[tokio::test]
async fn wrapped_missing_command_maps_to_not_found() {
    let store = Arc::new(MemoryStore::new());
    let events = ExecutionSession::new(
        shell("echo 'sh: 1: yay: command not found'; exit 127"),
        context(store.clone(), FixedProbe::bare()),
    )
    .start()
    .collect()
    .await;

    assert_eq!(terminal(&events).0, Outcome::NotFound);
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn ansi_sequences_are_stripped_from_lines() {
    let store = Arc::new(MemoryStore::new());
    let events = ExecutionSession::new(
        shell("printf '\\033[1;34m::\\033[0m Synchronizing\\n'"),
        context(store, FixedProbe::bare()),
    )
    .start()
    .collect()
    .await;

    assert!(events.contains(&ExecutionEvent::LineReceived {
        text: ":: Synchronizing".to_string()
    }));
}

#[tokio::test]
async fn cancel_kills_the_process_and_skips_history() {
    let store = Arc::new(MemoryStore::new());
    let mut handle = ExecutionSession::new(
        shell("echo started; sleep 30; echo never"),
        context(store.clone(), FixedProbe::bare()),
    )
    .start();
    let started = Instant::now();

    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        let first_line = matches!(event, ExecutionEvent::LineReceived { .. });
        events.push(event);
        if first_line {
            handle.cancel();
            handle.cancel();
        }
    }

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(events.contains(&ExecutionEvent::status("Cancelling...")));
    assert_eq!(terminal(&events), (Outcome::Cancelled, CANCELLED_MESSAGE.to_string()));
    assert!(!events.contains(&ExecutionEvent::LineReceived {
        text: "never".to_string()
    }));
    assert_eq!(handle.state(), SessionState::Cancelled);
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn cancel_before_first_event_still_terminates() {
    let store = Arc::new(MemoryStore::new());
    let handle = ExecutionSession::new(shell("sleep 30"), context(store.clone(), FixedProbe::bare())).start();
    handle.cancel();
    let events = tokio::time::timeout(Duration::from_secs(10), handle.collect())
        .await
        .expect("cancelled in time");
    assert_eq!(terminal(&events).0, Outcome::Cancelled);
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn degraded_helper_failure_explains_missing_escalation() {
    let store = Arc::new(MemoryStore::new());
    let spec = shell("echo 'error: you cannot perform this operation unless you are root.'; exit 1")
        .privileged()
        .interactive_helper();
    let events = ExecutionSession::new(spec, context(store, FixedProbe::bare()))
        .start()
        .collect()
        .await;

    let (outcome, message) = terminal(&events);
    assert_eq!(outcome, Outcome::Failed { exit_code: Some(1) });
    assert!(message.starts_with(escalation_unavailable_message()));
    assert!(message.contains("Exited with code 1"));
}

#[tokio::test]
async fn visible_terminal_reports_optimistic_success_without_history() {
    let store = Arc::new(MemoryStore::new());
    // `sh -c 'exit 0' <name> bash -c <script>` stands in for a terminal window
    // that the user closes straight away.
    let probe = FixedProbe {
        agent: None,
        terminal: Some(TerminalCandidate::new("sh", &["-c", "exit 0", "fake-terminal"])),
    };
    let spec = CommandSpec::new(["true"]).privileged().interactive_helper();
    let events = ExecutionSession::new(spec, context(store.clone(), probe))
        .start()
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            ExecutionEvent::status(TERMINAL_OPENED_MESSAGE),
            ExecutionEvent::terminated(Outcome::Succeeded, TERMINAL_CLOSED_MESSAGE),
        ]
    );
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn unlaunchable_terminal_fails_with_escalation_message() {
    let store = Arc::new(MemoryStore::new());
    let probe = FixedProbe {
        agent: None,
        terminal: Some(TerminalCandidate::new("asm-engine-test-no-terminal", &["-e"])),
    };
    let spec = CommandSpec::new(["true"]).privileged().interactive_helper();
    let events = ExecutionSession::new(spec, context(store.clone(), probe))
        .start()
        .collect()
        .await;

    let (outcome, message) = terminal(&events);
    assert_eq!(outcome, Outcome::Failed { exit_code: None });
    assert!(message.starts_with(escalation_unavailable_message()));
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn history_file_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("eta_history.json");
    let spec = shell("echo one; echo two; echo three");

    let store: Arc<dyn HistoryStore> = Arc::new(JsonFileStore::new(path.clone()));
    let events = ExecutionSession::new(spec.clone(), context(store, FixedProbe::bare()))
        .start()
        .collect()
        .await;
    assert_eq!(terminal(&events).0, Outcome::Succeeded);

    let reopened = JsonFileStore::new(path).load().expect("load");
    assert_eq!(reopened[&OperationKey::from("sh_-c")].lines, vec![3]);
    assert_eq!(spec.operation_key(), OperationKey::from("sh_-c"));
}

#[tokio::test]
async fn concurrent_sessions_of_one_kind_keep_every_sample() {
    let store = Arc::new(MemoryStore::new());
    let context = context(store.clone(), FixedProbe::bare());
    let mut handles = Vec::new();
    for index in 1..=4 {
        let script = format!("for i in $(seq 1 {}); do echo $i; done", index);
        handles.push(ExecutionSession::new(shell(&script), context.clone()).start());
    }
    for handle in handles {
        let events = handle.collect().await;
        assert_eq!(terminal(&events).0, Outcome::Succeeded);
    }

    let mut lines: Vec<u32> = store.document()[&OperationKey::from("sh_-c")]
        .lines
        .iter()
        .copied()
        .collect();
    lines.sort_unstable();
    assert_eq!(lines, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn silent_start_clears_indeterminate_after_the_grace_period() {
    let store = Arc::new(MemoryStore::new());
    let options = ExecutorOptions {
        indeterminate_grace: Duration::from_millis(200),
        ..ExecutorOptions::default()
    };
    let context = SessionContext::new(store, Arc::new(FixedProbe::bare()), options);
    let mut handle = ExecutionSession::new(shell("sleep 1; echo late"), context).start();
    let started = Instant::now();

    let mut timeline = Vec::new();
    while let Some(event) = handle.next_event().await {
        timeline.push((started.elapsed(), event));
    }

    let (cleared_at, cleared_index) = timeline
        .iter()
        .enumerate()
        .find(|(_, (_, event))| *event == ExecutionEvent::Indeterminate { active: false })
        .map(|(index, (at, _))| (*at, index))
        .expect("indeterminate cleared");
    let (line_at, line_index) = timeline
        .iter()
        .enumerate()
        .find(|(_, (_, event))| matches!(event, ExecutionEvent::LineReceived { .. }))
        .map(|(index, (at, _))| (*at, index))
        .expect("late line");

    assert!(cleared_index < line_index);
    assert!(cleared_at >= Duration::from_millis(150));
    assert!(cleared_at < Duration::from_millis(700));
    assert!(line_at >= Duration::from_millis(900));

    let events: Vec<ExecutionEvent> = timeline.into_iter().map(|(_, event)| event).collect();
    assert_eq!(terminal(&events).0, Outcome::Succeeded);
}

#[tokio::test]
async fn cancel_after_exit_keeps_the_exit_outcome() {
    let store = Arc::new(MemoryStore::new());
    // The background subshell keeps the output pipe open after `sh` exits.
    let mut handle = ExecutionSession::new(
        shell("echo done; (sleep 3; echo background) & exit 0"),
        context(store.clone(), FixedProbe::bare()),
    )
    .start();
    let started = Instant::now();

    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        let first_line = matches!(event, ExecutionEvent::LineReceived { .. });
        events.push(event);
        if first_line {
            tokio::time::sleep(Duration::from_millis(500)).await;
            handle.cancel();
        }
    }

    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert!(!events.contains(&ExecutionEvent::status("Cancelling...")));
    assert!(!events.contains(&ExecutionEvent::LineReceived {
        text: "background".to_string()
    }));
    assert_eq!(
        terminal(&events),
        (Outcome::Succeeded, "Completed successfully".to_string())
    );
    assert_eq!(handle.state(), SessionState::Succeeded);
    assert_eq!(store.save_count(), 1);
}
