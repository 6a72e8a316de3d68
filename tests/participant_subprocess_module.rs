use serde_json::json;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use taskbridge::participant::{ParticipantError, SubprocessParticipant, TimeoutPolicy};
use taskbridge::workitem::Workitem;
use tempfile::tempdir;

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

fn branch_workitem() -> Workitem {
    let mut fields = serde_json::Map::new();
    fields.insert("repo".to_string(), json!("test_repo"));
    fields.insert("user".to_string(), json!("vasya"));
    let mut workitem = Workitem::new("I1", fields);
    workitem.participant_name = "branch_repo".to_string();
    workitem.step_id = "0".to_string();
    workitem
}

fn participant(program: &Path, timeout_ms: u64, policy: TimeoutPolicy) -> SubprocessParticipant {
    SubprocessParticipant::new(
        program.display().to_string(),
        Duration::from_millis(timeout_ms),
        policy,
    )
}

#[test]
fn marker_payload_in_noisy_output_updates_the_workitem() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("branch-worker");
    write_script(
        &bin,
        "#!/bin/sh\nIN=$(cat)\nOUT=$(printf '%s' \"$IN\" | sed 's/\"user\":\"vasya\"/\"user\":\"vasya\",\"branch\":\"main\"/')\necho noise\necho \"~~~WORKITEM~~~$OUT\"\necho more noise\n",
    );

    let input = branch_workitem();
    let reply = participant(&bin, 5_000, TimeoutPolicy::Fallback)
        .consume(&input)
        .expect("consume");

    assert_eq!(reply.instance_id, "I1");
    assert_eq!(reply.field_str("repo"), Some("test_repo"));
    assert_eq!(reply.field_str("user"), Some("vasya"));
    assert_eq!(reply.field_str("branch"), Some("main"));
}

#[test]
fn split_marker_lines_are_joined_before_decoding() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("split-worker");
    write_script(
        &bin,
        "#!/bin/sh\ncat > /dev/null\necho '~~~WORKITEM~~~{\"fields\":'\necho '~~~WORKITEM~~~{\"repo\":1},\"instanceId\":\"I1\"}'\n",
    );

    let input = branch_workitem();
    let reply = participant(&bin, 5_000, TimeoutPolicy::Fallback)
        .consume(&input)
        .expect("consume");

    assert_eq!(reply.fields.get("repo"), Some(&json!(1)));
    assert_eq!(reply.participant_name, "branch_repo");
    assert_eq!(reply.step_id, "0");
}

#[test]
fn output_without_markers_passes_the_workitem_through() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("chatty-worker");
    write_script(&bin, "#!/bin/sh\ncat > /dev/null\necho plain worker chatter\n");

    let input = branch_workitem();
    let reply = participant(&bin, 5_000, TimeoutPolicy::Fallback)
        .consume(&input)
        .expect("consume");
    assert_eq!(reply, input);
}

#[test]
fn malformed_marker_payload_falls_back_to_the_input() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("broken-worker");
    write_script(&bin, "#!/bin/sh\ncat > /dev/null\necho '~~~WORKITEM~~~{not json'\n");

    let input = branch_workitem();
    let reply = participant(&bin, 5_000, TimeoutPolicy::Fallback)
        .consume(&input)
        .expect("consume");
    assert_eq!(reply, input);
}

#[test]
fn missing_worker_program_falls_back_to_the_input() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("not-installed");

    let input = branch_workitem();
    let reply = participant(&bin, 5_000, TimeoutPolicy::Fallback)
        .consume(&input)
        .expect("consume");
    assert_eq!(reply, input);
}

#[test]
fn exit_status_and_stderr_are_not_consulted() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("grumpy-worker");
    write_script(
        &bin,
        "#!/bin/sh\ncat > /dev/null\necho 'something went sideways' >&2\necho '~~~WORKITEM~~~{\"fields\":{\"done\":true},\"instanceId\":\"I1\"}'\nexit 3\n",
    );

    let reply = participant(&bin, 5_000, TimeoutPolicy::Fallback)
        .consume(&branch_workitem())
        .expect("consume");
    assert_eq!(reply.fields.get("done"), Some(&json!(true)));
}

#[test]
fn slow_worker_falls_back_under_the_default_policy() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("sleepy-worker");
    write_script(&bin, "#!/bin/sh\ncat > /dev/null\nsleep 2\n");

    let input = branch_workitem();
    let reply = participant(&bin, 100, TimeoutPolicy::Fallback)
        .consume(&input)
        .expect("consume");
    assert_eq!(reply, input);
}

#[test]
fn slow_worker_errors_under_the_fail_policy() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("sleepy-worker");
    write_script(&bin, "#!/bin/sh\ncat > /dev/null\nsleep 2\n");

    let err = participant(&bin, 100, TimeoutPolicy::Fail)
        .consume(&branch_workitem())
        .expect_err("timeout should surface");
    match err {
        ParticipantError::Timeout {
            participant,
            timeout_ms,
        } => {
            assert_eq!(participant, "branch_repo");
            assert_eq!(timeout_ms, 100);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn reply_for_another_instance_falls_back_to_the_input() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("confused-worker");
    write_script(
        &bin,
        "#!/bin/sh\ncat > /dev/null\necho '~~~WORKITEM~~~{\"fields\":{\"branch\":\"main\"},\"instanceId\":\"OTHER\"}'\n",
    );

    let input = branch_workitem();
    let reply = participant(&bin, 5_000, TimeoutPolicy::Fallback)
        .consume(&input)
        .expect("consume");
    assert_eq!(reply, input);
    assert_eq!(reply.field_str("branch"), None);
}

#[test]
fn reply_moving_the_step_position_falls_back_to_the_input() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("drifting-worker");
    write_script(
        &bin,
        "#!/bin/sh\ncat > /dev/null\necho '~~~WORKITEM~~~{\"fields\":{\"branch\":\"main\"},\"instanceId\":\"I1\",\"stepId\":\"7\"}'\n",
    );

    let input = branch_workitem();
    let reply = participant(&bin, 5_000, TimeoutPolicy::Fallback)
        .consume(&input)
        .expect("consume");
    assert_eq!(reply, input);
    assert_eq!(reply.step_id, "0");
    assert_eq!(reply.field_str("branch"), None);
}

#[test]
fn name_param_is_passed_as_the_program_argument() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("arg-worker");
    write_script(
        &bin,
        "#!/bin/sh\ncat > /dev/null\necho \"~~~WORKITEM~~~{\\\"fields\\\":{\\\"arg\\\":\\\"$1\\\"},\\\"instanceId\\\":\\\"I1\\\"}\"\n",
    );

    let mut input = branch_workitem();
    input.params.insert("name".to_string(), json!("brancher"));
    let reply = participant(&bin, 5_000, TimeoutPolicy::Fallback)
        .consume(&input)
        .expect("consume");
    assert_eq!(reply.field_str("arg"), Some("brancher"));
}
