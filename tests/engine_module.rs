use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use taskbridge::dispatch::{Coordinator, ParticipantRegistry};
use taskbridge::engine::{Engine, EngineError, ProcessDefinition, RunState, StepDef};
use taskbridge::participant::{
    InflightTable, Participant, QueueProxy, SubprocessParticipant, TimeoutPolicy,
};
use taskbridge::transport::QueueTransport;
use tempfile::tempdir;

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

fn step(participant: &str) -> StepDef {
    StepDef {
        participant: participant.to_string(),
        params: BTreeMap::new(),
    }
}

fn echo_harness() -> (Arc<Coordinator>, Arc<Engine>) {
    let mut registry = ParticipantRegistry::default();
    registry
        .register("fake1".to_string(), Participant::Echo)
        .expect("register");
    let coordinator = Arc::new(Coordinator::new(
        registry,
        Arc::new(InflightTable::default()),
    ));
    let engine = Arc::new(Engine::new(Arc::clone(&coordinator)));
    (coordinator, engine)
}

#[test]
fn echo_definition_completes_with_initial_fields() {
    let (coordinator, engine) = echo_harness();
    let definition = ProcessDefinition {
        name: "greet".to_string(),
        steps: vec![step("fake1")],
    };
    let mut fields = Map::new();
    fields.insert("message".to_string(), json!("hello"));

    let id = engine.launch(definition, fields).expect("launch");
    assert!(id.starts_with("wf-"));

    let result = engine
        .wait_result(&id, Duration::from_secs(5))
        .expect("result");
    assert_eq!(result.field_str("message"), Some("hello"));
    assert_eq!(result.instance_id, id);
    assert!(matches!(
        engine.run_state(&id),
        Some(RunState::Completed(_))
    ));

    coordinator.shutdown();
    coordinator.join();
    engine.join();
}

#[test]
fn fields_flow_from_one_step_to_the_next() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("branch-worker");
    write_script(
        &bin,
        "#!/bin/sh\nIN=$(cat)\nOUT=$(printf '%s' \"$IN\" | sed 's/\"user\":\"vasya\"/\"user\":\"vasya\",\"branch\":\"main\"/')\necho \"~~~WORKITEM~~~$OUT\"\n",
    );

    let mut registry = ParticipantRegistry::default();
    registry
        .register("fake1".to_string(), Participant::Echo)
        .expect("register");
    registry
        .register(
            "branch_repo".to_string(),
            Participant::Subprocess(SubprocessParticipant::new(
                bin.display().to_string(),
                Duration::from_secs(5),
                TimeoutPolicy::Fallback,
            )),
        )
        .expect("register");
    let coordinator = Arc::new(Coordinator::new(
        registry,
        Arc::new(InflightTable::default()),
    ));
    let engine = Arc::new(Engine::new(Arc::clone(&coordinator)));

    let definition = ProcessDefinition {
        name: "branch_flow".to_string(),
        steps: vec![step("branch_repo"), step("fake1")],
    };
    let mut fields = Map::new();
    fields.insert("repo".to_string(), json!("test_repo"));
    fields.insert("user".to_string(), json!("vasya"));

    let id = engine.launch(definition, fields).expect("launch");
    let result = engine
        .wait_result(&id, Duration::from_secs(10))
        .expect("result");
    assert_eq!(result.field_str("repo"), Some("test_repo"));
    assert_eq!(result.field_str("user"), Some("vasya"));
    assert_eq!(result.field_str("branch"), Some("main"));
    assert_eq!(result.step_id, "1");

    coordinator.shutdown();
    coordinator.join();
    engine.join();
}

#[test]
fn launch_is_refused_once_the_dispatcher_stops() {
    let (coordinator, engine) = echo_harness();
    coordinator.shutdown();

    let err = engine
        .launch(
            ProcessDefinition {
                name: "late".to_string(),
                steps: vec![step("fake1")],
            },
            Map::new(),
        )
        .expect_err("stopped engine refuses launches");
    assert!(matches!(err, EngineError::NotAccepting { .. }));

    coordinator.join();
    engine.join();
}

#[test]
fn definitions_naming_unknown_participants_are_rejected() {
    let (coordinator, engine) = echo_harness();
    let err = engine
        .launch(
            ProcessDefinition {
                name: "ghostly".to_string(),
                steps: vec![step("ghost")],
            },
            Map::new(),
        )
        .expect_err("unknown participant");
    match err {
        EngineError::UnknownParticipant { definition, name } => {
            assert_eq!(definition, "ghostly");
            assert_eq!(name, "ghost");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    coordinator.shutdown();
    coordinator.join();
    engine.join();
}

#[test]
fn queue_steps_are_abandoned_when_the_dispatcher_stops() {
    let transport = Arc::new(QueueTransport::memory());
    let inflight = Arc::new(InflightTable::default());
    let mut registry = ParticipantRegistry::default();
    registry
        .register(
            "hardworker".to_string(),
            Participant::QueueProxy(QueueProxy::new(
                "taskqueue".to_string(),
                Arc::clone(&transport),
                Arc::clone(&inflight),
            )),
        )
        .expect("register");
    let coordinator = Arc::new(Coordinator::new(registry, Arc::clone(&inflight)));
    let engine = Arc::new(Engine::new(Arc::clone(&coordinator)));

    let id = engine
        .launch(
            ProcessDefinition {
                name: "stuck".to_string(),
                steps: vec![step("hardworker")],
            },
            Map::new(),
        )
        .expect("launch");

    let queued = transport
        .receive("taskqueue", Duration::from_secs(2))
        .expect("receive");
    assert!(queued.is_some());

    coordinator.shutdown();
    engine.join();
    match engine.run_state(&id) {
        Some(RunState::Abandoned { step_id }) => assert_eq!(step_id, "0"),
        other => panic!("unexpected state: {other:?}"),
    }
    assert_eq!(engine.wait_result(&id, Duration::from_millis(50)), None);

    coordinator.join();
}
