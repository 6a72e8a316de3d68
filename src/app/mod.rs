use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::config::{self, Settings};
use crate::dispatch::Coordinator;
use crate::engine::{Engine, RunState};
use crate::participant::InflightTable;
use crate::shared::{clear_stop_signal, signal_stop, stop_requested, stop_signal_path};
use crate::worker;
use crate::workitem::Workitem;

const STOP_POLL: Duration = Duration::from_millis(200);

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }
    match args[0].as_str() {
        "run" => cmd_run(&args[1..]),
        "worker" => cmd_worker(&args[1..]),
        "dispatcher" => cmd_dispatcher(&args[1..]),
        "stop" => cmd_stop(&args[1..]),
        "help" | "--help" | "-h" => Ok(help_text()),
        other => Err(format!("unknown command `{other}`")),
    }
}

fn help_text() -> String {
    [
        "taskbridge <command>",
        "",
        "Commands:",
        "  run --config <path> --definition <path>",
        "      launch a process instance and wait for its result",
        "  worker --config <path> --queue <name> --participant <name>",
        "      consume workitems from a queue with the named participant",
        "  dispatcher --config <path>",
        "      route intake workitems to per-type worker queues",
        "  stop --config <path>",
        "      signal local taskbridge processes to stop",
    ]
    .join("\n")
}

fn flag_value(args: &[String], flag: &str) -> Result<String, String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == flag {
            return iter
                .next()
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"));
        }
    }
    Err(format!("missing required flag {flag}"))
}

fn load_settings(args: &[String]) -> Result<Settings, String> {
    let path = flag_value(args, "--config")?;
    let settings = Settings::from_path(Path::new(&path)).map_err(|err| err.to_string())?;
    settings.validate().map_err(|err| err.to_string())?;
    Ok(settings)
}

fn cmd_run(args: &[String]) -> Result<String, String> {
    let settings = load_settings(args)?;
    let definition_path = flag_value(args, "--definition")?;
    let request =
        config::load_launch_request(Path::new(&definition_path)).map_err(|err| err.to_string())?;
    clear_stop_signal(&settings.state_root);

    let transport = Arc::new(settings.build_transport());
    transport.recover().map_err(|err| err.to_string())?;
    let inflight = Arc::new(InflightTable::default());
    let registry = settings
        .build_registry(&transport, &inflight)
        .map_err(|err| err.to_string())?;
    let coordinator = Arc::new(Coordinator::new(registry, Arc::clone(&inflight)));
    coordinator.spawn_receiver(Arc::clone(&transport), &settings.reply_queue);
    let engine = Arc::new(Engine::new(Arc::clone(&coordinator)));

    let outcome = match engine.launch(request.definition, request.fields) {
        Err(err) => Err(err.to_string()),
        Ok(instance_id) => loop {
            if let Some(result) = engine.wait_result(&instance_id, STOP_POLL) {
                break render_completion(&instance_id, result);
            }
            match engine.run_state(&instance_id) {
                Some(RunState::Active) => {}
                Some(RunState::Completed(result)) => break render_completion(&instance_id, result),
                Some(RunState::Abandoned { step_id }) => {
                    break Ok(format!("instance {instance_id} abandoned at step {step_id}"))
                }
                Some(RunState::Failed { step_id, reason }) => {
                    break Err(format!(
                        "instance {instance_id} failed at step {step_id}: {reason}"
                    ))
                }
                None => break Err(format!("instance {instance_id} lost its run record")),
            }
            if stop_requested(&settings.state_root) {
                break Ok(format!("instance {instance_id} interrupted by stop signal"));
            }
        },
    };
    coordinator.shutdown();
    coordinator.join();
    engine.join();
    outcome
}

fn render_completion(instance_id: &str, result: Workitem) -> Result<String, String> {
    let fields =
        serde_json::to_string_pretty(&Value::Object(result.fields)).map_err(|err| err.to_string())?;
    Ok(format!("instance {instance_id} completed\n{fields}"))
}

fn cmd_worker(args: &[String]) -> Result<String, String> {
    let settings = load_settings(args)?;
    let queue = flag_value(args, "--queue")?;
    let participant_name = flag_value(args, "--participant")?;

    let Some(config) = settings.participants.get(&participant_name) else {
        return Err(format!("participant `{participant_name}` is not configured"));
    };
    let instances = config.instances();

    let transport = Arc::new(settings.build_transport());
    transport.recover().map_err(|err| err.to_string())?;
    let inflight = Arc::new(InflightTable::default());
    let participant = Arc::new(config.build(&transport, &inflight));
    if participant.kind() == "queue" {
        return Err(format!(
            "participant `{participant_name}` is a queue proxy and cannot serve a worker loop"
        ));
    }

    clear_stop_signal(&settings.state_root);
    let stop = Arc::new(AtomicBool::new(false));
    let monitor = spawn_stop_monitor(settings.state_root.clone(), Arc::clone(&stop));
    worker::run_worker_pool(
        &transport,
        &queue,
        &participant,
        &settings.reply_queue,
        instances,
        &stop,
    );
    let _ = monitor.join();
    Ok(format!("worker pool for `{participant_name}` stopped"))
}

fn cmd_dispatcher(args: &[String]) -> Result<String, String> {
    let settings = load_settings(args)?;
    let transport = Arc::new(settings.build_transport());
    transport.recover().map_err(|err| err.to_string())?;

    clear_stop_signal(&settings.state_root);
    let stop = Arc::new(AtomicBool::new(false));
    let monitor = spawn_stop_monitor(settings.state_root.clone(), Arc::clone(&stop));
    worker::run_dispatcher(&transport, &settings.dispatch_queue, &stop);
    let _ = monitor.join();
    Ok("dispatcher stopped".to_string())
}

fn cmd_stop(args: &[String]) -> Result<String, String> {
    let settings = load_settings(args)?;
    signal_stop(&settings.state_root).map_err(|err| err.to_string())?;
    Ok(format!(
        "stop signal written to {}",
        stop_signal_path(&settings.state_root).display()
    ))
}

fn spawn_stop_monitor(state_root: PathBuf, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            if stop_requested(&state_root) {
                stop.store(true, Ordering::SeqCst);
                break;
            }
            thread::sleep(STOP_POLL);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_is_rejected() {
        let err = run_cli(vec!["unleash".to_string()]).expect_err("unknown command");
        assert!(err.contains("unleash"));
    }

    #[test]
    fn empty_invocation_prints_help() {
        let output = run_cli(Vec::new()).expect("help output");
        assert!(output.contains("taskbridge <command>"));
        assert!(output.contains("--definition"));
    }

    #[test]
    fn missing_flags_are_reported_by_name() {
        let err = flag_value(&["--config".to_string()], "--config").expect_err("missing value");
        assert!(err.contains("--config"));
        let err = flag_value(&[], "--queue").expect_err("missing flag");
        assert!(err.contains("--queue"));
    }
}
