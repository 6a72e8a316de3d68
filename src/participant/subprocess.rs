use std::fmt;
use std::io::{BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::participant::ParticipantError;
use crate::workitem::{decode, encode, extract_embedded, Workitem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    #[default]
    Fallback,
    Fail,
}

impl TimeoutPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fallback => "fallback",
            Self::Fail => "fail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fallback" => Some(Self::Fallback),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SubprocessParticipant {
    pub program: String,
    pub timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
}

impl SubprocessParticipant {
    pub fn new(program: String, timeout: Duration, timeout_policy: TimeoutPolicy) -> Self {
        Self {
            program,
            timeout,
            timeout_policy,
        }
    }

    pub fn consume(&self, workitem: &Workitem) -> Result<Workitem, ParticipantError> {
        match self.run_worker_program(workitem) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => {
                info!(
                    participant = %workitem.participant_name,
                    instance = %workitem.instance_id,
                    "worker emitted no payload, passing workitem through unchanged"
                );
                Ok(workitem.clone())
            }
            Err(err @ ParticipantError::Timeout { .. })
                if self.timeout_policy == TimeoutPolicy::Fail =>
            {
                Err(err)
            }
            Err(err) => {
                warn!(
                    participant = %workitem.participant_name,
                    instance = %workitem.instance_id,
                    error = %err,
                    "worker failed, passing workitem through unchanged"
                );
                Ok(workitem.clone())
            }
        }
    }

    fn run_worker_program(
        &self,
        workitem: &Workitem,
    ) -> Result<Option<Workitem>, ParticipantError> {
        let participant = workitem.participant_name.clone();
        let payload = encode(workitem).map_err(|source| ParticipantError::Encode {
            participant: participant.clone(),
            source,
        })?;

        let mut command = Command::new(&self.program);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(name) = workitem.param_str("name") {
            if !name.is_empty() {
                command.arg(name);
            }
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ParticipantError::MissingProgram {
                    participant,
                    program: self.program.clone(),
                })
            }
            Err(source) => {
                return Err(ParticipantError::Io {
                    participant,
                    stage: "spawn",
                    source,
                })
            }
        };

        let mut stdin = child.stdin.take().ok_or_else(|| ParticipantError::Io {
            participant: participant.clone(),
            stage: "open stdin",
            source: std::io::Error::other("missing stdin pipe"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ParticipantError::Io {
            participant: participant.clone(),
            stage: "open stdout",
            source: std::io::Error::other("missing stdout pipe"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ParticipantError::Io {
            participant: participant.clone(),
            stage: "open stderr",
            source: std::io::Error::other("missing stderr pipe"),
        })?;

        let stdout_reader = thread::spawn(move || {
            let mut buf = String::new();
            let mut reader = BufReader::new(stdout);
            let _ = reader.read_to_string(&mut buf);
            buf
        });
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf);
            buf
        });

        if let Err(source) = stdin
            .write_all(payload.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
        {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_reader.join();
            let _ = stderr_reader.join();
            return Err(ParticipantError::Io {
                participant,
                stage: "write stdin",
                source,
            });
        }
        // Close the write side so a worker that drains stdin sees EOF.
        drop(stdin);

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = stdout_reader.join();
                        let _ = stderr_reader.join();
                        return Err(ParticipantError::Timeout {
                            participant,
                            timeout_ms: self.timeout.as_millis() as u64,
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_reader.join();
                    let _ = stderr_reader.join();
                    return Err(ParticipantError::Io {
                        participant,
                        stage: "wait",
                        source,
                    });
                }
            }
        }

        let stdout_text = stdout_reader.join().unwrap_or_default();
        let stderr_text = stderr_reader.join().unwrap_or_default();
        if !stderr_text.trim().is_empty() {
            debug!(
                participant = %participant,
                stderr = %stderr_text.trim(),
                "worker stderr"
            );
        }

        let fragments = extract_embedded(&stdout_text);
        if fragments.is_empty() {
            return Ok(None);
        }
        let mut reply =
            decode(&fragments.join(" ")).map_err(|source| ParticipantError::MalformedReply {
                participant: participant.clone(),
                source,
            })?;
        if reply.instance_id != workitem.instance_id {
            return Err(ParticipantError::ReplyIdentity {
                participant,
                field: "instance",
                expected: workitem.instance_id.clone(),
                found: reply.instance_id,
            });
        }
        if !reply.step_id.is_empty() && reply.step_id != workitem.step_id {
            return Err(ParticipantError::ReplyIdentity {
                participant,
                field: "step",
                expected: workitem.step_id.clone(),
                found: reply.step_id,
            });
        }
        if reply.participant_name.is_empty() {
            reply.participant_name = workitem.participant_name.clone();
        }
        if reply.step_id.is_empty() {
            reply.step_id = workitem.step_id.clone();
        }
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_policy_parse_matches_display() {
        for policy in [TimeoutPolicy::Fallback, TimeoutPolicy::Fail] {
            assert_eq!(TimeoutPolicy::parse(policy.as_str()), Some(policy));
        }
        assert_eq!(TimeoutPolicy::parse("retry"), None);
    }

    #[test]
    fn default_timeout_policy_is_fallback() {
        assert_eq!(TimeoutPolicy::default(), TimeoutPolicy::Fallback);
    }
}
