//! Command executor: dispatches each `CommandType` per §4.5's table and
//! keeps an idempotency LRU so a duplicate delivery (inevitable given the
//! dual-transport, at-least-once delivery model) doesn't re-run a
//! destructive command twice.

use std::collections::{HashSet, VecDeque};
use std::process::Stdio;
use std::time::{Duration, Instant};

use fleet_primitives::{Command, CommandResult, CommandType};
use serde_json::json;
use tokio::process::Command as Process;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::state::AgentState;

/// Service names the `restart_service` command is allowed to touch.
const SERVICE_WHITELIST: &[&str] = &["nebula", "k3s", "ollama", "liqo"];

/// Shell commands the `exec` command is allowed to run, keyed by the `cmd`
/// arg. Anything else is rejected before a shell is ever spawned.
const EXEC_WHITELIST: &[&str] = &["df", "uptime", "uname", "free"];

const IDEMPOTENCY_CAPACITY: usize = 256;

struct IdempotencyLru {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl IdempotencyLru {
    fn new() -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new() }
    }

    /// Returns `true` if this id was already recorded. Always records it.
    fn check_and_record(&mut self, id: Uuid) -> bool {
        if self.seen.contains(&id) {
            return true;
        }
        if self.order.len() >= IDEMPOTENCY_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id);
        self.order.push_back(id);
        false
    }
}

pub struct Executor {
    idempotency: Mutex<IdempotencyLru>,
}

impl Executor {
    pub fn new() -> Self {
        Self { idempotency: Mutex::new(IdempotencyLru::new()) }
    }

    pub async fn execute(&self, command: Command, config: &WorkerConfig, state: &AgentState) -> CommandResult {
        let already_seen = self.idempotency.lock().await.check_and_record(command.command_id);
        if already_seen {
            info!(command_id = %command.command_id, "duplicate command delivery, skipping re-execution");
            return CommandResult {
                command_id: command.command_id,
                success: true,
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                error: None,
                duration_ms: 0,
            };
        }

        let started = Instant::now();
        let result = dispatch(&command, config, state).await;
        finish(command.command_id, result, started)
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

enum Outcome {
    Ok { exit_code: Option<i32>, stdout: String, stderr: String },
    Err(String),
}

fn finish(command_id: Uuid, outcome: Outcome, started: Instant) -> CommandResult {
    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Outcome::Ok { exit_code, stdout, stderr } => {
            CommandResult { command_id, success: true, exit_code, stdout, stderr, error: None, duration_ms }
        }
        Outcome::Err(error) => CommandResult::failure(command_id, error, duration_ms),
    }
}

async fn dispatch(command: &Command, config: &WorkerConfig, state: &AgentState) -> Outcome {
    match command.kind {
        CommandType::Shutdown => schedule_halt(command, "-h").await,
        CommandType::Reboot => schedule_halt(command, "-r").await,
        CommandType::Drain => drain(command, config).await,
        CommandType::PullModel => pull_model(command, config, state).await,
        CommandType::UnloadModel => restart_service_by_name(command, "ollama").await,
        CommandType::Exec => exec(command).await,
        CommandType::RestartService => restart_service(command).await,
        CommandType::Status => report_status(state).await,
    }
}

fn delay_arg(command: &Command) -> String {
    command.args.get("delay").cloned().unwrap_or_else(|| "+1m".to_string())
}

async fn schedule_halt(command: &Command, flag: &str) -> Outcome {
    let delay = delay_arg(command);
    run_shell(&format!("shutdown {flag} {delay}"), command.timeout_seconds).await
}

async fn drain(command: &Command, config: &WorkerConfig) -> Outcome {
    let hostname = &config.node_id;
    let drain_cmd = format!("kubectl drain {hostname} --ignore-daemonsets --delete-emptydir-data");
    match run_shell(&drain_cmd, command.timeout_seconds).await {
        Outcome::Ok { stdout, stderr, .. } => {
            let shutdown = schedule_halt(command, "-h").await;
            match shutdown {
                Outcome::Ok { exit_code, stdout: halt_out, stderr: halt_err } => Outcome::Ok {
                    exit_code,
                    stdout: format!("{stdout}\n{halt_out}"),
                    stderr: format!("{stderr}\n{halt_err}"),
                },
                err => err,
            }
        }
        err => err,
    }
}

async fn pull_model(command: &Command, config: &WorkerConfig, state: &AgentState) -> Outcome {
    let Some(model) = command.args.get("model") else {
        return Outcome::Err("pull_model requires a 'model' arg".to_string());
    };
    let url = format!("{}/api/pull", config.worker_ollama_url);
    let resp = state.http.post(&url).json(&json!({ "name": model, "stream": false })).timeout(Duration::from_secs(command.timeout_seconds.max(1))).send().await;
    match resp {
        Ok(resp) if resp.status().is_success() => {
            let body = resp.text().await.unwrap_or_default();
            Outcome::Ok { exit_code: Some(0), stdout: body, stderr: String::new() }
        }
        Ok(resp) => Outcome::Err(format!("pull failed with status {}", resp.status())),
        Err(err) => Outcome::Err(err.to_string()),
    }
}

async fn restart_service_by_name(command: &Command, name: &str) -> Outcome {
    run_shell(&format!("systemctl restart {name}"), command.timeout_seconds).await
}

async fn restart_service(command: &Command) -> Outcome {
    let Some(name) = command.args.get("service") else {
        return Outcome::Err("restart_service requires a 'service' arg".to_string());
    };
    if !SERVICE_WHITELIST.contains(&name.as_str()) {
        return Outcome::Err(format!("service '{name}' is not whitelisted"));
    }
    restart_service_by_name(command, name).await
}

async fn exec(command: &Command) -> Outcome {
    let Some(cmd) = command.args.get("cmd") else {
        return Outcome::Err("exec requires a 'cmd' arg".to_string());
    };
    if !EXEC_WHITELIST.contains(&cmd.as_str()) {
        return Outcome::Err(format!("command '{cmd}' is not whitelisted"));
    }
    let args: Vec<&str> = command.args.get("args").map(|a| a.split_whitespace().collect()).unwrap_or_default();
    run_process(cmd, &args, command.timeout_seconds).await
}

async fn report_status(state: &AgentState) -> Outcome {
    let status = state.snapshot().await;
    match serde_json::to_string(&status) {
        Ok(json) => Outcome::Ok { exit_code: Some(0), stdout: json, stderr: String::new() },
        Err(err) => Outcome::Err(err.to_string()),
    }
}

async fn run_shell(command_line: &str, timeout_seconds: u64) -> Outcome {
    run_process("sh", &["-c", command_line], timeout_seconds).await
}

async fn run_process(program: &str, args: &[&str], timeout_seconds: u64) -> Outcome {
    let timeout = Duration::from_secs(timeout_seconds.max(1));
    let child = Process::new(program).args(args).stdout(Stdio::piped()).stderr(Stdio::piped()).output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => Outcome::Ok {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Ok(Err(err)) => Outcome::Err(format!("failed to spawn {program}: {err}")),
        Err(_) => {
            warn!(program, "command timed out");
            Outcome::Err(format!("{program} timed out after {timeout_seconds}s"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> WorkerConfig {
        WorkerConfig {
            node_id: "worker-1".into(),
            node_type: fleet_primitives::NodeType::GpuWorker,
            worker_ollama_url: "http://localhost:11434".into(),
            worker_models: vec!["llama3".into()],
            worker_concurrency: 1,
            heartbeat_interval: Duration::from_secs(30),
            rabbitmq_url: None,
            controller_grpc_addr: "http://localhost:7070".into(),
            instance_id: String::new(),
            nebula_ip: None,
            public_ip: None,
            region: None,
            availability_zone: None,
        }
    }

    #[tokio::test]
    async fn exec_rejects_non_whitelisted_commands() {
        let mut args = HashMap::new();
        args.insert("cmd".to_string(), "rm".to_string());
        let command = Command::new(CommandType::Exec, args, 5);
        let outcome = exec(&command).await;
        match outcome {
            Outcome::Err(msg) => assert!(msg.contains("not whitelisted")),
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn restart_service_rejects_non_whitelisted_service() {
        let mut args = HashMap::new();
        args.insert("service".to_string(), "sshd".to_string());
        let command = Command::new(CommandType::RestartService, args, 5);
        let outcome = restart_service(&command).await;
        match outcome {
            Outcome::Err(msg) => assert!(msg.contains("not whitelisted")),
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn duplicate_command_id_is_not_re_executed() {
        let executor = Executor::new();
        let config = config();
        let state = AgentState::new(config.clone());
        let command = Command::new(CommandType::Status, HashMap::new(), 5);

        let first = executor.execute(command.clone(), &config, &state).await;
        assert!(first.success);

        let second = executor.execute(command.clone(), &config, &state).await;
        assert!(second.success);
        assert_eq!(second.duration_ms, 0);
    }

    #[test]
    fn idempotency_lru_evicts_oldest_past_capacity() {
        let mut lru = IdempotencyLru::new();
        let first = Uuid::new_v4();
        assert!(!lru.check_and_record(first));
        for _ in 0..IDEMPOTENCY_CAPACITY {
            lru.check_and_record(Uuid::new_v4());
        }
        assert!(!lru.check_and_record(first));
    }
}
