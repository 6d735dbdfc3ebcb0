//! Status collection: probes the local inference engine, the mesh/service
//! markers this node's control plane cares about, GPU telemetry, and memory
//! pressure, then folds them into a [`NodeStatus`] snapshot per §4.5.

use std::path::Path;
use std::time::{Duration, Instant};

use fleet_primitives::{GpuStatus, LoadedModel, NodeStatus, Resources, ServiceName, ServiceReport, ServiceState};
use serde::Deserialize;
use tracing::debug;

use crate::config::WorkerConfig;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const CRITICAL_SERVICES: &[ServiceName] = &[ServiceName::Ollama];

/// Marker file presence stands in for the mesh/orchestration services this
/// agent does not itself set up (Nebula/K3s/Liqo bring-up is out of scope).
/// A deployment drops these files once the corresponding daemon is live.
const NEBULA_MARKER: &str = "/run/fleet/nebula-up";
const K3S_MARKER: &str = "/run/fleet/k3s-up";
const LIQO_MARKER: &str = "/run/fleet/liqo-up";

fn marker_service(path: &str) -> ServiceReport {
    if Path::new(path).exists() {
        ServiceReport { state: ServiceState::Running, message: String::new() }
    } else {
        ServiceReport { state: ServiceState::NotInstalled, message: format!("marker {path} absent") }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct OllamaPsResponse {
    #[serde(default)]
    models: Vec<OllamaPsEntry>,
}

#[derive(Debug, Deserialize)]
struct OllamaPsEntry {
    name: String,
}

async fn probe_ollama(client: &reqwest::Client, base_url: &str) -> (ServiceReport, Vec<LoadedModel>) {
    let tags = client
        .get(format!("{base_url}/api/tags"))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .ok()
        .filter(|r| r.status().is_success());

    let Some(tags) = tags else {
        return (
            ServiceReport { state: ServiceState::Stopped, message: "inference engine unreachable".to_string() },
            Vec::new(),
        );
    };

    let tags: OllamaTagsResponse = match tags.json().await {
        Ok(body) => body,
        Err(_) => return (ServiceReport { state: ServiceState::Running, message: String::new() }, Vec::new()),
    };

    let loaded: Vec<String> = match client.get(format!("{base_url}/api/ps")).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) => resp.json::<OllamaPsResponse>().await.map(|body| body.models.into_iter().map(|m| m.name).collect()).unwrap_or_default(),
        Err(_) => Vec::new(),
    };

    let models = tags
        .models
        .into_iter()
        .map(|t| LoadedModel { currently_loaded: loaded.contains(&t.name), name: t.name, size_bytes: t.size })
        .collect();

    (ServiceReport { state: ServiceState::Running, message: String::new() }, models)
}

fn parse_meminfo(raw: &str) -> Resources {
    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().split_whitespace().next().and_then(|v| v.parse().ok()).unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().split_whitespace().next().and_then(|v| v.parse().ok()).unwrap_or(0);
        }
    }
    let memory_total_mb = total_kb / 1024;
    let memory_used_mb = memory_total_mb.saturating_sub(available_kb / 1024);
    Resources { cpu_percent: 0.0, memory_used_mb, memory_total_mb }
}

async fn read_resources() -> Resources {
    match tokio::fs::read_to_string("/proc/meminfo").await {
        Ok(raw) => parse_meminfo(&raw),
        Err(err) => {
            debug!(%err, "could not read /proc/meminfo");
            Resources::default()
        }
    }
}

fn parse_nvidia_smi_csv(raw: &str) -> Vec<GpuStatus> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .filter_map(|(index, line)| {
            let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
            if fields.len() < 5 {
                return None;
            }
            Some(GpuStatus {
                index: index as u32,
                name: fields[0].to_string(),
                memory_used_mb: fields[1].parse().unwrap_or(0),
                memory_total_mb: fields[2].parse().unwrap_or(0),
                utilization: fields[3].parse().unwrap_or(0.0),
                temperature_c: fields[4].parse().unwrap_or(0.0),
            })
        })
        .collect()
}

async fn read_gpus() -> Vec<GpuStatus> {
    let output = tokio::process::Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.used,memory.total,utilization.gpu,temperature.gpu", "--format=csv,noheader,nounits"])
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => parse_nvidia_smi_csv(&String::from_utf8_lossy(&out.stdout)),
        Ok(_) => Vec::new(),
        Err(_) => Vec::new(),
    }
}

/// Builds a fresh [`NodeStatus`] snapshot. `idle_seconds` is the caller's
/// own idle accounting (time since the inference engine last served a
/// request), not derived here.
pub async fn collect(config: &WorkerConfig, client: &reqwest::Client, started_at: Instant, idle_seconds: u64) -> NodeStatus {
    let (ollama_report, models) = probe_ollama(client, &config.worker_ollama_url).await;

    let services = vec![
        (ServiceName::Ollama, ollama_report),
        (ServiceName::Nebula, marker_service(NEBULA_MARKER)),
        (ServiceName::K3s, marker_service(K3S_MARKER)),
        (ServiceName::Liqo, marker_service(LIQO_MARKER)),
    ];

    let health = NodeStatus::derive_health(&services, CRITICAL_SERVICES);

    NodeStatus {
        health,
        uptime_seconds: started_at.elapsed().as_secs(),
        idle_seconds,
        services,
        resources: read_resources().await,
        gpus: read_gpus().await,
        models,
        timestamp: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_meminfo_fields() {
        let raw = "MemTotal:       16384000 kB\nMemFree:         200000 kB\nMemAvailable:   8192000 kB\n";
        let resources = parse_meminfo(raw);
        assert_eq!(resources.memory_total_mb, 16000);
        assert_eq!(resources.memory_used_mb, 16000 - 8000);
    }

    #[test]
    fn parses_nvidia_smi_csv_rows() {
        let raw = "NVIDIA A100, 1024, 40960, 12.5, 55\nNVIDIA A100, 512, 40960, 3.0, 50\n";
        let gpus = parse_nvidia_smi_csv(raw);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "NVIDIA A100");
        assert_eq!(gpus[0].memory_used_mb, 1024);
        assert_eq!(gpus[1].index, 1);
    }

    #[test]
    fn malformed_nvidia_smi_rows_are_skipped() {
        let raw = "garbage\n";
        assert!(parse_nvidia_smi_csv(raw).is_empty());
    }

    #[test]
    fn marker_absent_reports_not_installed() {
        let report = marker_service("/nonexistent/path/for/test");
        assert_eq!(report.state, ServiceState::NotInstalled);
    }
}
