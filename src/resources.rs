//! Runtime environment detection and resource profiling
//!
//! Detects where the pipeline is running (job scheduler, container
//! orchestration, plain container, VM, bare server) and how much CPU, memory
//! and GPU it may use. Every probe degrades to the next fallback instead of
//! failing the run; only explicit user overrides can produce configuration
//! errors.
//!
//! All host access goes through the [`HostProbe`] seam so environments can be
//! simulated in tests.

use crate::config::Device;
use crate::error::{PipelineError, Result};
use std::process::Command;
use sysinfo::System;

/// Workers sharing one GPU are capped at this count
const MAX_GPU_WORKERS: usize = 4;
/// Memory budget assumed per worker when deriving the pool size, in MB
const WORKER_MEMORY_BUDGET_MB: u64 = 2048;
/// Upper bound accepted for CPU overrides
const MAX_CPU_OVERRIDE: f64 = 1024.0;
/// Upper bound accepted for worker-count overrides
const MAX_WORKER_OVERRIDE: usize = 256;
/// Upper bound accepted for memory overrides (64 TB), in MB
const MAX_MEMORY_OVERRIDE_MB: u64 = 64 * 1024 * 1024;
/// Container memory limits above this are treated as "no limit" (cgroup
/// files report huge sentinel values on unlimited hierarchies)
const CGROUP_MEMORY_SENTINEL_MB: u64 = 4 * 1024 * 1024;

/// Host access used by the profiler.
///
/// The default implementation talks to the real system; tests inject fakes
/// to simulate schedulers, containers and GPUs.
pub trait HostProbe {
    fn env_var(&self, key: &str) -> Option<String>;
    fn read_file(&self, path: &str) -> Option<String>;
    fn command_output(&self, program: &str, args: &[&str]) -> Option<String>;
    fn host_cpu_count(&self) -> usize;
    fn host_memory_mb(&self) -> u64;
}

/// Probe backed by the real host
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn read_file(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }

    fn command_output(&self, program: &str, args: &[&str]) -> Option<String> {
        let output = Command::new(program).args(args).output().ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8(output.stdout).ok()
    }

    fn host_cpu_count(&self) -> usize {
        num_cpus::get()
    }

    fn host_memory_mb(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory() / (1024 * 1024)
    }
}

/// Detected runtime environment, in detection priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    Slurm,
    Kubernetes,
    Docker,
    Vm,
    Server,
}

impl std::fmt::Display for RuntimeEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Slurm => "slurm",
            Self::Kubernetes => "kubernetes",
            Self::Docker => "docker",
            Self::Vm => "vm",
            Self::Server => "server",
        };
        write!(f, "{}", name)
    }
}

fn cgroup_mentions(probe: &dyn HostProbe, needle: &str) -> bool {
    probe
        .read_file("/proc/self/cgroup")
        .map_or(false, |content| content.contains(needle))
}

fn is_slurm(probe: &dyn HostProbe) -> bool {
    probe.env_var("SLURM_JOB_ID").is_some()
}

fn is_kubernetes(probe: &dyn HostProbe) -> bool {
    probe.env_var("KUBERNETES_SERVICE_HOST").is_some() && cgroup_mentions(probe, "kubelet")
}

fn is_docker(probe: &dyn HostProbe) -> bool {
    if is_kubernetes(probe) {
        return false;
    }
    cgroup_mentions(probe, "docker") || probe.read_file("/.dockerenv").is_some()
}

fn is_vm(probe: &dyn HostProbe) -> bool {
    probe
        .command_output("systemd-detect-virt", &[])
        .map_or(false, |out| {
            let virt = out.trim();
            !virt.is_empty() && virt != "none"
        })
}

/// Detect the runtime environment by checking markers in priority order
pub fn detect_runtime_environment(probe: &dyn HostProbe) -> RuntimeEnvironment {
    if is_slurm(probe) {
        RuntimeEnvironment::Slurm
    } else if is_kubernetes(probe) {
        RuntimeEnvironment::Kubernetes
    } else if is_docker(probe) {
        RuntimeEnvironment::Docker
    } else if is_vm(probe) {
        RuntimeEnvironment::Vm
    } else {
        RuntimeEnvironment::Server
    }
}

/// CPU cores and memory available to this process.
///
/// Cores are fractional because container limits allow values like `200m`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuResources {
    pub cores: f64,
    pub memory_mb: u64,
}

/// Parse Slurm memory strings: `8G`, `4096M`, `1024K`, plain MB
fn parse_slurm_memory(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (number, unit) = match value.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&value[..value.len() - 1], Some(c)),
        _ => (value, None),
    };
    let number: f64 = number.parse().ok()?;
    let mb = match unit {
        Some('K') | Some('k') => number / 1024.0,
        Some('M') | Some('m') | None => number,
        Some('G') | Some('g') => number * 1024.0,
        Some('T') | Some('t') => number * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(mb.round() as u64)
}

/// Parse Kubernetes CPU limits: `200m` -> 0.2, `2` -> 2.0
fn parse_k8s_cpu(value: &str) -> Option<f64> {
    let value = value.trim();
    if let Some(milli) = value.strip_suffix('m') {
        let milli: f64 = milli.parse().ok()?;
        return Some(milli / 1000.0);
    }
    value.parse().ok()
}

/// Parse Kubernetes memory limits: `512Mi`, `2Gi`, `1G`, raw bytes
fn parse_k8s_memory(value: &str) -> Option<u64> {
    let value = value.trim();
    let suffixes: &[(&str, f64)] = &[
        ("Ki", 1.0 / 1024.0),
        ("Mi", 1.0),
        ("Gi", 1024.0),
        ("Ti", 1024.0 * 1024.0),
        ("K", 1e3 / (1024.0 * 1024.0)),
        ("M", 1e6 / (1024.0 * 1024.0)),
        ("G", 1e9 / (1024.0 * 1024.0)),
        ("T", 1e12 / (1024.0 * 1024.0)),
    ];
    for (suffix, factor) in suffixes {
        if let Some(number) = value.strip_suffix(suffix) {
            let number: f64 = number.trim().parse().ok()?;
            return Some((number * factor).round() as u64);
        }
    }
    // no suffix: raw bytes
    let bytes: u64 = value.parse().ok()?;
    Some(bytes / (1024 * 1024))
}

/// CPU quota from cgroup v1 (cfs quota/period) or v2 (cpu.max)
fn cgroup_cpu_limit(probe: &dyn HostProbe) -> Option<f64> {
    if let (Some(quota), Some(period)) = (
        probe.read_file("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        probe.read_file("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        let quota: i64 = quota.trim().parse().ok()?;
        let period: i64 = period.trim().parse().ok()?;
        if quota > 0 && period > 0 {
            return Some(quota as f64 / period as f64);
        }
        return None;
    }
    if let Some(max) = probe.read_file("/sys/fs/cgroup/cpu.max") {
        let mut parts = max.split_whitespace();
        let quota = parts.next()?;
        if quota == "max" {
            return None;
        }
        let quota: f64 = quota.parse().ok()?;
        let period: f64 = parts.next()?.parse().ok()?;
        if period > 0.0 {
            return Some(quota / period);
        }
    }
    None
}

/// Memory limit from cgroup v1 or v2, in MB
fn cgroup_memory_limit_mb(probe: &dyn HostProbe) -> Option<u64> {
    let raw = probe
        .read_file("/sys/fs/cgroup/memory/memory.limit_in_bytes")
        .or_else(|| probe.read_file("/sys/fs/cgroup/memory.max"))?;
    let raw = raw.trim();
    if raw == "max" {
        return None;
    }
    let bytes: u64 = raw.parse().ok()?;
    let mb = bytes / (1024 * 1024);
    // unlimited hierarchies report absurd sentinel values
    if mb == 0 || mb > CGROUP_MEMORY_SENTINEL_MB {
        return None;
    }
    Some(mb)
}

fn cpu_memory_host(probe: &dyn HostProbe) -> CpuResources {
    CpuResources {
        cores: probe.host_cpu_count() as f64,
        memory_mb: probe.host_memory_mb(),
    }
}

/// Slurm job limits: scontrol query, then environment, then host probing
fn cpu_memory_slurm(probe: &dyn HostProbe) -> CpuResources {
    if let Some(job_id) = probe.env_var("SLURM_JOB_ID") {
        if let Some(output) = probe.command_output("scontrol", &["show", "job", &job_id]) {
            let mut cores = None;
            let mut memory = None;
            for token in output.split_whitespace() {
                if let Some(value) = token.strip_prefix("NumCPUs=") {
                    cores = value.parse::<f64>().ok();
                } else if let Some(value) = token.strip_prefix("MinMemory=") {
                    memory = parse_slurm_memory(value);
                }
            }
            if let (Some(cores), Some(memory_mb)) = (cores, memory) {
                return CpuResources { cores, memory_mb };
            }
        }
    }

    let cores = probe
        .env_var("SLURM_CPUS_PER_TASK")
        .and_then(|v| v.trim().parse::<f64>().ok());
    let memory = probe
        .env_var("SLURM_MEM_PER_NODE")
        .and_then(|v| parse_slurm_memory(&v));
    if let (Some(cores), Some(memory_mb)) = (cores, memory) {
        return CpuResources { cores, memory_mb };
    }

    cpu_memory_host(probe)
}

/// Kubernetes pod limits: downward-API env, then cgroup, then host probing
fn cpu_memory_kubernetes(probe: &dyn HostProbe) -> CpuResources {
    let env_cores = probe
        .env_var("CPU_LIMIT")
        .and_then(|v| parse_k8s_cpu(&v));
    let env_memory = probe
        .env_var("MEMORY_LIMIT")
        .and_then(|v| parse_k8s_memory(&v));
    if let (Some(cores), Some(memory_mb)) = (env_cores, env_memory) {
        return CpuResources { cores, memory_mb };
    }

    let host = cpu_memory_host(probe);
    CpuResources {
        cores: env_cores
            .or_else(|| cgroup_cpu_limit(probe))
            .unwrap_or(host.cores),
        memory_mb: env_memory
            .or_else(|| cgroup_memory_limit_mb(probe))
            .unwrap_or(host.memory_mb),
    }
}

/// Docker container limits: cgroup, then host probing
fn cpu_memory_docker(probe: &dyn HostProbe) -> CpuResources {
    let host = cpu_memory_host(probe);
    CpuResources {
        cores: cgroup_cpu_limit(probe).unwrap_or(host.cores),
        memory_mb: cgroup_memory_limit_mb(probe).unwrap_or(host.memory_mb),
    }
}

/// Detect environment and probe the matching CPU/memory limits
pub fn cpu_resources(probe: &dyn HostProbe) -> (CpuResources, RuntimeEnvironment) {
    let environment = detect_runtime_environment(probe);
    let resources = match environment {
        RuntimeEnvironment::Slurm => cpu_memory_slurm(probe),
        RuntimeEnvironment::Kubernetes => cpu_memory_kubernetes(probe),
        RuntimeEnvironment::Docker => cpu_memory_docker(probe),
        RuntimeEnvironment::Vm | RuntimeEnvironment::Server => cpu_memory_host(probe),
    };
    log::info!("Environment: {}", environment);
    log::info!("Available cores: {}", resources.cores);
    log::info!(
        "Available memory: {:.1} (GB)",
        resources.memory_mb as f64 / 1024.0
    );
    (resources, environment)
}

/// One detected GPU
#[derive(Debug, Clone, PartialEq)]
pub struct GpuDevice {
    pub index: usize,
    pub name: String,
    pub total_memory_mb: u64,
    pub compute_capability: String,
}

/// GPU probing result.
///
/// Probing errors are recorded, never raised: a failed probe means CPU-only
/// inference, not a failed run.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuResources {
    pub available: bool,
    pub count: usize,
    pub devices: Vec<GpuDevice>,
    pub error: Option<String>,
}

impl GpuResources {
    pub fn unavailable<S: Into<String>>(error: S) -> Self {
        Self {
            available: false,
            count: 0,
            devices: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Query the accelerator runtime for device count, memory and capability
pub fn gpu_resources(probe: &dyn HostProbe) -> GpuResources {
    let output = match probe.command_output(
        "nvidia-smi",
        &[
            "--query-gpu=index,name,memory.total,compute_cap",
            "--format=csv,noheader,nounits",
        ],
    ) {
        Some(output) => output,
        None => {
            log::warn!("No CUDA-capable GPU detected.");
            return GpuResources::unavailable("nvidia-smi not available");
        }
    };

    let mut devices = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            log::error!("Unexpected nvidia-smi output line: {}", line);
            return GpuResources::unavailable(format!("unparseable nvidia-smi line: {}", line));
        }
        let parsed = fields[0]
            .parse::<usize>()
            .ok()
            .zip(fields[2].parse::<u64>().ok());
        match parsed {
            Some((index, total_memory_mb)) => devices.push(GpuDevice {
                index,
                name: fields[1].to_string(),
                total_memory_mb,
                compute_capability: fields[3].to_string(),
            }),
            None => {
                return GpuResources::unavailable(format!(
                    "unparseable nvidia-smi line: {}",
                    line
                ));
            }
        }
    }

    if devices.is_empty() {
        log::warn!("No CUDA-capable GPU detected.");
        return GpuResources::unavailable("no devices reported");
    }

    GpuResources {
        available: true,
        count: devices.len(),
        devices,
        error: None,
    }
}

fn probe_openslide(probe: &dyn HostProbe) -> bool {
    probe
        .command_output("openslide-show-properties", &["--version"])
        .is_some()
}

fn probe_vips(probe: &dyn HostProbe) -> bool {
    probe
        .command_output("vips", &["--version"])
        .map_or(false, |out| out.to_lowercase().contains("vips"))
}

fn derive_worker_count(cores: f64, memory_mb: u64, gpu_inference: bool) -> usize {
    let cpu_workers = (cores.floor() as usize).max(1);
    let memory_workers = ((memory_mb / WORKER_MEMORY_BUDGET_MB) as usize).max(1);
    let workers = cpu_workers.min(memory_workers);
    if gpu_inference {
        workers.min(MAX_GPU_WORKERS)
    } else {
        workers
    }
}

/// Detected system capabilities.
///
/// Created once at pipeline start and read-only afterward; the overwrite
/// methods are user overrides applied immediately after detection.
#[derive(Debug, Clone)]
pub struct SystemProfile {
    pub environment: RuntimeEnvironment,
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub gpu: GpuResources,
    /// Effective device after validation (a GPU request without a detected
    /// GPU downgrades to CPU)
    pub device: Device,
    pub worker_count: usize,
    /// OpenSlide WSI backend available on this host
    pub openslide: bool,
    /// libvips image I/O backend available on this host
    pub vips: bool,
}

impl SystemProfile {
    /// Profile the real host
    pub fn detect(device: Device) -> Result<Self> {
        Self::detect_with(&SystemProbe, device)
    }

    /// Profile through an injected probe
    pub fn detect_with(probe: &dyn HostProbe, device: Device) -> Result<Self> {
        let (cpu, environment) = cpu_resources(probe);
        let gpu = gpu_resources(probe);

        let device = match device {
            Device::Gpu(index) if gpu.available => {
                if index >= gpu.count {
                    return Err(PipelineError::config(format!(
                        "device: GPU index {} requested but only {} device(s) detected",
                        index, gpu.count
                    )));
                }
                Device::Gpu(index)
            }
            Device::Gpu(index) => {
                log::warn!(
                    "GPU {} requested but no GPU detected ({}), falling back to CPU",
                    index,
                    gpu.error.as_deref().unwrap_or("unknown")
                );
                Device::Cpu
            }
            Device::Cpu => Device::Cpu,
        };

        let worker_count = derive_worker_count(
            cpu.cores,
            cpu.memory_mb,
            matches!(device, Device::Gpu(_)),
        );

        Ok(Self {
            environment,
            cpu_cores: cpu.cores,
            memory_mb: cpu.memory_mb,
            gpu,
            device,
            worker_count,
            openslide: probe_openslide(probe),
            vips: probe_vips(probe),
        })
    }

    /// Override the detected CPU count
    pub fn overwrite_cpu_cores(&mut self, cores: f64) -> Result<()> {
        if !(cores > 0.0) || cores > MAX_CPU_OVERRIDE {
            return Err(PipelineError::config(format!(
                "cpu_count: override must be in (0, {}], got {}",
                MAX_CPU_OVERRIDE, cores
            )));
        }
        if cores > self.cpu_cores {
            log::warn!(
                "CPU override {} exceeds detected {} cores",
                cores,
                self.cpu_cores
            );
        }
        self.cpu_cores = cores;
        self.worker_count = derive_worker_count(
            self.cpu_cores,
            self.memory_mb,
            matches!(self.device, Device::Gpu(_)),
        );
        Ok(())
    }

    /// Override the derived worker-pool size
    pub fn overwrite_worker_count(&mut self, workers: usize) -> Result<()> {
        if workers == 0 || workers > MAX_WORKER_OVERRIDE {
            return Err(PipelineError::config(format!(
                "worker_count: override must be in 1..={}, got {}",
                MAX_WORKER_OVERRIDE, workers
            )));
        }
        self.worker_count = workers;
        Ok(())
    }

    /// Override the detected memory budget, in MB
    pub fn overwrite_memory(&mut self, memory_mb: u64) -> Result<()> {
        if memory_mb == 0 || memory_mb > MAX_MEMORY_OVERRIDE_MB {
            return Err(PipelineError::config(format!(
                "memory: override must be in 1..={} MB, got {}",
                MAX_MEMORY_OVERRIDE_MB, memory_mb
            )));
        }
        self.memory_mb = memory_mb;
        self.worker_count = derive_worker_count(
            self.cpu_cores,
            self.memory_mb,
            matches!(self.device, Device::Gpu(_)),
        );
        Ok(())
    }

    /// GPU memory of the selected device, in MB
    pub fn gpu_memory_mb(&self) -> Option<u64> {
        match self.device {
            Device::Gpu(index) => self
                .gpu
                .devices
                .iter()
                .find(|d| d.index == index)
                .map(|d| d.total_memory_mb),
            Device::Cpu => None,
        }
    }

    /// Log the resolved configuration banner
    pub fn log_summary(&self) {
        log::info!("========================================");
        log::info!("         SYSTEM CONFIGURATION           ");
        log::info!("========================================");
        log::info!("Environment:        {}", self.environment);
        log::info!("CPU count:          {}", self.cpu_cores);
        log::info!("Memory:             {:.2} GB", self.memory_mb as f64 / 1024.0);
        log::info!("GPU count:          {}", self.gpu.count);
        match self.device {
            Device::Gpu(index) => {
                log::info!("Used GPU-ID:        {}", index);
                if let Some(mb) = self.gpu_memory_mb() {
                    log::info!("GPU memory:         {:.2} GB", mb as f64 / 1024.0);
                }
            }
            Device::Cpu => log::info!("Used GPU-ID:        none (CPU inference)"),
        }
        if let Some(error) = &self.gpu.error {
            log::info!("GPU probe error:    {}", error);
        }
        log::info!("Worker count:       {}", self.worker_count);
        log::info!("OpenSlide:          {}", self.openslide);
        log::info!("libvips:            {}", self.vips);
        log::info!("========================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Probe with scripted responses, in the spirit of the mock-heavy tests
    /// the original resource manager ships with.
    #[derive(Default)]
    struct FakeProbe {
        env: HashMap<String, String>,
        files: HashMap<String, String>,
        commands: HashMap<String, String>,
        cpu_count: usize,
        memory_mb: u64,
    }

    impl FakeProbe {
        fn new() -> Self {
            Self {
                cpu_count: 8,
                memory_mb: 16384,
                ..Default::default()
            }
        }

        fn with_env(mut self, key: &str, value: &str) -> Self {
            self.env.insert(key.into(), value.into());
            self
        }

        fn with_file(mut self, path: &str, content: &str) -> Self {
            self.files.insert(path.into(), content.into());
            self
        }

        fn with_command(mut self, program: &str, output: &str) -> Self {
            self.commands.insert(program.into(), output.into());
            self
        }
    }

    impl HostProbe for FakeProbe {
        fn env_var(&self, key: &str) -> Option<String> {
            self.env.get(key).cloned()
        }

        fn read_file(&self, path: &str) -> Option<String> {
            self.files.get(path).cloned()
        }

        fn command_output(&self, program: &str, _args: &[&str]) -> Option<String> {
            self.commands.get(program).cloned()
        }

        fn host_cpu_count(&self) -> usize {
            self.cpu_count
        }

        fn host_memory_mb(&self) -> u64 {
            self.memory_mb
        }
    }

    #[test]
    fn test_detect_slurm() {
        let probe = FakeProbe::new().with_env("SLURM_JOB_ID", "12345");
        assert_eq!(
            detect_runtime_environment(&probe),
            RuntimeEnvironment::Slurm
        );
    }

    #[test]
    fn test_detect_kubernetes_needs_both_markers() {
        let probe = FakeProbe::new().with_env("KUBERNETES_SERVICE_HOST", "10.0.0.1");
        // service env alone is not enough
        assert_eq!(
            detect_runtime_environment(&probe),
            RuntimeEnvironment::Server
        );

        let probe = probe.with_file("/proc/self/cgroup", "12:memory:/kubepods/kubelet/pod1");
        assert_eq!(
            detect_runtime_environment(&probe),
            RuntimeEnvironment::Kubernetes
        );
    }

    #[test]
    fn test_detect_docker_and_vm() {
        let probe = FakeProbe::new().with_file("/proc/self/cgroup", "12:memory:/docker/abc");
        assert_eq!(
            detect_runtime_environment(&probe),
            RuntimeEnvironment::Docker
        );

        let probe = FakeProbe::new().with_command("systemd-detect-virt", "kvm\n");
        assert_eq!(detect_runtime_environment(&probe), RuntimeEnvironment::Vm);

        let probe = FakeProbe::new().with_command("systemd-detect-virt", "none\n");
        assert_eq!(
            detect_runtime_environment(&probe),
            RuntimeEnvironment::Server
        );
    }

    #[test]
    fn test_slurm_scontrol_parsing() {
        let probe = FakeProbe::new()
            .with_env("SLURM_JOB_ID", "12345")
            .with_command("scontrol", "JobId=12345 NumCPUs=4 MinMemory=8G Partition=gpu\n");
        let (resources, env) = cpu_resources(&probe);
        assert_eq!(env, RuntimeEnvironment::Slurm);
        assert_eq!(resources.cores, 4.0);
        assert_eq!(resources.memory_mb, 8192);
    }

    #[test]
    fn test_slurm_env_fallback() {
        let probe = FakeProbe::new()
            .with_env("SLURM_JOB_ID", "12345")
            .with_env("SLURM_CPUS_PER_TASK", "2")
            .with_env("SLURM_MEM_PER_NODE", "4096");
        let (resources, _) = cpu_resources(&probe);
        assert_eq!(resources.cores, 2.0);
        assert_eq!(resources.memory_mb, 4096);
    }

    #[test]
    fn test_slurm_host_fallback() {
        // job id present but neither scontrol nor env limits available
        let probe = FakeProbe::new().with_env("SLURM_JOB_ID", "12345");
        let (resources, _) = cpu_resources(&probe);
        assert_eq!(resources.cores, 8.0);
        assert_eq!(resources.memory_mb, 16384);
    }

    #[test]
    fn test_kubernetes_env_limits_parsed_exactly() {
        let probe = FakeProbe::new()
            .with_env("KUBERNETES_SERVICE_HOST", "10.0.0.1")
            .with_file("/proc/self/cgroup", "kubelet")
            .with_env("CPU_LIMIT", "200m")
            .with_env("MEMORY_LIMIT", "512Mi");
        let (resources, env) = cpu_resources(&probe);
        assert_eq!(env, RuntimeEnvironment::Kubernetes);
        assert!((resources.cores - 0.2).abs() < 1e-9);
        assert_eq!(resources.memory_mb, 512);
    }

    #[test]
    fn test_kubernetes_cgroup_fallback() {
        let probe = FakeProbe::new()
            .with_env("KUBERNETES_SERVICE_HOST", "10.0.0.1")
            .with_file("/proc/self/cgroup", "kubelet")
            .with_file("/sys/fs/cgroup/cpu/cpu.cfs_quota_us", "100000\n")
            .with_file("/sys/fs/cgroup/cpu/cpu.cfs_period_us", "100000\n");
        let (resources, _) = cpu_resources(&probe);
        assert_eq!(resources.cores, 1.0);
        // memory falls back to host probing
        assert_eq!(resources.memory_mb, 16384);
    }

    #[test]
    fn test_no_markers_falls_back_to_host() {
        let probe = FakeProbe::new();
        let (resources, env) = cpu_resources(&probe);
        assert_eq!(env, RuntimeEnvironment::Server);
        assert_eq!(resources.cores, 8.0);
        assert_eq!(resources.memory_mb, 16384);
    }

    #[test]
    fn test_gpu_probe_parses_devices() {
        let probe = FakeProbe::new().with_command(
            "nvidia-smi",
            "0, NVIDIA A100-SXM4-40GB, 40960, 8.0\n1, NVIDIA A100-SXM4-40GB, 40960, 8.0\n",
        );
        let gpu = gpu_resources(&probe);
        assert!(gpu.available);
        assert_eq!(gpu.count, 2);
        assert_eq!(gpu.devices[0].total_memory_mb, 40960);
        assert_eq!(gpu.devices[1].compute_capability, "8.0");
        assert!(gpu.error.is_none());
    }

    #[test]
    fn test_gpu_probe_failure_is_recorded_not_fatal() {
        let probe = FakeProbe::new();
        let gpu = gpu_resources(&probe);
        assert!(!gpu.available);
        assert_eq!(gpu.count, 0);
        assert!(gpu.error.is_some());
    }

    #[test]
    fn test_profile_downgrades_missing_gpu() {
        let probe = FakeProbe::new();
        let profile = SystemProfile::detect_with(&probe, Device::Gpu(0)).unwrap();
        assert_eq!(profile.device, Device::Cpu);
        assert!(profile.gpu.error.is_some());
    }

    #[test]
    fn test_profile_rejects_invalid_gpu_index() {
        let probe =
            FakeProbe::new().with_command("nvidia-smi", "0, NVIDIA T4, 16384, 7.5\n");
        let err = SystemProfile::detect_with(&probe, Device::Gpu(2)).unwrap_err();
        assert!(err.to_string().contains("GPU index 2"));
    }

    #[test]
    fn test_worker_count_derivation() {
        // memory-bound: 8 cores but only 4 GB
        assert_eq!(derive_worker_count(8.0, 4096, false), 2);
        // cpu-bound
        assert_eq!(derive_worker_count(2.0, 65536, false), 2);
        // gpu cap
        assert_eq!(derive_worker_count(32.0, 262144, true), MAX_GPU_WORKERS);
        // fractional container limits still get one worker
        assert_eq!(derive_worker_count(0.2, 512, false), 1);
    }

    #[test]
    fn test_overrides_validated() {
        let probe = FakeProbe::new();
        let mut profile = SystemProfile::detect_with(&probe, Device::Cpu).unwrap();

        assert!(profile.overwrite_cpu_cores(4.0).is_ok());
        assert_eq!(profile.cpu_cores, 4.0);
        assert!(profile.overwrite_cpu_cores(0.0).is_err());
        assert!(profile.overwrite_cpu_cores(-1.0).is_err());

        assert!(profile.overwrite_worker_count(2).is_ok());
        assert_eq!(profile.worker_count, 2);
        assert!(profile.overwrite_worker_count(0).is_err());

        assert!(profile.overwrite_memory(8192).is_ok());
        assert!(profile.overwrite_memory(0).is_err());
    }

    #[test]
    fn test_memory_parsers() {
        assert_eq!(parse_slurm_memory("8G"), Some(8192));
        assert_eq!(parse_slurm_memory("4096"), Some(4096));
        assert_eq!(parse_slurm_memory("1024K"), Some(1));
        assert_eq!(parse_slurm_memory("bogus"), None);

        assert_eq!(parse_k8s_cpu("200m"), Some(0.2));
        assert_eq!(parse_k8s_cpu("2"), Some(2.0));
        assert_eq!(parse_k8s_memory("512Mi"), Some(512));
        assert_eq!(parse_k8s_memory("2Gi"), Some(2048));
        assert_eq!(parse_k8s_memory("134217728"), Some(128));
    }
}
