//! Process execution seam.
//!
//! Everything that touches the package manager, the service manager or any other
//! external tool goes through a `CommandRunner`:
//! - `SystemRunner` spawns real processes with `tokio::process`
//! - `FakeRunner` answers from scripted responses and a small simulated host
//!   (installed packages, active units), recording every call for assertions

use crate::logsink::{LogSink, Stream};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, warn};
use warden_shared::{WardenError, WardenResult};

/// Phrases upstream feeds use when they throttle us
const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "too many certificates",
    "error code 429",
    "http 429",
    "cool-down",
    "cooldown",
];

/// Matched throttling phrase, if any
pub fn detect_rate_limit(output: &str) -> Option<&'static str> {
    let lower = output.to_lowercase();
    RATE_LIMIT_PHRASES.iter().copied().find(|p| lower.contains(p))
}

// ============================================================================
// Invocation / Output
// ============================================================================

#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Component label for the log sink
    pub component: String,
    /// Do not stream output lines to the sink
    pub silent: bool,
    /// Arguments carry secrets; never log them
    pub redacted: bool,
    pub timeout: Option<Duration>,
    /// Written to stdin; secrets travel here instead of argv
    pub input: Option<String>,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            component: "wardend".to_string(),
            silent: false,
            redacted: false,
            timeout: None,
            input: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn component(mut self, component: &str) -> Self {
        self.component = component.to_string();
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn redacted(mut self) -> Self {
        self.redacted = true;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Printable command line; redacted invocations hide their arguments
    pub fn display(&self) -> String {
        if self.redacted {
            format!("{} <redacted>", self.program)
        } else if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Arguments joined with single spaces
    pub fn joined_args(&self) -> String {
        self.args.join(" ")
    }

    /// Arguments followed by stdin input, for matching in tests
    pub fn transcript(&self) -> String {
        match &self.input {
            Some(input) if !self.args.is_empty() => format!("{} {}", self.joined_args(), input),
            Some(input) => input.clone(),
            None => self.joined_args(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// None when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into an error, recognising upstream throttling.
    pub fn check(self, invocation: &Invocation) -> WardenResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let combined = format!("{}\n{}", self.stdout, self.stderr);
        if let Some(phrase) = detect_rate_limit(&combined) {
            return Err(WardenError::ExternalRateLimited {
                program: invocation.program.clone(),
                detail: format!("output mentions '{}'", phrase),
            });
        }
        let detail = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        Err(WardenError::Command {
            command: invocation.display(),
            exit_code: self.exit_code,
            stderr: tail(detail, 20),
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

// ============================================================================
// Runner trait
// ============================================================================

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Non-zero exit is NOT an error here; see `CommandOutput::check`.
    async fn execute(&self, invocation: &Invocation, sink: &dyn LogSink) -> WardenResult<CommandOutput>;
}

// ============================================================================
// System runner (production)
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    stream: Stream,
    invocation: &Invocation,
    sink: &dyn LogSink,
) -> String {
    let mut collected = String::new();
    let Some(reader) = reader else {
        return collected;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // tools may print bytes that are not UTF-8 in some locales
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                if !invocation.silent && !invocation.redacted {
                    sink.emit(&invocation.component, line, stream);
                }
                collected.push_str(line);
                collected.push('\n');
            }
            Err(e) => {
                warn!("Reading {:?} of {} failed: {}", stream, invocation.display(), e);
                break;
            }
        }
    }
    collected
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn execute(&self, invocation: &Invocation, sink: &dyn LogSink) -> WardenResult<CommandOutput> {
        debug!("Running {}", invocation.display());

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if invocation.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => WardenError::DependencyMissing(format!(
                    "'{}' is not available on this host",
                    invocation.program
                )),
                _ => WardenError::Command {
                    command: invocation.display(),
                    exit_code: None,
                    stderr: e.to_string(),
                },
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let feed = async {
            if let (Some(mut stdin), Some(input)) = (stdin, invocation.input.as_deref()) {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    warn!("Writing stdin of {} failed: {}", invocation.display(), e);
                }
                // dropping stdin closes the pipe
            }
        };

        let run = async {
            let (_, out, err) = tokio::join!(
                feed,
                pump(stdout, Stream::Stdout, invocation, sink),
                pump(stderr, Stream::Stderr, invocation, sink)
            );
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let finished = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };

        match finished {
            Some(result) => {
                let (status, stdout, stderr) = result?;
                Ok(CommandOutput {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                })
            }
            None => {
                let seconds = invocation.timeout.map(|d| d.as_secs()).unwrap_or_default();
                error!("{} timed out after {}s, killing", invocation.display(), seconds);
                let _ = child.kill().await;
                Err(WardenError::Timeout {
                    command: invocation.display(),
                    seconds,
                })
            }
        }
    }
}

// ============================================================================
// Fake runner (testing)
// ============================================================================

/// Callback run when a matching invocation is executed
pub type SideEffect = Arc<dyn Fn(&Invocation) + Send + Sync>;

struct Rule {
    program: String,
    needle: Option<String>,
    response: CommandOutput,
}

#[derive(Default)]
struct SimulatedHost {
    packages: BTreeSet<String>,
    active_units: BTreeSet<String>,
}

/// Deterministic runner for tests.
///
/// Resolution order for each call:
/// 1. scripted rules, most recently added first (`respond`, `respond_when`)
/// 2. the simulated host for `apt-get`, `dpkg-query` and `systemctl`
/// 3. success with empty output
///
/// Side effects registered with `on` run before the response is returned.
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    effects: Mutex<Vec<(String, SideEffect)>>,
    host: Mutex<SimulatedHost>,
    calls: Mutex<Vec<Invocation>>,
    streamed: Mutex<HashMap<String, usize>>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            effects: Mutex::new(Vec::new()),
            host: Mutex::new(SimulatedHost::default()),
            calls: Mutex::new(Vec::new()),
            streamed: Mutex::new(HashMap::new()),
        }
    }

    /// Answer every call to `program`
    pub fn respond(&self, program: &str, response: CommandOutput) -> &Self {
        self.push_rule(program, None, response)
    }

    /// Answer calls to `program` whose joined arguments contain `needle`
    pub fn respond_when(&self, program: &str, needle: &str, response: CommandOutput) -> &Self {
        self.push_rule(program, Some(needle), response)
    }

    fn push_rule(&self, program: &str, needle: Option<&str>, response: CommandOutput) -> &Self {
        lock(&self.rules).push(Rule {
            program: program.to_string(),
            needle: needle.map(str::to_string),
            response,
        });
        self
    }

    pub fn on(&self, program: &str, effect: impl Fn(&Invocation) + Send + Sync + 'static) -> &Self {
        lock(&self.effects).push((program.to_string(), Arc::new(effect)));
        self
    }

    /// Mark packages as installed on the simulated host
    pub fn with_packages(&self, packages: &[&str]) -> &Self {
        let mut host = lock(&self.host);
        host.packages.extend(packages.iter().map(|p| p.to_string()));
        self
    }

    /// Mark units as running on the simulated host
    pub fn with_active(&self, units: &[&str]) -> &Self {
        let mut host = lock(&self.host);
        host.active_units.extend(units.iter().map(|u| u.to_string()));
        self
    }

    pub fn is_installed(&self, package: &str) -> bool {
        lock(&self.host).packages.contains(package)
    }

    pub fn is_active(&self, unit: &str) -> bool {
        lock(&self.host).active_units.contains(unit)
    }

    pub fn calls(&self) -> Vec<Invocation> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Calls to `program`, as joined argument strings followed by any stdin input
    pub fn calls_to(&self, program: &str) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.program == program)
            .map(Invocation::transcript)
            .collect()
    }

    /// True if some call to `program` had arguments or input containing `needle`
    pub fn was_called(&self, program: &str, needle: &str) -> bool {
        self.calls_to(program).iter().any(|a| a.contains(needle))
    }

    /// Calls whose arguments changed host state (installs, removals, unit changes)
    pub fn mutating_calls(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| match c.program.as_str() {
                "apt-get" => !c.args.iter().any(|a| a == "update"),
                "systemctl" => !matches!(
                    c.args.first().map(String::as_str),
                    Some("is-active") | Some("is-enabled") | Some("show") | Some("status")
                ),
                "dpkg-query" | "apt-cache" => false,
                _ => true,
            })
            .map(Invocation::display)
            .collect()
    }

    /// Lines each component streamed to the sink
    pub fn streamed_lines(&self, component: &str) -> usize {
        lock(&self.streamed).get(component).copied().unwrap_or_default()
    }

    fn scripted(&self, invocation: &Invocation) -> Option<CommandOutput> {
        let joined = invocation.transcript();
        lock(&self.rules)
            .iter()
            .rev()
            .find(|r| {
                r.program == invocation.program
                    && r.needle.as_deref().map_or(true, |n| joined.contains(n))
            })
            .map(|r| r.response.clone())
    }

    fn simulate(&self, invocation: &Invocation) -> Option<CommandOutput> {
        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        let operands = || {
            args.iter()
                .skip(1)
                .filter(|a| !a.starts_with('-'))
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
        };
        let mut host = lock(&self.host);

        match invocation.program.as_str() {
            "apt-get" => match args.first().copied() {
                Some("install") => {
                    host.packages.extend(operands());
                    Some(CommandOutput::ok(""))
                }
                Some("purge") | Some("remove") => {
                    for pkg in operands() {
                        host.packages.remove(&pkg);
                    }
                    Some(CommandOutput::ok(""))
                }
                _ => Some(CommandOutput::ok("")),
            },
            "dpkg-query" => {
                let pkg = args.last().copied().unwrap_or_default();
                if host.packages.contains(pkg) {
                    Some(CommandOutput::ok("install ok installed"))
                } else {
                    Some(CommandOutput::failed(
                        1,
                        &format!("dpkg-query: no packages found matching {}", pkg),
                    ))
                }
            }
            "systemctl" => {
                let unit = args.last().copied().unwrap_or_default().to_string();
                match args.first().copied() {
                    Some("is-active") => {
                        if host.active_units.contains(&unit) {
                            Some(CommandOutput::ok("active"))
                        } else {
                            Some(CommandOutput {
                                exit_code: Some(3),
                                stdout: "inactive\n".to_string(),
                                stderr: String::new(),
                            })
                        }
                    }
                    Some("start") | Some("restart") | Some("reload") => {
                        host.active_units.insert(unit);
                        Some(CommandOutput::ok(""))
                    }
                    Some("stop") => {
                        host.active_units.remove(&unit);
                        Some(CommandOutput::ok(""))
                    }
                    _ => Some(CommandOutput::ok("")),
                }
            }
            _ => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn execute(&self, invocation: &Invocation, sink: &dyn LogSink) -> WardenResult<CommandOutput> {
        lock(&self.calls).push(invocation.clone());

        let effects: Vec<SideEffect> = lock(&self.effects)
            .iter()
            .filter(|(program, _)| *program == invocation.program)
            .map(|(_, effect)| effect.clone())
            .collect();
        for effect in effects {
            effect(invocation);
        }

        let output = self
            .scripted(invocation)
            .or_else(|| self.simulate(invocation))
            .unwrap_or_else(|| CommandOutput::ok(""));

        if !invocation.silent && !invocation.redacted {
            let mut count = 0;
            for line in output.stdout.lines() {
                sink.emit(&invocation.component, line, Stream::Stdout);
                count += 1;
            }
            for line in output.stderr.lines() {
                sink.emit(&invocation.component, line, Stream::Stderr);
                count += 1;
            }
            *lock(&self.streamed).entry(invocation.component.clone()).or_default() += count;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logsink::MemorySink;

    #[test]
    fn test_detect_rate_limit() {
        assert_eq!(
            detect_rate_limit("ERROR: Received error code 429 from mirror"),
            Some("error code 429")
        );
        assert!(detect_rate_limit("You are on cool-down until later").is_some());
        assert!(detect_rate_limit("E: Unable to locate package foo").is_none());
    }

    #[test]
    fn test_check_maps_failures() {
        let inv = Invocation::new("freshclam");
        let err = CommandOutput::failed(1, "Too Many Requests").check(&inv).unwrap_err();
        assert_eq!(err.kind(), "external_rate_limited");

        let err = CommandOutput::failed(100, "E: broken").check(&inv).unwrap_err();
        match err {
            WardenError::Command { exit_code, stderr, .. } => {
                assert_eq!(exit_code, Some(100));
                assert_eq!(stderr, "E: broken");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(CommandOutput::ok("x").check(&inv).is_ok());
    }

    #[test]
    fn test_redacted_display() {
        let inv = Invocation::new("mysql").args(["-e", "ALTER USER x IDENTIFIED BY 'p'"]).redacted();
        assert_eq!(inv.display(), "mysql <redacted>");
    }

    #[tokio::test]
    async fn test_system_runner_collects_output() {
        let sink = MemorySink::new();
        let out = SystemRunner
            .execute(&Invocation::new("echo").arg("hello").component("t"), &sink)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello\n");
        assert!(sink.contains("hello"));
    }

    #[tokio::test]
    async fn test_system_runner_keeps_reading_past_invalid_utf8() {
        let sink = MemorySink::new();
        let inv = Invocation::new("sh")
            .args(["-c", "printf 'a\\n\\377\\nb\\n'; head -c 300000 /dev/zero | tr '\\0' a"])
            .component("t");
        let out = SystemRunner.execute(&inv, &sink).await.unwrap();
        assert!(out.success());
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(lines[0], "a");
        assert_eq!(lines[1], "\u{FFFD}");
        assert_eq!(lines[2], "b");
        assert_eq!(lines[3].len(), 300000);
        assert!(sink.contains("b"));
    }

    #[tokio::test]
    async fn test_system_runner_feeds_stdin() {
        let sink = MemorySink::new();
        let inv = Invocation::new("cat").input("s3cret-value").silent();
        let out = SystemRunner.execute(&inv, &sink).await.unwrap();
        assert_eq!(out.stdout, "s3cret-value\n");
        assert!(!inv.display().contains("s3cret"));
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let sink = MemorySink::new();
        let err = SystemRunner
            .execute(&Invocation::new("definitely-not-a-real-binary-4711"), &sink)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "dependency_missing");
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let sink = MemorySink::new();
        let inv = Invocation::new("sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(100)));
        let err = SystemRunner.execute(&inv, &sink).await.unwrap_err();
        assert_eq!(err.kind(), "command_timeout");
    }

    #[tokio::test]
    async fn test_fake_simulates_packages_and_units() {
        let fake = FakeRunner::new();
        let sink = MemorySink::new();
        let query = Invocation::new("dpkg-query").args(["-W", "-f=${Status}", "nginx"]);

        assert!(!fake.execute(&query, &sink).await.unwrap().success());
        fake.execute(&Invocation::new("apt-get").args(["install", "-y", "nginx"]), &sink)
            .await
            .unwrap();
        assert!(fake.execute(&query, &sink).await.unwrap().success());

        fake.execute(&Invocation::new("systemctl").args(["start", "nginx"]), &sink)
            .await
            .unwrap();
        assert!(fake.is_active("nginx"));
        assert_eq!(fake.calls_to("apt-get"), vec!["install -y nginx".to_string()]);
    }

    #[tokio::test]
    async fn test_fake_scripted_overrides_and_side_effects() {
        let fake = FakeRunner::new();
        let sink = MemorySink::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        fake.respond("apt-get", CommandOutput::failed(100, "E: lock held"))
            .on("apt-get", move |_| *counter.lock().unwrap() += 1);

        let out = fake
            .execute(&Invocation::new("apt-get").args(["install", "-y", "x"]), &sink)
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(100));
        assert_eq!(*hits.lock().unwrap(), 1);
        assert!(!fake.is_installed("x"));
    }
}
