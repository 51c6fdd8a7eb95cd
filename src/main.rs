use chrono::Utc;
use clap::{Parser, Subcommand};
use dirs::home_dir;
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:25503";
const DEFAULT_HEALTH_PATH: &str = "/";
const DEFAULT_JAR_PATH: &str = "artifacts/thetadata/ThetaTerminal.jar";
const DEFAULT_JAVA_BIN: &str = "java";
const DEFAULT_CREDS_FILE_NAME: &str = "creds.txt";
const DEFAULT_OUTPUT_DIR: &str = "artifacts/mon-86";
const DEFAULT_SMOKE_RETRY_DELAYS: &str = "2,5,15";
const DEFAULT_SMOKE_COMMAND: [&str; 2] = ["node", "scripts/mon79-thetadata-smoke.js"];

const USER_AGENT: &str = "phenixflow-mon86-bootstrap/1.0";
const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(600);
const HTTP_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const JAR_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(45);
const MIN_JAR_BYTES: usize = 1024;
const HEALTH_BODY_SNIPPET_CHARS: usize = 120;
// 512 bytes covers the 120-char snippet at any UTF-8 width.
const HEALTH_BODY_READ_LIMIT: u64 = 512;
const MIN_HEALTH_POLL_SEC: f64 = 0.1;
const MAX_GATE_WAIT_SEC: f64 = 1_000_000_000.0;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SMOKE_REQUIRED: [&str; 3] = [
    "THETADATA_DOWNLOAD_PATH",
    "THETADATA_BASE_URL (if THETADATA_DOWNLOAD_PATH is relative)",
    "ThetaTerminal running with valid creds.txt",
];

#[derive(Parser, Debug)]
#[command(name = "thetaboot", version, about = "ThetaData terminal bootstrap CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Up {
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = 35.0)]
        health_timeout_sec: f64,
        #[arg(long, default_value_t = 1.0)]
        health_poll_sec: f64,
    },
    Check,
    Smoke {
        #[arg(long)]
        retry_delays_sec: Option<String>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Debug, Error)]
enum ThetabootError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Debug, Clone)]
struct Config {
    base_url: String,
    health_path: String,
    jar_path: PathBuf,
    jar_url: Option<String>,
    java_bin: String,
    java_args: Vec<String>,
    creds_file: Option<String>,
    output_dir: PathBuf,
    dry_run: bool,
    health_timeout_sec: f64,
    health_poll_sec: f64,
}

impl Config {
    // Exactly one separator between the base URL and the health path.
    fn health_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.health_path.starts_with('/') {
            format!("{base}{}", self.health_path)
        } else {
            format!("{base}/{}", self.health_path)
        }
    }
}

#[derive(Debug)]
enum CredsCheck {
    CredsFile,
    Missing { detail: String },
    Invalid { detail: String },
}

impl CredsCheck {
    fn mode(&self) -> &'static str {
        match self {
            CredsCheck::CredsFile => "creds_file",
            CredsCheck::Missing { .. } => "missing",
            CredsCheck::Invalid { .. } => "invalid",
        }
    }

    fn error(&self) -> Option<&str> {
        match self {
            CredsCheck::CredsFile => None,
            CredsCheck::Missing { detail } | CredsCheck::Invalid { detail } => Some(detail),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum ErrorCode {
    MissingCreds,
    PortInUse,
    DownloadFailed,
    HealthTimeout,
    Config,
}

impl ErrorCode {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingCreds => "MISSING_CREDS",
            ErrorCode::PortInUse => "PORT_IN_USE",
            ErrorCode::DownloadFailed => "DOWNLOAD_FAILED",
            ErrorCode::HealthTimeout => "HEALTH_TIMEOUT",
            ErrorCode::Config => "CONFIG",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSummary {
    ok: bool,
    dry_run: bool,
    already_running: bool,
    jar_existed: bool,
    jar_path: String,
    jar_url: Option<String>,
    base_url: String,
    health_url: String,
    log_path: Option<String>,
    pid: Option<u32>,
    error_code: Option<ErrorCode>,
    message: String,
    timestamp: String,
}

// Mutable facts accumulated along the decision sequence; everything else the
// summary needs lives in Config.
#[derive(Debug)]
struct RunState {
    jar_existed: bool,
    pid: Option<u32>,
    log_path: Option<PathBuf>,
}

#[derive(Debug)]
enum RunOutcome {
    AlreadyRunning { detail: String },
    DryRunComplete,
    HealthGatePassed,
    Failed { code: ErrorCode, message: String },
}

#[derive(Debug)]
enum HealthGate {
    Healthy,
    ChildExited { status: ExitStatus, last_detail: String },
    TimedOut { last_detail: String },
    Interrupted { last_detail: String },
}

#[derive(Debug, Serialize)]
struct EnvReport {
    ok: bool,
    issues: Vec<String>,
    warnings: Vec<String>,
    summary: EnvReportSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvReportSummary {
    has_base_url: bool,
    download_path_is_absolute_url: bool,
    auth_mode: &'static str,
}

fn main() -> Result<(), ThetabootError> {
    let cli = Cli::parse();
    let env = environment_map();

    let result = match cli.command {
        Commands::Up {
            dry_run,
            health_timeout_sec,
            health_poll_sec,
        } => handle_up(&env, dry_run, health_timeout_sec, health_poll_sec),
        Commands::Check => handle_check(&env),
        Commands::Smoke {
            retry_delays_sec,
            command,
        } => handle_smoke(&env, retry_delays_sec, command),
    };

    match result {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

// The only place the process environment is read; every component works from
// this snapshot.
fn environment_map() -> BTreeMap<String, String> {
    env::vars().collect()
}

fn handle_up(
    env: &BTreeMap<String, String>,
    dry_run: bool,
    health_timeout_sec: f64,
    health_poll_sec: f64,
) -> Result<i32, ThetabootError> {
    let config = resolve_config(env, dry_run, health_timeout_sec, health_poll_sec);
    let mut state = RunState {
        jar_existed: config.jar_path.exists(),
        pid: None,
        log_path: None,
    };

    let creds = check_terminal_creds(&config);
    if let Some(detail) = creds.error() {
        let message = format!("Authentication preflight failed ({}): {detail}", creds.mode());
        return finalize_run(
            &config,
            &state,
            RunOutcome::Failed {
                code: ErrorCode::MissingCreds,
                message,
            },
        );
    }

    if !is_http_url(&config.base_url) {
        return finalize_run(
            &config,
            &state,
            RunOutcome::Failed {
                code: ErrorCode::Config,
                message: "THETADATA_BASE_URL must start with http:// or https://".to_string(),
            },
        );
    }
    let (host, port) = match parse_base_target(&config.base_url) {
        Some(target) => target,
        None => {
            return finalize_run(
                &config,
                &state,
                RunOutcome::Failed {
                    code: ErrorCode::Config,
                    message: "THETADATA_BASE_URL must be a valid http(s) URL".to_string(),
                },
            )
        }
    };

    let (healthy, health_detail) = http_health(&config.health_url(), HTTP_HEALTH_TIMEOUT);
    if healthy {
        return finalize_run(
            &config,
            &state,
            RunOutcome::AlreadyRunning {
                detail: health_detail,
            },
        );
    }

    // Open port without a passing health check means something else already
    // owns the endpoint; a second launch would fight it for the bind.
    if tcp_probe(&host, port, TCP_PROBE_TIMEOUT) {
        let message = format!(
            "Port {host}:{port} is already in use but health check failed ({health_detail}). Refusing duplicate/unsafe start."
        );
        return finalize_run(
            &config,
            &state,
            RunOutcome::Failed {
                code: ErrorCode::PortInUse,
                message,
            },
        );
    }

    let creds = check_terminal_creds(&config);
    if let Some(detail) = creds.error() {
        let message = format!("Credentials preflight failed ({}): {detail}", creds.mode());
        return finalize_run(
            &config,
            &state,
            RunOutcome::Failed {
                code: ErrorCode::MissingCreds,
                message,
            },
        );
    }

    if !state.jar_existed {
        match config.jar_url.as_deref() {
            None if config.dry_run => {
                println!("[dry-run] jar is missing and THETADATA_JAR_URL is unset; real run would fail with DOWNLOAD_FAILED");
            }
            None => {
                return finalize_run(
                    &config,
                    &state,
                    RunOutcome::Failed {
                        code: ErrorCode::DownloadFailed,
                        message: "Jar missing and THETADATA_JAR_URL is not set".to_string(),
                    },
                )
            }
            Some(url) => match download_jar(url, &config.jar_path, config.dry_run) {
                Ok(detail) => println!("Jar bootstrap: {detail}"),
                Err(detail) => {
                    return finalize_run(
                        &config,
                        &state,
                        RunOutcome::Failed {
                            code: ErrorCode::DownloadFailed,
                            message: format!("Jar download failed: {detail}"),
                        },
                    )
                }
            },
        }
    }

    if config.dry_run {
        return finalize_run(&config, &state, RunOutcome::DryRunComplete);
    }

    if which::which(&config.java_bin).is_err() {
        return finalize_run(
            &config,
            &state,
            RunOutcome::Failed {
                code: ErrorCode::Config,
                message: format!("launcher binary not found: {}", config.java_bin),
            },
        );
    }

    // SIGINT/SIGTERM during the gate still run the graceful-shutdown path.
    let interrupted = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&interrupted))?;
    flag::register(SIGTERM, Arc::clone(&interrupted))?;

    let log_path = config
        .output_dir
        .join(format!("thetadata-service-{}.log", file_stamp()));
    state.log_path = Some(log_path.clone());
    let mut child = match launch_terminal(&config, &log_path) {
        Ok(child) => child,
        Err(err) => {
            return finalize_run(
                &config,
                &state,
                RunOutcome::Failed {
                    code: ErrorCode::Config,
                    message: format!("failed to launch {}: {err}", config.java_bin),
                },
            )
        }
    };
    state.pid = Some(child.id());

    let gate = run_health_gate(&mut child, &config, &health_detail, &interrupted);
    let outcome = match gate {
        HealthGate::Healthy => RunOutcome::HealthGatePassed,
        HealthGate::ChildExited {
            status,
            last_detail,
        } => RunOutcome::Failed {
            code: ErrorCode::HealthTimeout,
            message: format!(
                "ThetaData process exited before the health gate passed (status: {status}; last detail: {last_detail})"
            ),
        },
        HealthGate::TimedOut { last_detail } => RunOutcome::Failed {
            code: ErrorCode::HealthTimeout,
            message: format!(
                "Timed out waiting for healthy ThetaData service at {} after {:.1}s (last detail: {last_detail})",
                config.health_url(),
                config.health_timeout_sec
            ),
        },
        HealthGate::Interrupted { last_detail } => RunOutcome::Failed {
            code: ErrorCode::HealthTimeout,
            message: format!(
                "Interrupted while waiting for healthy ThetaData service at {} (last detail: {last_detail})",
                config.health_url()
            ),
        },
    };
    finalize_run(&config, &state, outcome)
}

// Single terminal-state builder: every orchestration branch funnels through
// here exactly once, so no exit path can persist a partial record.
fn finalize_run(
    config: &Config,
    state: &RunState,
    outcome: RunOutcome,
) -> Result<i32, ThetabootError> {
    let (ok, already_running, error_code, message) = match outcome {
        RunOutcome::AlreadyRunning { detail } => (
            true,
            true,
            None,
            format!("ThetaData already healthy; duplicate start skipped ({detail})"),
        ),
        RunOutcome::DryRunComplete => (
            true,
            false,
            None,
            "Dry run complete: preflight passed; would launch ThetaData and wait for health"
                .to_string(),
        ),
        RunOutcome::HealthGatePassed => (
            true,
            false,
            None,
            "ThetaData bootstrap succeeded and health gate passed".to_string(),
        ),
        RunOutcome::Failed { code, message } => (false, false, Some(code), message),
    };
    let summary = RunSummary {
        ok,
        dry_run: config.dry_run,
        already_running,
        jar_existed: state.jar_existed,
        jar_path: config.jar_path.display().to_string(),
        jar_url: config.jar_url.clone(),
        base_url: config.base_url.clone(),
        health_url: config.health_url(),
        log_path: state.log_path.as_ref().map(|path| path.display().to_string()),
        pid: state.pid,
        error_code,
        message,
        timestamp: now_iso(),
    };
    let artifact = write_summary(&summary, &config.output_dir)?;

    if let Some(code) = summary.error_code {
        eprintln!("{}: {}", code.as_str(), summary.message);
        if let Some(pid) = summary.pid {
            eprintln!("PID={pid}");
        }
        if let Some(log_path) = &summary.log_path {
            eprintln!("LOG={log_path}");
        }
        eprintln!("SUMMARY={}", artifact.display());
    } else {
        println!("{}", summary.message);
        if let Some(pid) = summary.pid {
            println!("PID={pid}");
        }
        if let Some(log_path) = &summary.log_path {
            println!("LOG={log_path}");
        }
        println!("SUMMARY={}", artifact.display());
    }
    if summary.ok || summary.error_code == Some(ErrorCode::MissingCreds) {
        print_env_guidance(&config.base_url, &config.jar_path);
    }
    Ok(if summary.ok { 0 } else { 1 })
}

fn print_env_guidance(base_url: &str, jar_path: &Path) {
    println!("MON-86 ENV GUIDANCE (MON-79/80/81/82)");
    println!("export THETADATA_BASE_URL=\"{base_url}\"");
    println!("export THETADATA_DOWNLOAD_PATH=\"/v3/stock/list/symbols?format=json\"");
    println!("export THETADATA_INGEST_PATH=\"$THETADATA_DOWNLOAD_PATH\"");
    println!("export THETADATA_OUTPUT_DIR=\"artifacts/mon-79\"");
    println!("# ThetaTerminal creds file (email line1, password line2)");
    println!("export THETADATA_CREDS_FILE=\"./creds.txt\"");
    println!("# Optional bootstrap tuning");
    println!("export THETADATA_JAR_PATH=\"{}\"", jar_path.display());
    println!("export THETADATA_HEALTH_PATH=\"/\"");
}

fn resolve_config(
    env: &BTreeMap<String, String>,
    dry_run: bool,
    health_timeout_sec: f64,
    health_poll_sec: f64,
) -> Config {
    let base_url = env_or(env, "THETADATA_BASE_URL", DEFAULT_BASE_URL);
    let health_path = env_or(env, "THETADATA_HEALTH_PATH", DEFAULT_HEALTH_PATH);
    let jar_path = absolutize(PathBuf::from(env_or(
        env,
        "THETADATA_JAR_PATH",
        DEFAULT_JAR_PATH,
    )));
    let jar_url = non_empty(env.get("THETADATA_JAR_URL"));
    let java_bin = env_or(env, "THETADATA_JAVA_BIN", DEFAULT_JAVA_BIN);
    let java_args = split_shell_args(
        env.get("THETADATA_JAVA_ARGS")
            .map(String::as_str)
            .unwrap_or_default(),
    );
    let creds_file = non_empty(env.get("THETADATA_CREDS_FILE"));
    let output_dir = absolutize(PathBuf::from(env_or(
        env,
        "THETADATA_BOOTSTRAP_OUTPUT_DIR",
        DEFAULT_OUTPUT_DIR,
    )));
    Config {
        base_url,
        health_path,
        jar_path,
        jar_url,
        java_bin,
        java_args,
        creds_file,
        output_dir,
        dry_run,
        health_timeout_sec: clamp_seconds(health_timeout_sec, 0.0, MAX_GATE_WAIT_SEC),
        health_poll_sec: clamp_seconds(health_poll_sec, MIN_HEALTH_POLL_SEC, MAX_GATE_WAIT_SEC),
    }
}

// Clap accepts any f64 here, including inf and nan; Duration::from_secs_f64
// does not.
fn clamp_seconds(value: f64, min: f64, max: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else if value > 0.0 {
        max
    } else {
        min
    }
}

fn env_or(env: &BTreeMap<String, String>, key: &str, default: &str) -> String {
    env.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

// Quoted tokens keep embedded whitespace; no escape processing. An
// unterminated quote consumes the rest of the input rather than failing.
fn split_shell_args(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    for ch in raw.chars() {
        match quote {
            Some(open) => {
                if ch == open {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_token = true;
                }
                ch if ch.is_whitespace() => {
                    if in_token {
                        args.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                ch => {
                    current.push(ch);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

fn check_terminal_creds(config: &Config) -> CredsCheck {
    let jar_parent = match config.jar_path.parent() {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };
    let configured = config
        .creds_file
        .as_deref()
        .unwrap_or(DEFAULT_CREDS_FILE_NAME);
    let mut path = PathBuf::from(expand_path(configured));
    if !path.is_absolute() {
        path = jar_parent.join(path);
    }
    if !path.exists() {
        return CredsCheck::Missing {
            detail: format!(
                "Missing creds file at {}. Create creds.txt with email on line 1 and password on line 2.",
                path.display()
            ),
        };
    }
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            return CredsCheck::Invalid {
                detail: format!("Unable to read creds file {}: {err}", path.display()),
            }
        }
    };
    let non_blank = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .count();
    if non_blank < 2 {
        return CredsCheck::Invalid {
            detail: format!(
                "Creds file {} must contain email on line 1 and password on line 2",
                path.display()
            ),
        };
    }
    CredsCheck::CredsFile
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn parse_base_target(base_url: &str) -> Option<(String, u16)> {
    let parsed = reqwest::Url::parse(base_url).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    let host = parsed
        .host_str()?
        .trim_matches(|c| c == '[' || c == ']')
        .to_string();
    let port = parsed.port_or_known_default()?;
    Some((host, port))
}

fn tcp_probe(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    false
}

fn http_health(url: &str, timeout: Duration) -> (bool, String) {
    let client = reqwest::blocking::Client::new();
    let result = client
        .get(url)
        .timeout(timeout)
        .header("User-Agent", USER_AGENT)
        .send();
    match result {
        Ok(response) => {
            let status = response.status().as_u16();
            let mut head = Vec::new();
            let _ = response.take(HEALTH_BODY_READ_LIMIT).read_to_end(&mut head);
            let snippet: String = String::from_utf8_lossy(&head)
                .chars()
                .take(HEALTH_BODY_SNIPPET_CHARS)
                .collect();
            (status < 500, format!("status={status} body={snippet}"))
        }
        Err(err) => (false, err.to_string()),
    }
}

fn download_jar(url: &str, dest: &Path, dry_run: bool) -> Result<String, String> {
    ensure_parent(dest).map_err(|err| err.to_string())?;
    if dry_run {
        return Ok(format!(
            "[dry-run] would download {url} -> {}",
            dest.display()
        ));
    }
    let client = reqwest::blocking::Client::new();
    let response = client
        .get(url)
        .timeout(JAR_DOWNLOAD_TIMEOUT)
        .header("User-Agent", USER_AGENT)
        .send()
        .map_err(|err| err.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("download failed: HTTP {status}"));
    }
    let bytes = response.bytes().map_err(|err| err.to_string())?;
    if bytes.len() < MIN_JAR_BYTES {
        return Err(format!(
            "download too small ({} bytes); expected a jar",
            bytes.len()
        ));
    }
    fs::write(dest, &bytes).map_err(|err| err.to_string())?;
    Ok(format!("downloaded {} bytes", bytes.len()))
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn launch_terminal(config: &Config, log_path: &Path) -> io::Result<Child> {
    ensure_parent(log_path)?;
    let mut log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let mut command_line = vec![config.java_bin.clone()];
    command_line.extend(config.java_args.iter().cloned());
    command_line.push("-jar".to_string());
    command_line.push(config.jar_path.display().to_string());
    writeln!(log, "[{}] launching: {}", now_iso(), command_line.join(" "))?;
    let stdout_log = log.try_clone()?;
    let mut cmd = Command::new(&config.java_bin);
    cmd.args(&config.java_args);
    cmd.arg("-jar").arg(&config.jar_path);
    cmd.stdout(Stdio::from(stdout_log));
    cmd.stderr(Stdio::from(log));
    if let Some(parent) = config.jar_path.parent() {
        cmd.current_dir(parent);
    }
    cmd.spawn()
}

fn run_health_gate(
    child: &mut Child,
    config: &Config,
    seed_detail: &str,
    interrupted: &AtomicBool,
) -> HealthGate {
    let deadline = Instant::now() + Duration::from_secs_f64(config.health_timeout_sec);
    let poll = Duration::from_secs_f64(config.health_poll_sec);
    let health_url = config.health_url();
    let mut last_detail = seed_detail.to_string();
    let outcome = loop {
        if interrupted.load(Ordering::Relaxed) {
            break HealthGate::Interrupted { last_detail };
        }
        let (healthy, detail) = http_health(&health_url, HTTP_HEALTH_TIMEOUT);
        last_detail = detail;
        if healthy {
            return HealthGate::Healthy;
        }
        if let Ok(Some(status)) = child.try_wait() {
            break HealthGate::ChildExited {
                status,
                last_detail,
            };
        }
        if Instant::now() >= deadline {
            break HealthGate::TimedOut { last_detail };
        }
        thread::sleep(poll);
    };
    shutdown_child(child);
    outcome
}

// Best effort; the child may already be exiting on its own.
fn shutdown_child(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    let _ = Command::new("kill").arg(child.id().to_string()).status();
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn file_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

fn write_summary(summary: &RunSummary, output_dir: &Path) -> Result<PathBuf, ThetabootError> {
    fs::create_dir_all(output_dir)?;
    let stamp = file_stamp();
    let payload = serde_json::to_string_pretty(summary)?;
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("mon86-bootstrap-{stamp}.json")
        } else {
            format!("mon86-bootstrap-{stamp}-{attempt}.json")
        };
        let path = output_dir.join(name);
        // create_new keeps the history append-only even when two runs land
        // in the same second.
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(payload.as_bytes())?;
                return Ok(path);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => return Err(err.into()),
        }
    }
}

fn handle_check(env: &BTreeMap<String, String>) -> Result<i32, ThetabootError> {
    let report = evaluate_env(env);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.ok { 0 } else { 1 })
}

fn evaluate_env(env: &BTreeMap<String, String>) -> EnvReport {
    let download_path = env
        .get("THETADATA_DOWNLOAD_PATH")
        .map(|value| value.trim())
        .unwrap_or_default();
    let base_url = env
        .get("THETADATA_BASE_URL")
        .map(|value| value.trim())
        .unwrap_or_default();
    let creds_file = env
        .get("THETADATA_CREDS_FILE")
        .map(|value| value.trim())
        .unwrap_or_default();
    let retry_delays = env
        .get("THETADATA_RETRY_DELAYS_MS")
        .map(|value| value.trim())
        .unwrap_or_default();

    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    if download_path.is_empty() {
        issues.push("Missing THETADATA_DOWNLOAD_PATH".to_string());
    } else {
        if !is_http_url(download_path) && base_url.is_empty() {
            issues.push("Missing THETADATA_BASE_URL for relative endpoint paths".to_string());
        }
        if is_placeholder(download_path) {
            issues.push("THETADATA_DOWNLOAD_PATH still looks like a placeholder".to_string());
        }
    }
    if !base_url.is_empty() {
        if is_placeholder(base_url) {
            issues.push("THETADATA_BASE_URL still looks like a placeholder".to_string());
        }
        if !is_http_url(base_url) {
            issues.push("THETADATA_BASE_URL must start with http:// or https://".to_string());
        }
    }
    if !creds_file.is_empty() && !Path::new(&expand_path(creds_file)).exists() {
        warnings.push("THETADATA_CREDS_FILE is set but file does not exist".to_string());
    }
    if !retry_delays.is_empty() && !looks_like_delay_list(retry_delays) {
        warnings.push(
            "THETADATA_RETRY_DELAYS_MS should be comma-separated integers, e.g. 2000,5000,15000"
                .to_string(),
        );
    }

    EnvReport {
        ok: issues.is_empty(),
        issues,
        warnings,
        summary: EnvReportSummary {
            has_base_url: !base_url.is_empty(),
            download_path_is_absolute_url: is_http_url(download_path),
            auth_mode: "terminal_creds",
        },
    }
}

fn is_placeholder(value: &str) -> bool {
    let lowered = value.to_lowercase();
    ["example", "changeme", "your_", "<", "placeholder"]
        .iter()
        .any(|token| lowered.contains(token))
}

fn looks_like_delay_list(value: &str) -> bool {
    value
        .split(',')
        .all(|piece| !piece.is_empty() && piece.bytes().all(|b| b.is_ascii_digit()))
}

fn handle_smoke(
    env: &BTreeMap<String, String>,
    retry_delays_sec: Option<String>,
    command: Vec<String>,
) -> Result<i32, ThetabootError> {
    let raw_delays = retry_delays_sec
        .or_else(|| env.get("MON79_RUNNER_RETRY_DELAYS_SEC").cloned())
        .unwrap_or_else(|| DEFAULT_SMOKE_RETRY_DELAYS.to_string());
    let delays = parse_smoke_retry_delays(&raw_delays).map_err(ThetabootError::Config)?;

    let report = evaluate_env(env);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.ok {
        eprintln!("MON-79 preflight blocked: missing ThetaData configuration");
        for requirement in SMOKE_REQUIRED {
            eprintln!("- {requirement}");
        }
        return Ok(1);
    }

    let command = if command.is_empty() {
        DEFAULT_SMOKE_COMMAND
            .iter()
            .map(|part| part.to_string())
            .collect()
    } else {
        command
    };
    let (program, args) = match command.split_first() {
        Some(split) => split,
        None => return Err(ThetabootError::Config("smoke command is empty".to_string())),
    };

    let attempts = delays.len() + 1;
    for attempt in 1..=attempts {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| ThetabootError::Process(format!("failed to run {program}: {err}")))?;
        io::stdout().write_all(&output.stdout)?;
        if output.status.success() {
            return Ok(0);
        }
        io::stderr().write_all(&output.stderr)?;
        if attempt < attempts {
            let delay = delays[attempt - 1];
            eprintln!("MON-79 smoke attempt {attempt}/{attempts} failed; retrying in {delay}s");
            thread::sleep(Duration::from_secs(delay));
        }
    }
    eprintln!("MON-79 smoke failed after {attempts} attempts");
    Ok(1)
}

fn parse_smoke_retry_delays(raw: &str) -> Result<Vec<u64>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .filter(|piece| !piece.is_empty())
        .map(|piece| {
            piece
                .trim()
                .parse::<u64>()
                .map_err(|_| "retry delays must be comma-separated integers, e.g. 2,5,15".to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn test_config(env: &BTreeMap<String, String>) -> Config {
        resolve_config(env, false, 35.0, 1.0)
    }

    fn sample_summary(ok: bool) -> RunSummary {
        RunSummary {
            ok,
            dry_run: false,
            already_running: false,
            jar_existed: false,
            jar_path: "/tmp/terminal.jar".to_string(),
            jar_url: None,
            base_url: "http://127.0.0.1:25503".to_string(),
            health_url: "http://127.0.0.1:25503/".to_string(),
            log_path: None,
            pid: None,
            error_code: if ok { None } else { Some(ErrorCode::MissingCreds) },
            message: "test".to_string(),
            timestamp: now_iso(),
        }
    }

    #[test]
    fn resolve_config_applies_defaults() {
        let config = test_config(&env_map(&[]));
        assert_eq!(config.base_url, "http://127.0.0.1:25503");
        assert_eq!(config.health_path, "/");
        assert_eq!(config.health_url(), "http://127.0.0.1:25503/");
        assert_eq!(config.java_bin, "java");
        assert!(config.java_args.is_empty());
        assert!(config.jar_url.is_none());
        assert!(config.creds_file.is_none());
        assert!(config.jar_path.is_absolute());
        assert!(config
            .jar_path
            .ends_with("artifacts/thetadata/ThetaTerminal.jar"));
        assert!(config.output_dir.is_absolute());
        assert!(config.output_dir.ends_with("artifacts/mon-86"));
    }

    #[test]
    fn resolve_config_trims_and_drops_blank_values() {
        let env = env_map(&[
            ("THETADATA_BASE_URL", "  http://10.0.0.5:9000/  "),
            ("THETADATA_HEALTH_PATH", "status"),
            ("THETADATA_JAR_URL", "   "),
            ("THETADATA_JAVA_BIN", " java17 "),
            ("THETADATA_JAVA_ARGS", " -Xmx512m "),
        ]);
        let config = test_config(&env);
        assert_eq!(config.base_url, "http://10.0.0.5:9000/");
        assert_eq!(config.health_url(), "http://10.0.0.5:9000/status");
        assert!(config.jar_url.is_none());
        assert_eq!(config.java_bin, "java17");
        assert_eq!(config.java_args, vec!["-Xmx512m"]);
    }

    #[test]
    fn resolve_config_clamps_degenerate_gate_timings() {
        let env = env_map(&[]);
        let config = resolve_config(&env, false, f64::INFINITY, f64::NAN);
        assert_eq!(config.health_timeout_sec, MAX_GATE_WAIT_SEC);
        assert_eq!(config.health_poll_sec, MIN_HEALTH_POLL_SEC);
        let config = resolve_config(&env, false, -3.0, 1e20);
        assert_eq!(config.health_timeout_sec, 0.0);
        assert_eq!(config.health_poll_sec, MAX_GATE_WAIT_SEC);
        let config = resolve_config(&env, false, 35.0, 1.0);
        assert_eq!(config.health_timeout_sec, 35.0);
        assert_eq!(config.health_poll_sec, 1.0);
    }

    #[test]
    fn whitespace_only_env_values_fall_back_to_defaults() {
        let config = test_config(&env_map(&[
            ("THETADATA_BASE_URL", "   "),
            ("THETADATA_JAVA_BIN", " \t "),
        ]));
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.java_bin, DEFAULT_JAVA_BIN);
    }

    #[test]
    fn health_url_joins_with_single_separator() {
        let mut config = test_config(&env_map(&[("THETADATA_BASE_URL", "http://h:1///")]));
        config.health_path = "/x".to_string();
        assert_eq!(config.health_url(), "http://h:1/x");
        config.health_path = "x".to_string();
        assert_eq!(config.health_url(), "http://h:1/x");
    }

    #[test]
    fn split_shell_args_handles_quotes() {
        assert!(split_shell_args("").is_empty());
        assert_eq!(split_shell_args("-Xmx4g"), vec!["-Xmx4g"]);
        assert_eq!(
            split_shell_args("-Xmx4g \"-Dname=theta data\" 'a b'"),
            vec!["-Xmx4g", "-Dname=theta data", "a b"]
        );
        assert_eq!(split_shell_args("  a   b  "), vec!["a", "b"]);
        assert_eq!(split_shell_args("\"\""), vec![""]);
        assert_eq!(split_shell_args("\"open ended"), vec!["open ended"]);
    }

    #[test]
    fn parse_base_target_extracts_host_and_port() {
        assert_eq!(
            parse_base_target("http://127.0.0.1:25503"),
            Some(("127.0.0.1".to_string(), 25503))
        );
        assert_eq!(
            parse_base_target("http://example.com"),
            Some(("example.com".to_string(), 80))
        );
        assert_eq!(
            parse_base_target("https://example.com"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(parse_base_target("http://"), None);
        assert_eq!(parse_base_target("not a url"), None);
        assert_eq!(parse_base_target("ftp://example.com"), None);
    }

    #[test]
    fn creds_check_reports_missing_file() {
        let dir = tempdir().unwrap();
        let jar = dir.path().join("terminal.jar");
        let config = test_config(&env_map(&[("THETADATA_JAR_PATH", jar.to_str().unwrap())]));
        let check = check_terminal_creds(&config);
        assert_eq!(check.mode(), "missing");
        assert!(check.error().unwrap().contains("Missing creds file at"));
    }

    #[test]
    fn creds_check_requires_two_non_blank_lines() {
        let dir = tempdir().unwrap();
        let jar = dir.path().join("terminal.jar");
        fs::write(dir.path().join("creds.txt"), "only-email\n\n").unwrap();
        let config = test_config(&env_map(&[("THETADATA_JAR_PATH", jar.to_str().unwrap())]));
        let check = check_terminal_creds(&config);
        assert_eq!(check.mode(), "invalid");
        assert!(check
            .error()
            .unwrap()
            .contains("must contain email on line 1 and password on line 2"));
    }

    #[test]
    fn creds_check_accepts_two_line_file() {
        let dir = tempdir().unwrap();
        let jar = dir.path().join("terminal.jar");
        fs::write(dir.path().join("creds.txt"), "user@example.com\nhunter2\n").unwrap();
        let config = test_config(&env_map(&[("THETADATA_JAR_PATH", jar.to_str().unwrap())]));
        let check = check_terminal_creds(&config);
        assert_eq!(check.mode(), "creds_file");
        assert!(check.error().is_none());
    }

    #[test]
    fn creds_override_resolves_relative_to_jar_parent() {
        let dir = tempdir().unwrap();
        let jar = dir.path().join("nested").join("terminal.jar");
        fs::create_dir_all(jar.parent().unwrap()).unwrap();
        fs::write(jar.parent().unwrap().join("alt-creds.txt"), "a@b.c\npw\n").unwrap();
        let config = test_config(&env_map(&[
            ("THETADATA_JAR_PATH", jar.to_str().unwrap()),
            ("THETADATA_CREDS_FILE", "alt-creds.txt"),
        ]));
        assert_eq!(check_terminal_creds(&config).mode(), "creds_file");
    }

    #[test]
    fn tcp_probe_reports_open_and_closed_ports() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_probe("127.0.0.1", port, TCP_PROBE_TIMEOUT));
        drop(listener);
        assert!(!tcp_probe("127.0.0.1", port, TCP_PROBE_TIMEOUT));
    }

    #[test]
    fn download_jar_dry_run_skips_network_and_creates_parent() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("artifacts").join("terminal.jar");
        let detail = download_jar("http://127.0.0.1:1/terminal.jar", &dest, true).unwrap();
        assert!(detail.starts_with("[dry-run] would download"));
        assert!(dest.parent().unwrap().is_dir());
        assert!(!dest.exists());
    }

    #[test]
    fn write_summary_never_overwrites() {
        let dir = tempdir().unwrap();
        let summary = sample_summary(true);
        let first = write_summary(&summary, dir.path()).unwrap();
        let second = write_summary(&summary, dir.path()).unwrap();
        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }

    #[test]
    fn run_summary_uses_wire_field_names() {
        let summary = sample_summary(false);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&summary).unwrap()).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "ok",
            "dryRun",
            "alreadyRunning",
            "jarExisted",
            "jarPath",
            "jarUrl",
            "baseUrl",
            "healthUrl",
            "logPath",
            "pid",
            "errorCode",
            "message",
            "timestamp",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
        assert_eq!(object["errorCode"], "MISSING_CREDS");
        assert!(object["logPath"].is_null());
        assert!(object["pid"].is_null());
    }

    #[test]
    fn error_codes_serialize_to_contract_names() {
        for (code, expected) in [
            (ErrorCode::MissingCreds, "MISSING_CREDS"),
            (ErrorCode::PortInUse, "PORT_IN_USE"),
            (ErrorCode::DownloadFailed, "DOWNLOAD_FAILED"),
            (ErrorCode::HealthTimeout, "HEALTH_TIMEOUT"),
            (ErrorCode::Config, "CONFIG"),
        ] {
            assert_eq!(
                serde_json::to_string(&code).unwrap(),
                format!("\"{expected}\"")
            );
            assert_eq!(code.as_str(), expected);
        }
    }

    #[test]
    fn evaluate_env_flags_missing_download_path() {
        let report = evaluate_env(&env_map(&[]));
        assert!(!report.ok);
        assert_eq!(report.issues, vec!["Missing THETADATA_DOWNLOAD_PATH"]);
        assert_eq!(report.summary.auth_mode, "terminal_creds");
        assert!(!report.summary.has_base_url);
        assert!(!report.summary.download_path_is_absolute_url);
    }

    #[test]
    fn evaluate_env_requires_base_url_for_relative_paths() {
        let report = evaluate_env(&env_map(&[(
            "THETADATA_DOWNLOAD_PATH",
            "/v3/stock/list/symbols",
        )]));
        assert_eq!(
            report.issues,
            vec!["Missing THETADATA_BASE_URL for relative endpoint paths"]
        );
    }

    #[test]
    fn evaluate_env_accepts_absolute_download_url() {
        let report = evaluate_env(&env_map(&[(
            "THETADATA_DOWNLOAD_PATH",
            "http://127.0.0.1:25503/v3/stock/list/symbols",
        )]));
        assert!(report.ok, "{:?}", report.issues);
        assert!(report.summary.download_path_is_absolute_url);
    }

    #[test]
    fn evaluate_env_detects_placeholders_and_bad_scheme() {
        let report = evaluate_env(&env_map(&[
            ("THETADATA_DOWNLOAD_PATH", "https://example.com/v1"),
            ("THETADATA_BASE_URL", "ftp://changeme"),
        ]));
        assert!(report
            .issues
            .contains(&"THETADATA_DOWNLOAD_PATH still looks like a placeholder".to_string()));
        assert!(report
            .issues
            .contains(&"THETADATA_BASE_URL still looks like a placeholder".to_string()));
        assert!(report
            .issues
            .contains(&"THETADATA_BASE_URL must start with http:// or https://".to_string()));
    }

    #[test]
    fn evaluate_env_warns_without_failing() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.txt");
        let report = evaluate_env(&env_map(&[
            ("THETADATA_DOWNLOAD_PATH", "http://127.0.0.1:25503/v3/x"),
            ("THETADATA_CREDS_FILE", missing.to_str().unwrap()),
            ("THETADATA_RETRY_DELAYS_MS", "2000;5000"),
        ]));
        assert!(report.ok);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn delay_list_shape_check_matches_digit_csv() {
        assert!(looks_like_delay_list("2000"));
        assert!(looks_like_delay_list("2000,5000,15000"));
        assert!(!looks_like_delay_list("2000,"));
        assert!(!looks_like_delay_list("2000,5s"));
        assert!(!looks_like_delay_list(",2000"));
    }

    #[test]
    fn parse_smoke_retry_delays_accepts_lists_and_empties() {
        assert_eq!(parse_smoke_retry_delays("2,5,15").unwrap(), vec![2, 5, 15]);
        assert_eq!(parse_smoke_retry_delays(" 2, 5 ").unwrap(), vec![2, 5]);
        assert!(parse_smoke_retry_delays("").unwrap().is_empty());
        assert!(parse_smoke_retry_delays("  ").unwrap().is_empty());
        assert_eq!(parse_smoke_retry_delays("2,,5").unwrap(), vec![2, 5]);
        assert!(parse_smoke_retry_delays("2,x").is_err());
        assert_eq!(parse_smoke_retry_delays("0").unwrap(), vec![0]);
    }
}
