//! Axum control surface: `/start` keeps one scraper process alive.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::State, routing::get, Json, Router};
use jlh_core::RunStatus;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "jlh-web";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("could not list processes: {0}")]
    Scan(#[source] std::io::Error),
    #[error("could not launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not open scraper log `{path}`: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::Scan(_) => "scan",
            SupervisorError::Spawn { .. } => "spawn",
            SupervisorError::LogFile { .. } => "log file",
        }
    }
}

/// Detects and launches the scraper process.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Marker used both in status messages and to recognise the process.
    fn name(&self) -> &str;

    async fn is_running(&self) -> Result<bool, SupervisorError>;

    /// Fire and forget. The launched process is not awaited.
    async fn launch(&self) -> Result<(), SupervisorError>;
}

/// True when some `ps -Af` line mentions `marker` and is not a grep or log line.
pub fn process_listed(ps_output: &str, marker: &str) -> bool {
    ps_output
        .lines()
        .filter(|line| !line.contains("grep") && !line.contains("log"))
        .any(|line| line.contains(marker))
}

pub struct PsProcessSupervisor {
    program: PathBuf,
    args: Vec<String>,
    marker: String,
    log_file: Option<PathBuf>,
}

impl PsProcessSupervisor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let program = program.into();
        let mut marker = program.display().to_string();
        for arg in &args {
            marker.push(' ');
            marker.push_str(arg);
        }
        Self {
            program,
            args,
            marker,
            log_file: None,
        }
    }

    /// Append the scraper's stdout and stderr to `path` instead of discarding them.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    async fn output_sinks(&self) -> Result<(Stdio, Stdio), SupervisorError> {
        let Some(path) = &self.log_file else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let log_error = |source: std::io::Error| SupervisorError::LogFile {
            path: path.display().to_string(),
            source,
        };
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(log_error)?
            .into_std()
            .await;
        let stderr = stdout.try_clone().map_err(log_error)?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }
}

#[async_trait]
impl ProcessSupervisor for PsProcessSupervisor {
    fn name(&self) -> &str {
        &self.marker
    }

    async fn is_running(&self) -> Result<bool, SupervisorError> {
        let output = Command::new("ps")
            .arg("-Af")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(SupervisorError::Scan)?;
        Ok(process_listed(
            &String::from_utf8_lossy(&output.stdout),
            &self.marker,
        ))
    }

    async fn launch(&self) -> Result<(), SupervisorError> {
        let (stdout, stderr) = self.output_sinks().await?;
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        info!(pid = child.id(), program = %self.marker, "scraper launched");
        Ok(())
    }
}

/// Launch the scraper until it shows up or `max_tries` launches have been made.
pub async fn start_scraper(supervisor: &dyn ProcessSupervisor, max_tries: u32) -> RunStatus {
    info!("/start called");
    let name = supervisor.name();
    let mut tries = 0;

    let result = async {
        while !supervisor.is_running().await? && tries < max_tries {
            info!(
                "scraper not running, attempting to start it (try {} of {max_tries})",
                tries + 1
            );
            supervisor.launch().await?;
            tries += 1;
        }
        supervisor.is_running().await
    }
    .await;

    let status = match result {
        Ok(true) if tries == 0 => RunStatus {
            running: true,
            tries,
            message: format!("{name} already running."),
        },
        Ok(true) => RunStatus {
            running: true,
            tries,
            message: format!("{name} started after {tries} tries."),
        },
        Ok(false) => RunStatus {
            running: false,
            tries,
            message: format!("Failed to start {name} after {tries} tries."),
        },
        Err(err) => {
            warn!(error = %err, tries, "supervisor failed");
            RunStatus {
                running: false,
                tries,
                message: format!("Aborting after {} error on try {tries}: {err}", err.kind()),
            }
        }
    };
    info!(running = status.running, tries = status.tries, message = %status.message, "start result");
    status
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub scraper_program: PathBuf,
    pub scraper_args: Vec<String>,
    pub max_tries: u32,
    /// Where a launched scraper writes its output; `None` discards it.
    pub scraper_log_file: Option<PathBuf>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let current_exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("jlh-cli"));
        Self::from_lookup(|key| std::env::var(key).ok(), current_exe)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, default_program: PathBuf) -> Self {
        Self {
            port: lookup("JLH_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            scraper_program: lookup("JLH_SCRAPER_PROGRAM")
                .map(PathBuf::from)
                .unwrap_or(default_program),
            scraper_args: scraper_args(lookup("JLH_SCRAPER_ARGS")),
            max_tries: lookup("JLH_START_MAX_TRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            scraper_log_file: match lookup("JLH_LOG_FILE") {
                Some(path) if path.trim().is_empty() => None,
                Some(path) => Some(PathBuf::from(path)),
                None => Some(PathBuf::from("jlh-scrape.log")),
            },
        }
    }
}

/// Blank arguments would leave a marker that also matches `jlh-cli serve`.
fn scraper_args(raw: Option<String>) -> Vec<String> {
    let args: Vec<String> = raw
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if args.is_empty() {
        vec!["scrape".to_string()]
    } else {
        args
    }
}

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub max_tries: u32,
}

impl AppState {
    pub fn new(supervisor: Arc<dyn ProcessSupervisor>, max_tries: u32) -> Self {
        Self {
            supervisor,
            max_tries,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/start", get(start_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WebConfig::from_env();
    let mut supervisor = PsProcessSupervisor::new(config.scraper_program.clone(), config.scraper_args.clone());
    if let Some(path) = &config.scraper_log_file {
        info!(path = %path.display(), "scraper output goes to log file");
        supervisor = supervisor.with_log_file(path.clone());
    }
    let state = AppState::new(Arc::new(supervisor), config.max_tries);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "control surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Json<RunStatus> {
    Json(start_scraper(state.supervisor.as_ref(), state.max_tries).await)
}

async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tower::ServiceExt;

    /// Reports running once `launches` reaches `running_after`; `None` never runs.
    struct FakeSupervisor {
        running_after: Option<u32>,
        fail_launch: bool,
        launches: AtomicU32,
    }

    impl FakeSupervisor {
        fn new(running_after: Option<u32>) -> Self {
            Self {
                running_after,
                fail_launch: false,
                launches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ProcessSupervisor for FakeSupervisor {
        fn name(&self) -> &str {
            "jlh-cli scrape"
        }

        async fn is_running(&self) -> Result<bool, SupervisorError> {
            let launches = self.launches.load(Ordering::SeqCst);
            Ok(self.running_after.is_some_and(|n| launches >= n))
        }

        async fn launch(&self) -> Result<(), SupervisorError> {
            if self.fail_launch {
                return Err(SupervisorError::Spawn {
                    program: "jlh-cli".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                });
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn get_status(supervisor: FakeSupervisor) -> RunStatus {
        let app = app(AppState::new(Arc::new(supervisor), 5));
        let resp = app
            .oneshot(Request::builder().uri("/start").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).expect("run status json")
    }

    #[tokio::test]
    async fn start_reports_already_running() {
        let status = get_status(FakeSupervisor::new(Some(0))).await;
        assert!(status.running);
        assert_eq!(status.tries, 0);
        assert_eq!(status.message, "jlh-cli scrape already running.");
    }

    #[tokio::test]
    async fn start_reports_tries_needed() {
        let status = get_status(FakeSupervisor::new(Some(2))).await;
        assert!(status.running);
        assert_eq!(status.tries, 2);
        assert_eq!(status.message, "jlh-cli scrape started after 2 tries.");
    }

    #[tokio::test]
    async fn start_gives_up_after_max_tries() {
        let supervisor = Arc::new(FakeSupervisor::new(None));
        let status = start_scraper(supervisor.as_ref(), 5).await;
        assert!(!status.running);
        assert_eq!(status.tries, 5);
        assert_eq!(status.message, "Failed to start jlh-cli scrape after 5 tries.");
        assert_eq!(supervisor.launches.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn start_aborts_on_supervisor_error() {
        let mut supervisor = FakeSupervisor::new(None);
        supervisor.fail_launch = true;
        let status = get_status(supervisor).await;
        assert!(!status.running);
        assert_eq!(status.tries, 0);
        assert!(status.message.starts_with("Aborting after spawn error on try 0:"));
        assert!(status.message.contains("no such file"));
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let app = app(AppState::new(Arc::new(FakeSupervisor::new(None)), 5));
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[test]
    fn ps_scan_skips_grep_and_log_lines() {
        let ps = "\
UID PID PPID C STIME TTY TIME CMD
root 10 1 0 10:00 ? 00:00:00 grep jlh-cli scrape
root 11 1 0 10:00 ? 00:00:00 tail -f jlh-cli scrape.log
root 12 1 0 10:00 ? 00:00:00 /usr/bin/jlh-cli serve";
        assert!(!process_listed(ps, "jlh-cli scrape"));

        let running = format!("{ps}\nroot 13 1 0 10:00 ? 00:00:01 /usr/bin/jlh-cli scrape");
        assert!(process_listed(&running, "/usr/bin/jlh-cli scrape"));
    }

    #[test]
    fn supervisor_marker_joins_program_and_args() {
        let supervisor = PsProcessSupervisor::new("/usr/bin/jlh-cli", vec!["scrape".to_string()]);
        assert_eq!(supervisor.name(), "/usr/bin/jlh-cli scrape");
    }

    #[test]
    fn web_config_defaults() {
        let config = WebConfig::from_lookup(|_| None, PathBuf::from("/opt/jlh-cli"));
        assert_eq!(config.port, 8000);
        assert_eq!(config.scraper_args, vec!["scrape".to_string()]);
        assert_eq!(config.max_tries, 5);
        assert_eq!(config.scraper_program, PathBuf::from("/opt/jlh-cli"));
        assert_eq!(config.scraper_log_file, Some(PathBuf::from("jlh-scrape.log")));
    }

    #[test]
    fn blank_scraper_args_fall_back_to_scrape() {
        let config = WebConfig::from_lookup(
            |key| (key == "JLH_SCRAPER_ARGS").then(|| "   ".to_string()),
            PathBuf::from("/opt/jlh-cli"),
        );
        assert_eq!(config.scraper_args, vec!["scrape".to_string()]);

        let supervisor = PsProcessSupervisor::new(config.scraper_program, config.scraper_args);
        let ps = "root 12 1 0 10:00 ? 00:00:00 /opt/jlh-cli serve";
        assert!(!process_listed(ps, supervisor.name()));
    }

    #[test]
    fn blank_log_file_discards_scraper_output() {
        let config = WebConfig::from_lookup(
            |key| (key == "JLH_LOG_FILE").then(String::new),
            PathBuf::from("/opt/jlh-cli"),
        );
        assert_eq!(config.scraper_log_file, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launched_scraper_output_is_appended_to_log_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scrape.log");
        std::fs::write(&path, "earlier run\n").expect("seed log");

        let supervisor = PsProcessSupervisor::new(
            "sh",
            vec!["-c".to_string(), "echo term done; echo term failed >&2".to_string()],
        )
        .with_log_file(&path);
        supervisor.launch().await.expect("launch");

        let mut contents = String::new();
        for _ in 0..100 {
            contents = std::fs::read_to_string(&path).expect("read log");
            if contents.contains("term done") && contents.contains("term failed") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(contents.starts_with("earlier run\n"));
        assert!(contents.contains("term done"));
        assert!(contents.contains("term failed"));
    }

    #[tokio::test]
    async fn unopenable_log_file_aborts_launch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let supervisor = PsProcessSupervisor::new("jlh-cli", vec!["scrape".to_string()])
            .with_log_file(dir.path().join("missing").join("scrape.log"));

        let err = supervisor.launch().await.expect_err("log dir is missing");
        assert_eq!(err.kind(), "log file");
    }
}
