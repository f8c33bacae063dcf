//! Uniform invocation of the storage CLI: version check, argument
//! building, output capture, bail-on-unexpected-exit-code, plus
//! RPC/GUI routing and filter-flag translation for tools that expose
//! one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};
use triarchive_core::config::StorageToolGuiConfig;
use triarchive_core::{TriarchiveError, TriarchiveResult};

/// Output larger than this (stdout + stderr, in bytes) is diverted to the
/// log-data directory instead of being embedded in a log line.
const OVERSIZED_OUTPUT_THRESHOLD: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub strict: bool,
    pub expected_exit_codes: Vec<i32>,
    pub is_async: bool,
}

impl RunOptions {
    pub fn strict_zero() -> Self {
        Self {
            strict: true,
            expected_exit_codes: vec![0],
            is_async: false,
        }
    }

    pub fn expecting(codes: &[i32]) -> Self {
        Self {
            strict: true,
            expected_exit_codes: codes.to_vec(),
            is_async: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The storage tool's RPC/GUI banner is matched against a configured
/// pattern to extract connection details when `rcd --rc-web-gui` is
/// launched.
pub fn parse_gui_banner(line: &str, pattern: &str) -> Option<StorageToolGuiConfig> {
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(line)?;
    Some(StorageToolGuiConfig {
        host: caps.name("host")?.as_str().to_string(),
        port: caps.name("port")?.as_str().parse().ok()?,
        user: caps.name("user")?.as_str().to_string(),
        password: caps.name("password")?.as_str().to_string(),
        login_token: caps.name("login_token")?.as_str().to_string(),
        special_commands: HashMap::new(),
        filter_params: Vec::new(),
        list_filter_params: Vec::new(),
        max_async_poll_interval_secs: 60,
    })
}

pub struct StorageTool {
    binary_path: PathBuf,
    log_data_dir: PathBuf,
    default_hashsum: String,
    gui: Option<StorageToolGuiConfig>,
    http: reqwest::Client,
}

impl StorageTool {
    pub fn new(
        binary_path: impl Into<PathBuf>,
        log_data_dir: impl Into<PathBuf>,
        default_hashsum: impl Into<String>,
        gui: Option<StorageToolGuiConfig>,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            log_data_dir: log_data_dir.into(),
            default_hashsum: default_hashsum.into(),
            gui,
            http: reqwest::Client::new(),
        }
    }

    /// Runs `command args...` as a subprocess, unless an RPC-capable GUI
    /// endpoint is configured and `command` has an RPC equivalent, in
    /// which case the call is routed through `run_via_rpc` instead.
    pub async fn run(
        &self,
        command: &str,
        args: &[String],
        opts: RunOptions,
    ) -> TriarchiveResult<CommandOutput> {
        if let Some(gui) = &self.gui {
            if let Some(spec) = gui.special_commands.get(command) {
                return self.run_via_rpc(gui, spec, command, args, &opts).await;
            }
        }
        self.run_subprocess(command, args, &opts).await
    }

    async fn run_subprocess(
        &self,
        command: &str,
        args: &[String],
        opts: &RunOptions,
    ) -> TriarchiveResult<CommandOutput> {
        let translated = self.translate_filter_args(args);
        let output = tokio::process::Command::new(&self.binary_path)
            .arg(command)
            .args(&translated)
            .output()
            .await
            .map_err(|e| TriarchiveError::Transient(format!("failed to spawn storage tool: {e}")))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if stdout.len() + stderr.len() > OVERSIZED_OUTPUT_THRESHOLD {
            self.divert_to_log_data(command, &stdout, &stderr).await?;
        }

        if opts.strict && !opts.expected_exit_codes.contains(&exit_code) {
            return Err(TriarchiveError::ToolExit {
                code: exit_code,
                message: format!("{command}: unexpected exit code, stderr: {stderr}"),
            });
        }

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Translates recognized `--flag value` pairs into a JSON `_filter`
    /// blob per §4.1; unrecognized flags are logged and dropped. Only
    /// applies when a GUI/RPC config is present — plain CLI invocations
    /// pass arguments through untouched.
    fn translate_filter_args(&self, args: &[String]) -> Vec<String> {
        let Some(gui) = &self.gui else {
            return args.to_vec();
        };

        let mut passthrough = Vec::new();
        let mut filter_blob: HashMap<String, Value> = HashMap::new();
        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            if gui.filter_params.contains(arg) {
                let value = iter.next().cloned().unwrap_or_default();
                if gui.list_filter_params.contains(arg) {
                    filter_blob
                        .entry(arg.trim_start_matches("--").to_string())
                        .and_modify(|v| {
                            if let Value::Array(a) = v {
                                a.push(Value::String(value.clone()));
                            }
                        })
                        .or_insert_with(|| Value::Array(vec![Value::String(value)]));
                } else {
                    filter_blob.insert(arg.trim_start_matches("--").to_string(), Value::String(value));
                }
            } else if arg.starts_with("--") {
                warn!(flag = %arg, "unrecognized storage-tool flag, dropping");
            } else {
                passthrough.push(arg.clone());
            }
        }

        if !filter_blob.is_empty() {
            passthrough.push("_filter".to_string());
            passthrough.push(serde_json::to_string(&filter_blob).unwrap_or_default());
        }
        passthrough
    }

    async fn run_via_rpc(
        &self,
        gui: &StorageToolGuiConfig,
        spec: &triarchive_core::config::RpcCommandSpec,
        command: &str,
        args: &[String],
        opts: &RunOptions,
    ) -> TriarchiveResult<CommandOutput> {
        let url = format!("http://{}:{}/{}", gui.host, gui.port, spec.endpoint);
        let mut body = HashMap::new();
        for (name, value) in spec.params.iter().zip(args.iter()) {
            body.insert(name.clone(), value.clone());
        }

        let response = self
            .http
            .post(&url)
            .basic_auth(&gui.user, Some(&gui.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| TriarchiveError::Transient(format!("rpc call to {command} failed: {e}")))?;

        let status = response.status();
        let json: Value = response
            .json()
            .await
            .unwrap_or_else(|_| Value::String(String::new()));

        if opts.is_async {
            if let Some(job_id) = json.get("jobid") {
                return self.poll_async_job(gui, job_id.clone()).await;
            }
        }

        let exit_code = if status.is_success() { 0 } else { status.as_u16() as i32 };
        Ok(CommandOutput {
            exit_code,
            stdout: json.to_string(),
            stderr: String::new(),
        })
    }

    async fn poll_async_job(&self, gui: &StorageToolGuiConfig, job_id: Value) -> TriarchiveResult<CommandOutput> {
        let url = format!("http://{}:{}/job/status", gui.host, gui.port);
        let mut interval = Duration::from_secs(1);
        let cap = Duration::from_secs(gui.max_async_poll_interval_secs);
        loop {
            let response = self
                .http
                .post(&url)
                .basic_auth(&gui.user, Some(&gui.password))
                .json(&serde_json::json!({ "jobid": job_id }))
                .send()
                .await
                .map_err(|e| TriarchiveError::Transient(format!("job poll failed: {e}")))?;
            let json: Value = response.json().await.unwrap_or_default();

            if json.get("finished").and_then(Value::as_bool) == Some(true) {
                let success = json.get("success").and_then(Value::as_bool).unwrap_or(false);
                return Ok(CommandOutput {
                    exit_code: if success { 0 } else { 1 },
                    stdout: json.to_string(),
                    stderr: String::new(),
                });
            }
            if json.get("error").and_then(Value::as_str) == Some("job not found") {
                return Err(TriarchiveError::Transient("async job not found".into()));
            }

            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(cap);
        }
    }

    async fn divert_to_log_data(&self, command: &str, stdout: &str, stderr: &str) -> TriarchiveResult<()> {
        let dir = self.log_data_dir.join(timestamp_dir_name());
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("stdout.log"), stdout).await?;
        tokio::fs::write(dir.join("stderr.log"), stderr).await?;
        info!(command, dir = %dir.display(), "diverted oversized command output to log data directory");
        Ok(())
    }

    /// The sentinel hash used for directories and for files the tool
    /// failed to hash.
    pub fn default_hashsum_sentinel(&self) -> &str {
        &self.default_hashsum
    }

    /// `hashsum <algo> path`, taking the first whitespace-separated token
    /// of stdout, or the configured default sentinel on failure.
    pub async fn hashsum(&self, algo: &str, path: &Path) -> String {
        let output = self
            .run_subprocess(
                "hashsum",
                &[algo.to_string(), path.display().to_string()],
                &RunOptions::default(),
            )
            .await;
        match output {
            Ok(out) if out.exit_code == 0 => out
                .stdout
                .split_whitespace()
                .next()
                .map(String::from)
                .unwrap_or_else(|| self.default_hashsum.clone()),
            _ => self.default_hashsum.clone(),
        }
    }

    pub async fn check(
        &self,
        checkfile: &Path,
        target_root: &str,
        algo: &str,
        differ_file: &Path,
        missing_on_dst_file: &Path,
        missing_on_src_file: &Path,
        expected_exit_codes: &[i32],
    ) -> TriarchiveResult<CommandOutput> {
        self.run(
            "check",
            &[
                checkfile.display().to_string(),
                target_root.to_string(),
                "--checkfile".to_string(),
                algo.to_string(),
                "--differ".to_string(),
                differ_file.display().to_string(),
                "--missing-on-dst".to_string(),
                missing_on_dst_file.display().to_string(),
                "--missing-on-src".to_string(),
                missing_on_src_file.display().to_string(),
            ],
            RunOptions::expecting(expected_exit_codes),
        )
        .await
    }

    pub async fn copy(&self, files_from: &Path, src: &str, dst: &str) -> TriarchiveResult<CommandOutput> {
        self.run(
            "copy",
            &[
                "--files-from".to_string(),
                files_from.display().to_string(),
                src.to_string(),
                dst.to_string(),
            ],
            RunOptions::strict_zero(),
        )
        .await
    }

    pub async fn move_files(&self, files_from: &Path, src: &str, dst: &str) -> TriarchiveResult<CommandOutput> {
        self.run(
            "move",
            &[
                "--files-from".to_string(),
                files_from.display().to_string(),
                src.to_string(),
                dst.to_string(),
            ],
            RunOptions::strict_zero(),
        )
        .await
    }

    pub async fn delete_files(&self, root: &str, files_from: &Path) -> TriarchiveResult<CommandOutput> {
        self.run(
            "delete",
            &[root.to_string(), "--files-from".to_string(), files_from.display().to_string()],
            RunOptions::strict_zero(),
        )
        .await
    }

    pub async fn purge(&self, path: &str) -> TriarchiveResult<CommandOutput> {
        self.run("purge", &[path.to_string()], RunOptions::strict_zero()).await
    }

    /// `lsl root --files-from <list>`: returns `size date time path` lines
    /// for the listed paths, used by the reconciler to fetch remote mtimes
    /// without a full tree walk.
    pub async fn lsl(&self, root: &str, files_from: &Path) -> TriarchiveResult<CommandOutput> {
        self.run(
            "lsl",
            &[root.to_string(), "--files-from".to_string(), files_from.display().to_string()],
            RunOptions::strict_zero(),
        )
        .await
    }

    pub async fn delete_with_min_age(&self, root: &str, min_age: Duration) -> TriarchiveResult<CommandOutput> {
        self.run(
            "delete",
            &[
                root.to_string(),
                "--min-age".to_string(),
                format!("{}s", min_age.as_secs()),
                "--rmdirs".to_string(),
            ],
            RunOptions::default(),
        )
        .await
    }
}

fn timestamp_dir_name() -> String {
    format!("{}", chrono::Utc::now().format("%Y-%m-%d_%H.%M.%S,%f"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gui_banner_extracts_named_fields() {
        let line = "http://user:pw@127.0.0.1:5572/?login_token=abc123 ";
        let pattern = triarchive_core::config::DEFAULT_GUI_URL_PATTERN;
        let parsed = parse_gui_banner(line, pattern).unwrap();
        assert_eq!(parsed.host, "127.0.0.1");
        assert_eq!(parsed.port, 5572);
        assert_eq!(parsed.user, "user");
        assert_eq!(parsed.login_token, "abc123");
    }

    #[test]
    fn parse_gui_banner_rejects_non_matching_line() {
        assert!(parse_gui_banner("not a banner", triarchive_core::config::DEFAULT_GUI_URL_PATTERN).is_none());
    }
}
