//! Native administrative tools (`pg_dump`, `pg_restore`, `psql`, `mysqldump`,
//! `mysql`, `sqlite3`) run as child processes.

use crate::vault::model::connection::{ConnectionConfig, Engine};
use crate::vault::redacted::{RedactedString, REDACTED};
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use validator::Validate;

static STDERR_TAIL_LINES: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tool {
    PgDump,
    PgRestore,
    Psql,
    MySqlDump,
    MySql,
    Sqlite3,
}

impl Tool {
    pub fn binary(&self) -> &'static str {
        match self {
            Tool::PgDump => "pg_dump",
            Tool::PgRestore => "pg_restore",
            Tool::Psql => "psql",
            Tool::MySqlDump => "mysqldump",
            Tool::MySql => "mysql",
            Tool::Sqlite3 => "sqlite3",
        }
    }
}

/// Where to find the native tools. Unset entries are looked up on `PATH`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub pg_dump: Option<PathBuf>,
    pub pg_restore: Option<PathBuf>,
    pub psql: Option<PathBuf>,
    pub mysqldump: Option<PathBuf>,
    pub mysql: Option<PathBuf>,
    pub sqlite3: Option<PathBuf>,
    /// Treat every native tool as missing, for hosts without client packages.
    pub disabled: bool,
}

impl ToolsConfig {
    pub fn path(&self, tool: Tool) -> PathBuf {
        let configured = match tool {
            Tool::PgDump => &self.pg_dump,
            Tool::PgRestore => &self.pg_restore,
            Tool::Psql => &self.psql,
            Tool::MySqlDump => &self.mysqldump,
            Tool::MySql => &self.mysql,
            Tool::Sqlite3 => &self.sqlite3,
        };
        configured
            .clone()
            .unwrap_or_else(|| PathBuf::from(tool.binary()))
    }

    pub fn command(&self, tool: Tool) -> ToolCommand {
        ToolCommand {
            tool,
            program: self.path(tool),
            disabled: self.disabled,
            args: vec![],
            env: vec![],
            stdin: None,
            stdout: None,
        }
    }
}

#[derive(Debug)]
pub struct ToolCommand {
    tool: Tool,
    program: PathBuf,
    disabled: bool,
    args: Vec<String>,
    env: Vec<(String, RedactedString)>,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: String,
    /// Tail of stderr, tools print warnings there even on success
    pub stderr: String,
}

impl ToolCommand {
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn secret_env<K: Into<String>>(mut self, key: K, value: RedactedString) -> Self {
        self.env.push((key.into(), value));
        self
    }

    pub fn stdin_file(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }

    pub fn stdout_file(mut self, path: &Path) -> Self {
        self.stdout = Some(path.to_path_buf());
        self
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    /// Command line safe for logs: secrets passed through the environment show
    /// up as redacted assignments.
    pub fn display(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, _)| format!("{k}={REDACTED}"))
            .collect();
        parts.push(self.program.display().to_string());
        parts.extend(self.args.iter().map(|a| {
            if a.is_empty() || a.contains(char::is_whitespace) {
                format!("'{a}'")
            } else {
                a.clone()
            }
        }));
        if let Some(stdin) = &self.stdin {
            parts.push(format!("< {}", stdin.display()));
        }
        if let Some(stdout) = &self.stdout {
            parts.push(format!("> {}", stdout.display()));
        }
        parts.join(" ")
    }

    /// Runs the tool to completion. A tool that cannot be started is
    /// [`Error::ToolUnavailable`], a non-zero exit is [`Error::ToolFailed`].
    pub fn run(&self) -> Result<ToolOutput> {
        let name = self.tool.binary();
        if self.disabled {
            return Err(Error::tool_unavailable(name, "native tools are disabled"));
        }
        tracing::debug!("Running {}", self.display());

        let mut command = Command::new(&self.program);
        command.args(&self.args).stderr(Stdio::piped());
        for (k, v) in &self.env {
            command.env(k, v.inner());
        }
        command.stdin(match &self.stdin {
            Some(path) => Stdio::from(File::open(path)?),
            None => Stdio::null(),
        });
        command.stdout(match &self.stdout {
            Some(path) => Stdio::from(File::create(path)?),
            None => Stdio::piped(),
        });

        let child = command.spawn().map_err(|e| match e.kind() {
            IoErrorKind::NotFound | IoErrorKind::PermissionDenied => {
                Error::tool_unavailable(name, format!("{}: {e}", self.program.display()))
            }
            _ => Error::from(e),
        })?;
        let output = child.wait_with_output()?;
        let stderr = tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES);
        if !output.status.success() {
            return Err(Error::ToolFailed {
                command: self.display(),
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Connection arguments and password environment for a server engine tool.
pub fn connection_args(tools: &ToolsConfig, tool: Tool, config: &ConnectionConfig) -> ToolCommand {
    let mut cmd = tools.command(tool);
    let host = config.host.clone().unwrap_or_else(|| "localhost".to_owned());
    let port = config.port_or_default().unwrap_or_default().to_string();
    match config.engine {
        Engine::Postgres => {
            cmd = cmd.args(["--host", host.as_str(), "--port", port.as_str(), "--no-password"]);
            if let Some(user) = &config.username {
                cmd = cmd.args(["--username", user.as_str()]);
            }
            if let Some(password) = &config.password {
                cmd = cmd.secret_env("PGPASSWORD", password.clone());
            }
        }
        Engine::MySql => {
            cmd = cmd.args(["--host", host.as_str(), "--port", port.as_str()]);
            if let Some(user) = &config.username {
                cmd = cmd.arg(format!("--user={user}"));
            }
            if let Some(password) = &config.password {
                cmd = cmd.secret_env("MYSQL_PWD", password.clone());
            }
        }
        Engine::Sqlite => {}
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::result_error::error::ErrorKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn pg_config() -> ConnectionConfig {
        ConnectionConfig {
            id: Uuid::new_v4(),
            name: "main".into(),
            engine: Engine::Postgres,
            host: Some("db.internal".into()),
            port: None,
            username: Some("app".into()),
            password: Some("s3cret".into()),
            database: "shop".into(),
            is_active: true,
            is_default: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_display_hides_password() {
        let cmd = connection_args(&ToolsConfig::default(), Tool::PgRestore, &pg_config())
            .args(["--clean", "--if-exists", "--dbname", "shop"]);
        let shown = cmd.display();
        assert!(shown.starts_with(&format!("PGPASSWORD={REDACTED} pg_restore --host db.internal --port 5432")));
        assert!(shown.contains("--username app"));
        assert!(!shown.contains("s3cret"));
    }

    #[test]
    fn test_missing_binary_is_tool_unavailable() {
        let tools = ToolsConfig {
            psql: Some("/nonexistent/bin/psql".into()),
            ..Default::default()
        };
        let err = tools.command(Tool::Psql).arg("--version").run().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolUnavailable);
    }

    #[test]
    fn test_disabled_tools() {
        let tools = ToolsConfig {
            disabled: true,
            ..Default::default()
        };
        let err = tools.command(Tool::Sqlite3).run().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolUnavailable);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_is_tool_failed() {
        let tools = ToolsConfig {
            sqlite3: Some("/bin/sh".into()),
            ..Default::default()
        };
        let err = tools
            .command(Tool::Sqlite3)
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolFailed);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }
}
