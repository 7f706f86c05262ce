use crate::error::{Error, Result};
use crate::logging;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr);
        }
        text
    }
}

/// Runs `argv[0]` with the remaining tokens as arguments and waits for it.
/// A missing program or a non-zero exit is an `ExternalTool` error.
pub async fn run<S: AsRef<str>>(argv: &[S]) -> Result<Output> {
    run_logged(argv, logging::verbose()).await
}

pub(crate) async fn run_logged<S: AsRef<str>>(argv: &[S], verbose: bool) -> Result<Output> {
    let argv: Vec<&str> = argv.iter().map(AsRef::as_ref).collect();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::ExternalTool("empty command".to_string()))?;
    let command_line = argv.join(" ");
    if verbose {
        info!(command = %command_line, "running command");
    }

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| Error::ExternalTool(format!("{}: {}", program, err)))?;
    let output_text = Output {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    if verbose {
        info!(
            command = %command_line,
            status = %output.status,
            output = %output_text.combined(),
            "command finished"
        );
    }
    if !output.status.success() {
        return Err(Error::ExternalTool(format!(
            "\"{}\" exited with {}: {}",
            command_line,
            output.status,
            output_text.combined()
        )));
    }
    Ok(output_text)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() -> anyhow::Result<()> {
        let output = run(&["sh", "-c", "printf hello; printf oops >&2"]).await?;
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.combined(), "hello\noops");
        Ok(())
    }

    #[tokio::test]
    async fn non_zero_exit_reports_argv_and_output() {
        let err = run(&["sh", "-c", "echo broken >&2; exit 3"]).await.unwrap_err();
        let text = err.to_string();
        assert!(matches!(err, Error::ExternalTool(_)));
        assert!(text.contains("sh -c"));
        assert!(text.contains("broken"));
    }

    #[tokio::test]
    async fn missing_program_is_external_tool_error() {
        let err = run(&["/nonexistent/cellguard-helper"]).await.unwrap_err();
        assert!(matches!(err, Error::ExternalTool(_)));
        assert!(err.to_string().contains("/nonexistent/cellguard-helper"));
    }

    #[tokio::test]
    async fn verbose_runs_log_argv_and_output_at_the_default_level() -> anyhow::Result<()> {
        let (_guard, captured) = logging::capture::logs(logging::directive_for(None, true));
        run_logged(&["echo", "helper-output"], true).await?;
        let logs = captured.text();
        assert!(logs.contains("running command"), "{logs}");
        assert!(logs.contains("command=echo helper-output"), "{logs}");
        assert!(logs.contains("helper-output"), "{logs}");
        Ok(())
    }

    #[tokio::test]
    async fn quiet_runs_log_nothing() -> anyhow::Result<()> {
        let (_guard, captured) = logging::capture::logs("info");
        run_logged(&["echo", "helper-output"], false).await?;
        assert_eq!(captured.text(), "");
        Ok(())
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let empty: [&str; 0] = [];
        assert!(run(&empty).await.is_err());
    }
}
