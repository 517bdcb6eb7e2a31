//! Shell executor
//!
//! Runs stage scripts on the host through `sh -c`, streaming combined output
//! into the job trace. Cancellation kills the child process group; cleanup
//! removes the workspace only if prepare created it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::executor::{
    Executor, ExecutorCommand, ExecutorError, ExecutorProvider, PrepareOptions,
};
use crate::trace::JobTrace;

pub struct ShellExecutorProvider;

impl ExecutorProvider for ShellExecutorProvider {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn create(&self) -> Box<dyn Executor> {
        Box::new(ShellExecutor::new())
    }
}

pub struct ShellExecutor {
    build_dir: Option<PathBuf>,
    created_build_dir: bool,
    trace: Option<Arc<JobTrace>>,
    shell: String,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            build_dir: None,
            created_build_dir: false,
            trace: None,
            shell: "sh".to_string(),
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn prepare(&mut self, options: PrepareOptions) -> Result<(), ExecutorError> {
        if !options.build_dir.exists() {
            tokio::fs::create_dir_all(&options.build_dir)
                .await
                .with_context(|| {
                    format!("creating build directory {}", options.build_dir.display())
                })?;
            self.created_build_dir = true;
        }

        debug!(build_dir = %options.build_dir.display(), "shell executor prepared");
        self.build_dir = Some(options.build_dir);
        self.trace = Some(options.trace);
        // run scripts through the dialect they were generated for
        self.shell = options.runner.shell.clone();
        Ok(())
    }

    async fn run(&mut self, cmd: ExecutorCommand) -> Result<(), ExecutorError> {
        let build_dir = self
            .build_dir
            .as_ref()
            .ok_or_else(|| ExecutorError::system("shell executor is not prepared"))?;
        let trace = self
            .trace
            .as_ref()
            .ok_or_else(|| ExecutorError::system("shell executor is not prepared"))?;

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&cmd.script)
            .current_dir(build_dir)
            .envs(cmd.variables.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning shell for stage {}", cmd.stage))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::system("child stdout is not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::system("child stderr is not piped"))?;

        let out_pump = tokio::spawn(pump(stdout, Arc::clone(trace)));
        let err_pump = tokio::spawn(pump(stderr, Arc::clone(trace)));

        let status = tokio::select! {
            status = child.wait() => status.context("waiting for shell")?,
            _ = cmd.cancel.cancelled() => {
                debug!(stage = %cmd.stage, "stage canceled, killing child");
                if let Err(e) = child.start_kill() {
                    warn!("killing child failed: {}", e);
                }
                let _ = child.wait().await;
                let _ = out_pump.await;
                let _ = err_pump.await;
                return Err(ExecutorError::system("stage canceled"));
            }
        };

        // drain remaining output before reporting the result
        let _ = out_pump.await;
        let _ = err_pump.await;

        if status.success() {
            Ok(())
        } else {
            Err(ExecutorError::Script {
                exit_code: status.code().unwrap_or(-1),
            })
        }
    }

    async fn finish(&mut self, success: bool) {
        debug!(success, "shell executor finished");
    }

    async fn cleanup(&mut self) {
        if !self.created_build_dir {
            return;
        }
        self.created_build_dir = false;

        if let Some(dir) = self.build_dir.take() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(dir = %dir.display(), "removing build directory failed: {}", e);
            }
        }
    }
}

async fn pump(mut reader: impl tokio::io::AsyncRead + Unpin, trace: Arc<JobTrace>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => trace.write(&buf[..n]),
        }
    }
}
