//! 命令执行器
//!
//! 提供统一的外部进程执行接口，支持：
//! - stdout/stderr 按行捕获并打上来源标记
//! - 进程组级别的取消（SIGTERM，宽限期后 SIGKILL）
//! - 简单命令的超时控制
//!
//! 交错策略：两个读取任务各自按行读取，读到完整一行立即送入同一个有序通道。
//! 同一流内严格保序；跨流只保证“按行边界到达的先后”，不保证与进程写入时刻一致。

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::job::EXIT_CODE_KILLED;
use crate::domain::log::LogStream;

/// 输出通道容量，读取端跟不上时对子进程形成背压
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// 进程退出后等待读取任务转发剩余输出的上限
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 等待命令完成失败
    #[error("failed to wait for command: {0}")]
    WaitFailed(#[source] std::io::Error),
    /// 命令超时
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

/// 要执行的命令
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub work_dir: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    /// 用于日志展示的命令行
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().to_string()));
        parts.join(" ")
    }
}

/// 带来源标记的一行输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: LogStream,
    pub text: String,
}

/// 进程结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// 正常退出
    Code(i32),
    /// 被信号终止
    Killed,
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ProcessExit::Code(code),
            None => ProcessExit::Killed,
        }
    }

    /// 退出码，被终止时返回 [`EXIT_CODE_KILLED`]
    pub fn code(&self) -> i32 {
        match self {
            ProcessExit::Code(code) => *code,
            ProcessExit::Killed => EXIT_CODE_KILLED,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }
}

/// 运行中的进程句柄
///
/// 丢弃句柄会杀掉子进程
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    output: mpsc::Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    /// 终止时从通道中收下的剩余输出
    pending: Vec<OutputLine>,
    exit: Option<ProcessExit>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// 读取下一行输出
    ///
    /// 两个流都到达 EOF 后返回 `None`
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.output.recv().await
    }

    /// 取出已读取但尚未消费的输出（终止后调用，不等待）
    pub fn drain_buffered(&mut self) -> Vec<OutputLine> {
        let mut lines = std::mem::take(&mut self.pending);
        while let Ok(line) = self.output.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// 等待进程退出
    pub async fn wait(&mut self) -> Result<ProcessExit, CommandError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await.map_err(CommandError::WaitFailed)?;
        let exit = ProcessExit::from_status(status);
        self.exit = Some(exit);
        Ok(exit)
    }

    /// 终止进程
    ///
    /// 先向进程组发送 SIGTERM，宽限期内未退出则 SIGKILL
    pub async fn terminate(&mut self, grace: Duration) -> Result<ProcessExit, CommandError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        self.signal_group(false);

        let exit = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => ProcessExit::from_status(status.map_err(CommandError::WaitFailed)?),
            Err(_) => {
                warn!(pid = ?self.pid, grace = ?grace, "Process ignored SIGTERM, killing");
                self.signal_group(true);
                if let Err(e) = self.child.kill().await {
                    warn!(pid = ?self.pid, error = %e, "Failed to kill child process");
                }
                self.child.wait().await.map_err(CommandError::WaitFailed)?;
                ProcessExit::Killed
            }
        };

        self.collect_remaining().await;
        self.exit = Some(exit);
        Ok(exit)
    }

    /// 收下管道中已写出的输出，读取任务超时未结束则中止
    ///
    /// 孙进程继承管道时可能一直不到 EOF
    async fn collect_remaining(&mut self) {
        let output = &mut self.output;
        let pending = &mut self.pending;
        let finished = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
            while let Some(line) = output.recv().await {
                pending.push(line);
            }
        })
        .await;
        if finished.is_err() {
            debug!(pid = ?self.pid, "Output readers still open after exit, aborting");
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }

    #[cfg(unix)]
    fn signal_group(&mut self, force: bool) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
            debug!(pid, ?signal, error = %e, "killpg failed");
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _force: bool) {
        if let Err(e) = self.child.start_kill() {
            debug!(pid = ?self.pid, error = %e, "start_kill failed");
        }
    }
}

/// 命令执行器
pub struct CommandRunner;

impl CommandRunner {
    /// 启动进程并按行捕获输出
    ///
    /// 子进程放入独立进程组，便于连同其子进程一起终止
    pub fn spawn(spec: &CommandSpec) -> Result<ProcessHandle, CommandError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.work_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.envs {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| CommandError::SpawnFailed {
            program: spec.program.to_string_lossy().to_string(),
            source,
        })?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(stdout, LogStream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(stderr, LogStream::Stderr, tx)));
        }

        debug!(pid = ?pid, command = %spec.display(), "Process spawned");

        Ok(ProcessHandle {
            child,
            pid,
            output: rx,
            readers,
            pending: Vec::new(),
            exit: None,
        })
    }

    /// 执行简单命令（无流式输出）
    ///
    /// 用于探测解释器版本等短命令
    pub async fn run_simple(
        program: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(|source| CommandError::SpawnFailed {
                    program: program.to_string_lossy().to_string(),
                    source,
                })
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout(timeout))
            }
        }
    }
}

/// 按行读取，容忍非 UTF-8 输出和 `\r\n` 结尾
async fn read_lines<R>(reader: R, stream: LogStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let text = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(stream = stream.as_str(), error = %e, "Output read failed");
                break;
            }
        }
    }
}
