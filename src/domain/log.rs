//! 任务日志行

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 输出流标记
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// 日志行
///
/// 追加后不再修改；`seq` 从 0 开始连续递增，同时作为续传游标
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub job_id: String,
    pub seq: u64,
    pub stream: LogStream,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

impl LogLine {
    /// 创建新日志行
    pub fn new(job_id: &str, seq: u64, stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            seq,
            stream,
            timestamp: Utc::now(),
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_creation() {
        let line = LogLine::new("job-1", 3, LogStream::Stderr, "boom");
        assert_eq!(line.seq, 3);
        assert_eq!(line.stream.as_str(), "stderr");
        assert_eq!(line.content, "boom");
    }

    #[test]
    fn test_log_stream_serializes_lowercase() {
        let json = serde_json::to_string(&LogStream::Stdout).unwrap();
        assert_eq!(json, "\"stdout\"");
    }
}
