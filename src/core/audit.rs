//! 恢复审计日志（append-only JSONL，按天滚动）
//!
//! 每条失败 / 死信 / 重试 / 升级 / 解决事件写一行，文件名 `audit_YYYY-MM-DD.jsonl`，从不原地改写。
//! 写入是同步的：记录落盘之后调用方才更新内存队列。

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::recovery::RecoveryStrategy;

/// 审计事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// 调度器的单次尝试失败（之后可能重试成功）
    AttemptFailed,
    /// 重试耗尽，进入死信队列
    DeadLetter,
    Retried,
    Escalated,
    Resolved,
}

/// 一行审计记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event: AuditEvent,
    pub operation_id: String,
    pub operation_name: String,
    pub error_code: String,
    pub severity: String,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RecoveryStrategy>,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub resolved: bool,
}

/// 审计日志写入器
pub struct AuditLog {
    dir: PathBuf,
    fsync: bool,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            dir: dir.into(),
            fsync,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 当天的审计文件路径
    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!(
            "audit_{}.jsonl",
            chrono::Local::now().format("%Y-%m-%d")
        ))
    }

    /// 追加一条记录
    pub fn append(&self, record: &AuditRecord) -> io::Result<()> {
        let line = serde_json::to_string(record).map_err(io::Error::other)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        writeln!(file, "{line}")?;
        if self.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// 按文件名（即日期）顺序读出全部记录；损坏的行跳过并告警
    pub fn read_records(&self) -> io::Result<Vec<AuditRecord>> {
        let mut files: Vec<PathBuf> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("audit_") && n.ends_with(".jsonl"))
                        .unwrap_or(false)
                })
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        files.sort();

        let mut records = Vec::new();
        for path in files {
            let reader = BufReader::new(fs::File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditRecord>(&line) {
                    Ok(r) => records.push(r),
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Skipping malformed audit line"
                        )
                    }
                }
            }
        }
        Ok(records)
    }

    /// 重放日志：仍未解决的死信记录（重启后人工排查用）
    pub fn unresolved_dead_letters(&self) -> io::Result<Vec<AuditRecord>> {
        let records = self.read_records()?;
        let resolved: std::collections::HashSet<&str> = records
            .iter()
            .filter(|r| r.event == AuditEvent::Resolved)
            .map(|r| r.operation_id.as_str())
            .collect();
        Ok(records
            .iter()
            .filter(|r| {
                r.event == AuditEvent::DeadLetter && !resolved.contains(r.operation_id.as_str())
            })
            .cloned()
            .collect())
    }
}
