//! 下载任务状态机
//!
//! ```text
//! Planned -> InProgress -> Verifying -> Completed
//! InProgress | Verifying -> Failed         摘要不匹配，删除续传记录
//! InProgress | Verifying -> Interrupted    传输失败或取消，保存续传记录
//! Interrupted -> Planned                   续传
//! ```

use crate::checksum::Sha256Digest;
use crate::planner::ThreadPlan;
use crate::resume::ResumeRecord;
use log::{debug, warn};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Planned,
    InProgress,
    Verifying,
    Completed,
    Failed,
    Interrupted,
}

impl TaskState {
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::{Completed, Failed, InProgress, Interrupted, Planned, Verifying};
        matches!(
            (self, next),
            (Planned, InProgress)
                | (InProgress, Verifying | Interrupted | Failed)
                | (Verifying, Completed | Failed | Interrupted)
                | (Interrupted, Planned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Interrupted
        )
    }
}

/// 一次下载
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub source_url: String,
    pub destination_path: PathBuf,
    pub total_bytes: u64,
    pub bytes_completed: u64,
    pub expected_checksum: Option<Sha256Digest>,
    pub thread_plan: ThreadPlan,
    state: TaskState,
}

impl TransferTask {
    pub fn new(
        source_url: &str,
        destination_path: PathBuf,
        total_bytes: u64,
        expected_checksum: Option<Sha256Digest>,
        thread_plan: ThreadPlan,
    ) -> Self {
        Self {
            source_url: source_url.to_string(),
            destination_path,
            total_bytes,
            bytes_completed: 0,
            expected_checksum,
            thread_plan,
            state: TaskState::Planned,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// 状态迁移，非法迁移被忽略并返回 `false`
    pub fn transition(&mut self, next: TaskState) -> bool {
        if self.state.can_transition_to(next) {
            debug!(
                "Task {:?}: {:?} -> {:?}",
                self.destination_path, self.state, next
            );
            self.state = next;
            true
        } else {
            warn!(
                "Task {:?}: invalid transition {:?} -> {:?}",
                self.destination_path, self.state, next
            );
            false
        }
    }

    /// 部分文件路径 `<dest>.partial`
    pub fn partial_path(&self) -> PathBuf {
        partial_path_for(&self.destination_path)
    }

    pub fn to_resume_record(&self) -> ResumeRecord {
        ResumeRecord::new(
            &self.source_url,
            &self.destination_path,
            self.total_bytes,
            self.bytes_completed,
            self.expected_checksum,
        )
    }
}

pub fn partial_path_for(destination: &std::path::Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TransferTask {
        TransferTask::new(
            "http://10.0.0.2:8000/download/x",
            PathBuf::from("/tmp/out.bin"),
            100,
            None,
            ThreadPlan::resume_suffix(0, 100, 8192),
        )
    }

    #[test]
    fn test_happy_path() {
        let mut t = task();
        assert_eq!(t.state(), TaskState::Planned);
        assert!(t.transition(TaskState::InProgress));
        assert!(t.transition(TaskState::Verifying));
        assert!(t.transition(TaskState::Completed));
        assert!(t.state().is_terminal());
    }

    #[test]
    fn test_interrupt_and_resume() {
        let mut t = task();
        t.transition(TaskState::InProgress);
        assert!(t.transition(TaskState::Interrupted));
        assert!(t.transition(TaskState::Planned));
        assert!(t.transition(TaskState::InProgress));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut t = task();
        assert!(!t.transition(TaskState::Completed));
        assert!(!t.transition(TaskState::Verifying));
        assert_eq!(t.state(), TaskState::Planned);

        t.transition(TaskState::InProgress);
        t.transition(TaskState::Verifying);
        t.transition(TaskState::Failed);
        // 校验失败不可续传
        assert!(!t.transition(TaskState::Planned));
        assert!(!t.transition(TaskState::Interrupted));
    }

    #[test]
    fn test_verify_interrupted_by_transport() {
        let mut t = task();
        t.transition(TaskState::InProgress);
        t.transition(TaskState::Verifying);
        // 获取摘要时断线，数据仍然完整，可以续传
        assert!(t.transition(TaskState::Interrupted));
        assert!(t.transition(TaskState::Planned));
    }

    #[test]
    fn test_corrupt_chunk_fails_directly() {
        let mut t = task();
        t.transition(TaskState::InProgress);
        assert!(t.transition(TaskState::Failed));
        assert!(!t.transition(TaskState::Planned));
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(task().partial_path(), PathBuf::from("/tmp/out.bin.partial"));
    }
}
