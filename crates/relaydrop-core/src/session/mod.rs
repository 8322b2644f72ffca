//! 会话状态
//!
//! [`Session`] 只由控制器（[`controller::SessionController`]）修改，
//! 观察者通过 [`controller::Snapshot`] 拿到它的副本。
//!
//! 状态转移: `idle -> sending -> idle`，`idle -> receiving -> idle`。
//! 无论传输成功与否，会话结束后一定回到 `idle`。

pub mod controller;
pub mod roster;

pub use controller::{Controller, ControllerConfig, Snapshot, convert_file_list_to_dto};
pub use roster::Roster;

use log::warn;

use crate::transfer::{FileDto, FileProgress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Sending,
    Receiving,
}

/// 单个文件的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Skipped,
    Sending,
    Finished,
    Error,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Skipped | FileStatus::Finished | FileStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub id: String,
    pub name: String,
    /// 已传输字节数（单调递增，不超过 `total`）
    pub curr: u64,
    pub total: u64,
    pub state: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 当前会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub state: SessionState,
    pub curr: u64,
    /// 总字节数，至少为 1
    pub total: u64,
    pub file_state: BTreeMap<String, FileState>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            curr: 0,
            total: 1,
            file_state: BTreeMap::new(),
        }
    }
}

impl Session {
    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    /// 开始新会话，覆盖上一个会话留下的状态
    pub fn begin(&mut self, state: SessionState) {
        *self = Self {
            state,
            ..Self::default()
        };
    }

    /// 以文件列表初始化（全部 `pending`）
    pub fn seed(&mut self, files: &[FileDto]) {
        self.file_state = files
            .iter()
            .map(|f| {
                (
                    f.id.clone(),
                    FileState {
                        id: f.id.clone(),
                        name: f.file_name.clone(),
                        curr: 0,
                        total: f.size,
                        state: FileStatus::Pending,
                        error: None,
                    },
                )
            })
            .collect();
        self.recompute();
    }

    /// 标记被对端拒绝的文件；被跳过的文件不再计入总量
    pub fn mark_skipped(&mut self, ids: &[String]) {
        for id in ids {
            match self.file_state.get_mut(id) {
                Some(file) if file.state == FileStatus::Pending => file.state = FileStatus::Skipped,
                Some(file) => warn!("Cannot skip file {} in state {:?}", id, file.state),
                None => warn!("Skip for unknown file {}", id),
            }
        }
        self.recompute();
    }

    /// 应用一条进度；已结束的文件忽略后续进度
    pub fn apply_progress(&mut self, progress: &FileProgress) {
        let Some(file) = self.file_state.get_mut(&progress.id) else {
            warn!("Progress for unknown file {}", progress.id);
            return;
        };
        if file.state.is_terminal() {
            return;
        }

        file.curr = file.curr.max(progress.curr.min(file.total));
        if progress.success {
            file.state = FileStatus::Finished;
        } else if let Some(error) = &progress.error {
            file.state = FileStatus::Error;
            file.error = Some(error.clone());
        } else {
            file.state = FileStatus::Sending;
        }
        self.recompute();
    }

    /// 会话结束，文件状态保留到下一个会话开始
    pub fn finish(&mut self) {
        self.state = SessionState::Idle;
    }

    /// 进度比例 `[0, 1]`
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> f64 {
        self.curr as f64 / self.total as f64
    }

    fn recompute(&mut self) {
        self.total = self
            .file_state
            .values()
            .filter(|f| f.state != FileStatus::Skipped)
            .map(|f| f.total)
            .sum::<u64>()
            .max(1);
        self.curr = self.file_state.values().map(|f| f.curr).sum::<u64>().min(self.total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dto(id: &str, name: &str, size: u64) -> FileDto {
        FileDto {
            id: id.to_string(),
            file_name: name.to_string(),
            size,
            file_type: "text/plain".to_string(),
            metadata: None,
        }
    }

    fn sending(files: &[FileDto]) -> Session {
        let mut session = Session::default();
        session.begin(SessionState::Sending);
        session.seed(files);
        session
    }

    fn sum_of_files(session: &Session) -> u64 {
        session.file_state.values().map(|f| f.curr).sum()
    }

    #[test]
    fn test_default_total_is_one() {
        let session = Session::default();
        assert!(session.is_idle());
        assert_eq!(session.total, 1);
        assert!(session.ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn test_seed_n_pending_files() {
        let files: Vec<FileDto> = (0..5).map(|i| dto(&i.to_string(), "f", 10)).collect();
        let session = sending(&files);

        assert_eq!(session.file_state.len(), 5);
        assert!(session
            .file_state
            .values()
            .all(|f| f.state == FileStatus::Pending && f.curr == 0));
        assert_eq!(session.total, 50);
        assert_eq!(session.curr, 0);
    }

    #[test]
    fn test_empty_files_keep_total_positive() {
        let session = sending(&[dto("0", "empty", 0)]);
        assert_eq!(session.total, 1);
    }

    #[test]
    fn test_curr_is_sum_and_bounded() {
        let mut session = sending(&[dto("0", "a", 100), dto("1", "b", 50)]);

        let steps = [
            FileProgress::sending("0", 40),
            FileProgress::sending("1", 50),
            FileProgress::sending("0", 30),
            FileProgress::sending("0", 500),
            FileProgress::finished("1", 50),
        ];
        for step in &steps {
            session.apply_progress(step);
            assert_eq!(session.curr, sum_of_files(&session));
            assert!(session.curr <= session.total);
        }

        assert_eq!(session.file_state["0"].curr, 100);
        assert_eq!(session.file_state["0"].state, FileStatus::Sending);
        assert_eq!(session.curr, 150);
    }

    #[test]
    fn test_single_terminal_outcome() {
        let mut session = sending(&[dto("0", "a", 10), dto("1", "b", 10)]);

        session.apply_progress(&FileProgress::finished("0", 10));
        session.apply_progress(&FileProgress::failed("0", 10, "late"));
        assert_eq!(session.file_state["0"].state, FileStatus::Finished);
        assert!(session.file_state["0"].error.is_none());

        session.apply_progress(&FileProgress::failed("1", 3, "broken pipe"));
        session.apply_progress(&FileProgress::finished("1", 10));
        assert_eq!(session.file_state["1"].state, FileStatus::Error);
        assert_eq!(session.file_state["1"].curr, 3);
    }

    #[test]
    fn test_skipped_never_finishes() {
        let mut session = sending(&[dto("0", "a", 10)]);
        session.mark_skipped(&["0".to_string()]);
        session.apply_progress(&FileProgress::finished("0", 10));

        assert_eq!(session.file_state["0"].state, FileStatus::Skipped);
        assert_eq!(session.curr, 0);
    }

    #[test]
    fn test_unknown_progress_ignored() {
        let mut session = sending(&[dto("0", "a", 10)]);
        let before = session.clone();
        session.apply_progress(&FileProgress::finished("9", 10));
        assert_eq!(session, before);
    }

    #[test]
    fn test_skip_scenario() {
        let mut session = sending(&[dto("0", "a.txt", 100), dto("1", "b.txt", 50)]);
        assert_eq!(session.total, 150);

        session.mark_skipped(&["1".to_string()]);
        assert_eq!(session.file_state["1"].state, FileStatus::Skipped);
        assert_eq!(session.total, 100);

        session.apply_progress(&FileProgress::sending("0", 60));
        session.apply_progress(&FileProgress::finished("0", 100));
        session.finish();

        assert!(session.is_idle());
        assert_eq!(session.file_state["0"].state, FileStatus::Finished);
        assert_eq!(session.curr, 100);
        assert!((session.ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_begin_discards_previous_session() {
        let mut session = sending(&[dto("0", "a", 10)]);
        session.apply_progress(&FileProgress::finished("0", 10));
        session.finish();

        session.begin(SessionState::Receiving);
        assert_eq!(session.state, SessionState::Receiving);
        assert!(session.file_state.is_empty());
        assert_eq!(session.total, 1);
    }

    #[test]
    fn test_session_format() {
        let session = sending(&[dto("0", "a", 10)]);
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["state"], "sending");
        assert_eq!(json["fileState"]["0"]["state"], "pending");
    }
}
