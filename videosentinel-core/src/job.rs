//! Per-file state machine and work item owned by the batch controller.

use std::path::PathBuf;

use crate::encoder::EncodeFlags;
use crate::quality_policy::TargetCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Discovered,
    Probed,
    Classified,
    Compliant,
    NeedsRemux,
    Remuxed,
    NeedsReencode,
    ExistingValid,
    Encoding,
    Validated,
    Replaced,
    Done,
    Failed,
    /// Probe-invalid files are excluded from normal processing without
    /// counting as a re-encode failure.
    Skipped,
}

impl JobState {
    /// A state never moves to a strictly earlier one except an explicit
    /// resume re-enqueue. `rank` gives the ordering used to enforce that
    /// outside of resume.
    pub fn rank(self) -> u8 {
        match self {
            JobState::Discovered => 0,
            JobState::Probed => 1,
            JobState::Classified => 2,
            JobState::Compliant | JobState::NeedsRemux | JobState::NeedsReencode => 3,
            JobState::Remuxed | JobState::ExistingValid | JobState::Encoding => 4,
            JobState::Validated => 5,
            JobState::Replaced => 6,
            JobState::Done => 7,
            JobState::Failed | JobState::Skipped => 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub source_path: PathBuf,
    pub intermediate_path: Option<PathBuf>,
    pub final_path: Option<PathBuf>,
    pub target_codec: TargetCodec,
    pub crf: f32,
    pub flags: EncodeFlags,
    pub state: JobState,
    pub error: Option<String>,
}

impl EncodeJob {
    pub fn new(source_path: PathBuf, target_codec: TargetCodec, crf: f32, flags: EncodeFlags) -> Self {
        Self {
            source_path,
            intermediate_path: None,
            final_path: None,
            target_codec,
            crf,
            flags,
            state: JobState::Discovered,
            error: None,
        }
    }

    /// Moves to `next`, refusing to go strictly backwards. Callers that must
    /// re-enqueue during resume construct a fresh job instead of calling
    /// this.
    pub fn advance(&mut self, next: JobState) {
        debug_assert!(
            next.rank() >= self.state.rank() || next == JobState::Failed || next == JobState::Skipped,
            "illegal backward transition from {:?} to {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.state = JobState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_forward() {
        let mut job = EncodeJob::new("a.avi".into(), TargetCodec::Hevc, 22.0, EncodeFlags::default());
        job.advance(JobState::Probed);
        job.advance(JobState::Classified);
        assert_eq!(job.state, JobState::Classified);
    }

    #[test]
    #[should_panic]
    fn advance_rejects_backward_transition_in_debug() {
        let mut job = EncodeJob::new("a.avi".into(), TargetCodec::Hevc, 22.0, EncodeFlags::default());
        job.advance(JobState::Classified);
        job.advance(JobState::Discovered);
    }

    #[test]
    fn fail_is_always_reachable() {
        let mut job = EncodeJob::new("a.avi".into(), TargetCodec::Hevc, 22.0, EncodeFlags::default());
        job.advance(JobState::Classified);
        job.fail("encoder exited 1");
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.is_some());
    }
}
