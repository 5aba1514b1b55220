use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Message category. Each mailbox keeps one queue per subject so that control traffic (failure
///  notifications) is never stuck behind bulk traffic: receivers pick the subjects they poll and
///  their priority order.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Subject {
    Default = 0,
    /// Local fault notifications
    Failure = 1,
    /// Membership changes: a peer host was detected as failed
    FailureSiteUpdate = 2,
}

impl Subject {
    pub const COUNT: usize = 3;

    pub const ALL: [Subject; Subject::COUNT] = [Subject::Default, Subject::Failure, Subject::FailureSiteUpdate];

    pub fn index(&self) -> usize {
        u8::from(*self) as usize
    }
}
