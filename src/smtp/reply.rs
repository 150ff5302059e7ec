//! SMTP reply code table (SPEC_FULL.md §6.2). A single enum keeps the
//! code/enhanced-status/text triple together instead of scattering string
//! constants the way the teacher's `SmtpSession` does, since this table is
//! driven end-to-end by C2's and C1's typed rejection reasons rather than
//! being assembled ad hoc per command.

use crate::auth::RejectReason;
use crate::smtp::mailbox::MailboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    GenericTransient,
    DuplicateOrPersistenceFail,
    BadClientIp,
    MalformedMailFrom,
    MalformedRcpt,
    UnknownMailbox,
    MailboxMisconfigured,
    ListArchived,
    WrongSystemDomain,
    TooManyRecipients,
    UnauthorizedSender,
    SequenceError,
    SpfFail,
    SpfTempError,
    SpfPermError,
    DkimVerificationFailed,
    MalformedBody,
    SpfAlignmentFailure,
    DkimAlignmentFailure,
    DmarcPolicyRejection,
    Ok,
    MessageAccepted,
    Bye,
}

impl Reply {
    pub const fn code(self) -> (u16, &'static str) {
        match self {
            Reply::GenericTransient => (451, "4.0.0"),
            Reply::DuplicateOrPersistenceFail => (451, "4.2.4"),
            Reply::BadClientIp => (451, "4.0.0"),
            Reply::MalformedMailFrom => (501, "5.1.7"),
            Reply::MalformedRcpt => (501, "5.1.3"),
            Reply::UnknownMailbox => (550, "5.1.1"),
            Reply::MailboxMisconfigured => (451, "4.3.0"),
            Reply::ListArchived => (450, "4.2.1"),
            Reply::WrongSystemDomain => (550, "5.1.2"),
            Reply::TooManyRecipients => (451, "4.5.3"),
            Reply::UnauthorizedSender => (550, "5.7.2"),
            Reply::SequenceError => (503, "5.5.1"),
            Reply::SpfFail => (550, "5.7.1"),
            Reply::SpfTempError => (451, "4.4.3"),
            Reply::SpfPermError => (550, "5.5.2"),
            Reply::DkimVerificationFailed => (550, "5.7.7"),
            Reply::MalformedBody => (550, "5.7.7"),
            Reply::SpfAlignmentFailure => (550, "5.7.1"),
            Reply::DkimAlignmentFailure => (550, "5.7.1"),
            Reply::DmarcPolicyRejection => (550, "5.7.1"),
            Reply::Ok => (250, "2.0.0"),
            Reply::MessageAccepted => (250, "2.6.0"),
            Reply::Bye => (221, "2.0.0"),
        }
    }

    pub fn render(self, detail: &str) -> (u16, String) {
        let (code, enhanced) = self.code();
        if detail.is_empty() {
            (code, format!("{enhanced} {self:?}"))
        } else {
            (code, format!("{enhanced} {detail}"))
        }
    }
}

impl From<&RejectReason> for Reply {
    fn from(reason: &RejectReason) -> Self {
        match reason {
            RejectReason::SpfFail => Reply::SpfFail,
            RejectReason::SpfTempError => Reply::SpfTempError,
            RejectReason::SpfPermError => Reply::SpfPermError,
            RejectReason::MalformedFrom => Reply::MalformedBody,
            RejectReason::DmarcPolicy => Reply::DmarcPolicyRejection,
            RejectReason::MalformedBody => Reply::MalformedBody,
            RejectReason::SpfAlignmentFailure => Reply::SpfAlignmentFailure,
        }
    }
}

impl From<&MailboxError> for Reply {
    fn from(err: &MailboxError) -> Self {
        match err {
            MailboxError::UnknownMailbox => Reply::UnknownMailbox,
            MailboxError::WrongSystemDomain => Reply::WrongSystemDomain,
            MailboxError::ListArchived => Reply::ListArchived,
            MailboxError::Unauthorized => Reply::UnauthorizedSender,
            MailboxError::Misconfigured => Reply::MailboxMisconfigured,
        }
    }
}
