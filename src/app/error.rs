use std::process::ExitCode;

use crate::{Error, ErrorKind};

/// sysexits-style exit code for a failed command.
pub fn exit_code(err: &Error) -> ExitCode {
    ExitCode::from(exit_status(err.kind()))
}

fn exit_status(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::InvalidRequest | ErrorKind::InvalidSize => 64,
        ErrorKind::InvalidSource => 66,
        ErrorKind::NotSupported => 69,
        ErrorKind::ConversionFailed | ErrorKind::StaleMachine => 70,
        ErrorKind::DuplicateName => 73,
        ErrorKind::IoFailure => 74,
        ErrorKind::DownloadFailed | ErrorKind::Cancelled => 75,
        ErrorKind::Configuration => 78,
    }
}
