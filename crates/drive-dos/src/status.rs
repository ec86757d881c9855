//! Drive status codes and the channel-15 status line.
//!
//! The host reads drive status as a single ASCII line
//! `CC,MSG,TT,SS\r` where `CC` is the decimal error code, `MSG` a short
//! phrase, and `TT`/`SS` carry track/sector or auxiliary values. Code
//! numbers follow the legacy dialect: anything below 20 is informational,
//! everything else is an error.

/// Version banner returned for the DOS-version status (code 73).
pub const DOS_VERSION: &str = "IECDRIVE V0.1";

/// Status codes understood by the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// 00 — everything fine.
    Ok,
    /// 01 — files deleted; track field carries the count.
    Scratched,
    /// 21 — sector read failed (no sync / bad track-sector).
    ReadNoSync,
    /// 30 — command not recognised.
    SyntaxUnknown,
    /// 31 — command recognised but unusable in this form.
    SyntaxUnable,
    /// 32 — command line as long as the buffer, i.e. truncated.
    SyntaxTooLong,
    /// 34 — a file name was required and missing.
    SyntaxNoName,
    /// 39 — directory-change target not found.
    DirNotFound,
    /// 62 — file not found.
    FileNotFound,
    /// 63 — file exists.
    FileExists,
    /// 70 — no free buffer / channel not open.
    NoChannel,
    /// 73 — version banner, reported after reset.
    DosVersion,
    /// 74 — not a mountable/valid disk image.
    ImageInvalid,
    /// 77 — partition number out of range.
    PartitionIllegal,
    /// 79 — uploaded drive code is not recognised.
    UnknownDriveCode,
    /// 99 — MCU clock source too unstable for this loader.
    ClockUnstable,
}

impl ErrorCode {
    /// Decimal code on the status line.
    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Scratched => 1,
            Self::ReadNoSync => 21,
            Self::SyntaxUnknown => 30,
            Self::SyntaxUnable => 31,
            Self::SyntaxTooLong => 32,
            Self::SyntaxNoName => 34,
            Self::DirNotFound => 39,
            Self::FileNotFound => 62,
            Self::FileExists => 63,
            Self::NoChannel => 70,
            Self::DosVersion => 73,
            Self::ImageInvalid => 74,
            Self::PartitionIllegal => 77,
            Self::UnknownDriveCode => 79,
            Self::ClockUnstable => 99,
        }
    }

    /// Message phrase on the status line.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Scratched => "FILES SCRATCHED",
            Self::ReadNoSync => "READ ERROR",
            Self::SyntaxUnknown
            | Self::SyntaxUnable
            | Self::SyntaxTooLong
            | Self::SyntaxNoName => "SYNTAX ERROR",
            Self::DirNotFound | Self::FileNotFound => "FILE NOT FOUND",
            Self::FileExists => "FILE EXISTS",
            Self::NoChannel => "NO CHANNEL",
            Self::DosVersion => DOS_VERSION,
            Self::ImageInvalid => "IMAGE INVALID",
            Self::PartitionIllegal => "SELECTED PARTITION ILLEGAL",
            Self::UnknownDriveCode => "UNKNOWN DRIVE CODE",
            Self::ClockUnstable => "CLOCK UNSTABLE",
        }
    }
}

/// A status with its auxiliary track/sector values, used as the error type
/// throughout the parser so `?` can short-circuit a command while carrying
/// the exact line the host will read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosError {
    pub code: ErrorCode,
    pub track: u8,
    pub sector: u8,
}

impl DosError {
    /// Error with zero track/sector.
    #[must_use]
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            track: 0,
            sector: 0,
        }
    }

    /// Error with explicit auxiliary values.
    #[must_use]
    pub fn with_ts(code: ErrorCode, track: u8, sector: u8) -> Self {
        Self {
            code,
            track,
            sector,
        }
    }
}

impl From<ErrorCode> for DosError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

/// Append a decimal number: two digits, three when the value needs them.
fn append_number(out: &mut Vec<u8>, mut value: u8) {
    if value >= 100 {
        out.push(b'0' + value / 100);
        value %= 100;
    }
    out.push(b'0' + value / 10);
    out.push(b'0' + value % 10);
}

/// Format a full status line `CC,MSG,TT,SS\r`.
#[must_use]
pub fn format_status(code: ErrorCode, track: u8, sector: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    append_number(&mut out, code.number());
    out.push(b',');
    out.extend_from_slice(code.message().as_bytes());
    out.push(b',');
    append_number(&mut out, track);
    out.push(b',');
    append_number(&mut out, sector);
    out.push(b'\r');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_line() {
        assert_eq!(format_status(ErrorCode::Ok, 0, 0), b"00,OK,00,00\r");
    }

    #[test]
    fn scratched_carries_count() {
        assert_eq!(
            format_status(ErrorCode::Scratched, 2, 0),
            b"01,FILES SCRATCHED,02,00\r"
        );
    }

    #[test]
    fn three_digit_track() {
        assert_eq!(
            format_status(ErrorCode::ReadNoSync, 254, 7),
            b"21,READ ERROR,254,07\r"
        );
    }

    #[test]
    fn version_banner() {
        let line = format_status(ErrorCode::DosVersion, 0, 0);
        assert!(line.starts_with(b"73,IECDRIVE"));
        assert!(line.ends_with(b"\r"));
    }

    #[test]
    fn codes_are_legacy_numbers() {
        assert_eq!(ErrorCode::SyntaxUnknown.number(), 30);
        assert_eq!(ErrorCode::SyntaxUnable.number(), 31);
        assert_eq!(ErrorCode::SyntaxTooLong.number(), 32);
        assert_eq!(ErrorCode::SyntaxNoName.number(), 34);
        assert_eq!(ErrorCode::FileNotFound.number(), 62);
        assert_eq!(ErrorCode::NoChannel.number(), 70);
        assert_eq!(ErrorCode::PartitionIllegal.number(), 77);
    }
}
