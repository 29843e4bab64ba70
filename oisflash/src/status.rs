//! Diagnostic status lines published after reconciliation.
//!
//! Both lines are consumed by other subsystems (sysfs nodes, EXIF tagging)
//! and live in 40-byte buffers there, so they are capped at
//! [`STATUS_LINE_MAX`]` - 1` bytes.

/// Buffer size of a status line, terminator included.
pub const STATUS_LINE_MAX: usize = 40;

/// Placeholder for an unavailable phone or module version.
pub const NULL_MARKER: &str = "NULL";

/// Placeholder for an absent version in the debug line.
pub const ISNULL_MARKER: &str = "ISNULL";

/// Module version shown when the firmware status cannot be read.
pub const NG_FIRMWARE: &str = "NG_FW2";

/// Module version shown when the calibration version is corrupt.
pub const NG_CALIBRATION: &str = "NG_CD2";

/// EXIF tag prefix of the debug line.
pub const EXIF_TAG: &str = "ssois";

fn truncate(mut line: String) -> String {
    let max = STATUS_LINE_MAX - 1;
    if line.len() > max {
        let mut end = max;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        line.truncate(end);
    }
    line
}

/// `"{module} {phone}\n"`, with [`NULL_MARKER`] for a missing phone version.
pub fn fw_full_line(module: &str, phone: Option<&str>) -> String {
    truncate(format!("{module} {}\n", phone.unwrap_or(NULL_MARKER)))
}

/// `"ssois{module} {phone} {cal} {err:x} {status:x} {mode:x}\n"`.
pub fn debug_line(
    module: Option<&str>,
    phone: Option<&str>,
    cal: Option<&str>,
    error_flags: u16,
    status: u8,
    mode: u16,
) -> String {
    let or_null = |v: Option<&str>| {
        v.filter(|s| !s.is_empty())
            .unwrap_or(ISNULL_MARKER)
            .to_string()
    };
    truncate(format!(
        "{EXIF_TAG}{} {} {} {error_flags:x} {status:x} {mode:x}\n",
        or_null(module),
        or_null(phone),
        or_null(cal)
    ))
}
