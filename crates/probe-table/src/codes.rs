//! Stage controller error-code tables.
//!
//! The controller reports numbered faults through two separate registers:
//! system errors (`geterror`) and machine errors (`getmerror`). Codes are
//! resolved to operator-readable messages here; codes missing from the
//! tables degrade to a generic message instead of failing the lookup.

/// Reported when a move ran into a limit switch. Expected and benign during
/// intentional retract maneuvers, a hard fault everywhere else.
pub const LIMIT_SWITCH_ERROR: i32 = 1004;

/// Resolve a system error code to a message.
pub fn error_message(code: i32) -> &'static str {
    match code {
        1..=4 => "Internal error.",
        1001 => "Invalid parameter.",
        1002 | 1008 => "Not enough parameters on the stack.",
        1003 | 1007 => "Valid range of parameter is exceeded.",
        1004 => "Move stopped working, range should run over.",
        1009 => "Not enough space on the stack.",
        1010 => "Not enough space on parameter memory.",
        1015 => "Parameters outside of working range.",
        2000 => "Unknown command.",
        _ => "Unknown error code.",
    }
}

/// Resolve a machine error code to a message.
pub fn machine_error_message(code: i32) -> &'static str {
    match code {
        1 => "Error memory overflow.",
        10 => "Motor driver disabled or failing 12V power supply.",
        13 => "Exceeded maximum positioning errors in closed loop.",
        23 => "RS422 encoder error.",
        _ => "Unknown machine error code.",
    }
}
