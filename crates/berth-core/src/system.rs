//! Process probing helpers built on `/proc`.

use std::io::ErrorKind;
use std::path::PathBuf;

use nix::unistd::Pid;

use berth_common::error::{BerthError, Result};

/// Reads a process's start time in clock ticks since boot.
///
/// Captured immediately after clone, the value later distinguishes the
/// original init from an unrelated process that reused its pid.
///
/// # Errors
///
/// Returns an error if `/proc/<pid>/stat` cannot be read or parsed.
pub fn process_start_time(pid: Pid) -> Result<u64> {
    let path = PathBuf::from(format!("/proc/{pid}/stat"));
    let stat = std::fs::read_to_string(&path).map_err(|e| BerthError::io(path.clone(), e))?;
    start_time_from_stat(&stat).ok_or_else(|| {
        BerthError::io(
            path,
            std::io::Error::new(ErrorKind::InvalidData, "malformed stat line"),
        )
    })
}

/// Extracts field 22 (starttime) from a `/proc/<pid>/stat` line.
///
/// The comm field may contain spaces and parentheses, so parsing resumes
/// after the last closing parenthesis.
fn start_time_from_stat(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_LINE: &str = "1234 (cat) R 1 1234 1234 0 -1 4194304 95 0 0 0 0 0 0 0 20 0 1 0 \
                             8979167 5492736 177 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 \
                             17 3 0 0 0 0 0";

    #[test]
    fn start_time_is_field_twenty_two() {
        assert_eq!(start_time_from_stat(STAT_LINE), Some(8_979_167));
    }

    #[test]
    fn comm_with_spaces_and_parens_is_skipped() {
        let stat = STAT_LINE.replace("(cat)", "(tricky) name))");
        assert_eq!(start_time_from_stat(&stat), Some(8_979_167));
    }

    #[test]
    fn malformed_line_yields_none() {
        assert_eq!(start_time_from_stat("no parens here"), None);
        assert_eq!(start_time_from_stat("1 (x) R 2 3"), None);
    }

    #[test]
    fn own_start_time_is_readable() {
        let start = process_start_time(nix::unistd::getpid()).expect("own stat readable");
        assert!(start > 0);
    }
}
