//! Git output parsing helpers.

use std::collections::BTreeMap;
use std::process::Output;

/// Formats a git error with both stdout and stderr for better debugging.
pub fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// Parses `git ls-remote --heads` output into a branch -> commit map.
pub fn parse_ls_remote_heads(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let commit = parts.next()?;
            let reference = parts.next()?;
            let branch = reference.strip_prefix("refs/heads/")?;
            Some((branch.to_string(), commit.to_string()))
        })
        .collect()
}

/// Returns true if a push was refused because the remote moved ahead.
pub fn is_push_rejected(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("[rejected]")
        || lower.contains("non-fast-forward")
        || lower.contains("fetch first")
        || lower.contains("failed to push some refs")
}

/// Returns true if `git status --porcelain` reported no changes.
pub fn is_clean_status(porcelain: &str) -> bool {
    porcelain.lines().all(|line| line.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_remote_heads() {
        let out = "\
1111111111111111111111111111111111111111\trefs/heads/master
2222222222222222222222222222222222222222\trefs/heads/alpha
3333333333333333333333333333333333333333\trefs/tags/v1
";
        let heads = parse_ls_remote_heads(out);
        assert_eq!(heads.len(), 2);
        assert_eq!(
            heads.get("alpha").map(String::as_str),
            Some("2222222222222222222222222222222222222222")
        );
        assert!(heads.contains_key("master"));
    }

    #[test]
    fn test_parse_ls_remote_nested_branch() {
        let heads = parse_ls_remote_heads("abc\trefs/heads/team/beta\n");
        assert_eq!(heads.get("team/beta").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_is_push_rejected() {
        assert!(is_push_rejected(
            " ! [rejected]        alpha -> alpha (fetch first)\nerror: failed to push some refs"
        ));
        assert!(!is_push_rejected("fatal: Could not resolve host: example.com"));
    }

    #[test]
    fn test_is_clean_status() {
        assert!(is_clean_status(""));
        assert!(is_clean_status("\n"));
        assert!(!is_clean_status("?? boxes/a.yml\n"));
    }

    #[cfg(unix)]
    mod unix_tests {
        use super::*;
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        fn make_output(status_code: i32, stdout: &[u8], stderr: &[u8]) -> Output {
            Output {
                status: ExitStatus::from_raw(status_code << 8),
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
            }
        }

        #[test]
        fn test_format_git_error_empty_output() {
            let output = make_output(128, b"", b"");
            assert_eq!(format_git_error(&output), "Command failed with exit code 128");
        }

        #[test]
        fn test_format_git_error_both() {
            let output = make_output(1, b"hint: pull first", b"error: failed to push");
            assert_eq!(
                format_git_error(&output),
                "error: failed to push\nhint: pull first"
            );
        }
    }
}
