//! Shared test helpers for the planbot workspace.
//!
//! The main export is [`fake_assistant`]: shell scripts that stand in for
//! the assistant binary by emitting canned stream-JSON on stdout. Driver and
//! CLI tests point the driver's binary path at one of these scripts.

pub mod fake_assistant {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_path(dir: &Path, stem: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        dir.join(format!("{stem}_{n}.sh"))
    }

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, body).expect("failed to write fake assistant script");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
                .expect("failed to chmod fake assistant script");
        }
    }

    /// A script that prints each given stream-JSON line and exits 0.
    pub fn script(dir: &Path, lines: &[&str]) -> PathBuf {
        let path = unique_path(dir, "fake_assistant");
        let mut body = String::from("#!/bin/sh\n");
        for line in lines {
            body.push_str("echo '");
            body.push_str(line);
            body.push_str("'\n");
        }
        write_script(&path, &body);
        path
    }

    /// A script that writes `stderr_msg` to stderr and exits with `code`,
    /// emitting no stream events at all.
    pub fn failing_script(dir: &Path, stderr_msg: &str, code: i32) -> PathBuf {
        let path = unique_path(dir, "failing_assistant");
        let body = format!("#!/bin/sh\necho '{stderr_msg}' >&2\nexit {code}\n");
        write_script(&path, &body);
        path
    }

    /// A script that never produces a terminal event. Used for timeout and
    /// abort tests.
    pub fn hanging_script(dir: &Path) -> PathBuf {
        let path = unique_path(dir, "hanging_assistant");
        write_script(&path, "#!/bin/sh\nsleep 3600\n");
        path
    }

    /// A script that consumes the prompt, asks an interactive question, and
    /// echoes the answer's content back through its result event.
    pub fn questioning_script(dir: &Path) -> PathBuf {
        let path = unique_path(dir, "questioning_assistant");
        let body = concat!(
            "#!/bin/sh\n",
            "read -r _prompt\n",
            r#"echo '{"type":"tool_use","tool_name":"AskUserQuestion","tool_input":{"id":"q-1","question":"Which database?","options":[{"label":"Postgres (recommended)","value":"postgres"},{"label":"SQLite","value":"sqlite"}]}}'"#,
            "\n",
            "read -r answer\n",
            "content=$(printf '%s' \"$answer\" | sed -n 's/.*\"content\":\"\\([^\"]*\\)\".*/\\1/p')\n",
            "printf '{\"type\":\"result\",\"result\":\"using %s\",\"cost_usd\":0.05}\\n' \"$content\"\n",
        );
        write_script(&path, body);
        path
    }
}
