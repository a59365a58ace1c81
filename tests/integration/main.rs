//! Integration tests for the file-mem-cache harness binary

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use serde_json::Value;
    use std::path::Path;
    use std::process::Stdio;
    use tempfile::TempDir;

    fn cache(workdir: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("file-mem-cache");
        cmd.arg("--workdir")
            .arg(workdir)
            .args(["--heartbeat-ms", "600", "--grace-ms", "0"]);
        cmd
    }

    fn stdout_json(output: &[u8]) -> Value {
        serde_json::from_slice(output).expect("stdout is JSON")
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("file-mem-cache")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Cross-process TTL cache"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("file-mem-cache")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("file-mem-cache"));
    }

    #[test]
    fn get_unknown_key_prints_null() {
        let temp = TempDir::new().unwrap();
        cache(temp.path())
            .args(["get", "nothing"])
            .assert()
            .success()
            .stdout("null\n");
    }

    #[test]
    fn set_then_get_across_invocations() {
        let temp = TempDir::new().unwrap();
        cache(temp.path())
            .args(["set", "hello", r#"{"name":"world"}"#])
            .assert()
            .success();

        let output = cache(temp.path()).args(["get", "hello"]).output().unwrap();
        assert!(output.status.success());
        assert_eq!(stdout_json(&output.stdout)["name"], "world");

        // Each invocation withdraws its heartbeat on exit
        let procs = std::fs::read_dir(temp.path().join("proc")).unwrap().count();
        assert_eq!(procs, 0);
    }

    #[test]
    fn keys_and_reset() {
        let temp = TempDir::new().unwrap();
        cache(temp.path()).args(["set", "a", "1"]).assert().success();
        cache(temp.path()).args(["set", "b/c", "2"]).assert().success();

        cache(temp.path())
            .args(["keys", "--format", "plain"])
            .assert()
            .success()
            .stdout("a\nb/c\n");

        cache(temp.path()).args(["reset", "a"]).assert().success();
        cache(temp.path()).args(["reset", "a"]).assert().success();
        cache(temp.path())
            .args(["keys"])
            .assert()
            .success()
            .stdout("[\"b/c\"]\n");
    }

    #[test]
    fn append_and_remove_by_index() {
        let temp = TempDir::new().unwrap();
        for item in ["\"a\"", "\"b\"", "\"c\""] {
            cache(temp.path())
                .args(["append", "list", item])
                .assert()
                .success();
        }

        cache(temp.path())
            .args(["remove", "list", "2", "--index"])
            .assert()
            .success()
            .stdout("[\"a\",\"c\"]\n");
    }

    #[test]
    fn append_with_ttl_expires() {
        let temp = TempDir::new().unwrap();
        cache(temp.path())
            .args(["append", "recent", "\"x\"", "--ttl", "100"])
            .assert()
            .success()
            .stdout("[\"x\"]\n");

        std::thread::sleep(std::time::Duration::from_millis(300));
        cache(temp.path())
            .args(["get", "recent"])
            .assert()
            .success()
            .stdout("null\n");
    }

    #[test]
    fn append_shape_mismatch_fails() {
        let temp = TempDir::new().unwrap();
        cache(temp.path())
            .args(["set", "map", r#"{"a":1}"#])
            .assert()
            .success();

        cache(temp.path())
            .args(["append", "map", "[1]"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn health_reports_dead_sibling() {
        let temp = TempDir::new().unwrap();
        let proc_dir = temp.path().join("proc");
        std::fs::create_dir_all(&proc_dir).unwrap();
        std::fs::write(proc_dir.join("crashed"), "1000").unwrap();

        let output = cache(temp.path()).arg("health").output().unwrap();
        assert!(output.status.success());
        assert_eq!(stdout_json(&output.stdout)["removed_heartbeats"], 1);
        assert!(!proc_dir.join("crashed").exists());
    }

    #[test]
    fn concurrent_processes_append_both_values() {
        let temp = TempDir::new().unwrap();
        let bin = env!("CARGO_BIN_EXE_file-mem-cache");

        let children: Vec<_> = ["first", "second"]
            .iter()
            .map(|tag| {
                std::process::Command::new(bin)
                    .arg("--workdir")
                    .arg(temp.path())
                    .args(["--heartbeat-ms", "900", "--tag", tag])
                    .args(["append", "counter", &format!("\"{tag}\""), "--initial", "[]"])
                    .stdout(Stdio::null())
                    .spawn()
                    .unwrap()
            })
            .collect();
        for mut child in children {
            assert!(child.wait().unwrap().success());
        }

        let output = cache(temp.path()).args(["get", "counter"]).output().unwrap();
        let value = stdout_json(&output.stdout);
        let items = value.as_array().expect("counter is a sequence");
        assert_eq!(items.len(), 2);
        assert!(items.contains(&Value::from("first")));
        assert!(items.contains(&Value::from("second")));
    }
}
