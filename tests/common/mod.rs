//! Shared helpers for driving the score-fly binary inside a scratch project.

use serde_json::Value;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

pub struct Project {
    pub dir: TempDir,
}

impl Project {
    /// Fresh project directory with `init` already run.
    pub fn init(prefix: &str) -> Self {
        let project = Project {
            dir: tempfile::tempdir().expect("create temp dir"),
        };
        project.run_ok(&["init", "--app-prefix", prefix]);
        project
    }

    pub fn empty() -> Self {
        Project {
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, contents).expect("write project file");
        path
    }

    pub fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.path(name)).expect("read project file")
    }

    pub fn state(&self) -> Value {
        serde_json::from_str(&self.read(".score-fly/state.json")).expect("parse state.json")
    }

    pub fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_score-fly"))
            .args(args)
            .current_dir(self.dir.path())
            .env_remove("RUST_LOG")
            .env_remove("SCORE_FLY_DISPATCH_TIMEOUT")
            .env_remove("SCORE_FLY_DEBUG")
            .output()
            .expect("run score-fly")
    }

    /// Run and return stdout, failing the test with stderr on a non-zero exit.
    pub fn run_ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "score-fly {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    pub fn run_err(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            !output.status.success(),
            "score-fly {:?} unexpectedly succeeded",
            args
        );
        String::from_utf8_lossy(&output.stderr).into_owned()
    }
}
