use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Temporary directory holding a recorded build trace and a config file.
pub struct TraceFixture {
    pub dir: TempDir,
    pub trace: PathBuf,
    pub config: PathBuf,
}

impl TraceFixture {
    /// Chain A(0-10) -> B(10-25) -> C(25-40) on one minion, plus an
    /// unrelated rule on a second minion.
    pub fn chain() -> Self {
        crate::test_log!("FIXTURE: Creating chain trace");
        Self::with_trace(
            r#"{
  "minions": {
    "m1": [
      {"rule": "//lib:a", "start_ms": 0, "finish_ms": 10},
      {"rule": "//lib:b", "start_ms": 10, "finish_ms": 25},
      {"rule": "//app:c", "start_ms": 25, "finish_ms": 40}
    ],
    "m2": [
      {"rule": "//tools:gen", "start_ms": 0, "finish_ms": 5},
      {"rule": "//tools:fmt", "start_ms": 2, "finish_ms": 8}
    ]
  },
  "dependencies": [
    {"rule": "//lib:b", "depends_on": "//lib:a"},
    {"rule": "//app:c", "depends_on": "//lib:b"}
  ]
}
"#,
        )
    }

    pub fn with_trace(contents: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let trace = dir.path().join("trace.json");
        let config = dir.path().join("config.toml");
        fs::write(&trace, contents).expect("Failed to write trace");
        Self { dir, trace, config }
    }

    pub fn write_config(&self, contents: &str) {
        fs::write(&self.config, contents).expect("Failed to write config");
    }
}
