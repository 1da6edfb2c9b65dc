use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use sandbox_executor::judge::{Judge, JudgeConfig, LanguageSpec};
use sandbox_executor::limits::TimeoutPolicy;
use sandbox_executor::pool::{PoolConfig, SandboxPool};

const FAKE_ISOLATE: &str = include_str!("../fixtures/fake-isolate.sh");

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("sandbox_executor=debug,info"))
            .with_test_writer()
            .try_init();
    });
}

/// A judge backed by a real pool driving the fake isolate script.
pub struct Sandbox {
    pub dir: TempDir,
    pub pool: Arc<SandboxPool>,
    pub judge: Judge<SandboxPool>,
}

impl Sandbox {
    pub async fn new(box_count: usize) -> Self {
        setup();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("boxes");
        std::fs::create_dir_all(&root).unwrap();
        let isolate = install_fake_isolate(dir.path(), &root);

        let config = PoolConfig {
            isolate_bin: isolate.display().to_string(),
            shell: "/bin/sh".to_string(),
            sandbox_root: root,
            box_count,
            metadata_dir: dir.path().join("meta"),
            command_timeout: Duration::from_secs(10),
            timeouts: TimeoutPolicy::default(),
            use_cgroups: false,
        };
        let pool = Arc::new(SandboxPool::new(config).await.unwrap());

        let judge_config = JudgeConfig {
            scratch_dir: Some(dir.path().to_path_buf()),
            ..JudgeConfig::default()
        };
        let judge = Judge::new(Arc::clone(&pool), shell_language(), judge_config);

        Self { dir, pool, judge }
    }

    /// Number of isolate invocations with the given action.
    pub fn calls(&self, action: &str) -> usize {
        std::fs::read_to_string(self.dir.path().join("boxes/calls.log"))
            .unwrap_or_default()
            .lines()
            .filter(|line| line.ends_with(&format!(" {action}")))
            .count()
    }
}

/// Write the fake isolate script and a wrapper that pins its root.
fn install_fake_isolate(dir: &Path, root: &Path) -> PathBuf {
    let script = dir.join("fake-isolate.sh");
    std::fs::write(&script, FAKE_ISOLATE).unwrap();

    let wrapper = dir.join("isolate");
    std::fs::write(
        &wrapper,
        format!(
            "#!/bin/sh\nFAKE_ISOLATE_ROOT='{}' exec /bin/sh '{}' \"$@\"\n",
            root.display(),
            script.display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();
    wrapper
}

/// A "compiled" shell language: compiling checks the syntax and copies the
/// script to the executable name.
fn shell_language() -> HashMap<String, LanguageSpec> {
    let spec: LanguageSpec = serde_json::from_str(
        r#"{
            "source_file": "main.sh",
            "executable": "main",
            "compile": ["/bin/sh", "-c", "sh -n {source} && cp {source} {executable}"],
            "run": ["/bin/sh", "{executable}"]
        }"#,
    )
    .unwrap();
    HashMap::from([("shell".to_string(), spec)])
}
