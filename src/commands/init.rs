//! `loadstorm init` command implementation.

use anyhow::Result;
use std::path::Path;

/// Execute the `init` command.
///
/// Writes a commented starter plan to `path`. An existing file is only
/// replaced with `force`.
pub fn execute_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}\n\
             Use `--force` to overwrite.",
            path.display()
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, generate_template())?;
    eprintln!("Created {}", path.display());
    eprintln!("Edit the file, then run `loadstorm run --config {}`.", path.display());

    Ok(())
}

/// Starter plan with every section present and most options commented out.
fn generate_template() -> String {
    r#"# loadstorm test plan

[settings]
# Number of concurrent virtual users
users = 10

# "loop" runs for duration_secs, "fixed" sends requests_per_user per user
mode = "loop"
duration_secs = 30
# requests_per_user = 10

# Users start evenly spread across this window
ramp_up_secs = 5.0

# Per-request timeout in milliseconds
timeout_ms = 10000

# Warn after this many consecutive failures of one kind (0 disables)
fatal_failure_threshold = 10

# Expected interval between requests (ms) for coordinated omission correction
# expected_interval_ms = 100

[target]
url = "http://localhost:8080"
# "exact" hits url as given, "paths" picks a random entry from paths
mode = "exact"
# paths = ["/", "/health"]
method = "GET"
# payload = '{"name": "${user}"}'

[think_time]
min_secs = 1.0
max_secs = 5.0

[rate_limit]
# Global cap across all users; omit for unlimited
# requests_per_second = 100.0

# [auth]
# type = "bearer"
# token = "your-token"

# [headers]
# X-Env = "staging"

# [validation]
# status = 200
# contains = "ok"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadstorm::loadtest::config::TestPlan;

    #[test]
    fn test_generate_template_parses_as_plan() {
        let plan = TestPlan::from_toml(&generate_template()).unwrap();
        assert_eq!(plan.settings.users, 10);
        assert_eq!(plan.target.url, "http://localhost:8080");
        assert_eq!(plan.rate_limit.requests_per_second, None);
    }

    #[test]
    fn test_execute_init_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("loadstorm.toml");
        execute_init(&path, false).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[settings]"));
    }

    #[test]
    fn test_execute_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loadstorm.toml");
        std::fs::write(&path, "keep me").unwrap();

        let err = execute_init(&path, false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");

        execute_init(&path, true).unwrap();
        assert_ne!(std::fs::read_to_string(&path).unwrap(), "keep me");
    }
}
