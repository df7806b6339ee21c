//! Worker side of a run
//!
//! A worker is started as `<worker> <index> <base64 config>`. It runs the
//! configured test command once per file in its partition, then writes a
//! completion report with the number of files that failed. A worker that
//! cannot run at all exits without a report and is counted as incomplete.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use tunnelrun_common::{Error as ConfigError, RunConfig};
use walkdir::WalkDir;

use crate::error::{ControlError, ControlResult};
use crate::tunnel::ProviderProfile;

/// Placeholder in `workers.test_command` replaced by the test file path
pub const FILE_PLACEHOLDER: &str = "{file}";

/// A decoded worker command line
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub index: usize,
    pub config: RunConfig,
}

impl WorkerInvocation {
    pub fn from_args(index: usize, encoded: &str) -> ControlResult<Self> {
        let config = RunConfig::decode(encoded)?;
        if config.partition(index).is_none() {
            return Err(ControlError::Config(ConfigError::InvalidConfig(format!(
                "no partition for worker {} ({} configured)",
                index,
                config.workers.partitions.len()
            ))));
        }
        Ok(Self { index, config })
    }

    /// Files matched by this worker's globs, in pattern order without repeats
    pub fn test_files(&self) -> ControlResult<Vec<PathBuf>> {
        let patterns = self.config.partition(self.index).unwrap_or_default();
        let mut files: Vec<PathBuf> = Vec::new();

        for pattern in patterns {
            let matched = expand_glob(pattern)?;
            if matched.is_empty() {
                warn!("Worker {}: {:?} matched no files", self.index, pattern);
            }
            for path in matched {
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    /// Variables describing the run to each test process
    pub fn environment(&self) -> ControlResult<Vec<(&'static str, String)>> {
        let provider = self.config.provider();
        let selenium = ProviderProfile::for_service(self.config.service).selenium(provider);
        let capabilities = serde_json::to_string(&provider.capabilities)
            .map_err(|e| ControlError::Config(ConfigError::Serialization(e)))?;

        let mut env = vec![
            ("TUNNELRUN_WORKER_INDEX", self.index.to_string()),
            ("TUNNELRUN_BASE_URL", self.config.server.base_url()),
            ("TUNNELRUN_WEBDRIVER_URL", selenium.webdriver_url()),
            ("TUNNELRUN_CAPABILITIES", capabilities),
        ];
        if let Some(tunnel_id) = &self.config.tunnel_id {
            env.push(("TUNNELRUN_TUNNEL_ID", tunnel_id.clone()));
        }
        Ok(env)
    }

    /// Test command for `file` with the placeholder substituted
    pub fn test_command(&self, file: &Path) -> Vec<String> {
        let file = file.to_string_lossy();
        self.config
            .workers
            .test_command
            .iter()
            .map(|arg| arg.replace(FILE_PLACEHOLDER, &file))
            .collect()
    }

    /// Run every test file; returns how many failed
    pub async fn run(&self) -> ControlResult<u32> {
        let files = self.test_files()?;
        let env = self.environment()?;
        info!("Worker {} running {} test file(s)", self.index, files.len());

        let mut failures = 0u32;
        for file in &files {
            let argv = self.test_command(file);
            let Some((program, args)) = argv.split_first() else {
                return Err(ControlError::Config(ConfigError::InvalidConfig(
                    "workers.test_command must not be empty".to_string(),
                )));
            };

            debug!("Worker {}: {} {}", self.index, program, args.join(" "));
            let status = Command::new(program)
                .args(args)
                .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
                .env("TUNNELRUN_TEST_FILE", file)
                .stdin(Stdio::null())
                .status()
                .await
                .map_err(|e| ControlError::spawn(format!("test command {}", program), e))?;

            if status.success() {
                info!("PASS {}", file.display());
            } else {
                failures += 1;
                warn!("FAIL {} ({})", file.display(), status);
            }
        }

        info!("Worker {} done: {} failed file(s)", self.index, failures);
        Ok(failures)
    }
}

/// Characters that make a path component a pattern
const GLOB_META: &[char] = &['*', '?', '['];

/// Files matching a shell-style glob (`*`, `?`, `[...]`, `**`), sorted by
/// name within each directory
fn expand_glob(pattern: &str) -> ControlResult<Vec<PathBuf>> {
    let bad_glob = |e: regex::Error| {
        ControlError::Config(ConfigError::InvalidConfig(format!(
            "bad test glob {:?}: {}",
            pattern, e
        )))
    };

    let Some(meta) = pattern.find(GLOB_META) else {
        let path = PathBuf::from(pattern);
        return Ok(if path.is_file() { vec![path] } else { Vec::new() });
    };

    // Walk from the deepest directory that has no pattern characters
    let (root, rest) = match pattern[..meta].rfind('/') {
        Some(0) => ("/", &pattern[1..]),
        Some(slash) => (&pattern[..slash], &pattern[slash + 1..]),
        None => (".", pattern),
    };
    let matcher = glob_regex(pattern, root == ".").map_err(bad_glob)?;

    let mut walker = WalkDir::new(root).sort_by_file_name();
    if !rest.contains("**") {
        walker = walker.max_depth(rest.split('/').count());
    }

    let mut files = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let path = entry.path();
                if matcher.is_match(&path.to_string_lossy()) {
                    files.push(path.strip_prefix("./").unwrap_or(path).to_path_buf());
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Skipping unreadable path: {}", e),
        }
    }
    Ok(files)
}

/// Translate a glob to an anchored regex over `/`-separated paths
fn glob_regex(pattern: &str, relative: bool) -> Result<Regex, regex::Error> {
    let mut re = String::from("^");
    if relative {
        re.push_str(r"(?:\./)?");
    }

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    re.push_str("(?:.*/)?");
                } else {
                    re.push_str(".*");
                }
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            '[' => {
                let negate = chars.peek() == Some(&'!');
                if negate {
                    chars.next();
                }
                let mut class = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    class.push(c);
                }
                if closed {
                    re.push_str(if negate { "[^" } else { "[" });
                    re.push_str(&class.replace('\\', "\\\\"));
                    re.push(']');
                } else {
                    // Unclosed bracket is literal
                    let bang = if negate { "!" } else { "" };
                    re.push_str(&regex::escape(&format!("[{}{}", bang, class)));
                }
            }
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tunnelrun_common::ServiceKind;

    fn invocation(dir: &Path, test_command: &[&str]) -> WorkerInvocation {
        let mut config = RunConfig::default();
        config.workers.partitions = vec![
            vec![format!("{}/*.js", dir.display())],
            vec![format!("{}/b.js", dir.display()), format!("{}/*.js", dir.display())],
        ];
        config.workers.test_command = test_command.iter().map(|s| s.to_string()).collect();
        WorkerInvocation::from_args(0, &config.encode().unwrap()).unwrap()
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.js"), "").unwrap();
        std::fs::write(dir.path().join("b.js"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        dir
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(matches!(
            WorkerInvocation::from_args(0, "not base64!"),
            Err(ControlError::Config(_))
        ));

        let mut config = RunConfig::default();
        config.workers.partitions = vec![vec!["a.js".to_string()]];
        let err = WorkerInvocation::from_args(3, &config.encode().unwrap()).unwrap_err();
        assert!(err.to_string().contains("no partition for worker 3"));
    }

    #[test]
    fn test_globs_expand_without_repeats() {
        let dir = fixture();
        let mut inv = invocation(dir.path(), &["true"]);
        let files = inv.test_files().unwrap();
        assert_eq!(files, [dir.path().join("a.js"), dir.path().join("b.js")]);

        inv.index = 1;
        let files = inv.test_files().unwrap();
        assert_eq!(files, [dir.path().join("b.js"), dir.path().join("a.js")]);
    }

    #[test]
    fn test_glob_translation() {
        let re = glob_regex("test/**/*.js", true).unwrap();
        assert!(re.is_match("test/a.js"));
        assert!(re.is_match("./test/unit/deep/b.js"));
        assert!(!re.is_match("test/a.jsx"));
        assert!(!re.is_match("other/test/a.js"));

        let re = glob_regex("/t/p?_[!x].js", false).unwrap();
        assert!(re.is_match("/t/p1_a.js"));
        assert!(!re.is_match("/t/p1_x.js"));
        assert!(!re.is_match("/t/p/_a.js"));
    }

    #[test]
    fn test_recursive_glob_and_missing_files() {
        let dir = fixture();
        std::fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();
        std::fs::write(dir.path().join("nested/deeper/c.js"), "").unwrap();

        let files = expand_glob(&format!("{}/**/*.js", dir.path().display())).unwrap();
        assert_eq!(
            files,
            [
                dir.path().join("a.js"),
                dir.path().join("b.js"),
                dir.path().join("nested/deeper/c.js")
            ]
        );

        let shallow = expand_glob(&format!("{}/*/c.js", dir.path().display())).unwrap();
        assert!(shallow.is_empty());
        assert!(expand_glob(&format!("{}/absent.js", dir.path().display()))
            .unwrap()
            .is_empty());
        assert!(expand_glob(&format!("{}/[a.js", dir.path().display()))
            .unwrap()
            .is_empty());
        assert!(matches!(
            expand_glob(&format!("{}/[z-a].js", dir.path().display())),
            Err(ControlError::Config(_))
        ));
    }

    #[test]
    fn test_placeholder_substitution() {
        let inv = invocation(Path::new("/t"), &["node", "--file={file}", "{file}"]);
        assert_eq!(
            inv.test_command(Path::new("/t/a.js")),
            ["node", "--file=/t/a.js", "/t/a.js"]
        );
    }

    #[test]
    fn test_environment() {
        let mut inv = invocation(Path::new("/t"), &["true"]);
        inv.config.service = ServiceKind::SauceLabs;
        inv.config.tunnel_id = Some("tid".to_string());
        inv.config.server.port = 8123;

        let env = inv.environment().unwrap();
        let get = |key: &str| env.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone());
        assert_eq!(get("TUNNELRUN_WORKER_INDEX").as_deref(), Some("0"));
        assert_eq!(get("TUNNELRUN_BASE_URL").as_deref(), Some("http://localhost:8123"));
        assert_eq!(
            get("TUNNELRUN_WEBDRIVER_URL").as_deref(),
            Some("http://localhost:4445/wd/hub")
        );
        assert_eq!(get("TUNNELRUN_TUNNEL_ID").as_deref(), Some("tid"));
        assert_eq!(get("TUNNELRUN_CAPABILITIES").as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_counts_failing_files() {
        let dir = fixture();
        let inv = invocation(dir.path(), &["sh", "-c", r#"test "$(basename {file})" = a.js"#]);
        assert_eq!(inv.run().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_test_process_sees_environment() {
        let dir = fixture();
        let script = r#"test "$TUNNELRUN_WORKER_INDEX" = 0 && test "$TUNNELRUN_TEST_FILE" = "{file}""#;
        let inv = invocation(dir.path(), &["sh", "-c", script]);
        assert_eq!(inv.run().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_test_program_is_an_error() {
        let dir = fixture();
        let inv = invocation(dir.path(), &["/nonexistent/test-runner", "{file}"]);
        assert!(matches!(inv.run().await, Err(ControlError::Spawn { .. })));
    }
}
