//! Integration tests for bundle-service

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn bundle_service() -> Command {
        cargo_bin_cmd!("bundle-service")
    }

    /// Temp registry, work dir, and a config file pointing at both
    struct Sandbox {
        root: TempDir,
    }

    impl Sandbox {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let config = format!(
                "[installation]\nwork_dir = {:?}\nregistry = {:?}\njitter_secs = 0\n",
                root.path().join("work"),
                root.path().join("registry"),
            );
            std::fs::write(root.path().join("config.toml"), config).unwrap();
            Self { root }
        }

        fn publish(&self, name: &str, version: &str, files: &[(&str, &str)]) {
            let dir = self.root.path().join("registry").join(name).join(version);
            for (path, content) in files {
                let file = dir.join(path);
                std::fs::create_dir_all(file.parent().unwrap()).unwrap();
                std::fs::write(file, content).unwrap();
            }
        }

        fn path(&self, relative: &str) -> std::path::PathBuf {
            self.root.path().join(relative)
        }

        fn cmd(&self) -> Command {
            let mut cmd = bundle_service();
            cmd.env("BUNDLE_SERVICE_CONFIG", self.path("config.toml"));
            cmd
        }
    }

    fn is_empty_dir(path: &Path) -> bool {
        std::fs::read_dir(path).map_or(true, |mut entries| entries.next().is_none())
    }

    #[test]
    fn help_displays() {
        bundle_service()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("coalescing build cache"));
    }

    #[test]
    fn version_displays() {
        bundle_service()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("bundle-service"));
    }

    #[test]
    fn config_path() {
        let sandbox = Sandbox::new();
        sandbox
            .cmd()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let sandbox = Sandbox::new();
        sandbox
            .cmd()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[installation]"))
            .stdout(predicate::str::contains("wait_budget_secs = 20"));
    }

    #[test]
    fn config_init_creates_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.toml");

        bundle_service()
            .args(["--config", path.to_str().unwrap(), "config", "init"])
            .assert()
            .success();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[coordinator]"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[coordinator]\nwait_budget_secs = 0\n").unwrap();

        bundle_service()
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("config init --force"));
    }

    #[test]
    fn build_js_to_stdout() {
        let sandbox = Sandbox::new();
        sandbox.publish(
            "o-grid",
            "5.1.0",
            &[("package.json", r#"{"main": "src/grid.js"}"#), ("src/grid.js", "var columns = 12;")],
        );
        sandbox.publish("o-grid", "4.0.0", &[("main.js", "var columns = 4;")]);

        sandbox
            .cmd()
            .args(["build", "--modules", "o-grid@^5", "--export", "Widgets"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Widgets[\"o-grid\"]"))
            .stdout(predicate::str::contains("var columns = 12;"));

        assert!(is_empty_dir(&sandbox.path("work")));
    }

    #[test]
    fn build_css_to_file() {
        let sandbox = Sandbox::new();
        sandbox.publish("o-fonts", "1.2.3", &[("main.css", "@font-face { font-family: x; }")]);
        let output = sandbox.path("out.css");

        sandbox
            .cmd()
            .args([
                "build",
                "-m",
                "o-fonts@1.2.3",
                "--type",
                "css",
                "--brand",
                "internal",
                "--output",
                output.to_str().unwrap(),
            ])
            .assert()
            .success()
            .stderr(predicate::str::contains("Wrote"));

        let css = std::fs::read_to_string(output).unwrap();
        assert!(css.contains("--o-brand: \"internal\""));
        assert!(css.contains("@font-face"));
    }

    #[test]
    fn build_missing_package_fails() {
        let sandbox = Sandbox::new();

        sandbox
            .cmd()
            .args(["build", "--modules", "o-unknown@^1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Package not found: o-unknown@^1"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn build_conflicting_versions_fails() {
        let sandbox = Sandbox::new();

        sandbox
            .cmd()
            .args(["build", "--modules", "o-grid@^5,o-grid@^6"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Version conflict"));
    }

    #[test]
    fn build_compile_error_fails() {
        let sandbox = Sandbox::new();
        sandbox.publish("o-broken", "1.0.0", &[("main.js", "function () {")]);

        sandbox
            .cmd()
            .args(["build", "--modules", "o-broken@^1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Compilation failed"));
    }
}
