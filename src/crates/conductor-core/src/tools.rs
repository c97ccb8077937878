//! Tool-tag processor.
//!
//! Extracts the closed set of tool-call XML tags from agent output and
//! executes them against the sandbox. Execution order is fixed so that
//! creations precede consumers: file writes, reads and listings, directory
//! operations, copies/moves, scaffolding, package installs, then commands
//! and builds. Every path is resolved through [`Sandbox`]; every command
//! goes through [`CommandGuard`]. A rejected operation is recorded in the
//! report's `errors` and never aborts the run.

use crate::events::{EngineEvent, EventBus};
use conductor_tooling::{CommandGuard, Sandbox};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

const PREVIEW_CHARS: usize = 2000;

macro_rules! tag_pattern {
    ($name:ident, $pattern:literal) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("tool tag pattern"))
        }
    };
}

tag_pattern!(write_file_tag, r#"(?s)<write_file\s+path=["'](.*?)["']\s*>(.*?)</write_file>"#);
tag_pattern!(append_file_tag, r#"(?s)<append_file\s+path=["'](.*?)["']\s*>(.*?)</append_file>"#);
tag_pattern!(read_file_tag, r#"<read_file\s+path=["'](.*?)["']\s*/>"#);
tag_pattern!(delete_file_tag, r#"<delete_file\s+path=["'](.*?)["']\s*/>"#);
tag_pattern!(create_dir_tag, r#"<create_dir\s+path=["'](.*?)["']\s*/>"#);
tag_pattern!(list_dir_tag, r#"<list_dir\s+path=["'](.*?)["']\s*/>"#);
tag_pattern!(delete_dir_tag, r#"<delete_dir\s+path=["'](.*?)["']\s*/>"#);
tag_pattern!(copy_tag, r#"<copy\s+path=["'](.*?)["']\s+to=["'](.*?)["']\s*/>"#);
tag_pattern!(move_tag, r#"<move\s+path=["'](.*?)["']\s+to=["'](.*?)["']\s*/>"#);
tag_pattern!(
    scaffold_tag,
    r#"<scaffold_project\s+name=["'](.*?)["'](?:\s+template=["'](.*?)["'])?\s*/>"#
);
tag_pattern!(
    install_package_tag,
    r#"<install_package\s+name=["'](.*?)["'](?:\s+manager=["'](.*?)["'])?\s*/>"#
);
tag_pattern!(install_tool_tag, r#"<install_tool\s+name=["'](.*?)["']\s*/>"#);
tag_pattern!(
    run_command_tag,
    r#"<run_command\s+command=["'](.*?)["'](?:\s+timeout=["'](\d+)["'])?\s*/>"#
);
tag_pattern!(run_build_tag, r#"<run_build(?:\s+command=["'](.*?)["'])?\s*/>"#);

fn fence_open() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^```\w*\s*\n?").expect("fence open"))
}

fn fence_close() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n?```\s*$").expect("fence close"))
}

fn package_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9@/_.+-]+$").expect("package name"))
}

/// Tools that `<install_tool>` may install: name -> (manager, package).
const APPROVED_TOOLS: &[(&str, &str, &str)] = &[
    ("vite", "npm", "vite"),
    ("typescript", "npm", "typescript"),
    ("jest", "npm", "jest"),
    ("esbuild", "npm", "esbuild"),
    ("webpack", "npm", "webpack"),
    ("lodash", "npm", "lodash"),
    ("ruff", "pip", "ruff"),
    ("pytest", "pip", "pytest"),
];

/// Package managers `<install_package>` may invoke.
fn manager_command(manager: &str, package: &str) -> Option<String> {
    match manager {
        "npm" => Some(format!("npm install {package}")),
        "yarn" => Some(format!("yarn add {package}")),
        "pnpm" => Some(format!("pnpm add {package}")),
        "pip" => Some(format!("pip install {package}")),
        "cargo" => Some(format!("cargo add {package}")),
        _ => None,
    }
}

/// Counters and error strings accumulated over one processing pass.
#[derive(Debug, Clone, Default)]
pub struct ToolReport {
    pub files_created: Vec<String>,
    pub files_deleted: Vec<String>,
    pub dirs_created: Vec<String>,
    pub commands_run: Vec<String>,
    pub packages_installed: Vec<String>,
    pub errors: Vec<String>,
}

impl ToolReport {
    /// Total count of side-effecting operations performed.
    pub fn total_actions(&self) -> usize {
        self.files_created.len()
            + self.files_deleted.len()
            + self.dirs_created.len()
            + self.commands_run.len()
            + self.packages_installed.len()
    }
}

/// Executes tool tags found in one node output.
pub struct ToolProcessor {
    sandbox: Sandbox,
    guard: CommandGuard,
    bus: EventBus,
    speaker: String,
}

impl ToolProcessor {
    pub fn new(sandbox: Sandbox, bus: EventBus, speaker: impl Into<String>) -> Self {
        Self {
            sandbox,
            guard: CommandGuard::default(),
            bus,
            speaker: speaker.into(),
        }
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!(speaker = %self.speaker, "{message}");
        self.bus.emit(EngineEvent::log(&self.speaker, message));
    }

    fn thought(&self, content: impl Into<String>) {
        self.bus.emit(EngineEvent::thought(&self.speaker, content));
    }

    fn preview(text: &str) -> String {
        if text.chars().count() > PREVIEW_CHARS {
            let cut: String = text.chars().take(PREVIEW_CHARS).collect();
            format!("{cut}\n*(truncated...)*")
        } else {
            text.to_string()
        }
    }

    fn clean_content(content: &str) -> String {
        let content = content.trim();
        let content = fence_open().replace(content, "");
        let content = fence_close().replace(&content, "");
        content.trim().to_string()
    }

    fn resolve(&self, raw: &str, action: &str, report: &mut ToolReport) -> Option<std::path::PathBuf> {
        match self.sandbox.resolve(raw) {
            Ok(path) => Some(path),
            Err(e) => {
                self.log(format!("Security: blocked {action} of {raw} ({e})"));
                report.errors.push(format!("Blocked {action}: {raw}"));
                None
            }
        }
    }

    /// Process every tool tag in `output`, in the fixed order.
    pub async fn process_all(&self, output: &str) -> ToolReport {
        let mut report = ToolReport::default();

        self.process_write_file(output, &mut report).await;
        self.process_read_file(output, &mut report).await;
        self.process_list_dir(output, &mut report).await;
        self.process_create_dir(output, &mut report).await;
        self.process_delete_file(output, &mut report).await;
        self.process_delete_dir(output, &mut report).await;
        self.process_append_file(output, &mut report).await;
        self.process_copy(output, &mut report).await;
        self.process_move(output, &mut report).await;
        self.process_scaffold(output, &mut report).await;
        self.process_install_package(output, &mut report).await;
        self.process_install_tool(output, &mut report).await;
        self.process_run_command(output, &mut report).await;
        self.process_run_build(output, &mut report).await;

        report
    }

    async fn process_write_file(&self, output: &str, report: &mut ToolReport) {
        for capture in write_file_tag().captures_iter(output) {
            let raw_path = &capture[1];
            let content = Self::clean_content(&capture[2]);
            let Some(target) = self.resolve(raw_path, "write", report) else {
                continue;
            };
            if content.is_empty() {
                self.log(format!("Skipped empty file: {raw_path}"));
                continue;
            }
            let result = async {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, &content).await
            }
            .await;
            match result {
                Ok(()) => {
                    self.log(format!("Created/updated: {raw_path} ({} chars)", content.len()));
                    report.files_created.push(raw_path.to_string());
                }
                Err(e) => {
                    self.log(format!("Write error: {e}"));
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    async fn process_read_file(&self, output: &str, report: &mut ToolReport) {
        for capture in read_file_tag().captures_iter(output) {
            let raw_path = &capture[1];
            let Some(target) = self.resolve(raw_path, "read", report) else {
                continue;
            };
            match tokio::fs::read_to_string(&target).await {
                Ok(content) => {
                    self.thought(format!(
                        "### READ FILE: `{raw_path}`\n```\n{}\n```",
                        Self::preview(&content)
                    ));
                    self.log(format!("Read: {raw_path}"));
                }
                Err(_) => self.log(format!("File not found: {raw_path}")),
            }
        }
    }

    async fn process_list_dir(&self, output: &str, report: &mut ToolReport) {
        for capture in list_dir_tag().captures_iter(output) {
            let raw_path = &capture[1];
            let Some(target) = self.resolve(raw_path, "list", report) else {
                continue;
            };
            match tokio::fs::read_dir(&target).await {
                Ok(mut entries) => {
                    let mut lines = Vec::new();
                    while let Ok(Some(entry)) = entries.next_entry().await {
                        let marker = if entry.path().is_dir() { "[dir] " } else { "" };
                        lines.push(format!("- {marker}{}", entry.file_name().to_string_lossy()));
                    }
                    lines.sort();
                    self.thought(format!("### LIST DIR: `{raw_path}`\n{}", lines.join("\n")));
                    self.log(format!("Listed: {raw_path} ({} items)", lines.len()));
                }
                Err(_) => self.log(format!("Directory not found: {raw_path}")),
            }
        }
    }

    async fn process_create_dir(&self, output: &str, report: &mut ToolReport) {
        for capture in create_dir_tag().captures_iter(output) {
            let raw_path = &capture[1];
            let Some(target) = self.resolve(raw_path, "mkdir", report) else {
                continue;
            };
            match tokio::fs::create_dir_all(&target).await {
                Ok(()) => {
                    self.log(format!("Created directory: {raw_path}"));
                    report.dirs_created.push(raw_path.to_string());
                }
                Err(e) => {
                    self.log(format!("Mkdir error: {e}"));
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    async fn process_delete_file(&self, output: &str, report: &mut ToolReport) {
        for capture in delete_file_tag().captures_iter(output) {
            let raw_path = &capture[1];
            let Some(target) = self.resolve(raw_path, "delete", report) else {
                continue;
            };
            if target.is_file() {
                match tokio::fs::remove_file(&target).await {
                    Ok(()) => {
                        self.log(format!("Deleted file: {raw_path}"));
                        report.files_deleted.push(raw_path.to_string());
                    }
                    Err(e) => {
                        self.log(format!("Delete error: {e}"));
                        report.errors.push(e.to_string());
                    }
                }
            }
        }
    }

    async fn process_delete_dir(&self, output: &str, report: &mut ToolReport) {
        for capture in delete_dir_tag().captures_iter(output) {
            let raw_path = &capture[1];
            let Some(target) = self.resolve(raw_path, "rmdir", report) else {
                continue;
            };
            if target.is_dir() {
                match tokio::fs::remove_dir_all(&target).await {
                    Ok(()) => self.log(format!("Deleted directory: {raw_path}")),
                    Err(e) => {
                        self.log(format!("Rmdir error: {e}"));
                        report.errors.push(e.to_string());
                    }
                }
            }
        }
    }

    async fn process_append_file(&self, output: &str, report: &mut ToolReport) {
        for capture in append_file_tag().captures_iter(output) {
            let raw_path = &capture[1];
            let content = capture[2].trim().to_string();
            let Some(target) = self.resolve(raw_path, "append", report) else {
                continue;
            };
            let result = async {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let existing = tokio::fs::read_to_string(&target).await.unwrap_or_default();
                tokio::fs::write(&target, format!("{existing}{content}\n")).await
            }
            .await;
            match result {
                Ok(()) => self.log(format!("Appended to: {raw_path}")),
                Err(e) => {
                    self.log(format!("Append error: {e}"));
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    async fn process_copy(&self, output: &str, report: &mut ToolReport) {
        for capture in copy_tag().captures_iter(output) {
            let (raw_src, raw_dst) = (&capture[1], &capture[2]);
            let Some(src) = self.resolve(raw_src, "copy", report) else {
                continue;
            };
            let Some(dst) = self.resolve(raw_dst, "copy", report) else {
                continue;
            };
            match copy_recursive(&src, &dst).await {
                Ok(()) => self.log(format!("Copied: {raw_src} -> {raw_dst}")),
                Err(e) => {
                    self.log(format!("Copy error: {e}"));
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    async fn process_move(&self, output: &str, report: &mut ToolReport) {
        for capture in move_tag().captures_iter(output) {
            let (raw_src, raw_dst) = (&capture[1], &capture[2]);
            let Some(src) = self.resolve(raw_src, "move", report) else {
                continue;
            };
            let Some(dst) = self.resolve(raw_dst, "move", report) else {
                continue;
            };
            let result = async {
                if let Some(parent) = dst.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&src, &dst).await
            }
            .await;
            match result {
                Ok(()) => self.log(format!("Moved: {raw_src} -> {raw_dst}")),
                Err(e) => {
                    self.log(format!("Move error: {e}"));
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    async fn process_scaffold(&self, output: &str, report: &mut ToolReport) {
        for capture in scaffold_tag().captures_iter(output) {
            let name = &capture[1];
            let template = capture.get(2).map(|m| m.as_str()).unwrap_or("web-app");
            let Some(root) = self.resolve(name, "scaffold", report) else {
                continue;
            };
            self.log(format!("Scaffolding: {name} (template: {template})"));
            match scaffold_template(&root, template).await {
                Ok(created) => {
                    for file in created {
                        report.files_created.push(format!("{name}/{file}"));
                    }
                    report.dirs_created.push(name.to_string());
                    self.thought(format!(
                        "### PROJECT SCAFFOLDED\nPath: {}\nTemplate: {template}",
                        root.display()
                    ));
                }
                Err(e) => {
                    self.log(format!("Scaffold error: {e}"));
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    async fn process_install_package(&self, output: &str, report: &mut ToolReport) {
        for capture in install_package_tag().captures_iter(output) {
            let package = &capture[1];
            let manager = capture.get(2).map(|m| m.as_str()).unwrap_or("npm");
            if !package_name().is_match(package) {
                self.log(format!("Invalid package name: {package}"));
                report.errors.push(format!("Invalid package name: {package}"));
                continue;
            }
            let Some(command) = manager_command(manager, package) else {
                self.log(format!("Package manager not approved: {manager}"));
                report.errors.push(format!("Unapproved manager: {manager}"));
                continue;
            };
            self.log(format!("Installing: {package} via {manager}"));
            match self
                .guard
                .run_with_timeout(&command, self.sandbox.root(), Duration::from_secs(300))
                .await
            {
                Ok(result) if result.success() => {
                    self.log(format!("Installed: {package}"));
                    report.packages_installed.push(package.to_string());
                }
                Ok(result) => {
                    self.log(format!(
                        "Install warning: {}",
                        Self::preview(result.summary())
                    ));
                }
                Err(e) => {
                    self.log(format!("Install error: {e}"));
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    async fn process_install_tool(&self, output: &str, report: &mut ToolReport) {
        for capture in install_tool_tag().captures_iter(output) {
            let tool = &capture[1];
            let Some((_, manager, package)) =
                APPROVED_TOOLS.iter().find(|(name, _, _)| *name == tool)
            else {
                self.log(format!("Tool not approved: {tool}"));
                report.errors.push(format!("Unapproved tool: {tool}"));
                continue;
            };
            let command = manager_command(manager, package).expect("approved manager");
            self.log(format!("Installing tool: {tool}"));
            match self
                .guard
                .run_with_timeout(&command, self.sandbox.root(), Duration::from_secs(300))
                .await
            {
                Ok(result) if result.success() => {
                    self.log(format!("Tool installed: {tool}"));
                    report.packages_installed.push(tool.to_string());
                }
                Ok(_) | Err(_) => self.log(format!("Tool install failed: {tool}")),
            }
        }
    }

    async fn process_run_command(&self, output: &str, report: &mut ToolReport) {
        for capture in run_command_tag().captures_iter(output) {
            let command = &capture[1];
            let timeout = capture
                .get(2)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(self.guard.timeout);
            self.log(format!("Executing: {command}"));
            match self
                .guard
                .run_with_timeout(command, self.sandbox.root(), timeout)
                .await
            {
                Ok(result) => {
                    self.thought(format!(
                        "### COMMAND: `{command}`\n```\n{}\n```",
                        Self::preview(result.summary())
                    ));
                    report.commands_run.push(command.to_string());
                }
                Err(e) => {
                    self.log(format!("Command error: {e}"));
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    async fn process_run_build(&self, output: &str, report: &mut ToolReport) {
        for capture in run_build_tag().captures_iter(output) {
            let command = capture.get(1).map(|m| m.as_str()).unwrap_or("npm run build");
            self.log(format!("Running build: {command}"));
            match self
                .guard
                .run_with_timeout(command, self.sandbox.root(), Duration::from_secs(300))
                .await
            {
                Ok(result) if result.success() => {
                    self.log("Build complete".to_string());
                    report.commands_run.push(command.to_string());
                }
                Ok(result) => {
                    self.log(format!("Build failed: {}", Self::preview(result.summary())));
                    report.errors.push(format!("Build failed: {command}"));
                }
                Err(e) => {
                    self.log(format!("Build error: {e}"));
                    report.errors.push(e.to_string());
                }
            }
        }
    }
}

/// Copy a file or directory tree.
async fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if src.is_dir() {
        // Walk iteratively; async recursion over directories is not worth
        // the boxing here.
        let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
        while let Some((from, to)) = pending.pop() {
            tokio::fs::create_dir_all(&to).await?;
            let mut entries = tokio::fs::read_dir(&from).await?;
            while let Some(entry) = entries.next_entry().await? {
                let target = to.join(entry.file_name());
                if entry.path().is_dir() {
                    pending.push((entry.path(), target));
                } else {
                    tokio::fs::copy(entry.path(), target).await?;
                }
            }
        }
        Ok(())
    } else {
        tokio::fs::copy(src, dst).await.map(|_| ())
    }
}

/// Materialize a built-in project template under `root`. Returns the
/// relative paths of the files created.
async fn scaffold_template(root: &Path, template: &str) -> std::io::Result<Vec<String>> {
    let files: &[(&str, &str)] = match template {
        "static-site" => &[
            ("index.html", "<!doctype html>\n<html>\n<head><title>New Site</title></head>\n<body>\n<h1>Hello</h1>\n</body>\n</html>\n"),
            ("css/style.css", "body { font-family: sans-serif; }\n"),
            ("js/main.js", "console.log('ready');\n"),
        ],
        "cli-tool" => &[
            ("src/main.py", "def main():\n    print(\"hello\")\n\n\nif __name__ == \"__main__\":\n    main()\n"),
            ("README.md", "# CLI Tool\n"),
            ("requirements.txt", ""),
        ],
        // Default template.
        _ => &[
            ("package.json", "{\n  \"name\": \"new-app\",\n  \"version\": \"0.1.0\",\n  \"scripts\": {\n    \"dev\": \"vite\",\n    \"build\": \"vite build\"\n  }\n}\n"),
            ("index.html", "<!doctype html>\n<html>\n<body>\n<div id=\"app\"></div>\n<script type=\"module\" src=\"/src/main.js\"></script>\n</body>\n</html>\n"),
            ("src/main.js", "document.querySelector('#app').textContent = 'ready';\n"),
            ("docs/README.md", "# New App\n"),
        ],
    };

    let mut created = Vec::new();
    for (relative, content) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        created.push(relative.to_string());
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn processor() -> (TempDir, ToolProcessor, EventBus) {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::default();
        let sandbox = Sandbox::new(dir.path()).unwrap();
        let processor = ToolProcessor::new(sandbox, bus.clone(), "Builder");
        (dir, processor, bus)
    }

    #[tokio::test]
    async fn write_file_creates_parents_and_strips_fences() {
        let (dir, processor, _) = processor();
        let output = "<write_file path=\"src/app.js\">```javascript\nconsole.log(1);\n```</write_file>";
        let report = processor.process_all(output).await;

        assert_eq!(report.files_created, vec!["src/app.js"]);
        let written = std::fs::read_to_string(dir.path().join("src/app.js")).unwrap();
        assert_eq!(written, "console.log(1);");
    }

    #[tokio::test]
    async fn path_escape_is_blocked_without_write() {
        let (dir, processor, _) = processor();
        let report = processor
            .process_all("<write_file path=\"../etc/passwd\">x</write_file>")
            .await;

        assert!(!report.errors.is_empty());
        assert!(report.files_created.is_empty());
        // Nothing outside the sandbox was touched.
        assert!(!dir.path().parent().unwrap().join("etc/passwd").exists());
    }

    #[tokio::test]
    async fn append_creates_then_appends() {
        let (dir, processor, _) = processor();
        processor
            .process_all("<append_file path=\"log.txt\">first</append_file>")
            .await;
        processor
            .process_all("<append_file path=\"log.txt\">second</append_file>")
            .await;
        let content = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn delete_file_only_removes_files() {
        let (dir, processor, _) = processor();
        std::fs::create_dir(dir.path().join("keepdir")).unwrap();
        std::fs::write(dir.path().join("gone.txt"), "x").unwrap();

        let report = processor
            .process_all("<delete_file path=\"gone.txt\"/><delete_file path=\"keepdir\"/>")
            .await;

        assert_eq!(report.files_deleted, vec!["gone.txt"]);
        assert!(dir.path().join("keepdir").exists());
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn copy_and_move_round_trip() {
        let (dir, processor, _) = processor();
        std::fs::write(dir.path().join("a.txt"), "payload").unwrap();

        processor
            .process_all("<copy path=\"a.txt\" to=\"b.txt\"/><move path=\"b.txt\" to=\"sub/c.txt\"/>")
            .await;

        assert!(dir.path().join("a.txt").exists());
        assert!(!dir.path().join("b.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sub/c.txt")).unwrap(),
            "payload"
        );
    }

    #[tokio::test]
    async fn read_file_emits_preview_thought() {
        let (dir, processor, bus) = processor();
        std::fs::write(dir.path().join("notes.md"), "remember this").unwrap();
        let mut rx = bus.subscribe();

        processor.process_all("<read_file path=\"notes.md\"/>").await;

        let mut saw_preview = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::NodeThought { thought, .. } = event {
                if thought.contains("remember this") {
                    saw_preview = true;
                }
            }
        }
        assert!(saw_preview);
    }

    #[tokio::test]
    async fn scaffold_materializes_template() {
        let (dir, processor, _) = processor();
        let report = processor
            .process_all("<scaffold_project name=\"game\" template=\"static-site\"/>")
            .await;

        assert!(dir.path().join("game/index.html").exists());
        assert!(dir.path().join("game/css/style.css").exists());
        assert_eq!(report.dirs_created, vec!["game"]);
    }

    #[tokio::test]
    async fn run_command_is_guarded() {
        let (_dir, processor, _) = processor();
        let report = processor
            .process_all("<run_command command=\"rm -rf /\"/>")
            .await;
        assert!(report.commands_run.is_empty());
        assert!(!report.errors.is_empty());
    }

    #[tokio::test]
    async fn run_command_captures_output_as_thought() {
        let (_dir, processor, bus) = processor();
        let mut rx = bus.subscribe();
        let report = processor
            .process_all("<run_command command=\"echo tool-output\"/>")
            .await;

        assert_eq!(report.commands_run, vec!["echo tool-output"]);
        let mut saw_output = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::NodeThought { thought, .. } = event {
                if thought.contains("tool-output") {
                    saw_output = true;
                }
            }
        }
        assert!(saw_output);
    }

    #[tokio::test]
    async fn unapproved_manager_and_tool_are_rejected() {
        let (_dir, processor, _) = processor();
        let report = processor
            .process_all(
                "<install_package name=\"x\" manager=\"curlpipe\"/><install_tool name=\"netcat\"/>",
            )
            .await;
        assert!(report.packages_installed.is_empty());
        assert_eq!(report.errors.len(), 2);
    }

    #[tokio::test]
    async fn shell_injection_in_package_name_is_rejected() {
        let (_dir, processor, _) = processor();
        let report = processor
            .process_all("<install_package name=\"x; rm -rf ~\" manager=\"npm\"/>")
            .await;
        assert!(report.packages_installed.is_empty());
        assert!(!report.errors.is_empty());
    }

    #[tokio::test]
    async fn report_counts_actions() {
        let (_dir, processor, _) = processor();
        let report = processor
            .process_all(
                "<write_file path=\"a.txt\">x</write_file>\
                 <create_dir path=\"d\"/>\
                 <run_command command=\"true\"/>",
            )
            .await;
        assert_eq!(report.total_actions(), 3);
        assert!(report.errors.is_empty());
    }
}
