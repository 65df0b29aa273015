//! Maintenance-tool backend — drives the external update-delivery
//! executable shipped next to the host application.
//!
//! ## Check cycle
//! `<tool> --checkupdates` is spawned with piped stdio; a waiter task
//! collects its output, maps the exit status and publishes one
//! [`BackendEvent`] on the backend's broadcast channel. Exit code 0 means
//! the captured stdout may contain an update list; any other clean exit is
//! treated as "no updates".
//!
//! ## Install trigger
//! `<tool> --updater` (or `--silentUpdate`) is launched detached and never
//! monitored; performing the installation is the tool's job, not ours.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};

use crate::backend::{AdminAuthoriser, BackendEvent, Features, UpdaterBackend};
use crate::error::UpdaterError;
use crate::version::Version;
use crate::{UpdateInfo, UpdaterConfig};

use async_trait::async_trait;

const CHECK_ARG: &str = "--checkupdates";
const UPDATES_OPEN: &str = "<updates>";
const UPDATES_CLOSE: &str = "</updates>";

// ─── Backend State ───────────────────────────────────────────

/// Resolved maintenance tool install.
#[derive(Debug, Clone)]
struct ToolLocation {
    program: PathBuf,
    working_dir: PathBuf,
}

/// A check process in flight.
#[derive(Debug, Clone, Copy)]
struct RunningCheck {
    pid: u32,
}

#[derive(Default)]
struct Inner {
    tool: Option<ToolLocation>,
    check: Option<RunningCheck>,
}

/// Reference [`UpdaterBackend`] for maintenance-tool style installers.
pub struct MaintenanceToolBackend {
    config: UpdaterConfig,
    authoriser: Option<Arc<dyn AdminAuthoriser>>,
    events: broadcast::Sender<BackendEvent>,
    ready: AtomicBool,
    inner: Arc<Mutex<Inner>>,
}

impl MaintenanceToolBackend {
    pub fn new(config: UpdaterConfig, authoriser: Option<Arc<dyn AdminAuthoriser>>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            authoriser,
            events,
            ready: AtomicBool::new(false),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Resolved tool path, once initialized. Hosts feed this into
    /// [`tool_requires_admin`] to pick the startup elevation default.
    pub async fn tool_path(&self) -> Option<PathBuf> {
        self.inner.lock().await.tool.as_ref().map(|t| t.program.clone())
    }
}

#[async_trait]
impl UpdaterBackend for MaintenanceToolBackend {
    fn features(&self) -> Features {
        if !self.ready.load(Ordering::Acquire) {
            return Features::NONE;
        }
        let mut features = Features::CHECK_UPDATES | Features::TRIGGER_INSTALL;
        if cfg!(target_os = "windows") {
            // The tool cannot replace binaries the host still holds open.
            features |= Features::INSTALL_NEEDS_EXIT;
        }
        features
    }

    async fn initialize(&self) -> bool {
        if !self.config.enabled {
            tracing::info!("[Backend] updater disabled by configuration");
            return false;
        }
        match locate_tool(&self.config) {
            Some(tool) => {
                tracing::info!("[Backend] maintenance tool found at {}", tool.program.display());
                self.inner.lock().await.tool = Some(tool);
                self.ready.store(true, Ordering::Release);
                true
            }
            None => {
                tracing::warn!("[Backend] maintenance tool not found, update checks disabled");
                false
            }
        }
    }

    async fn check_for_updates(&self) -> Result<(), UpdaterError> {
        let mut inner = self.inner.lock().await;
        let tool = inner.tool.clone().ok_or(UpdaterError::NotInitialized)?;
        if inner.check.is_some() {
            return Err(UpdaterError::AlreadyRunning);
        }

        let mut cmd = Command::new(&tool.program);
        cmd.arg(CHECK_ARG)
            .current_dir(&tool.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        apply_creation_flags(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Launch errors are delivered through the event channel so
                // completion handling stays in one place.
                tracing::error!("[Backend] failed to launch maintenance tool: {}", e);
                let _ = self.events.send(BackendEvent::CheckFailed {
                    message: format!("failed to launch '{}': {}", tool.program.display(), e),
                    exit_code: None,
                    normal_exit: false,
                });
                return Ok(());
            }
        };

        let pid = child.id().unwrap_or(0);
        inner.check = Some(RunningCheck { pid });
        drop(inner);
        tracing::info!("[Backend] update check started (pid {})", pid);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let inner = self.inner.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            // Drain the pipes concurrently so the child never blocks on a
            // full pipe before we reach wait().
            let stdout_task = tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Some(mut out) = stdout {
                    let _ = out.read_to_end(&mut buf).await;
                }
                buf
            });
            let stderr_task = tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Some(mut err) = stderr {
                    let _ = err.read_to_end(&mut buf).await;
                }
                buf
            });

            let status = child.wait().await;
            let stdout_buf = stdout_task.await.unwrap_or_default();
            let stderr_buf = stderr_task.await.unwrap_or_default();

            inner.lock().await.check = None;

            let event = match status {
                Ok(status) => match status.code() {
                    Some(0) => {
                        let output = String::from_utf8_lossy(&stdout_buf);
                        match parse_update_output(&output) {
                            Ok(updates) => {
                                tracing::info!("[Backend] check finished: {} update(s) available", updates.len());
                                BackendEvent::CheckCompleted { updates }
                            }
                            Err(e) => {
                                tracing::warn!("[Backend] {}", e);
                                BackendEvent::CheckFailed {
                                    message: e.to_string(),
                                    exit_code: Some(0),
                                    normal_exit: true,
                                }
                            }
                        }
                    }
                    Some(code) => {
                        tracing::info!("[Backend] maintenance tool exited with code {}, treating as no updates", code);
                        BackendEvent::CheckCompleted { updates: Vec::new() }
                    }
                    None => {
                        let stderr_text = String::from_utf8_lossy(&stderr_buf);
                        let mut message = "maintenance tool terminated abnormally".to_string();
                        if !stderr_text.trim().is_empty() {
                            message = format!("{}: {}", message, stderr_text.trim());
                        }
                        tracing::warn!("[Backend] {}", message);
                        BackendEvent::CheckFailed {
                            message,
                            exit_code: None,
                            normal_exit: false,
                        }
                    }
                },
                Err(e) => {
                    tracing::error!("[Backend] failed to wait for maintenance tool: {}", e);
                    BackendEvent::CheckFailed {
                        message: format!("failed to wait for maintenance tool: {}", e),
                        exit_code: None,
                        normal_exit: false,
                    }
                }
            };
            let _ = events.send(event);
        });

        Ok(())
    }

    async fn is_checking(&self) -> bool {
        self.inner.lock().await.check.is_some()
    }

    async fn abort(&self, force: bool) {
        let inner = self.inner.lock().await;
        if let Some(check) = inner.check {
            tracing::info!("[Backend] aborting update check (pid {}, force: {})", check.pid, force);
            if let Err(e) = terminate_pid(check.pid, force) {
                tracing::warn!("[Backend] failed to signal maintenance tool: {}", e);
            }
        }
    }

    async fn trigger_updates(&self, updates: &[UpdateInfo], elevated: bool) -> bool {
        let tool = self.inner.lock().await.tool.clone();
        let Some(tool) = tool else {
            tracing::warn!("[Backend] cannot trigger install, backend not initialized");
            return false;
        };
        tracing::debug!("[Backend] triggering installer for {} update(s)", updates.len());

        let args = self.config.run_args.clone().unwrap_or_else(|| {
            let arg = if self.config.silent { "--silentUpdate" } else { "--updater" };
            vec![arg.to_string()]
        });

        if elevated {
            match &self.authoriser {
                Some(authoriser) if !authoriser.has_admin_rights() => {
                    tracing::info!("[Backend] routing installer launch through elevation helper");
                    return authoriser.execute_as_admin(&tool.program, &args);
                }
                Some(_) => {} // already elevated, plain launch is fine
                None => {
                    tracing::warn!("[Backend] elevated launch requested but no elevation helper is configured");
                }
            }
        }

        let mut cmd = Command::new(&tool.program);
        cmd.args(&args)
            .current_dir(&tool.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        apply_creation_flags(&mut cmd);

        match cmd.spawn() {
            Ok(_child) => {
                // The handle is dropped on purpose: the installer outlives us.
                tracing::info!("[Backend] installer launched ({})", args.join(" "));
                true
            }
            Err(e) => {
                tracing::error!("[Backend] failed to launch installer: {}", e);
                false
            }
        }
    }

    async fn install_updates(&self, _updates: &[UpdateInfo]) -> Result<(), UpdaterError> {
        Err(UpdaterError::Unsupported { operation: "install_updates" })
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}

// ─── Tool Discovery ──────────────────────────────────────────

/// Apply the platform naming conventions to a configured tool path.
fn platform_tool_path(path: &str) -> String {
    #[cfg(target_os = "windows")]
    {
        let mut path = path.to_string();
        if !path.ends_with(".exe") {
            path.push_str(".exe");
        }
        path
    }
    #[cfg(target_os = "macos")]
    {
        // "dir/name[.app]" refers to the binary inside the bundle.
        let stripped = path.strip_suffix(".app").unwrap_or(path);
        let file_name = Path::new(stripped)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}.app/Contents/MacOS/{}", stripped, file_name)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        path.to_string()
    }
}

fn locate_tool(config: &UpdaterConfig) -> Option<ToolLocation> {
    let default = if cfg!(target_os = "macos") {
        "../../maintenancetool"
    } else {
        "./maintenancetool"
    };
    let configured = config.path.clone().unwrap_or_else(|| default.to_string());
    let candidate = PathBuf::from(platform_tool_path(&configured));

    // Relative paths resolve against the host executable's directory.
    let resolved = if candidate.is_absolute() {
        candidate
    } else {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))?;
        exe_dir.join(candidate)
    };

    if resolved.is_file() {
        let working_dir = resolved
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Some(ToolLocation { program: resolved, working_dir })
    } else {
        tracing::warn!("[Backend] no maintenance tool at {}", resolved.display());
        None
    }
}

/// Whether launching the tool needs elevation: on unix, true when the tool
/// binary is owned by root. Meant to be evaluated once at host startup and
/// fed into `UpdateController::set_run_as_admin`.
#[cfg(unix)]
pub fn tool_requires_admin(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).map(|m| m.uid() == 0).unwrap_or(false)
}

#[cfg(not(unix))]
pub fn tool_requires_admin(_path: &Path) -> bool {
    false
}

// ─── Process Control ─────────────────────────────────────────

/// Signal a check process by pid. `force` escalates from a termination
/// request (SIGTERM) to an immediate kill.
fn terminate_pid(pid: u32, force: bool) -> Result<()> {
    if pid == 0 {
        return Err(anyhow::anyhow!("refusing to signal pid 0"));
    }

    #[cfg(target_os = "windows")]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        let _ = force;
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(anyhow::anyhow!("failed to open process {}", pid));
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(anyhow::anyhow!("TerminateProcess failed for pid {}", pid));
            }
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        signal::kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| anyhow::anyhow!("failed to send {:?} to pid {}: {}", signal, pid, e))?;
    }

    Ok(())
}

/// Hide the console window of spawned children on Windows. No-op elsewhere.
#[cfg(target_os = "windows")]
fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

// ─── Output Parsing ──────────────────────────────────────────

/// Extract the update catalog from the tool's captured stdout.
///
/// The output is untrusted text that may contain one well-formed
/// `<updates>...</updates>` fragment embedded in unrelated noise. Missing
/// markers mean "no updates", never an error. A present fragment is
/// validated strictly: every record needs a non-empty name, a parseable
/// version and a base-10 size, and must be a leaf; one bad record
/// invalidates the whole catalog.
pub fn parse_update_output(output: &str) -> Result<Vec<UpdateInfo>, UpdaterError> {
    let Some(begin) = output.find(UPDATES_OPEN) else {
        return Ok(Vec::new());
    };
    let Some(end) = output[begin..].find(UPDATES_CLOSE) else {
        // Truncated output without a closing tag is treated as "no updates"
        // for compatibility with tools that die mid-write.
        return Ok(Vec::new());
    };
    let fragment = &output[begin..begin + end + UPDATES_CLOSE.len()];
    parse_update_fragment(fragment)
}

fn parse_update_fragment(fragment: &str) -> Result<Vec<UpdateInfo>, UpdaterError> {
    let mut reader = Reader::from_str(fragment);
    reader.trim_text(true);

    match reader.read_event() {
        Ok(Event::Start(e)) if e.name().as_ref() == b"updates" => {}
        Ok(_) => return Err(parse_failed("root element is not <updates>")),
        Err(e) => return Err(reader_failed(&reader, e)),
    }

    let mut updates = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) if e.name().as_ref() == b"update" => {
                updates.push(read_update_record(&e)?);
            }
            Ok(Event::Start(e)) if e.name().as_ref() == b"update" => {
                let info = read_update_record(&e)?;
                // A non-self-closing record must still be a leaf.
                loop {
                    match reader.read_event() {
                        Ok(Event::End(end)) if end.name().as_ref() == b"update" => break,
                        Ok(Event::Text(_)) | Ok(Event::CData(_)) | Ok(Event::Comment(_)) => {}
                        Ok(_) => {
                            return Err(parse_failed("<update> records must not have child elements"))
                        }
                        Err(e) => return Err(reader_failed(&reader, e)),
                    }
                }
                updates.push(info);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"updates" => break,
            Ok(Event::Text(_)) | Ok(Event::Comment(_)) => {}
            Ok(Event::Eof) => return Err(parse_failed("unexpected end of update list")),
            Ok(_) => return Err(parse_failed("unexpected element in update list")),
            Err(e) => return Err(reader_failed(&reader, e)),
        }
    }

    Ok(updates)
}

fn read_update_record(e: &BytesStart<'_>) -> Result<UpdateInfo, UpdaterError> {
    let name = required_attr(e, "name")?;
    if name.is_empty() {
        return Err(parse_failed("<update> has an empty name"));
    }
    let version_raw = required_attr(e, "version")?;
    let version = Version::parse(&version_raw)
        .ok_or_else(|| parse_failed(&format!("invalid version '{}'", version_raw)))?;
    let size_raw = required_attr(e, "size")?;
    let size: u64 = size_raw
        .parse()
        .map_err(|_| parse_failed(&format!("invalid size '{}'", size_raw)))?;

    Ok(UpdateInfo { name, version, size })
}

fn required_attr(e: &BytesStart<'_>, key: &str) -> Result<String, UpdaterError> {
    match e.try_get_attribute(key) {
        Ok(Some(attr)) => match attr.unescape_value() {
            Ok(value) => Ok(value.into_owned()),
            Err(err) => Err(parse_failed(&format!("bad '{}' attribute: {}", key, err))),
        },
        Ok(None) => Err(parse_failed(&format!("<update> is missing the '{}' attribute", key))),
        Err(err) => Err(parse_failed(&format!("bad '{}' attribute: {}", key, err))),
    }
}

fn parse_failed(message: &str) -> UpdaterError {
    UpdaterError::ParseFailed { message: message.to_string() }
}

fn reader_failed(reader: &Reader<&[u8]>, err: quick_xml::Error) -> UpdaterError {
    tracing::warn!("[Backend] XML reader error at byte {}: {}", reader.buffer_position(), err);
    UpdaterError::ParseFailed { message: format!("malformed update list: {}", err) }
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(output: &str) -> Result<Vec<UpdateInfo>, UpdaterError> {
        parse_update_output(output)
    }

    #[test]
    fn no_markers_means_no_updates() {
        assert_eq!(parse("Warning: no repository set\n").unwrap(), vec![]);
        assert_eq!(parse("").unwrap(), vec![]);
    }

    #[test]
    fn fragment_embedded_in_noise_is_found() {
        let output = "[0] loading components...\n\
                      <updates><update name=\"core\" version=\"1.2.0\" size=\"512\"/></updates>\n\
                      [1] done\n";
        let updates = parse(output).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name, "core");
        assert_eq!(updates[0].version, Version::parse("1.2.0").unwrap());
        assert_eq!(updates[0].size, 512);
    }

    #[test]
    fn two_records_preserved_in_order() {
        let output = "<updates>\
                      <update name=\"A\" version=\"2.3.1\" size=\"1024\"/>\
                      <update name=\"B\" version=\"0.9\" size=\"0\"/>\
                      </updates>";
        let updates = parse(output).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].name, "A");
        assert_eq!(updates[0].version.to_string(), "2.3.1");
        assert_eq!(updates[0].size, 1024);
        assert_eq!(updates[1].name, "B");
        assert_eq!(updates[1].version.to_string(), "0.9");
        assert_eq!(updates[1].size, 0);
    }

    #[test]
    fn expanded_leaf_record_is_accepted() {
        let output = "<updates><update name=\"A\" version=\"1.0\" size=\"10\"></update></updates>";
        assert_eq!(parse(output).unwrap().len(), 1);
    }

    // The missing-closing-tag policy is deliberate: truncated output from a
    // dying tool reads as "no updates", not as a parse error.
    #[test]
    fn truncated_fragment_is_treated_as_no_updates() {
        let output = "<updates><update name=\"A\" version=\"1.0\" size=\"10\"/>";
        assert_eq!(parse(output).unwrap(), vec![]);
    }

    #[test]
    fn empty_name_fails_the_whole_parse() {
        let output = "<updates><update name=\"\" version=\"1.0\" size=\"10\"/></updates>";
        assert!(matches!(parse(output), Err(UpdaterError::ParseFailed { .. })));
    }

    #[test]
    fn missing_attribute_fails_the_whole_parse() {
        let output = "<updates><update name=\"A\" version=\"1.0\"/></updates>";
        assert!(matches!(parse(output), Err(UpdaterError::ParseFailed { .. })));
    }

    #[test]
    fn bad_version_fails_the_whole_parse() {
        let output = "<updates><update name=\"A\" version=\"latest\" size=\"10\"/></updates>";
        assert!(matches!(parse(output), Err(UpdaterError::ParseFailed { .. })));
    }

    #[test]
    fn bad_size_fails_the_whole_parse() {
        for size in ["-1", "12MB", ""] {
            let output = format!(
                "<updates><update name=\"A\" version=\"1.0\" size=\"{}\"/></updates>",
                size
            );
            assert!(
                matches!(parse(&output), Err(UpdaterError::ParseFailed { .. })),
                "size '{}' should fail",
                size
            );
        }
    }

    #[test]
    fn one_bad_record_invalidates_the_batch() {
        let output = "<updates>\
                      <update name=\"A\" version=\"1.0\" size=\"10\"/>\
                      <update name=\"B\" version=\"1.0\"/>\
                      </updates>";
        assert!(matches!(parse(output), Err(UpdaterError::ParseFailed { .. })));
    }

    #[test]
    fn non_leaf_record_fails() {
        let output =
            "<updates><update name=\"A\" version=\"1.0\" size=\"10\"><x/></update></updates>";
        assert!(matches!(parse(output), Err(UpdaterError::ParseFailed { .. })));
    }

    #[test]
    fn unknown_element_fails() {
        let output = "<updates><upgrade name=\"A\" version=\"1.0\" size=\"10\"/></updates>";
        assert!(matches!(parse(output), Err(UpdaterError::ParseFailed { .. })));
    }

    #[test]
    fn malformed_xml_inside_fragment_fails() {
        let output = "<updates><update name=\"A\" version=\"1.0\" size=\"10\"</updates>";
        assert!(matches!(parse(output), Err(UpdaterError::ParseFailed { .. })));
    }

    #[test]
    fn empty_list_is_a_clean_result() {
        assert_eq!(parse("<updates></updates>").unwrap(), vec![]);
    }

    #[tokio::test]
    async fn locate_tool_finds_configured_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join(platform_tool_path("maintenancetool"));
        if let Some(parent) = tool.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&tool, b"").unwrap();

        let config = UpdaterConfig {
            path: Some(dir.path().join("maintenancetool").to_string_lossy().into_owned()),
            ..UpdaterConfig::default()
        };
        let location = locate_tool(&config).expect("tool should be found");
        assert_eq!(location.program, tool);
        assert_eq!(location.working_dir, tool.parent().unwrap());
    }

    #[tokio::test]
    async fn locate_tool_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpdaterConfig {
            path: Some(dir.path().join("nope").to_string_lossy().into_owned()),
            ..UpdaterConfig::default()
        };
        assert!(locate_tool(&config).is_none());
    }

    #[tokio::test]
    async fn uninitialized_backend_has_no_features_and_refuses_checks() {
        let backend = MaintenanceToolBackend::new(UpdaterConfig::default(), None);
        assert!(backend.features().is_empty());
        assert!(matches!(
            backend.check_for_updates().await,
            Err(UpdaterError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn disabled_config_fails_initialization() {
        let config = UpdaterConfig { enabled: false, ..UpdaterConfig::default() };
        let backend = MaintenanceToolBackend::new(config, None);
        assert!(!backend.initialize().await);
        assert!(backend.features().is_empty());
    }
}
