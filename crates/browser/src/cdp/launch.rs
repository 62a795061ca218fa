//! Chromium process launch and DevTools endpoint discovery.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use bd_domain::error::{Error, Result};

use crate::driver::LaunchOptions;

/// Well-known install locations probed when no executable is configured.
const CANDIDATES: &[&str] = &[
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
];

pub fn find_browser_executable(configured: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        return Err(Error::Driver(format!(
            "configured browser executable not found: {}",
            path.display()
        )));
    }
    CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| Error::Driver("no Chromium/Chrome executable found".into()))
}

pub struct LaunchedBrowser {
    pub child: Child,
    pub ws_url: String,
    pub user_data_dir: PathBuf,
}

/// Spawn the browser with an ephemeral DevTools port and scrape the
/// websocket URL from stderr.
pub async fn spawn_browser(opts: &LaunchOptions) -> Result<LaunchedBrowser> {
    let executable = find_browser_executable(opts.executable.as_deref())?;
    let user_data_dir =
        std::env::temp_dir().join(format!("browserd-profile-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&user_data_dir)?;

    let mut cmd = Command::new(&executable);
    cmd.arg("--remote-debugging-port=0")
        .arg(format!("--user-data-dir={}", user_data_dir.display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-background-networking")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if opts.headless {
        cmd.arg("--headless=new");
    }
    for arg in &opts.extra_args {
        cmd.arg(arg);
    }

    let mut child = cmd.spawn()?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Driver("failed to capture browser stderr".into()))?;

    // Chromium prints "DevTools listening on ws://..." shortly after
    // start; everything else on stderr is noise we skip.
    let ws_url = tokio::time::timeout(Duration::from_secs(30), async {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(idx) = line.find("ws://") {
                return Ok::<_, Error>(line[idx..].trim().to_string());
            }
            tracing::trace!(line = %line, "browser stderr");
        }
        Err(Error::Driver("browser exited before announcing DevTools endpoint".into()))
    })
    .await
    .map_err(|_| Error::Driver("timed out waiting for DevTools endpoint".into()))??;

    tracing::debug!(ws_url = %ws_url, pid = ?child.id(), "browser launched");

    Ok(LaunchedBrowser {
        child,
        ws_url,
        user_data_dir,
    })
}
