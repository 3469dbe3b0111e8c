//! Browser catalog: per-driver-type images and capability payloads.

use std::time::Duration;

use {
    corral_factory::{ContainerRole, ContainerSpec},
    serde_json::{Value, json},
};

/// Container-side WebDriver port for the standalone browser images.
pub const SELENIUM_PORT: &str = "4444/tcp";

/// Default memory limit for a browser container.
const BROWSER_MEM_LIMIT: i64 = 480 * 1024 * 1024;

/// Recording images run ffmpeg next to the browser and need headroom.
const VIDEO_MEM_LIMIT: i64 = 700 * 1024 * 1024;

/// Browsers need a generous `/dev/shm` or they crash on heavy pages.
const BROWSER_SHM_SIZE: i64 = 2 * 1024 * 1024 * 1024;

/// Which browser a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Browser {
    Chrome,
    Firefox,
}

impl Browser {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Firefox => "firefox",
        }
    }

    /// Image reference for the plain standalone browser.
    pub fn image(&self) -> &'static str {
        match self {
            Self::Chrome => "selenium/standalone-chrome",
            Self::Firefox => "selenium/standalone-firefox",
        }
    }

    /// Image reference for the browser bundled with ffmpeg, used by
    /// recording sessions.
    pub fn video_image(&self) -> &'static str {
        match self {
            Self::Chrome => "selenium/standalone-chrome-ffmpeg",
            Self::Firefox => "selenium/standalone-firefox-ffmpeg",
        }
    }
}

/// Arguments Chrome gets in every session.
const CHROME_DEFAULT_ARGUMENTS: &[&str] = &[
    "--data-reduction-proxy-lo-fi",
    "--disable-win32k-renderer-lockdown",
    "--start-maximized",
];

/// Preferences Firefox gets in every session.
const FIREFOX_DEFAULT_PREFS: &[(&str, &str)] = &[("browser.startup.homepage", "about:blank")];

/// Configuration for one browser session's container and capabilities.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub browser: Browser,
    /// Image override. Defaults to the browser's standalone image (or its
    /// ffmpeg variant when recording).
    pub image: Option<String>,
    /// Overwrite the browser's default user agent.
    pub user_agent: Option<String>,
    /// Extra browser arguments (Chrome) or `key=value` preferences (Firefox).
    pub args: Vec<String>,
    /// Extra container environment variables in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// How long to wait for the WebDriver endpoint inside the container.
    pub ready_timeout: Duration,
    /// Container memory limit in bytes.
    pub mem_limit: i64,
}

impl DriverConfig {
    pub fn new(browser: Browser) -> Self {
        Self {
            browser,
            image: None,
            user_agent: None,
            args: Vec::new(),
            env: Vec::new(),
            ready_timeout: Duration::from_secs(60),
            mem_limit: BROWSER_MEM_LIMIT,
        }
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// The effective image reference.
    pub fn image_ref(&self, recording: bool) -> String {
        match (&self.image, recording) {
            (Some(image), _) => image.clone(),
            (None, false) => self.browser.image().to_string(),
            (None, true) => self.browser.video_image().to_string(),
        }
    }

    /// Container specification for this session.
    pub fn container_spec(&self, recording: bool) -> ContainerSpec {
        let mem_limit = if recording { VIDEO_MEM_LIMIT } else { self.mem_limit };
        ContainerSpec::new(self.image_ref(recording), SELENIUM_PORT, ContainerRole::Browser)
            .env(self.env.clone())
            .label("browser", self.browser.name())
            .mem_limit(mem_limit)
            .shm_size(BROWSER_SHM_SIZE)
    }

    /// W3C `alwaysMatch` capabilities, with an optional proxy attachment.
    pub fn capabilities(&self, proxy: Option<Value>) -> Value {
        let mut caps = match self.browser {
            Browser::Chrome => {
                let mut args: Vec<String> =
                    CHROME_DEFAULT_ARGUMENTS.iter().map(|s| s.to_string()).collect();
                args.extend(self.args.iter().cloned());
                if let Some(ua) = &self.user_agent {
                    args.push(format!("--user-agent={ua}"));
                }
                json!({
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args },
                })
            },
            Browser::Firefox => {
                let mut prefs = serde_json::Map::new();
                for (key, value) in FIREFOX_DEFAULT_PREFS {
                    prefs.insert((*key).to_string(), Value::String((*value).to_string()));
                }
                for arg in &self.args {
                    if let Some((key, value)) = arg.split_once('=') {
                        prefs.insert(key.to_string(), Value::String(value.to_string()));
                    }
                }
                if let Some(ua) = &self.user_agent {
                    prefs.insert(
                        "general.useragent.override".to_string(),
                        Value::String(ua.clone()),
                    );
                }
                json!({
                    "browserName": "firefox",
                    "moz:firefoxOptions": { "prefs": prefs },
                })
            },
        };
        if let Some(proxy) = proxy {
            if let Some(map) = caps.as_object_mut() {
                map.insert("proxy".to_string(), proxy);
            }
        }
        caps
    }
}
