//! Scripted browser session: a long-lived `node` process running Playwright, driven with
//! one JSON command per line on stdin and one JSON reply per line on stdout.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::export::{ExportSelectors, ExportTrigger};
use crate::grid::{GridSelectors, GridSurface, PaneSnapshot};
use crate::AdapterError;

const DRIVER_SCRIPT: &str = r##"
const { chromium } = require('playwright');
const fs = require('fs');
const path = require('path');
const readline = require('readline');

(async () => {
  const opts = JSON.parse(process.env.JOBD_DRIVER_OPTS || '{}');
  const browser = await chromium.launch({ headless: opts.headless !== false });
  const context = await browser.newContext({ acceptDownloads: true, userAgent: opts.userAgent || undefined });
  const page = await context.newPage();
  page.setDefaultTimeout(opts.timeoutMs || 30000);

  if (opts.downloadDir) {
    page.on('download', async (download) => {
      const target = path.join(opts.downloadDir, Date.now() + '-' + download.suggestedFilename());
      const partial = target + '.part';
      try {
        await download.saveAs(partial);
        fs.renameSync(partial, target);
      } catch (e) {
        fs.rmSync(partial, { force: true });
        process.stderr.write('download failed: ' + e + '\n');
      }
    });
  }

  const scope = async (frameSelector) => {
    if (!frameSelector) return page;
    const handle = await page.waitForSelector(frameSelector);
    const frame = await handle.contentFrame();
    if (!frame) throw new Error('frame not found: ' + frameSelector);
    return frame;
  };

  const ops = {
    goto: async (c) => {
      await page.goto(c.url, { waitUntil: 'networkidle' });
      return null;
    },
    grid_rows: async (c) => {
      const f = await scope(c.frame);
      await f.waitForSelector(c.right_rows);
      return await f.evaluate((s) => {
        const text = (el) => (el ? el.innerText : '').trim();
        const headers = Array.from(document.querySelectorAll(s.headers)).map(text);
        const left = Array.from(document.querySelectorAll(s.left_rows)).map((row) => ({
          row_id: row.getAttribute(s.row_id_attr) || '',
          title: text(row.querySelector(s.left_title)),
        }));
        const right = Array.from(document.querySelectorAll(s.right_rows)).map((row) => ({
          row_id: row.getAttribute(s.row_id_attr) || '',
          cells: Array.from(row.querySelectorAll(s.cells)).map((cell) => {
            const a = cell.querySelector('a[href]');
            return { text: text(cell), href: a ? a.href : null };
          }),
        }));
        return { headers, left, right };
      }, c);
    },
    scroll: async (c) => {
      const f = await scope(c.frame);
      await f.evaluate((sel) => {
        const el = document.querySelector(sel);
        if (!el) throw new Error('scroller not found: ' + sel);
        el.scrollBy(0, Math.max(el.clientHeight * 0.8, 200));
      }, c.scroller);
      return null;
    },
    click: async (c) => {
      const f = await scope(c.frame);
      await f.click(c.selector);
      return null;
    },
  };

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    let reply;
    try {
      const cmd = JSON.parse(line);
      if (cmd.op === 'close') break;
      const handler = ops[cmd.op];
      if (!handler) throw new Error('unknown op: ' + cmd.op);
      reply = { ok: true, data: await handler(cmd) };
    } catch (e) {
      reply = { ok: false, error: String((e && e.message) || e) };
    }
    process.stdout.write(JSON.stringify(reply) + '\n');
  }
  await browser.close();
})().catch((e) => {
  process.stderr.write(String(e) + '\n');
  process.exit(1);
});
"##;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaywrightConfig {
    pub node_bin: String,
    pub headless: bool,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub download_dir: Option<PathBuf>,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            node_bin: "node".to_string(),
            headless: true,
            user_agent: None,
            timeout: Duration::from_secs(30),
            download_dir: None,
        }
    }
}

impl PlaywrightConfig {
    fn driver_opts(&self) -> JsonValue {
        json!({
            "headless": self.headless,
            "userAgent": self.user_agent,
            "timeoutMs": self.timeout.as_millis() as u64,
            "downloadDir": self.download_dir,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DriverReply {
    ok: bool,
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    error: Option<String>,
}

pub struct PlaywrightSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    reply_timeout: Duration,
}

impl PlaywrightSession {
    pub async fn launch(config: &PlaywrightConfig) -> Result<Self, AdapterError> {
        let mut child = Command::new(&config.node_bin)
            .arg("-e")
            .arg(DRIVER_SCRIPT)
            .env("JOBD_DRIVER_OPTS", config.driver_opts().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AdapterError::Browser(format!("failed to spawn `{}`: {e}", config.node_bin)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Browser("driver stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Browser("driver stdout unavailable".into()))?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            // browser startup and navigation both count against the first reply
            reply_timeout: config.timeout * 2,
        })
    }

    async fn call(&mut self, command: JsonValue) -> Result<JsonValue, AdapterError> {
        let op = command["op"].as_str().unwrap_or("?").to_string();
        debug!(op = %op, "driver command");

        let mut line = command.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let reply = tokio::time::timeout(self.reply_timeout, self.stdout.next_line())
            .await
            .map_err(|_| AdapterError::Browser(format!("driver did not answer `{op}`")))??
            .ok_or_else(|| AdapterError::Browser(format!("driver exited during `{op}`")))?;
        let reply: DriverReply = serde_json::from_str(&reply)
            .map_err(|e| AdapterError::Browser(format!("malformed driver reply to `{op}`: {e}")))?;

        if reply.ok {
            Ok(reply.data.unwrap_or(JsonValue::Null))
        } else {
            Err(AdapterError::Browser(format!(
                "{op}: {}",
                reply.error.unwrap_or_else(|| "unknown error".to_string())
            )))
        }
    }

    pub async fn goto(&mut self, url: &str) -> Result<(), AdapterError> {
        self.call(json!({ "op": "goto", "url": url })).await?;
        Ok(())
    }

    pub async fn click(&mut self, frame: Option<&str>, selector: &str) -> Result<(), AdapterError> {
        self.call(json!({ "op": "click", "frame": frame, "selector": selector }))
            .await?;
        Ok(())
    }

    pub fn grid<'a>(&'a mut self, selectors: &'a GridSelectors) -> GridPane<'a> {
        GridPane {
            session: self,
            selectors,
        }
    }

    pub fn export_menu<'a>(&'a mut self, selectors: &'a ExportSelectors) -> ExportMenu<'a> {
        ExportMenu {
            session: self,
            selectors,
        }
    }

    /// Ends the session. The browser is always torn down, even if the driver is wedged.
    pub async fn close(mut self) {
        let _ = self.stdin.write_all(b"{\"op\":\"close\"}\n").await;
        let _ = self.stdin.flush().await;
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => warn!(%status, "browser driver exited uncleanly"),
            Ok(Err(err)) => warn!(error = %err, "waiting on browser driver failed"),
            Err(_) => {
                warn!("browser driver did not exit; killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

pub struct GridPane<'a> {
    session: &'a mut PlaywrightSession,
    selectors: &'a GridSelectors,
}

#[async_trait]
impl<'a> GridSurface for GridPane<'a> {
    async fn visible_rows(&mut self) -> Result<PaneSnapshot, AdapterError> {
        let mut command = serde_json::to_value(self.selectors)
            .map_err(|e| AdapterError::Browser(format!("encoding grid selectors: {e}")))?;
        command["op"] = JsonValue::from("grid_rows");
        let data = self.session.call(command).await?;
        serde_json::from_value(data)
            .map_err(|e| AdapterError::Browser(format!("malformed grid snapshot: {e}")))
    }

    async fn scroll_forward(&mut self) -> Result<(), AdapterError> {
        self.session
            .call(json!({
                "op": "scroll",
                "frame": self.selectors.frame,
                "scroller": self.selectors.scroller,
            }))
            .await?;
        Ok(())
    }
}

pub struct ExportMenu<'a> {
    session: &'a mut PlaywrightSession,
    selectors: &'a ExportSelectors,
}

#[async_trait]
impl<'a> ExportTrigger for ExportMenu<'a> {
    async fn trigger_export(&mut self) -> Result<(), AdapterError> {
        for selector in &self.selectors.clicks {
            self.session
                .click(self.selectors.frame.as_deref(), selector)
                .await?;
        }
        Ok(())
    }
}
