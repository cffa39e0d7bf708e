//! Renderer backed by an external office suite.
//!
//! Each render gets its own temp directory: the filled template is written
//! there, the converter (and optional rasterizer) run against it, and the
//! resulting PNG is read back and normalised. The directory is removed when the
//! render ends, whatever the outcome. Child processes are spawned with
//! `kill_on_drop`, so a render that times out or is cancelled takes its
//! converter down with it.

use crate::config::RenderConfig;
use crate::render::image::normalize_png;
use crate::render::{RenderError, SlipData, SlipRenderer, SlipTemplate};
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const INPUT_STEM: &str = "slip";

#[derive(Debug, Clone)]
pub struct OfficeRenderer {
    converter_program: String,
    converter_args: Vec<String>,
    rasterizer_program: Option<String>,
    rasterizer_args: Vec<String>,
    timeout: Duration,
}

/// Paths of one render, substituted into command arguments.
struct Workspace {
    input: PathBuf,
    outdir: PathBuf,
}

impl Workspace {
    fn intermediate(&self) -> PathBuf {
        self.outdir.join(format!("{}.pdf", INPUT_STEM))
    }

    fn output(&self) -> PathBuf {
        self.outdir.join(format!("{}.png", INPUT_STEM))
    }
}

impl OfficeRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            converter_program: config.converter_program.clone(),
            converter_args: config.converter_args.clone(),
            rasterizer_program: config.rasterizer_program.clone(),
            rasterizer_args: config.rasterizer_args.clone(),
            timeout: config.timeout(),
        }
    }

    async fn convert(&self, ws: &Workspace) -> Result<Vec<u8>, RenderError> {
        let output = ws.output();
        match &self.rasterizer_program {
            Some(rasterizer) => {
                let pdf = ws.intermediate();
                run(&self.converter_program, &self.converter_args, &ws.input, &ws.outdir, &pdf)
                    .await?;
                expect_file(&pdf, &self.converter_program)?;
                run(rasterizer, &self.rasterizer_args, &pdf, &ws.outdir, &output).await?;
                expect_file(&output, rasterizer)?;
            }
            None => {
                run(&self.converter_program, &self.converter_args, &ws.input, &ws.outdir, &output)
                    .await?;
                expect_file(&output, &self.converter_program)?;
            }
        }
        tokio::fs::read(&output)
            .await
            .map_err(|e| RenderError::ConversionCrash(format!("cannot read output: {}", e)))
    }
}

#[async_trait]
impl SlipRenderer for OfficeRenderer {
    async fn render(&self, template: &SlipTemplate, data: &SlipData) -> Result<Vec<u8>, RenderError> {
        let filled = template.fill(data)?;

        let dir = tempfile::tempdir()
            .map_err(|e| RenderError::ConversionCrash(format!("cannot create temp dir: {}", e)))?;
        let ws = Workspace {
            input: dir.path().join(format!("{}.{}", INPUT_STEM, template.extension())),
            outdir: dir.path().to_path_buf(),
        };
        tokio::fs::write(&ws.input, filled.as_bytes())
            .await
            .map_err(|e| RenderError::ConversionCrash(format!("cannot write input: {}", e)))?;

        let raw = tokio::time::timeout(self.timeout, self.convert(&ws))
            .await
            .map_err(|_| RenderError::ConversionTimeout(self.timeout))??;
        normalize_png(&raw)
    }
}

fn substitute(arg: &str, input: &Path, outdir: &Path, output: &Path) -> String {
    let stem = output.with_extension("");
    arg.replace("{input}", &input.to_string_lossy())
        .replace("{outdir}", &outdir.to_string_lossy())
        .replace("{output}", &output.to_string_lossy())
        .replace("{stem}", &stem.to_string_lossy())
}

async fn run(
    program: &str,
    args: &[String],
    input: &Path,
    outdir: &Path,
    output: &Path,
) -> Result<(), RenderError> {
    let args: Vec<String> = args
        .iter()
        .map(|a| substitute(a, input, outdir, output))
        .collect();
    debug!("Running {} {:?}", program, args);

    let result = Command::new(program)
        .args(&args)
        .current_dir(outdir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RenderError::ConversionCrash(format!("cannot start {}: {}", program, e)))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        let detail = stderr.lines().last().unwrap_or("").trim();
        return Err(RenderError::ConversionCrash(format!(
            "{} exited with {}{}{}",
            program,
            result.status,
            if detail.is_empty() { "" } else { ": " },
            detail
        )));
    }
    Ok(())
}

fn expect_file(path: &Path, program: &str) -> Result<(), RenderError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(RenderError::ConversionCrash(format!(
            "{} produced no {}",
            program,
            path.file_name().and_then(|n| n.to_str()).unwrap_or("output")
        )))
    }
}
