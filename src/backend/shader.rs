// Shader compilation and SPIR-V loading
//
// Vulkan consumes SPIR-V bytecode. GLSL sources go through a `ShaderCompiler`
// passed in by the caller; the provided one shells out to `glslc` from the
// Vulkan SDK. Precompiled `.spv` files go through `load_spirv`.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Write;
use std::process::{Command, Stdio};

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Geometry,
    TessControl,
    TessEvaluation,
    Compute,
}

impl ShaderStage {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    /// Stage name understood by `glslc -fshader-stage=`
    pub fn glslc_name(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
            Self::Geometry => "geom",
            Self::TessControl => "tesc",
            Self::TessEvaluation => "tese",
            Self::Compute => "comp",
        }
    }
}

/// GLSL source in, SPIR-V words out
pub trait ShaderCompiler {
    fn compile(&self, stage: ShaderStage, source: &str, preamble: &str) -> Result<Vec<u32>>;
}

/// Compiles through the `glslc` executable (stdin -> stdout)
#[derive(Debug, Clone)]
pub struct GlslcCompiler {
    executable: String,
}

impl Default for GlslcCompiler {
    fn default() -> Self {
        Self {
            executable: "glslc".to_string(),
        }
    }
}

impl GlslcCompiler {
    pub fn with_executable(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl ShaderCompiler for GlslcCompiler {
    fn compile(&self, stage: ShaderStage, source: &str, preamble: &str) -> Result<Vec<u32>> {
        let full_source = inject_preamble(source, preamble);

        let mut child = Command::new(&self.executable)
            .arg(format!("-fshader-stage={}", stage.glslc_name()))
            .arg("--target-env=vulkan1.3")
            .args(["-o", "-", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to run {}. Install the Vulkan SDK or put glslc on PATH",
                    self.executable
                )
            })?;

        child
            .stdin
            .take()
            .context("glslc stdin unavailable")?
            .write_all(full_source.as_bytes())
            .context("Failed to send shader source to glslc")?;

        let output = child
            .wait_with_output()
            .context("Failed to wait for glslc")?;

        if !output.status.success() {
            anyhow::bail!(
                "Failed to compile {:?} shader:\n{}",
                stage,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        log::debug!("Compiled {:?} shader ({} bytes)", stage, output.stdout.len());
        load_spirv(&output.stdout)
    }
}

/// Insert `preamble` right after the `#version` line, or at the top when the
/// source has none
pub fn inject_preamble(source: &str, preamble: &str) -> String {
    if preamble.is_empty() {
        return source.to_string();
    }

    let mut out = String::with_capacity(source.len() + preamble.len() + 2);
    let mut injected = false;
    for line in source.lines() {
        out.push_str(line);
        out.push('\n');
        if !injected && line.trim_start().starts_with("#version") {
            out.push_str(preamble);
            out.push('\n');
            injected = true;
        }
    }

    if injected {
        out
    } else {
        format!("{}\n{}", preamble, source)
    }
}

/// Convert SPIR-V bytes into words
pub fn load_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 || bytes.is_empty() {
        anyhow::bail!("SPIR-V length {} is not a multiple of 4", bytes.len());
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        anyhow::bail!("Missing SPIR-V magic number (found {:#010x})", words[0]);
    }
    Ok(words)
}
