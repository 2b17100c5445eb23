//! Compile subprocess wrapper for source-mode plugins

use std::path::Path;
use std::process::Command;

use crate::config::CompilerConfig;
use crate::error::HostError;

/// Invokes the configured compiler as an opaque subprocess.
pub struct Compiler {
    argv: Vec<String>,
}

impl Compiler {
    pub fn new(config: &CompilerConfig) -> Self {
        Self {
            argv: config.command.clone(),
        }
    }

    /// Compile `source` into `output`.
    ///
    /// On failure the returned error carries the compiler's combined
    /// stdout/stderr diagnostic, ready to be forwarded as a notify
    /// message.
    pub fn compile(&self, source: &Path, output: &Path) -> Result<(), HostError> {
        let argv = render_argv(&self.argv, source, output);
        let Some((program, args)) = argv.split_first() else {
            return Err(HostError::Compile("empty compiler command".into()));
        };

        tracing::info!(source = %source.display(), output = %output.display(), "compiling plugin");

        let result = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| HostError::Compile(format!("failed to run {program}: {e}")))?;

        if result.status.success() {
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&result.stdout);
        let stderr = String::from_utf8_lossy(&result.stderr);
        let mut diagnostic = format!("compile failed for {}", source.display());
        for stream in [stdout.trim(), stderr.trim()] {
            if !stream.is_empty() {
                diagnostic.push('\n');
                diagnostic.push_str(stream);
            }
        }
        Err(HostError::Compile(diagnostic))
    }
}

/// Substitute `{src}` and `{out}` placeholders in the command template
fn render_argv(template: &[String], source: &Path, output: &Path) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{src}", &source.display().to_string())
                .replace("{out}", &output.display().to_string())
        })
        .collect()
}
