//! One-shot external command plugins.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{PluginConfig, Transform};
use crate::file::File;

/// Runs an external command once per input file.
///
/// The command's stdout followed by its stderr becomes the new content.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    config: PluginConfig,
    program: String,
    leading_args: Vec<String>,
}

impl CommandTransform {
    pub fn new(config: PluginConfig) -> Self {
        let (program, leading_args) = config.program();
        Self {
            config,
            program,
            leading_args,
        }
    }
}

#[async_trait]
impl Transform for CommandTransform {
    async fn transform(&self, file: File) -> File {
        // Nothing to transform
        if file.is_deleted() {
            return File::new(file.name, "", file.op);
        }

        let args = self.config.injected_args(&file);
        crate::debug_event!(
            &self.config.name,
            "run",
            "{} {} ({})",
            self.program,
            self.leading_args.join(" "),
            file.name
        );

        let result = Command::new(&self.program)
            .args(&self.leading_args)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await;

        match result {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                let failure = (!output.status.success()).then(|| output.status.to_string());
                File::from_command(&file, &text, failure)
            }
            Err(e) => File::from_command(
                &file,
                "",
                Some(format!("failed to run '{}': {e}", self.program)),
            ),
        }
    }
}
