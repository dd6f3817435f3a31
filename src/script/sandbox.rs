// src/script/sandbox.rs
//! Sandbox globals exposed to every recipe script: platform constants and a
//! small namespace of host utility functions (§4.3, §6). Everything here is
//! deliberately narrow — scripts never get raw filesystem access beyond
//! what these functions grant, and never see cache internals.

use rhai::{Engine, Scope};
use sha2::{Digest, Sha256};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct SandboxContext {
    pub platform: String,
    pub arch: String,
}

impl SandboxContext {
    pub fn new(platform: impl Into<String>, arch: impl Into<String>) -> Self {
        SandboxContext {
            platform: platform.into(),
            arch: arch.into(),
        }
    }

    pub fn exe_ext(&self) -> &'static str {
        if self.platform == "windows" {
            ".exe"
        } else {
            ""
        }
    }

    pub fn shell(&self) -> &'static str {
        if self.platform == "windows" {
            "cmd"
        } else {
            "sh"
        }
    }

    pub fn platform_arch(&self) -> String {
        format!("{}-{}", self.platform, self.arch)
    }
}

/// Install platform constants and the utility function namespace into a
/// fresh engine/scope pair. Called once per node at `load` time — the
/// engine is owned exclusively by that node's executor thread afterward, so
/// no registration here needs to be thread-safe against concurrent callers.
pub fn install(engine: &mut Engine, scope: &mut Scope<'static>, ctx: &SandboxContext) {
    scope.push_constant("PLATFORM", ctx.platform.clone());
    scope.push_constant("ARCH", ctx.arch.clone());
    scope.push_constant("PLATFORM_ARCH", ctx.platform_arch());
    scope.push_constant("EXE_EXT", ctx.exe_ext().to_string());
    scope.push_constant("SHELL", ctx.shell().to_string());

    engine.register_fn("path_join", |a: &str, b: &str| -> String {
        Path::new(a).join(b).to_string_lossy().into_owned()
    });

    engine.register_fn("sha256_file", |path: &str| -> String {
        match std::fs::read(path) {
            Ok(bytes) => {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                hex::encode(hasher.finalize())
            }
            Err(_) => String::new(),
        }
    });

    engine.register_fn("log_info", |msg: &str| tracing::info!(target: "recipe", "{msg}"));
    engine.register_fn("log_warn", |msg: &str| tracing::warn!(target: "recipe", "{msg}"));
    engine.register_fn("log_error", |msg: &str| tracing::error!(target: "recipe", "{msg}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exe_ext_and_shell_follow_platform() {
        let linux = SandboxContext::new("linux", "x86_64");
        assert_eq!(linux.exe_ext(), "");
        assert_eq!(linux.shell(), "sh");

        let windows = SandboxContext::new("windows", "x86_64");
        assert_eq!(windows.exe_ext(), ".exe");
        assert_eq!(windows.shell(), "cmd");
    }

    #[test]
    fn platform_arch_is_joined() {
        let ctx = SandboxContext::new("linux", "aarch64");
        assert_eq!(ctx.platform_arch(), "linux-aarch64");
    }
}
