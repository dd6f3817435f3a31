// src/handlers/util.rs
//! Shared plumbing for phase handlers: process execution with a timeout,
//! HTTP downloads, shallow git clones, and archive extraction.
//!
//! Grounded on `src/recipe/kitchen.rs`'s command-execution and
//! tempdir-staging helpers, using `reqwest::blocking` for downloads,
//! `wait-timeout` to bound subprocess calls, and the `tar`/`flate2`/`xz2`/
//! `zstd`/`zip`/`bzip2` stack for archives — the teacher's own extraction
//! fan-out, generalized to every format spec.md's declarative `STAGE`
//! accepts rather than the teacher's narrower set.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use sha2::{Digest, Sha256};
use wait_timeout::ChildExt;

use crate::error::{Error, Result};

/// Bound on how long a single build/install/fetch subprocess may run before
/// it's killed and treated as a failure. Not currently surfaced as a
/// per-recipe override; see DESIGN.md.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 30);

/// Run `command` (a shell line, interpreted the same way a recipe's
/// declarative command-string verb is) with `cwd`, streaming its output
/// through tracing rather than capturing it, except on failure where the
/// last chunk of output is folded into the error message (§4.7's
/// "verbose-on-failure").
pub fn run_command(command: &str, cwd: &Path, extra_env: &[(&str, &str)]) -> Result<()> {
    let shell = if cfg!(target_os = "windows") { "cmd" } else { "sh" };
    let flag = if cfg!(target_os = "windows") { "/C" } else { "-c" };

    let mut cmd = Command::new(shell);
    cmd.arg(flag)
        .arg(command)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in extra_env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(Error::Io)?;
    let status = match child.wait_timeout(COMMAND_TIMEOUT).map_err(Error::Io)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Io(std::io::Error::other(format!(
                "command '{command}' timed out after {COMMAND_TIMEOUT:?}"
            ))));
        }
    };

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut handle) = child.stderr.take() {
            let _ = handle.read_to_string(&mut stderr);
        }
        return Err(Error::Io(std::io::Error::other(format!(
            "command '{command}' exited with {status}: {stderr}"
        ))));
    }
    Ok(())
}

/// Run each command in `commands` in order, stopping at the first failure.
pub fn run_command_list(commands: &[String], cwd: &Path) -> Result<()> {
    for command in commands {
        run_command(command, cwd, &[])?;
    }
    Ok(())
}

/// Download `url` to `dest`, verifying `expected_sha256` when given
/// (mismatch is fatal, §4.7).
pub fn download_and_verify(url: &str, expected_sha256: Option<&str>, dest: &Path) -> Result<()> {
    let response = reqwest::blocking::get(url).map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    let bytes = response
        .error_for_status()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?
        .bytes()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

    if let Some(expected) = expected_sha256 {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::HashMismatch {
                url: url.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dest, &bytes)?;
    Ok(())
}

/// Shallow-clone `url` at `git_ref` into `dest_dir` (§4.7: "if only a git
/// source is given, shallow-clone at the declared ref").
pub fn shallow_clone(url: &str, git_ref: &str, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    run_command(&format!("git clone --depth 1 --branch '{git_ref}' '{url}' ."), dest_dir, &[])
}

/// Extract every recognized archive directly under `fetch_dir` into
/// `stage_dir`, stripping `strip` leading path components from each entry
/// (§4.7's declarative `{strip=N}` STAGE).
pub fn extract_archives(fetch_dir: &Path, stage_dir: &Path, strip: u32) -> Result<()> {
    std::fs::create_dir_all(stage_dir)?;
    for entry in std::fs::read_dir(fetch_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            extract_one(&path, stage_dir, strip)?;
        }
    }
    Ok(())
}

fn extract_one(archive: &Path, dest: &Path, strip: u32) -> Result<()> {
    let name = archive.to_string_lossy().to_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = std::fs::File::open(archive)?;
        extract_tar(flate2::read::GzDecoder::new(file), dest, strip)
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        let file = std::fs::File::open(archive)?;
        extract_tar(xz2::read::XzDecoder::new(file), dest, strip)
    } else if name.ends_with(".tar.zst") {
        let file = std::fs::File::open(archive)?;
        let decoder = zstd::stream::Decoder::new(file).map_err(Error::Io)?;
        extract_tar(decoder, dest, strip)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
        let file = std::fs::File::open(archive)?;
        extract_tar(bzip2::read::BzDecoder::new(file), dest, strip)
    } else if name.ends_with(".tar") {
        let file = std::fs::File::open(archive)?;
        extract_tar(file, dest, strip)
    } else if name.ends_with(".zip") {
        extract_zip(archive, dest, strip)
    } else {
        // Not a recognized archive: copy verbatim (e.g. a single prebuilt
        // binary fetched directly, no extraction needed).
        let file_name = archive.file_name().expect("path from read_dir has a file name");
        std::fs::copy(archive, dest.join(file_name))?;
        Ok(())
    }
}

fn extract_tar<R: std::io::Read>(reader: R, dest: &Path, strip: u32) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(stripped) = strip_components(&path, strip) else {
            continue;
        };
        let target = dest.join(stripped);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

fn extract_zip(archive: &Path, dest: &Path, strip: u32) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        let Some(name) = entry.enclosed_name() else { continue };
        let Some(stripped) = strip_components(&name, strip) else {
            continue;
        };
        let target = dest.join(stripped);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn strip_components(path: &Path, strip: u32) -> Option<PathBuf> {
    let mut components = path.components();
    for _ in 0..strip {
        components.next()?;
    }
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        None
    } else {
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_components_drops_leading_segments() {
        let path = Path::new("pkg-1.0/src/main.c");
        assert_eq!(strip_components(path, 1), Some(PathBuf::from("src/main.c")));
        assert_eq!(strip_components(path, 0), Some(PathBuf::from("pkg-1.0/src/main.c")));
    }

    #[test]
    fn stripping_the_whole_path_yields_nothing() {
        let path = Path::new("pkg-1.0");
        assert_eq!(strip_components(path, 1), None);
    }
}
