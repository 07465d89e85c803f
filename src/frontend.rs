//! Source translation: turning input files into IR modules.
//!
//! A [`Frontend`] is the pluggable `translate(source) -> Module` step. The
//! pipeline never parses source text itself; it only admits the modules
//! front-ends produce.

use crate::core::error::{JitError, JitResult};
use crate::ir::Module;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Extension of textual IR files.
pub const IR_EXTENSION: &str = "jir";

pub trait Frontend: Send + Sync {
    /// Whether this front-end handles `path`.
    fn accepts(&self, path: &Path) -> bool;

    fn translate(&self, path: &Path) -> JitResult<Module>;
}

fn io_error(path: &Path, err: impl std::fmt::Display) -> JitError {
    JitError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string())
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().is_some_and(|ext| ext == extension)
}

/// Parses `.jir` files directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrTextFrontend;

impl Frontend for IrTextFrontend {
    fn accepts(&self, path: &Path) -> bool {
        has_extension(path, IR_EXTENSION)
    }

    fn translate(&self, path: &Path) -> JitResult<Module> {
        let text = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
        Module::parse(&module_name(path), &text)
    }
}

/// Runs an external translator and parses the IR it prints.
///
/// The translator is invoked as `program [args...] <source>` and must write
/// a module in the IR text format to standard output.
#[derive(Debug, Clone)]
pub struct CommandFrontend {
    program: String,
    args: Vec<String>,
    extension: String,
}

impl CommandFrontend {
    pub fn new(program: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            extension: extension.into().trim_start_matches('.').to_string(),
        }
    }

    /// Build from a command line such as `"mycc --emit-jir"`.
    pub fn from_command_line(command: &str, extension: impl Into<String>) -> Option<Self> {
        let mut words = command.split_whitespace();
        let program = words.next()?;
        let mut frontend = Self::new(program, extension);
        frontend.args = words.map(str::to_string).collect();
        Some(frontend)
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }
}

impl Frontend for CommandFrontend {
    fn accepts(&self, path: &Path) -> bool {
        has_extension(path, &self.extension)
    }

    fn translate(&self, path: &Path) -> JitResult<Module> {
        log::debug!("translating {} with `{}`", path.display(), self.program);
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .output()
            .map_err(|e| io_error(path, format!("cannot run `{}`: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(JitError::Parse {
                line: 0,
                message: format!(
                    "`{}` failed on {} ({}): {}",
                    self.program,
                    path.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let text = String::from_utf8(output.stdout).map_err(|e| io_error(path, e))?;
        Module::parse(&module_name(path), &text)
    }
}

/// Expand files and directories into the list of sources to load.
///
/// Files are taken as given. Directories contribute the files whose
/// extension is one of `extensions`, sorted by path, without recursing.
pub fn collect_sources(inputs: &[PathBuf], extensions: &[&str]) -> JitResult<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in fs::read_dir(input).map_err(|e| io_error(input, e))? {
                let path = entry.map_err(|e| io_error(input, e))?.path();
                if path.is_file() && extensions.iter().any(|ext| has_extension(&path, ext)) {
                    found.push(path);
                }
            }
            found.sort();
            log::debug!("{}: {} source(s)", input.display(), found.len());
            sources.extend(found);
        } else if input.is_file() {
            sources.push(input.clone());
        } else {
            return Err(io_error(input, "no such file or directory"));
        }
    }
    Ok(sources)
}

/// Translate `path` with the first front-end that accepts it.
pub fn translate(frontends: &[Box<dyn Frontend>], path: &Path) -> JitResult<Module> {
    frontends
        .iter()
        .find(|frontend| frontend.accepts(path))
        .ok_or_else(|| io_error(path, "no front-end accepts this file"))?
        .translate(path)
}
